//! The VMM lifecycle state machine.

/// Global status of the VMM.
///
/// `Stopped` is the initial state. A successful start moves to
/// `Running`; a failed start that also fails to unwind, or a failed
/// stop, moves to `Corrupt`, which is terminal until reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmmStatus {
    #[default]
    Stopped,
    Running,
    Corrupt,
}
