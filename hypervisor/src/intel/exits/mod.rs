//! The exit-handler dispatch surface.
//!
//! Every exit class owns a registry of delegates. Dispatch iterates the
//! registered delegates in insertion order and stops at the first one
//! that reports the exit handled; otherwise the class default runs; a
//! class with neither is a fatal exit and the caller halts the vCPU.

pub mod cpuid;
pub mod cr;
pub mod ept_violation;
pub mod external_interrupt;
pub mod interrupt_window;
pub mod io;
pub mod mtf;
pub mod msr;
pub mod nmi;
pub mod nmi_window;
pub mod preemption_timer;
pub mod xsetbv;

use {
    crate::{error::HypervisorError, intel::capture::GuestRegisters},
    alloc::{boxed::Box, collections::BTreeMap, vec::Vec},
};

/// What the vCPU run loop does after a handled exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    /// Skip the exiting instruction.
    IncrementRip,

    /// Re-enter the guest at the same RIP.
    Continue,
}

/// The per-exit state a delegate sees and mutates.
///
/// The vCPU copies the guest register file in before dispatch and back
/// out after, so delegates never hold references into the vCPU itself.
#[derive(Default)]
pub struct ExitContext {
    pub cpu_id: u32,
    pub regs: GuestRegisters,
    pub exit_reason: u32,
    pub exit_qualification: u64,
    pub guest_physical: u64,
    pub guest_linear: u64,
    pub instruction_length: u64,
}

impl ExitContext {
    /// The MSR index of an RDMSR/WRMSR exit.
    pub fn msr_index(&self) -> u32 {
        self.regs.rcx as u32
    }

    /// The EDX:EAX value of a WRMSR exit.
    pub fn msr_value(&self) -> u64 {
        (self.regs.rdx << 32) | (self.regs.rax & 0xFFFF_FFFF)
    }

    /// The port of an I/O instruction exit.
    pub fn io_port(&self) -> u16 {
        ((self.exit_qualification >> 16) & 0xFFFF) as u16
    }
}

/// A callable bound to a vCPU, invoked on one exit class. Returns whether
/// it handled the exit.
pub type HandlerDelegate = Box<dyn FnMut(&mut ExitContext) -> bool>;

/// An ordered delegate list plus an optional default.
pub struct HandlerRegistry {
    delegates: Vec<HandlerDelegate>,
    default: Option<HandlerDelegate>,
}

impl HandlerRegistry {
    pub const fn new() -> Self {
        Self {
            delegates: Vec::new(),
            default: None,
        }
    }

    pub fn add(&mut self, delegate: HandlerDelegate) {
        self.delegates.push(delegate);
    }

    pub fn set_default(&mut self, delegate: HandlerDelegate) {
        self.default = Some(delegate);
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty() && self.default.is_none()
    }

    /// First-match dispatch: the earliest-registered delegate that
    /// reports the exit handled wins; otherwise the default; otherwise
    /// the exit is fatal.
    pub fn dispatch(&mut self, ctx: &mut ExitContext) -> Result<(), HypervisorError> {
        for delegate in self.delegates.iter_mut() {
            if delegate(ctx) {
                return Ok(());
            }
        }

        if let Some(default) = self.default.as_mut() {
            if default(ctx) {
                return Ok(());
            }
        }
        Err(HypervisorError::HandlerFatal)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-key delegate lists plus a shared default, for the fine-grained
/// classes (MSR index, I/O port).
pub struct KeyedRegistry<K: Ord> {
    delegates: BTreeMap<K, Vec<HandlerDelegate>>,
    default: Option<HandlerDelegate>,
}

impl<K: Ord> KeyedRegistry<K> {
    pub const fn new() -> Self {
        Self {
            delegates: BTreeMap::new(),
            default: None,
        }
    }

    pub fn add(&mut self, key: K, delegate: HandlerDelegate) {
        self.delegates.entry(key).or_default().push(delegate);
    }

    pub fn set_default(&mut self, delegate: HandlerDelegate) {
        self.default = Some(delegate);
    }

    /// First-match dispatch over the key's list, falling back to the
    /// shared default.
    pub fn dispatch(&mut self, key: &K, ctx: &mut ExitContext) -> Result<(), HypervisorError> {
        if let Some(list) = self.delegates.get_mut(key) {
            for delegate in list.iter_mut() {
                if delegate(ctx) {
                    return Ok(());
                }
            }
        }

        if let Some(default) = self.default.as_mut() {
            if default(ctx) {
                return Ok(());
            }
        }
        Err(HypervisorError::HandlerFatal)
    }
}

impl<K: Ord> Default for KeyedRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    fn recording(log: &Rc<RefCell<Vec<&'static str>>>, name: &'static str, handled: bool) -> HandlerDelegate {
        let log = log.clone();
        Box::new(move |_ctx| {
            log.borrow_mut().push(name);
            handled
        })
    }

    #[test]
    fn earliest_registered_handling_delegate_wins() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.add(recording(&log, "h1", false));
        registry.add(recording(&log, "h2", true));
        registry.add(recording(&log, "h3", true));

        registry.dispatch(&mut ExitContext::default()).unwrap();
        assert_eq!(*log.borrow(), ["h1", "h2"]);
    }

    #[test]
    fn default_runs_only_when_no_delegate_handles() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.add(recording(&log, "h1", false));
        registry.set_default(recording(&log, "default", true));

        registry.dispatch(&mut ExitContext::default()).unwrap();
        assert_eq!(*log.borrow(), ["h1", "default"]);
    }

    #[test]
    fn no_delegate_and_no_default_is_fatal() {
        let mut registry = HandlerRegistry::new();
        assert_eq!(
            registry.dispatch(&mut ExitContext::default()).unwrap_err(),
            HypervisorError::HandlerFatal
        );

        let mut registry = HandlerRegistry::new();
        registry.add(Box::new(|_| false));
        assert_eq!(
            registry.dispatch(&mut ExitContext::default()).unwrap_err(),
            HypervisorError::HandlerFatal
        );
    }

    #[test]
    fn keyed_dispatch_demultiplexes_and_falls_back() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registry = KeyedRegistry::<u32>::new();
        registry.add(0x1B, recording(&log, "h1", false));
        registry.add(0x1B, recording(&log, "h2", true));
        registry.set_default(recording(&log, "default", true));

        // Registered key: h1 then h2, default untouched.
        registry.dispatch(&0x1B, &mut ExitContext::default()).unwrap();
        assert_eq!(*log.borrow(), ["h1", "h2"]);

        // Unregistered key: straight to the default.
        log.borrow_mut().clear();
        registry.dispatch(&0x1C, &mut ExitContext::default()).unwrap();
        assert_eq!(*log.borrow(), ["default"]);
    }
}
