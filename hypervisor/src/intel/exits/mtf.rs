//! Monitor-trap-flag exits: single stepping the guest.

use crate::{
    error::HypervisorError,
    intel::{
        controls::{set_control_bits, VmxControl},
        exits::{ExitContext, HandlerDelegate, HandlerRegistry},
    },
};

const MONITOR_TRAP_FLAG: u32 = 1 << 27;

pub struct MonitorTrapComponent {
    registry: HandlerRegistry,
}

impl MonitorTrapComponent {
    pub const fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
        }
    }

    pub fn add_handler(&mut self, delegate: HandlerDelegate) {
        self.registry.add(delegate);
    }

    pub fn set_default_handler(&mut self, delegate: HandlerDelegate) {
        self.registry.set_default(delegate);
    }

    /// Delegates run, then the flag drops so the step does not repeat.
    pub fn dispatch(&mut self, ctx: &mut ExitContext) -> Result<(), HypervisorError> {
        let result = self.registry.dispatch(ctx);
        Self::disable();
        result
    }

    /// Raises the primary control bit for a single step.
    pub fn enable() {
        set_control_bits(VmxControl::ProcessorBased, MONITOR_TRAP_FLAG, true);
    }

    pub fn disable() {
        set_control_bits(VmxControl::ProcessorBased, MONITOR_TRAP_FLAG, false);
    }
}

impl Default for MonitorTrapComponent {
    fn default() -> Self {
        Self::new()
    }
}
