//! External-interrupt exits.

use crate::{
    error::HypervisorError,
    intel::{
        controls::{set_control_bits, VmxControl},
        exits::{ExitContext, HandlerDelegate, HandlerRegistry},
    },
};

const EXTERNAL_INTERRUPT_EXITING: u32 = 1 << 0;
const ACK_INTERRUPT_ON_EXIT: u32 = 1 << 15;

pub struct ExternalInterruptComponent {
    registry: HandlerRegistry,
}

impl ExternalInterruptComponent {
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

    pub fn dispatch(&mut self, ctx: &mut ExitContext) -> Result<(), HypervisorError> {
        self.registry.dispatch(ctx)
    }

    /// Interrupts exit and are acknowledged so the vector lands in the
    /// exit-interruption information field.
    pub fn enable_exiting() {
        set_control_bits(VmxControl::PinBased, EXTERNAL_INTERRUPT_EXITING, true);
        set_control_bits(VmxControl::VmExit, ACK_INTERRUPT_ON_EXIT, true);
    }

    pub fn disable_exiting() {
        set_control_bits(VmxControl::PinBased, EXTERNAL_INTERRUPT_EXITING, false);
        set_control_bits(VmxControl::VmExit, ACK_INTERRUPT_ON_EXIT, false);
    }
}

impl Default for ExternalInterruptComponent {
    fn default() -> Self {
        Self::new()
    }
}
