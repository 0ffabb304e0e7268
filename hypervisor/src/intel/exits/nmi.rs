//! Non-maskable interrupt exits.
//!
//! With NMI exiting enabled in the pin-based controls, an NMI delivered
//! to the guest arrives as an exception-or-NMI exit whose interruption
//! type is NMI. Delegates decide how it is handled; the usual default
//! re-queues it through the NMI-window path.

use crate::{
    error::HypervisorError,
    intel::{
        controls::{set_control_bits, VmxControl},
        exits::{ExitContext, HandlerDelegate, HandlerRegistry},
    },
};

const NMI_EXITING: u32 = 1 << 3;
const VIRTUAL_NMIS: u32 = 1 << 5;

/// Interruption type of the exit-interruption information field.
const INTERRUPTION_INFO_TYPE_MASK: u32 = 0x700;
const INTERRUPTION_TYPE_NMI: u32 = 2 << 8;

/// Whether the exit-interruption information names an NMI.
pub fn is_nmi(interruption_info: u32) -> bool {
    interruption_info & INTERRUPTION_INFO_TYPE_MASK == INTERRUPTION_TYPE_NMI
}

pub struct NmiComponent {
    registry: HandlerRegistry,
}

impl NmiComponent {
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

    pub fn enable_exiting() {
        set_control_bits(VmxControl::PinBased, NMI_EXITING | VIRTUAL_NMIS, true);
    }

    pub fn disable_exiting() {
        set_control_bits(VmxControl::PinBased, NMI_EXITING | VIRTUAL_NMIS, false);
    }
}

impl Default for NmiComponent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interruption_type_discriminates_nmis() {
        assert!(is_nmi(0x8000_0202));
        // Hardware exception (type 3).
        assert!(!is_nmi(0x8000_030E));
    }
}
