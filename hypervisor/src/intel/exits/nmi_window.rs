//! NMI-window exits.
//!
//! `queue_nmi` records intent and raises NMI-window exiting; at the next
//! window exit one NMI is injected and exiting stops when none are
//! pending.

use {
    crate::{
        error::HypervisorError,
        intel::{
            controls::{set_control_bits, VmxControl},
            exits::{ExitContext, HandlerDelegate, HandlerRegistry},
            support::vmwrite,
        },
    },
    x86::vmx::vmcs,
};

const NMI_WINDOW_EXITING: u32 = 1 << 22;

const NMI_VECTOR: u32 = 2;
const INTERRUPTION_VALID: u32 = 1 << 31;
const INTERRUPTION_TYPE_NMI: u32 = 2 << 8;

pub struct NmiWindowComponent {
    registry: HandlerRegistry,
    pending: u32,
}

impl NmiWindowComponent {
    pub const fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            pending: 0,
        }
    }

    pub fn add_handler(&mut self, delegate: HandlerDelegate) {
        self.registry.add(delegate);
    }

    /// Records one NMI for delivery at the next open window.
    pub fn queue_nmi(&mut self) {
        self.pending += 1;
        Self::enable_exiting();
    }

    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Handles a window exit: delegates first, then one queued NMI is
    /// injected; exiting stops when the queue is dry.
    pub fn dispatch(&mut self, ctx: &mut ExitContext) -> Result<(), HypervisorError> {
        if !self.registry.is_empty() {
            self.registry.dispatch(ctx)?;
        }

        if self.pending > 0 {
            self.pending -= 1;
            Self::inject_nmi();
        }

        if self.pending == 0 {
            Self::disable_exiting();
        }

        Ok(())
    }

    pub fn enable_exiting() {
        set_control_bits(VmxControl::ProcessorBased, NMI_WINDOW_EXITING, true);
    }

    pub fn disable_exiting() {
        set_control_bits(VmxControl::ProcessorBased, NMI_WINDOW_EXITING, false);
    }

    /// Injects an NMI on the next VM entry.
    pub fn inject_nmi() {
        vmwrite(
            vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD,
            (INTERRUPTION_VALID | INTERRUPTION_TYPE_NMI | NMI_VECTOR) as u64,
        );
    }
}

impl Default for NmiWindowComponent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_count_tracks_queued_nmis() {
        let mut component = NmiWindowComponent::new();
        component.pending += 2;
        assert_eq!(component.pending(), 2);
    }
}
