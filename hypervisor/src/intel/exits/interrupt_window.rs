//! Interrupt-window exits and event injection.
//!
//! `queue_external_interrupt` records an intent and raises window
//! exiting; when the guest next opens an interrupt window, the oldest
//! queued vector is injected through the VM-entry interruption-information
//! field and window exiting is dropped once the queue drains.
//!
//! Reference: Intel SDM Vol 3, 25.8.3 VM-Entry Controls for Event
//! Injection.

use {
    crate::{
        error::HypervisorError,
        intel::{
            controls::{set_control_bits, VmxControl},
            exits::{ExitContext, HandlerDelegate, HandlerRegistry},
            support::vmwrite,
        },
    },
    alloc::collections::VecDeque,
    x86::vmx::vmcs,
};

const INTERRUPT_WINDOW_EXITING: u32 = 1 << 2;

const INTERRUPTION_VALID: u32 = 1 << 31;
const INTERRUPTION_TYPE_EXTERNAL: u32 = 0 << 8;
const INTERRUPTION_TYPE_EXCEPTION: u32 = 3 << 8;
const INTERRUPTION_DELIVER_ERROR_CODE: u32 = 1 << 11;

pub struct InterruptWindowComponent {
    registry: HandlerRegistry,
    queue: VecDeque<u8>,
}

impl InterruptWindowComponent {
    pub const fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn add_handler(&mut self, delegate: HandlerDelegate) {
        self.registry.add(delegate);
    }

    /// Records an interrupt for delivery at the next open window and
    /// enables window exiting.
    pub fn queue_external_interrupt(&mut self, vector: u8) {
        self.queue.push_back(vector);
        Self::enable_exiting();
    }

    /// Pops the vector to inject at this window exit, if any.
    pub fn pop_queued(&mut self) -> Option<u8> {
        self.queue.pop_front()
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Handles a window exit: delegates run first, then the oldest queued
    /// vector is injected; exiting stops once nothing is pending. An
    /// empty registry is not fatal here since the window exit was
    /// requested by the queue, not a registration.
    pub fn dispatch(&mut self, ctx: &mut ExitContext) -> Result<(), HypervisorError> {
        if !self.registry.is_empty() {
            self.registry.dispatch(ctx)?;
        }

        if let Some(vector) = self.pop_queued() {
            Self::inject_external_interrupt(vector);
        }

        if self.queue_is_empty() {
            Self::disable_exiting();
        }

        Ok(())
    }

    pub fn enable_exiting() {
        set_control_bits(VmxControl::ProcessorBased, INTERRUPT_WINDOW_EXITING, true);
    }

    pub fn disable_exiting() {
        set_control_bits(VmxControl::ProcessorBased, INTERRUPT_WINDOW_EXITING, false);
    }

    /// Injects an external interrupt on the next VM entry.
    pub fn inject_external_interrupt(vector: u8) {
        vmwrite(
            vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD,
            (INTERRUPTION_VALID | INTERRUPTION_TYPE_EXTERNAL | vector as u32) as u64,
        );
    }

    /// Injects a hardware exception on the next VM entry, with an error
    /// code when the vector pushes one.
    pub fn inject_exception(vector: u8, error_code: Option<u32>) {
        let mut info = INTERRUPTION_VALID | INTERRUPTION_TYPE_EXCEPTION | vector as u32;

        if let Some(code) = error_code {
            info |= INTERRUPTION_DELIVER_ERROR_CODE;
            vmwrite(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, code as u64);
        }

        vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, info as u64);
    }
}

impl Default for InterruptWindowComponent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_preserves_arrival_order() {
        let mut component = InterruptWindowComponent::new();
        // Queue manipulation is hardware-free; enable_exiting is not.
        component.queue.push_back(0x20);
        component.queue.push_back(0x21);

        assert_eq!(component.pop_queued(), Some(0x20));
        assert!(!component.queue_is_empty());
        assert_eq!(component.pop_queued(), Some(0x21));
        assert!(component.queue_is_empty());
        assert_eq!(component.pop_queued(), None);
    }
}
