//! VMX-preemption timer exits.

use {
    crate::{
        error::HypervisorError,
        intel::{
            controls::{set_control_bits, VmxControl},
            exits::{ExitContext, HandlerDelegate, HandlerRegistry},
            support::{vmread, vmwrite},
        },
    },
    x86::vmx::vmcs,
};

const ACTIVATE_VMX_PREEMPTION_TIMER: u32 = 1 << 6;
const SAVE_VMX_PREEMPTION_TIMER_VALUE: u32 = 1 << 22;

pub struct PreemptionTimerComponent {
    registry: HandlerRegistry,
}

impl PreemptionTimerComponent {
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

    /// Programs the timer and arms the exit.
    pub fn set_timer(value: u64) {
        vmwrite(vmcs::guest::VMX_PREEMPTION_TIMER_VALUE, value);
        Self::enable_exiting();
    }

    pub fn get_timer() -> u64 {
        vmread(vmcs::guest::VMX_PREEMPTION_TIMER_VALUE)
    }

    pub fn enable_exiting() {
        set_control_bits(VmxControl::PinBased, ACTIVATE_VMX_PREEMPTION_TIMER, true);
        set_control_bits(VmxControl::VmExit, SAVE_VMX_PREEMPTION_TIMER_VALUE, true);
    }

    pub fn disable_exiting() {
        set_control_bits(VmxControl::PinBased, ACTIVATE_VMX_PREEMPTION_TIMER, false);
        set_control_bits(VmxControl::VmExit, SAVE_VMX_PREEMPTION_TIMER_VALUE, false);
    }
}

impl Default for PreemptionTimerComponent {
    fn default() -> Self {
        Self::new()
    }
}
