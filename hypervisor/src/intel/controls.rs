//! VMX control-field computation.
//!
//! Every control field starts from the intersection of the allowed-0 and
//! allowed-1 halves of the matching `IA32_VMX_TRUE_*_CTLS` capability MSR:
//! the bits that are both mandatory and supported. Optional bits are then
//! set only when allowed-1 permits them, so no unsupported bit ever
//! reaches the VMCS.

use {
    crate::intel::support::{rdmsr, vmread, vmwrite},
    x86::{msr, vmx::vmcs},
};

/// The five adjustable control fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

impl VmxControl {
    fn capability_msr(self) -> u32 {
        match self {
            Self::PinBased => msr::IA32_VMX_TRUE_PINBASED_CTLS,
            Self::ProcessorBased => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
            Self::ProcessorBased2 => msr::IA32_VMX_PROCBASED_CTLS2,
            Self::VmExit => msr::IA32_VMX_TRUE_EXIT_CTLS,
            Self::VmEntry => msr::IA32_VMX_TRUE_ENTRY_CTLS,
        }
    }
}

/// The two halves of a capability MSR.
#[derive(Clone, Copy, Debug)]
pub struct Capability {
    /// Low 32 bits: the value every mandatory bit takes.
    pub allowed_0: u32,

    /// High 32 bits: the set of bits the hardware supports at all.
    pub allowed_1: u32,
}

impl Capability {
    pub fn read(control: VmxControl) -> Self {
        Self::from_raw(rdmsr(control.capability_msr()))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            allowed_0: raw as u32,
            allowed_1: (raw >> 32) as u32,
        }
    }

    /// The mandatory-and-supported base value for the field.
    pub fn base(&self) -> u32 {
        self.allowed_0 & self.allowed_1
    }

    /// `base()` plus every requested bit allowed-1 permits.
    pub fn with_desired(&self, desired: u32) -> u32 {
        self.base() | (desired & self.allowed_1)
    }

    /// Whether allowed-1 permits the bit at all.
    pub fn allows(&self, bits: u32) -> bool {
        self.allowed_1 & bits == bits
    }
}

/// Computes the final value for a control field: the capability base plus
/// the desired optional bits the hardware supports.
pub fn adjust_vmx_controls(control: VmxControl, desired: u32) -> u64 {
    Capability::read(control).with_desired(desired) as u64
}

fn field_of(control: VmxControl) -> u32 {
    match control {
        VmxControl::PinBased => vmcs::control::PINBASED_EXEC_CONTROLS,
        VmxControl::ProcessorBased => vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
        VmxControl::ProcessorBased2 => vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS,
        VmxControl::VmExit => vmcs::control::VMEXIT_CONTROLS,
        VmxControl::VmEntry => vmcs::control::VMENTRY_CONTROLS,
    }
}

/// Read-modify-write of one control field on the live VMCS. Enables are
/// masked by allowed-1, disables never strip the capability base, so the
/// written value always stays inside the hardware-supported set.
pub fn set_control_bits(control: VmxControl, bits: u32, enable: bool) {
    let cap = Capability::read(control);
    let mut value = vmread(field_of(control)) as u32;

    if enable {
        value |= bits & cap.allowed_1;
    } else {
        value &= !bits;
    }
    value |= cap.base();

    vmwrite(field_of(control), value as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // allowed_0 = 0x16, allowed_1 = 0xFFF7: bits 1, 2, 4 mandatory, bit 3
    // unsupported.
    const CAP: u64 = 0x0000_FFF7_0000_0016;

    #[test]
    fn base_is_the_intersection_of_the_two_halves() {
        let cap = Capability::from_raw(CAP);
        assert_eq!(cap.base(), 0x16);
    }

    #[test]
    fn desired_bits_outside_allowed_1_never_set() {
        let cap = Capability::from_raw(CAP);
        // Bit 3 is not supported; bit 5 is.
        assert_eq!(cap.with_desired(1 << 3), 0x16);
        assert_eq!(cap.with_desired(1 << 5), 0x16 | 1 << 5);
        assert!(!cap.allows(1 << 3));
        assert!(cap.allows(1 << 5));
    }

    #[test]
    fn mandatory_bits_survive_a_zero_request() {
        let cap = Capability::from_raw(CAP);
        assert_eq!(cap.with_desired(0), cap.base());
    }
}
