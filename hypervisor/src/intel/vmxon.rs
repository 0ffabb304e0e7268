//! The VMXON region and the checks required before entering VMX operation.

use {
    crate::{
        error::HypervisorError,
        intel::support::{self, cr0, cr0_write, cr4, cr4_write, rdmsr, wrmsr},
    },
    bit_field::BitField,
    x86::{current::paging::BASE_PAGE_SIZE, msr},
};

/// The VMXON region, physical-address aligned to a page.
#[repr(C, align(4096))]
pub struct Vmxon {
    /// Revision ID required for VMXON.
    pub revision_id: u32,

    /// Data array constituting the rest of the VMXON region.
    pub data: [u8; BASE_PAGE_SIZE - 4],
}

impl Vmxon {
    /// Initializes the VMXON region with the revision from IA32_VMX_BASIC.
    pub fn init(&mut self) {
        self.revision_id = rdmsr(msr::IA32_VMX_BASIC) as u32;
        self.revision_id.set_bit(31, false);
    }

    /// Checks that the CPU supports VMX operation.
    pub fn check_vmx_support() -> Result<(), HypervisorError> {
        let cpuid = x86::cpuid::CpuId::new();
        match cpuid.get_feature_info() {
            Some(fi) if fi.has_vmx() => Ok(()),
            _ => Err(HypervisorError::VmxUnsupported),
        }
    }

    /// Sets the VMX-enable bit in CR4.
    pub fn enable_vmx_operation() {
        const CR4_VMX_ENABLE_BIT: usize = 13;
        let mut value = cr4();
        value.set_bit(CR4_VMX_ENABLE_BIT, true);
        cr4_write(value);
    }

    /// Adjusts IA32_FEATURE_CONTROL: sets the lock bit and VMXON-outside-SMX
    /// when unlocked; fails when the BIOS locked VMX off.
    pub fn adjust_feature_control_msr() -> Result<(), HypervisorError> {
        const VMX_LOCK_BIT: u64 = 1 << 0;
        const VMXON_OUTSIDE_SMX: u64 = 1 << 2;

        let feature_control = rdmsr(msr::IA32_FEATURE_CONTROL);

        if (feature_control & VMX_LOCK_BIT) == 0 {
            wrmsr(
                msr::IA32_FEATURE_CONTROL,
                VMXON_OUTSIDE_SMX | VMX_LOCK_BIT | feature_control,
            );
        } else if (feature_control & VMXON_OUTSIDE_SMX) == 0 {
            return Err(HypervisorError::VmxBiosLock);
        }

        Ok(())
    }

    /// Forces the CR0 bits the fixed MSRs require for VMX operation.
    pub fn set_cr0_bits() {
        let fixed0 = rdmsr(msr::IA32_VMX_CR0_FIXED0);
        let fixed1 = rdmsr(msr::IA32_VMX_CR0_FIXED1);

        let mut value = cr0().bits() as u64;
        value |= fixed0;
        value &= fixed1;

        cr0_write(value);
    }

    /// Forces the CR4 bits the fixed MSRs require for VMX operation.
    pub fn set_cr4_bits() {
        let fixed0 = rdmsr(msr::IA32_VMX_CR4_FIXED0);
        let fixed1 = rdmsr(msr::IA32_VMX_CR4_FIXED1);

        let mut value = cr4();
        value |= fixed0;
        value &= fixed1;

        cr4_write(value);
    }

    /// Performs the whole pre-VMXON sequence and executes VMXON on this
    /// region.
    pub fn activate(&mut self) -> Result<(), HypervisorError> {
        Self::check_vmx_support()?;
        Self::enable_vmx_operation();
        Self::adjust_feature_control_msr()?;
        Self::set_cr0_bits();
        Self::set_cr4_bits();
        self.init();
        support::vmxon(self as *const _ as u64)
    }
}
