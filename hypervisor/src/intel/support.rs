#![allow(dead_code)]

use {crate::error::HypervisorError, core::arch::asm};

/// Enable VMX operation on the given VMXON region.
pub fn vmxon(vmxon_region: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmxon(vmxon_region) }.map_err(|_| HypervisorError::VmxOnFailed)
}

/// Disable VMX operation.
pub fn vmxoff() -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmxoff() }.map_err(|_| HypervisorError::VmxOffFailed)
}

/// Clear VMCS.
pub fn vmclear(vmcs_region: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmclear(vmcs_region) }.map_err(|_| HypervisorError::VmClearFailed)
}

/// Load current VMCS pointer.
pub fn vmptrld(vmcs_region: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmptrld(vmcs_region) }.map_err(|_| HypervisorError::VmPtrLdFailed)
}

/// Read a specified field from the current VMCS.
pub fn vmread(field: u32) -> u64 {
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
}

/// Write to a specified field in the current VMCS.
pub fn vmwrite<T: Into<u64>>(field: u32, val: T)
where
    u64: From<T>,
{
    unsafe { x86::bits64::vmx::vmwrite(field, u64::from(val)) }.unwrap();
}

/// Invalidate EPT-derived translations for all contexts.
pub fn invept_all_contexts() {
    // INVEPT type 2, descriptor ignored but must be addressable.
    let descriptor: [u64; 2] = [0, 0];
    unsafe {
        asm!(
            "invept {}, [{}]",
            in(reg) 2u64,
            in(reg) descriptor.as_ptr(),
            options(nostack),
        );
    }
}

/// Reads an MSR.
pub fn rdmsr(msr: u32) -> u64 {
    unsafe { x86::msr::rdmsr(msr) }
}

/// Writes a value to an MSR.
pub fn wrmsr(msr: u32, value: u64) {
    unsafe { x86::msr::wrmsr(msr, value) };
}

/// Reads the CR0 register.
pub fn cr0() -> x86::controlregs::Cr0 {
    unsafe { x86::controlregs::cr0() }
}

/// Writes a raw value to the CR0 register.
pub fn cr0_write(val: u64) {
    unsafe { x86_64::registers::control::Cr0::write_raw(val) };
}

/// Reads the CR3 register.
pub fn cr3() -> u64 {
    unsafe { x86::controlregs::cr3() }
}

/// Reads the CR4 register.
pub fn cr4() -> u64 {
    x86_64::registers::control::Cr4::read_raw()
}

/// Writes a raw value to the CR4 register.
pub fn cr4_write(val: u64) {
    unsafe { x86_64::registers::control::Cr4::write_raw(val) };
}

/// Reads the CR2 register.
pub fn cr2() -> u64 {
    unsafe { x86::controlregs::cr2() as u64 }
}

/// Reads the DR7 register.
pub fn dr7_read() -> u64 {
    unsafe { x86::debugregs::dr7().0 as u64 }
}

/// Write to Extended Control Register XCR0.
pub fn xsetbv(val: u64) {
    unsafe { x86_64::registers::xcontrol::XCr0::write_raw(val) };
}

/// Disables maskable interrupts.
pub fn cli() {
    unsafe { x86::irq::disable() };
}

/// Halts execution of the processor.
pub fn hlt() {
    unsafe { x86::halt() };
}

/// Stops the processor: interrupts off, HLT forever. The fatal-exit path
/// ends here.
pub fn stop() -> ! {
    cli();
    loop {
        hlt();
    }
}

/// Reads the IDTR.
pub fn sidt() -> x86::dtables::DescriptorTablePointer<u64> {
    let mut idtr = x86::dtables::DescriptorTablePointer::<u64>::default();
    unsafe { x86::dtables::sidt(&mut idtr) };
    idtr
}

/// Reads the GDTR.
pub fn sgdt() -> x86::dtables::DescriptorTablePointer<u64> {
    let mut gdtr = x86::dtables::DescriptorTablePointer::<u64>::default();
    unsafe { x86::dtables::sgdt(&mut gdtr) };
    gdtr
}

/// Reads 8 bits from an IO port.
pub fn inb(port: u16) -> u8 {
    unsafe { x86::io::inb(port) }
}

/// Writes 8 bits to an IO port.
pub fn outb(port: u16, val: u8) {
    unsafe { x86::io::outb(port, val) };
}

/// Reads 16 bits from an IO port.
pub fn inw(port: u16) -> u16 {
    unsafe { x86::io::inw(port) }
}

/// Writes 16 bits to an IO port.
pub fn outw(port: u16, val: u16) {
    unsafe { x86::io::outw(port, val) };
}

/// Reads 32 bits from an IO port.
pub fn inl(port: u16) -> u32 {
    unsafe { x86::io::inl(port) }
}

/// Writes 32 bits to an IO port.
pub fn outl(port: u16, val: u32) {
    unsafe { x86::io::outl(port, val) };
}
