//! Per-CPU bring-up and teardown of the VMM.
//!
//! `virtualize_cpu` captures the running context, enters VMX operation,
//! and launches the vCPU; the captured context continues as the guest.
//! Each vCPU is boxed into a registry keyed by CPU id and never moves.

use {
    crate::{
        error::HypervisorError,
        intel::{
            capture::{capture_registers, GuestRegisters},
            ept::EptMap,
            vcpu::Vcpu,
        },
    },
    alloc::{boxed::Box, collections::BTreeMap},
    spin::Mutex,
};

/// CPUID leaf and signature the running VMM answers with, so bring-up can
/// tell whether this CPU is already virtualized.
pub const CPUID_VENDOR_AND_MAX_FUNCTIONS: u32 = 0x4000_0000;
pub const VENDOR_NAME: u32 = 0x4D52_4947; // "GIRM"

static VCPUS: Mutex<BTreeMap<u32, Box<Vcpu>>> = Mutex::new(BTreeMap::new());

/// Whether this VMM already answers hypervisor CPUID on this CPU.
pub fn is_virtualized() -> bool {
    let regs = x86::cpuid::cpuid!(CPUID_VENDOR_AND_MAX_FUNCTIONS);
    (regs.ebx == regs.ecx) && (regs.ecx == regs.edx) && (regs.edx == VENDOR_NAME)
}

/// Builds and launches the vCPU for this CPU. On success the captured
/// context is already running as the guest when this returns to it.
///
/// `ept` is the shared translation map, owned by the caller for the
/// lifetime of the VMM; `is_host_vcpu` marks the CPU the hypervisor was
/// launched from, whose live context seeds the guest state.
pub fn virtualize_cpu(
    cpu_id: u32,
    ept: Option<&mut EptMap>,
    is_host_vcpu: bool,
) -> Result<(), HypervisorError> {
    if VCPUS.lock().contains_key(&cpu_id) {
        return Err(HypervisorError::VcpuAlreadyExists);
    }

    let mut registers = GuestRegisters::default();
    unsafe { capture_registers(&mut registers) };

    // The guest resumes at the capture point; when it does, the VMM is
    // already answering CPUID and bring-up is complete.
    if is_virtualized() {
        log::debug!("cpu {cpu_id}: now running as guest");
        return Ok(());
    }

    let mut vcpu = Vcpu::new(cpu_id);
    if let Some(map) = ept {
        vcpu.set_eptp(map);
    }
    vcpu.activate(&registers, is_host_vcpu)?;

    // Park the box in the registry, then run through a raw pointer: the
    // box's address is stable, and the lock cannot be held across the
    // launch.
    let vcpu: *mut Vcpu = {
        let mut vcpus = VCPUS.lock();
        vcpus.entry(cpu_id).or_insert(vcpu).as_mut() as *mut Vcpu
    };

    log::info!("cpu {cpu_id}: launching");
    unsafe { (*vcpu).run() }
}

/// Tears down the vCPU for this CPU: VMXOFF and removal from the
/// registry.
pub fn devirtualize_cpu(cpu_id: u32) -> Result<(), HypervisorError> {
    let mut vcpus = VCPUS.lock();
    let mut vcpu = vcpus.remove(&cpu_id).ok_or(HypervisorError::VcpuNotFound)?;
    vcpu.devirtualize()
}

/// Number of vCPUs currently registered.
pub fn active_vcpus() -> usize {
    VCPUS.lock().len()
}
