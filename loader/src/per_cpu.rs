//! The per-CPU enable-virtualization step.
//!
//! The pipeline fans this out through `platform_on_each_cpu`; the
//! hardware implementation hands each CPU to the hypervisor core. The
//! trait exists so the pipeline's ordering and rollback can be exercised
//! without VT-x.

use {
    crate::error::LoaderError,
    mirage_hypervisor::{error::HypervisorError, intel::host::MemoryDescriptor, logger, vmm},
    mirage_shared::ring::DebugRing,
};

/// What one CPU needs to come up.
pub struct PerCpuContext<'a> {
    /// The loader-owned debug ring, already mapped into the VMM layout.
    pub ring: *mut DebugRing,

    /// The memory descriptors behind the VMM root page table; the
    /// one-shot host-state builder consumes them.
    pub descriptors: &'a [MemoryDescriptor],

    /// The CPU the hypervisor is launched from; its live context seeds
    /// the guest state.
    pub host_cpu: u32,
}

pub trait CpuVirt {
    /// Virtualizes one CPU. Runs on that CPU.
    fn start(&self, cpu: u32, ctx: &PerCpuContext<'_>) -> Result<(), LoaderError>;

    /// Devirtualizes one CPU. Must succeed quietly on a CPU that never
    /// started, so a partial bring-up can be unwound with a full reverse
    /// sweep.
    fn stop(&self, cpu: u32) -> Result<(), LoaderError>;
}

/// The real thing: VMXON + VMLAUNCH through the hypervisor core.
pub struct HardwareCpu;

impl CpuVirt for HardwareCpu {
    fn start(&self, cpu: u32, ctx: &PerCpuContext<'_>) -> Result<(), LoaderError> {
        if cpu == ctx.host_cpu {
            // First CPU up installs the ring logger and builds the
            // shared host state; later CPUs observe the completed value.
            let _ = unsafe { logger::init_ring_logger(ctx.ring, log::LevelFilter::Info) };
            mirage_hypervisor::intel::host::init(ctx.descriptors);
        }

        vmm::virtualize_cpu(cpu, None, cpu == ctx.host_cpu).map_err(|e| {
            log::error!("cpu {cpu}: virtualization failed: {e}");
            LoaderError::CpuStartFailed
        })
    }

    fn stop(&self, cpu: u32) -> Result<(), LoaderError> {
        match vmm::devirtualize_cpu(cpu) {
            Ok(()) => Ok(()),
            // Never started; nothing to unwind on this CPU.
            Err(HypervisorError::VcpuNotFound) => Ok(()),
            Err(e) => {
                log::error!("cpu {cpu}: devirtualization failed: {e}");
                Err(LoaderError::CpuStopFailed)
            }
        }
    }
}
