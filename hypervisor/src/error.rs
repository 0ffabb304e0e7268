use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("VMX is not supported by this CPU")]
    VmxUnsupported,

    #[error("VMX locked off in BIOS")]
    VmxBiosLock,

    #[error("Failed to execute VMXON")]
    VmxOnFailed,

    #[error("Failed to execute VMXOFF")]
    VmxOffFailed,

    #[error("Failed to execute VMCLEAR")]
    VmClearFailed,

    #[error("Failed to execute VMPTRLD")]
    VmPtrLdFailed,

    #[error("VMLAUNCH or VMRESUME failed")]
    VmxEntryFailure,

    #[error("VM exit not handled by any delegate or default")]
    HandlerFatal,

    #[error("Unknown VM exit basic reason")]
    UnknownExitReason,

    #[error("EPT mapping collides with an existing leaf")]
    EptCollision,

    #[error("Virtual address is already mapped in the root page table")]
    PageAlreadyMapped,

    #[error("GPA is not mapped by the EPT")]
    EptNotPresent,

    #[error("No EPT is configured for this vCPU")]
    EptNotConfigured,

    #[error("Guest page walk hit a cleared present bit")]
    PageNotPresent,

    #[error("EPT PML4 base address is not page aligned")]
    InvalidEptPointer,

    #[error("Page table root is not page aligned")]
    InvalidCr3,

    #[error("Address is not aligned to the mapping granularity")]
    UnalignedAddress,

    #[error("Selector index is outside the descriptor table")]
    SelectorOutOfRange,

    #[error("Host state was not initialized before vCPU construction")]
    HostStateNotInitialized,

    #[error("vCPU for this CPU already exists")]
    VcpuAlreadyExists,

    #[error("No vCPU exists for this CPU")]
    VcpuNotFound,
}
