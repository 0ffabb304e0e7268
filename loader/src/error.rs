use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderError {
    #[error("IOCTL payload failed validation")]
    ArgInvalid,

    #[error("Pool, segment, or table allocation failed")]
    AllocFailed,

    #[error("Copying from host user memory failed")]
    CopyFailed,

    #[error("Inserting into the root page table failed")]
    MapFailed,

    #[error("ELF image failed validation")]
    ElfInvalid,

    #[error("Per-CPU bring-up failed")]
    CpuStartFailed,

    #[error("Per-CPU teardown failed")]
    CpuStopFailed,

    #[error("VMM is corrupt; reboot required")]
    Corrupt,
}
