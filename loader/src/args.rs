//! Validation of the `start_vmm` IOCTL payload.
//!
//! Runs on the loader-side copy, after the single `copy_from_user`; the
//! user pointer is never dereferenced again.

use {
    crate::error::LoaderError,
    mirage_shared::{
        args::StartVmmArgs,
        consts::{MAX_ELF_FILE_SIZE, MAX_EXTENSIONS, START_VMM_ARGS_VERSION},
    },
};

/// Verifies the copied arguments. Rejects an unsupported ABI version, a
/// missing or oversize microkernel image, an empty extension table, and
/// any extension entry whose address and size are not both zero or both
/// populated.
pub fn verify_start_vmm_args(args: &StartVmmArgs) -> Result<(), LoaderError> {
    if args.ver != START_VMM_ARGS_VERSION {
        log::error!("IOCTL ABI version not supported");
        return Err(LoaderError::ArgInvalid);
    }

    let mk = args.mk_elf_file;
    if mk.addr == 0 {
        log::error!("the microkernel is required");
        return Err(LoaderError::ArgInvalid);
    }
    if mk.size == 0 || mk.size > MAX_ELF_FILE_SIZE {
        log::error!("mk_elf_file.size is invalid");
        return Err(LoaderError::ArgInvalid);
    }

    let exts = args.ext_elf_files;
    if exts[0].addr == 0 {
        log::error!("at least one extension is required");
        return Err(LoaderError::ArgInvalid);
    }

    for (idx, ext) in exts.iter().enumerate().take(MAX_EXTENSIONS) {

        if (ext.addr == 0) != (ext.size == 0) {
            log::error!("invalid extension address/size combination");
            return Err(LoaderError::ArgInvalid);
        }

        if ext.size > MAX_ELF_FILE_SIZE {
            log::error!("ext_elf_files[{idx}].size is invalid");
            return Err(LoaderError::ArgInvalid);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirage_shared::args::Span;

    fn valid_args() -> StartVmmArgs {
        let mut args = StartVmmArgs::new(Span::new(0x1000, 0x2000), 0);
        args.ext_elf_files[0] = Span::new(0x9000, 0x1000);
        args
    }

    #[test]
    fn well_formed_args_pass() {
        verify_start_vmm_args(&valid_args()).unwrap();
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut args = valid_args();
        args.ver = 2;
        assert_eq!(
            verify_start_vmm_args(&args).unwrap_err(),
            LoaderError::ArgInvalid
        );
    }

    #[test]
    fn microkernel_image_is_mandatory_and_bounded() {
        let mut args = valid_args();
        args.mk_elf_file = Span::new(0, 0x2000);
        assert!(verify_start_vmm_args(&args).is_err());

        let mut args = valid_args();
        args.mk_elf_file = Span::new(0x1000, 0);
        assert!(verify_start_vmm_args(&args).is_err());

        let mut args = valid_args();
        args.mk_elf_file = Span::new(0x1000, MAX_ELF_FILE_SIZE + 1);
        assert!(verify_start_vmm_args(&args).is_err());

        let mut args = valid_args();
        args.mk_elf_file = Span::new(0x1000, MAX_ELF_FILE_SIZE);
        assert!(verify_start_vmm_args(&args).is_ok());
    }

    #[test]
    fn first_extension_is_required() {
        let mut args = valid_args();
        args.ext_elf_files[0] = Span::empty();
        assert!(verify_start_vmm_args(&args).is_err());
    }

    #[test]
    fn extension_entries_must_be_consistent() {
        let mut args = valid_args();
        args.ext_elf_files[3] = Span::new(0x5000, 0);
        assert!(verify_start_vmm_args(&args).is_err());

        let mut args = valid_args();
        args.ext_elf_files[3] = Span::new(0, 0x5000);
        assert!(verify_start_vmm_args(&args).is_err());

        let mut args = valid_args();
        args.ext_elf_files[3] = Span::new(0x5000, 0x1000);
        assert!(verify_start_vmm_args(&args).is_ok());
    }
}
