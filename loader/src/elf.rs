//! Minimal ELF64 parsing for segment staging.
//!
//! The loader only needs to validate an image and walk its program
//! headers; linking, relocation, and symbol handling belong to the
//! microkernel's own loader.

use crate::error::LoaderError;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EM_X86_64: u16 = 62;

/// Loadable segment.
pub const PT_LOAD: u32 = 1;

/// Program header flag bits.
pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

/// ELF64 file header.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Elf64Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Elf64Header {
    pub const SIZE: usize = 64;

    /// Parses and validates the header: magic, 64-bit, little-endian,
    /// x86-64.
    pub fn from_bytes(data: &[u8]) -> Result<Self, LoaderError> {
        if data.len() < Self::SIZE {
            return Err(LoaderError::ElfInvalid);
        }

        let header = unsafe { core::ptr::read_unaligned(data.as_ptr().cast::<Self>()) };

        if header.e_ident[0..4] != ELF_MAGIC {
            return Err(LoaderError::ElfInvalid);
        }
        if header.e_ident[4] != ELFCLASS64 || header.e_ident[5] != ELFDATA2LSB {
            return Err(LoaderError::ElfInvalid);
        }
        if header.e_machine != EM_X86_64 {
            return Err(LoaderError::ElfInvalid);
        }
        if header.e_phentsize as usize != core::mem::size_of::<Elf64ProgramHeader>() {
            return Err(LoaderError::ElfInvalid);
        }

        Ok(header)
    }
}

/// ELF64 program header.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

/// Returns the PT_LOAD program headers of a validated image, bounds
/// checked against the file.
pub fn load_segments(data: &[u8]) -> Result<alloc::vec::Vec<Elf64ProgramHeader>, LoaderError> {
    let header = Elf64Header::from_bytes(data)?;

    let phoff = header.e_phoff as usize;
    let phsize = core::mem::size_of::<Elf64ProgramHeader>();
    let table_end = phoff
        .checked_add(header.e_phnum as usize * phsize)
        .ok_or(LoaderError::ElfInvalid)?;
    if table_end > data.len() {
        return Err(LoaderError::ElfInvalid);
    }

    let mut segments = alloc::vec::Vec::new();
    for i in 0..header.e_phnum as usize {
        let offset = phoff + i * phsize;
        let phdr = unsafe {
            core::ptr::read_unaligned(data.as_ptr().add(offset).cast::<Elf64ProgramHeader>())
        };

        if phdr.p_type != PT_LOAD {
            continue;
        }

        let file_end = phdr
            .p_offset
            .checked_add(phdr.p_filesz)
            .ok_or(LoaderError::ElfInvalid)?;
        if file_end > data.len() as u64 || phdr.p_filesz > phdr.p_memsz {
            return Err(LoaderError::ElfInvalid);
        }

        segments.push(phdr);
    }

    Ok(segments)
}

#[cfg(test)]
pub(crate) mod testdata {
    use super::*;

    /// Builds a minimal x86-64 ELF with the given PT_LOAD segments as
    /// `(vaddr, file_bytes, memsz, flags)`.
    pub fn build_elf(segments: &[(u64, &[u8], u64, u32)]) -> Vec<u8> {
        let phnum = segments.len() as u16;
        let phsize = core::mem::size_of::<Elf64ProgramHeader>();
        let data_start = Elf64Header::SIZE + phnum as usize * phsize;

        let mut image = vec![0u8; data_start];
        image[0..4].copy_from_slice(&ELF_MAGIC);
        image[4] = ELFCLASS64;
        image[5] = ELFDATA2LSB;
        image[6] = 1; // EV_CURRENT

        // e_type = ET_EXEC, e_machine = EM_X86_64, e_version = 1.
        image[16..18].copy_from_slice(&2u16.to_le_bytes());
        image[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        // e_phoff right after the header.
        image[32..40].copy_from_slice(&(Elf64Header::SIZE as u64).to_le_bytes());
        // e_ehsize, e_phentsize, e_phnum.
        image[52..54].copy_from_slice(&(Elf64Header::SIZE as u16).to_le_bytes());
        image[54..56].copy_from_slice(&(phsize as u16).to_le_bytes());
        image[56..58].copy_from_slice(&phnum.to_le_bytes());

        let mut offset = data_start as u64;
        for (i, (vaddr, bytes, memsz, flags)) in segments.iter().enumerate() {
            let phdr = Elf64ProgramHeader {
                p_type: PT_LOAD,
                p_flags: *flags,
                p_offset: offset,
                p_vaddr: *vaddr,
                p_paddr: *vaddr,
                p_filesz: bytes.len() as u64,
                p_memsz: *memsz,
                p_align: 0x1000,
            };

            let phdr_bytes = unsafe {
                core::slice::from_raw_parts(
                    (&phdr as *const Elf64ProgramHeader).cast::<u8>(),
                    phsize,
                )
            };
            let dst = Elf64Header::SIZE + i * phsize;
            image[dst..dst + phsize].copy_from_slice(phdr_bytes);

            image.extend_from_slice(bytes);
            offset += bytes.len() as u64;
        }

        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_image_yields_its_load_segments() {
        let image = testdata::build_elf(&[
            (0x1000, b"code", 0x1000, PF_R | PF_X),
            (0x3000, b"data", 0x2000, PF_R | PF_W),
        ]);

        let segments = load_segments(&image).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].p_vaddr, 0x1000);
        assert_eq!(segments[0].p_flags, PF_R | PF_X);
        assert_eq!(segments[1].p_memsz, 0x2000);
        assert_eq!(segments[1].p_filesz, 4);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut image = testdata::build_elf(&[(0x1000, b"code", 0x1000, PF_R)]);
        image[0] = 0;
        assert_eq!(load_segments(&image).unwrap_err(), LoaderError::ElfInvalid);
    }

    #[test]
    fn truncated_images_are_rejected() {
        let image = testdata::build_elf(&[(0x1000, b"code", 0x1000, PF_R)]);
        // Cut into the segment bytes.
        assert!(load_segments(&image[..image.len() - 2]).is_err());
        // Cut into the program-header table.
        assert!(load_segments(&image[..Elf64Header::SIZE + 8]).is_err());
    }
}
