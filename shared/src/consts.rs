//! Build-time constants for the loader and the microkernel VMM.

/// Size of a standard page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Shift of a standard page.
pub const PAGE_SHIFT: u64 = 12;

/// Supported `start_vmm` IOCTL ABI version.
pub const START_VMM_ARGS_VERSION: u64 = 1;

/// Maximum number of extension ELF images the loader will stage.
pub const MAX_EXTENSIONS: usize = 64;

/// Maximum size in bytes of the microkernel or any extension ELF image.
pub const MAX_ELF_FILE_SIZE: u64 = 0x0080_0000;

/// Size in bytes of the debug ring's byte buffer.
pub const DEBUG_RING_SIZE: usize = 0x8000;

/// Size in bytes of one VMM stack. Each vCPU carries two allocations of
/// twice this size (primary + IST1) so overruns land in guard space.
pub const STACK_SIZE: usize = 0x8000;

/// Default size of the microkernel page pool, in pages.
pub const MK_PAGE_POOL_SIZE: u32 = 512;

/// Default size of the microkernel huge pool, in pages.
pub const MK_HUGE_POOL_SIZE: u32 = 16;

/// IOCTL exit code for success.
pub const LOADER_SUCCESS: i64 = 0;

/// IOCTL exit code for any validation, allocation, mapping, or per-CPU
/// bring-up failure.
pub const LOADER_FAILURE: i64 = -1;

// The fixed virtual layout of the VMM address space. The loader installs
// every staged resource at these addresses in the root page table; the
// microkernel is linked against them.

/// Where the debug ring is mapped in the VMM address space.
pub const MK_DEBUG_RING_ADDR: u64 = 0x0000_2000_0000_0000;

/// Where the loader's code aliases are mapped in the VMM address space.
pub const MK_CODE_ALIAS_ADDR: u64 = 0x0000_2008_0000_0000;

/// Where the microkernel ELF image is mapped in the VMM address space.
pub const MK_ELF_FILE_ADDR: u64 = 0x0000_2010_0000_0000;

/// Where the extension ELF images are mapped in the VMM address space.
pub const MK_EXT_ELF_FILES_ADDR: u64 = 0x0000_2018_0000_0000;

/// Where the microkernel's loaded segments are mapped in the VMM address
/// space.
pub const MK_ELF_SEGMENTS_ADDR: u64 = 0x0000_2020_0000_0000;

/// Where the page pool is mapped in the VMM address space.
pub const MK_PAGE_POOL_ADDR: u64 = 0x0000_2028_0000_0000;

/// Where the huge pool is mapped in the VMM address space.
pub const MK_HUGE_POOL_ADDR: u64 = 0x0000_2030_0000_0000;
