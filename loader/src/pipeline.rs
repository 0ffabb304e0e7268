//! The VMM launch pipeline.
//!
//! An ordered sequence of alloc/copy/map stages followed by the per-CPU
//! fan-out. Each stage's output lands in `Staged` the moment it exists,
//! so a failure at stage k releases exactly what stages 1..k-1 acquired,
//! in reverse order. The pipeline owns every allocation until the whole
//! bring-up succeeds; only then does ownership transfer to the running
//! VMM.

use {
    crate::{
        args::verify_start_vmm_args,
        elf,
        error::LoaderError,
        per_cpu::{CpuVirt, PerCpuContext},
        platform::{Direction, OwnedSpan, Platform},
        pools::{alloc_mk_huge_pool, alloc_mk_page_pool},
        root_page_table::{MapAttr, RootPageTable},
        status::VmmStatus,
    },
    alloc::{boxed::Box, vec::Vec},
    mirage_hypervisor::intel::{
        descriptor::default_exception_stub,
        host::{MemoryDescriptor, MemoryType},
        vmlaunch::{launch_vm, vmexit_landing},
    },
    mirage_shared::{
        args::StartVmmArgs,
        consts::{
            LOADER_FAILURE, LOADER_SUCCESS, MAX_ELF_FILE_SIZE, MK_CODE_ALIAS_ADDR,
            MK_DEBUG_RING_ADDR, MK_ELF_FILE_ADDR, MK_ELF_SEGMENTS_ADDR, MK_EXT_ELF_FILES_ADDR,
            MK_HUGE_POOL_ADDR, MK_PAGE_POOL_ADDR, PAGE_SIZE,
        },
        ring::DebugRing,
    },
};

const BANNER: &[u8] = b"VMM started\n";

/// One staged, loadable microkernel segment.
pub struct Segment {
    pub span: OwnedSpan,
    pub vaddr: u64,
    pub flags: u32,
}

/// Everything the launch acquires, in acquisition order.
#[derive(Default)]
struct Staged {
    root_page_table: Option<RootPageTable>,
    mk_elf_file: Option<OwnedSpan>,
    ext_elf_files: Vec<OwnedSpan>,
    mk_elf_segments: Vec<Segment>,
    page_pool: Option<OwnedSpan>,
    huge_pool: Option<OwnedSpan>,
}

/// The loader: lifecycle state, the debug ring, and the resources of the
/// running VMM. One per host; the IOCTL entry path serializes access.
pub struct Loader<P: Platform, C: CpuVirt> {
    platform: P,
    cpu: C,
    status: VmmStatus,
    ring: Box<DebugRing>,
    descriptors: Vec<MemoryDescriptor>,
    resources: Option<Staged>,
}

impl<P: Platform, C: CpuVirt> Loader<P, C> {
    pub fn new(platform: P, cpu: C) -> Self {
        Self {
            platform,
            cpu,
            status: VmmStatus::Stopped,
            ring: Box::new(DebugRing::new()),
            descriptors: Vec::new(),
            resources: None,
        }
    }

    pub fn status(&self) -> VmmStatus {
        self.status
    }

    /// The host-facing view of the debug ring.
    pub fn ring_mut(&mut self) -> &mut DebugRing {
        &mut self.ring
    }

    /// The `start_vmm` IOCTL: one `copy_from_user`, validation, then the
    /// launch pipeline.
    pub fn start_vmm_ioctl(&mut self, user_args: u64) -> i64 {
        let mut args = StartVmmArgs::new(mirage_shared::args::Span::empty(), 0);
        let copied = self.platform.copy_from_user(
            &mut args as *mut StartVmmArgs as *mut u8,
            user_args,
            core::mem::size_of::<StartVmmArgs>() as u64,
        );
        if !copied {
            log::error!("platform_copy_from_user failed");
            return LOADER_FAILURE;
        }

        match self.start_vmm(&args) {
            Ok(()) => LOADER_SUCCESS,
            Err(e) => {
                log::error!("start_vmm failed: {e}");
                LOADER_FAILURE
            }
        }
    }

    /// The `stop_vmm` IOCTL.
    pub fn stop_vmm_ioctl(&mut self) -> i64 {
        match self.stop_vmm() {
            Ok(()) => LOADER_SUCCESS,
            Err(e) => {
                log::error!("stop_vmm failed: {e}");
                LOADER_FAILURE
            }
        }
    }

    /// Validates the arguments and runs the launch pipeline.
    pub fn start_vmm(&mut self, args: &StartVmmArgs) -> Result<(), LoaderError> {
        verify_start_vmm_args(args)?;

        if self.status == VmmStatus::Running {
            self.stop_vmm()?;
        }

        if self.status == VmmStatus::Corrupt {
            log::error!("unable to start, previous VMM failed to properly stop");
            return Err(LoaderError::Corrupt);
        }

        self.ring.reset();
        self.descriptors.clear();

        let mut staged = Staged::default();
        if let Err(e) = Self::stage(
            &self.platform,
            args,
            self.ring.as_ref(),
            &mut staged,
            &mut self.descriptors,
        ) {
            Self::release(&self.platform, staged);
            return Err(e);
        }

        dump_staged(&staged);

        let ctx = PerCpuContext {
            ring: self.ring.as_mut() as *mut DebugRing,
            descriptors: &self.descriptors,
            host_cpu: 0,
        };

        let cpu = &self.cpu;
        let forward = self
            .platform
            .on_each_cpu(Direction::Forward, &mut |id| cpu.start(id, &ctx));

        if forward.is_err() {
            log::error!("start_vmm_per_cpu failed");

            let reverse = self
                .platform
                .on_each_cpu(Direction::Reverse, &mut |id| cpu.stop(id));
            if reverse.is_err() {
                // Some CPU is stuck half-virtualized; nothing can be
                // safely freed until reboot.
                log::error!("stop_vmm_per_cpu failed");
                self.status = VmmStatus::Corrupt;
                return Err(LoaderError::CpuStartFailed);
            }

            Self::release(&self.platform, staged);
            return Err(LoaderError::CpuStartFailed);
        }

        self.ring.write_bytes(BANNER);
        self.resources = Some(staged);
        self.status = VmmStatus::Running;

        Ok(())
    }

    /// Broadcasts the per-CPU teardown in reverse order and frees every
    /// pool and table the launch acquired.
    pub fn stop_vmm(&mut self) -> Result<(), LoaderError> {
        match self.status {
            VmmStatus::Corrupt => return Err(LoaderError::Corrupt),
            VmmStatus::Stopped => return Ok(()),
            VmmStatus::Running => {}
        }

        let cpu = &self.cpu;
        let reverse = self
            .platform
            .on_each_cpu(Direction::Reverse, &mut |id| cpu.stop(id));
        if reverse.is_err() {
            log::error!("stop_vmm_per_cpu failed");
            self.status = VmmStatus::Corrupt;
            return Err(LoaderError::CpuStopFailed);
        }

        if let Some(staged) = self.resources.take() {
            Self::release(&self.platform, staged);
        }
        self.descriptors.clear();
        self.status = VmmStatus::Stopped;

        Ok(())
    }

    // ---------------------------------------------------------------
    // Stages
    // ---------------------------------------------------------------

    fn stage(
        platform: &P,
        args: &StartVmmArgs,
        ring: &DebugRing,
        staged: &mut Staged,
        descriptors: &mut Vec<MemoryDescriptor>,
    ) -> Result<(), LoaderError> {
        staged.root_page_table = Some(RootPageTable::new(platform)?);

        let mk = args.mk_elf_file;
        staged.mk_elf_file = Some(Self::alloc_and_copy_from_user(platform, mk.addr, mk.size)?);

        let exts = args.ext_elf_files;
        for ext in exts {
            if ext.is_empty() {
                continue;
            }
            staged
                .ext_elf_files
                .push(Self::alloc_and_copy_from_user(platform, ext.addr, ext.size)?);
        }

        Self::alloc_and_copy_mk_elf_segments(platform, staged)?;

        staged.page_pool = Some(alloc_mk_page_pool(platform, args.page_pool_size)?);
        staged.huge_pool = Some(alloc_mk_huge_pool(platform, 0)?);

        let root = staged
            .root_page_table
            .as_mut()
            .ok_or(LoaderError::MapFailed)?;

        // Install everything into the fixed VMM virtual layout.
        Self::map_span(
            platform,
            root,
            descriptors,
            MK_DEBUG_RING_ADDR,
            ring as *const DebugRing as u64,
            core::mem::size_of::<DebugRing>() as u64,
            MapAttr::ReadWrite,
        )?;

        Self::map_mk_code_aliases(platform, root, descriptors)?;

        let mk = staged.mk_elf_file.as_ref().ok_or(LoaderError::MapFailed)?;
        Self::map_span(
            platform,
            root,
            descriptors,
            MK_ELF_FILE_ADDR,
            mk.addr(),
            mk.size,
            MapAttr::ReadWrite,
        )?;

        for (idx, ext) in staged.ext_elf_files.iter().enumerate() {
            Self::map_span(
                platform,
                root,
                descriptors,
                MK_EXT_ELF_FILES_ADDR + idx as u64 * MAX_ELF_FILE_SIZE,
                ext.addr(),
                ext.size,
                MapAttr::ReadWrite,
            )?;
        }

        for segment in &staged.mk_elf_segments {
            let attr = if segment.flags & elf::PF_X != 0 {
                MapAttr::ReadExecute
            } else {
                MapAttr::ReadWrite
            };
            Self::map_span(
                platform,
                root,
                descriptors,
                MK_ELF_SEGMENTS_ADDR + segment.vaddr,
                segment.span.addr(),
                segment.span.size,
                attr,
            )?;
        }

        let pool = staged.page_pool.as_ref().ok_or(LoaderError::MapFailed)?;
        Self::map_span(
            platform,
            root,
            descriptors,
            MK_PAGE_POOL_ADDR,
            pool.addr(),
            pool.size,
            MapAttr::ReadWrite,
        )?;

        let pool = staged.huge_pool.as_ref().ok_or(LoaderError::MapFailed)?;
        Self::map_span(
            platform,
            root,
            descriptors,
            MK_HUGE_POOL_ADDR,
            pool.addr(),
            pool.size,
            MapAttr::ReadWrite,
        )?;

        Ok(())
    }

    fn alloc_and_copy_from_user(
        platform: &P,
        user_addr: u64,
        size: u64,
    ) -> Result<OwnedSpan, LoaderError> {
        let span = platform.alloc_span(align_up(size))?;
        if !platform.copy_from_user(span.ptr.as_ptr(), user_addr, size) {
            // The span is not yet owned by the caller; give it back.
            platform.free_span(span);
            return Err(LoaderError::CopyFailed);
        }
        Ok(span)
    }

    /// Parses the staged microkernel image and stages one allocation per
    /// PT_LOAD segment: file bytes copied, the rest zero.
    fn alloc_and_copy_mk_elf_segments(
        platform: &P,
        staged: &mut Staged,
    ) -> Result<(), LoaderError> {
        let image = staged.mk_elf_file.as_ref().ok_or(LoaderError::ElfInvalid)?;
        let segments = elf::load_segments(image.as_slice())?;

        for phdr in segments {
            let mut span = platform.alloc_span(align_up(phdr.p_memsz))?;
            let file_bytes =
                &image.as_slice()[phdr.p_offset as usize..(phdr.p_offset + phdr.p_filesz) as usize];
            span.as_mut_slice()[..file_bytes.len()].copy_from_slice(file_bytes);

            staged.mk_elf_segments.push(Segment {
                span,
                vaddr: phdr.p_vaddr,
                flags: phdr.p_flags,
            });
        }

        Ok(())
    }

    /// Maps the launch/exit/exception trampolines the virtualized CPU
    /// keeps executing after the handoff.
    fn map_mk_code_aliases(
        platform: &P,
        root: &mut RootPageTable,
        descriptors: &mut Vec<MemoryDescriptor>,
    ) -> Result<(), LoaderError> {
        let symbols = [
            launch_vm as usize as u64,
            vmexit_landing as usize as u64,
            default_exception_stub as usize as u64,
        ];

        let mut pages: Vec<u64> = symbols
            .iter()
            .map(|addr| addr & !(PAGE_SIZE - 1))
            .collect();
        pages.sort_unstable();
        pages.dedup();

        for (idx, page) in pages.iter().enumerate() {
            let virt = MK_CODE_ALIAS_ADDR + idx as u64 * PAGE_SIZE;
            let phys = platform.virt_to_phys(*page);
            root.map_4k(platform, virt, phys, MapAttr::ReadExecute)?;
            descriptors.push(MemoryDescriptor {
                virt,
                phys,
                typ: MemoryType::READ | MemoryType::EXECUTE,
            });
        }

        Ok(())
    }

    fn map_span(
        platform: &P,
        root: &mut RootPageTable,
        descriptors: &mut Vec<MemoryDescriptor>,
        virt_base: u64,
        addr: u64,
        size: u64,
        attr: MapAttr,
    ) -> Result<(), LoaderError> {
        let typ = match attr {
            MapAttr::ReadWrite => MemoryType::READ | MemoryType::WRITE,
            MapAttr::ReadExecute => MemoryType::READ | MemoryType::EXECUTE,
        };

        let mut offset = 0;
        while offset < align_up(size) {
            let phys = platform.virt_to_phys(addr + offset);
            root.map_4k(platform, virt_base + offset, phys, attr)?;
            descriptors.push(MemoryDescriptor {
                virt: virt_base + offset,
                phys,
                typ,
            });
            offset += PAGE_SIZE;
        }

        Ok(())
    }

    /// Releases staged resources in reverse acquisition order.
    fn release(platform: &P, staged: Staged) {
        if let Some(pool) = staged.huge_pool {
            platform.free_span(pool);
        }
        if let Some(pool) = staged.page_pool {
            platform.free_span(pool);
        }
        for segment in staged.mk_elf_segments.into_iter().rev() {
            platform.free_span(segment.span);
        }
        for ext in staged.ext_elf_files.into_iter().rev() {
            platform.free_span(ext);
        }
        if let Some(mk) = staged.mk_elf_file {
            platform.free_span(mk);
        }
        if let Some(root) = staged.root_page_table {
            root.release(platform);
        }
    }
}

fn dump_staged(staged: &Staged) {
    if let Some(mk) = &staged.mk_elf_file {
        log::debug!("mk elf file: {:#x} ({} bytes)", mk.addr(), mk.size);
    }
    for (idx, ext) in staged.ext_elf_files.iter().enumerate() {
        log::debug!("ext elf file[{idx}]: {:#x} ({} bytes)", ext.addr(), ext.size);
    }
    for segment in &staged.mk_elf_segments {
        log::debug!(
            "mk segment: vaddr {:#x} flags {:#x} ({} bytes)",
            segment.vaddr,
            segment.flags,
            segment.span.size
        );
    }
    if let Some(pool) = &staged.page_pool {
        log::debug!("page pool: {:#x} ({} bytes)", pool.addr(), pool.size);
    }
    if let Some(pool) = &staged.huge_pool {
        log::debug!("huge pool: {:#x} ({} bytes)", pool.addr(), pool.size);
    }
}

fn align_up(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::elf::testdata::build_elf;
    use mirage_shared::args::Span;
    use mirage_shared::consts::{MK_PAGE_POOL_SIZE, START_VMM_ARGS_VERSION};
    use std::{
        alloc::{alloc_zeroed, dealloc, Layout},
        cell::{Cell, RefCell},
        collections::{BTreeMap, BTreeSet},
        ptr::NonNull,
    };

    /// In-process platform with allocation tracking and failure
    /// injection.
    pub(crate) struct MockPlatform {
        cpus: u32,
        allocs: RefCell<BTreeMap<usize, u64>>,
        alloc_count: Cell<usize>,
        fail_after: Cell<usize>,
        fail_contiguous: Cell<bool>,
        fail_copy: Cell<bool>,
    }

    impl MockPlatform {
        pub(crate) fn new(cpus: u32) -> Self {
            Self {
                cpus,
                allocs: RefCell::new(BTreeMap::new()),
                alloc_count: Cell::new(0),
                fail_after: Cell::new(usize::MAX),
                fail_contiguous: Cell::new(false),
                fail_copy: Cell::new(false),
            }
        }

        /// Fails every allocation after the next `n` successes.
        pub(crate) fn fail_after(&self, n: usize) {
            self.fail_after.set(n);
        }

        pub(crate) fn fail_contiguous(&self) {
            self.fail_contiguous.set(true);
        }

        pub(crate) fn fail_copy(&self) {
            self.fail_copy.set(true);
        }

        /// Allocations not yet freed.
        pub(crate) fn outstanding(&self) -> usize {
            self.allocs.borrow().len()
        }

        pub(crate) fn alloc_count(&self) -> usize {
            self.alloc_count.get()
        }

        fn alloc_inner(&self, size: u64) -> Option<NonNull<u8>> {
            if self.fail_after.get() == 0 {
                return None;
            }
            self.fail_after.set(self.fail_after.get().saturating_sub(1));
            self.alloc_count.set(self.alloc_count.get() + 1);

            let layout = Layout::from_size_align(size as usize, 4096).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            let ptr = NonNull::new(ptr)?;
            self.allocs.borrow_mut().insert(ptr.as_ptr() as usize, size);
            Some(ptr)
        }
    }

    impl Platform for MockPlatform {
        fn alloc(&self, size: u64) -> Option<NonNull<u8>> {
            self.alloc_inner(size)
        }

        fn alloc_contiguous(&self, size: u64) -> Option<NonNull<u8>> {
            if self.fail_contiguous.get() {
                return None;
            }
            self.alloc_inner(size)
        }

        fn free(&self, ptr: NonNull<u8>, size: u64) {
            let tracked = self.allocs.borrow_mut().remove(&(ptr.as_ptr() as usize));
            assert_eq!(tracked, Some(size), "freed span does not match allocation");
            let layout = Layout::from_size_align(size as usize, 4096).unwrap();
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }

        fn copy_from_user(&self, dst: *mut u8, src: u64, size: u64) -> bool {
            if self.fail_copy.get() {
                return false;
            }
            unsafe { core::ptr::copy_nonoverlapping(src as *const u8, dst, size as usize) };
            true
        }

        fn virt_to_phys(&self, virt: u64) -> u64 {
            virt
        }

        fn num_cpus(&self) -> u32 {
            self.cpus
        }

        fn on_each_cpu(
            &self,
            direction: Direction,
            cb: &mut dyn FnMut(u32) -> Result<(), LoaderError>,
        ) -> Result<(), LoaderError> {
            let ids: Vec<u32> = match direction {
                Direction::Forward => (0..self.cpus).collect(),
                Direction::Reverse => (0..self.cpus).rev().collect(),
            };
            for id in ids {
                cb(id)?;
            }
            Ok(())
        }
    }

    /// In-process per-CPU virtualization with failure injection.
    pub(crate) struct MockCpu {
        active: RefCell<BTreeSet<u32>>,
        started: RefCell<Vec<u32>>,
        stopped: RefCell<Vec<u32>>,
        fail_start_on: Cell<Option<u32>>,
        fail_stop: Cell<bool>,
    }

    impl MockCpu {
        pub(crate) fn new() -> Self {
            Self {
                active: RefCell::new(BTreeSet::new()),
                started: RefCell::new(Vec::new()),
                stopped: RefCell::new(Vec::new()),
                fail_start_on: Cell::new(None),
                fail_stop: Cell::new(false),
            }
        }

        pub(crate) fn fail_start_on(&self, cpu: u32) {
            self.fail_start_on.set(Some(cpu));
        }

        pub(crate) fn fail_stop(&self) {
            self.fail_stop.set(true);
        }
    }

    impl CpuVirt for MockCpu {
        fn start(&self, cpu: u32, _ctx: &PerCpuContext<'_>) -> Result<(), LoaderError> {
            if self.fail_start_on.get() == Some(cpu) {
                return Err(LoaderError::CpuStartFailed);
            }
            self.active.borrow_mut().insert(cpu);
            self.started.borrow_mut().push(cpu);
            Ok(())
        }

        fn stop(&self, cpu: u32) -> Result<(), LoaderError> {
            if self.fail_stop.get() {
                return Err(LoaderError::CpuStopFailed);
            }
            self.active.borrow_mut().remove(&cpu);
            self.stopped.borrow_mut().push(cpu);
            Ok(())
        }
    }

    fn user_images() -> (Vec<u8>, Vec<u8>) {
        let mk = build_elf(&[
            (0x0000, b"\x90\x90\x90\x90", 0x1000, elf::PF_R | elf::PF_X),
            (0x2000, b"data", 0x2000, elf::PF_R | elf::PF_W),
        ]);
        let ext = build_elf(&[(0x0000, b"ext!", 0x1000, elf::PF_R | elf::PF_X)]);
        (mk, ext)
    }

    fn args_for(mk: &[u8], ext: &[u8], page_pool_size: u32) -> StartVmmArgs {
        let mut args = StartVmmArgs::new(
            Span::new(mk.as_ptr() as u64, mk.len() as u64),
            page_pool_size,
        );
        args.ext_elf_files[0] = Span::new(ext.as_ptr() as u64, ext.len() as u64);
        args
    }

    fn drain(ring: &mut DebugRing) -> Vec<u8> {
        core::iter::from_fn(|| ring.pop()).collect()
    }

    #[test]
    fn start_succeeds_and_reports_running_with_banner() {
        let (mk, ext) = user_images();
        let mut loader = Loader::new(MockPlatform::new(1), MockCpu::new());

        loader.start_vmm(&args_for(&mk, &ext, 0)).unwrap();
        assert_eq!(loader.status(), VmmStatus::Running);
        assert_eq!(drain(loader.ring_mut()), BANNER);

        // The staged image landed in the VMM layout.
        let resources = loader.resources.as_ref().unwrap();
        let root = resources.root_page_table.as_ref().unwrap();
        let mk_copy = resources.mk_elf_file.as_ref().unwrap();
        assert_eq!(
            root.translate(MK_ELF_FILE_ADDR),
            Some((mk_copy.addr(), MapAttr::ReadWrite))
        );
        assert_eq!(
            root.translate(MK_DEBUG_RING_ADDR).map(|(_, attr)| attr),
            Some(MapAttr::ReadWrite)
        );
        // Pools sized by default, in pages.
        assert_eq!(
            resources.page_pool.as_ref().unwrap().size,
            PAGE_SIZE * MK_PAGE_POOL_SIZE as u64
        );

        loader.stop_vmm().unwrap();
        assert_eq!(loader.status(), VmmStatus::Stopped);
        assert_eq!(loader.platform.outstanding(), 0);
    }

    #[test]
    fn bad_version_is_rejected_before_any_allocation() {
        let (mk, ext) = user_images();
        let mut loader = Loader::new(MockPlatform::new(1), MockCpu::new());

        let mut args = args_for(&mk, &ext, 0);
        args.ver = START_VMM_ARGS_VERSION + 1;

        assert_eq!(
            loader.start_vmm(&args).unwrap_err(),
            LoaderError::ArgInvalid
        );
        assert_eq!(loader.platform.alloc_count(), 0);
        assert_eq!(loader.status(), VmmStatus::Stopped);
    }

    #[test]
    fn huge_pool_failure_rolls_back_everything() {
        let (mk, ext) = user_images();
        let mut loader = Loader::new(MockPlatform::new(1), MockCpu::new());
        loader.platform.fail_contiguous();

        assert_eq!(
            loader.start_vmm(&args_for(&mk, &ext, 0)).unwrap_err(),
            LoaderError::AllocFailed
        );
        assert_eq!(loader.status(), VmmStatus::Stopped);
        assert_eq!(loader.platform.outstanding(), 0);
    }

    #[test]
    fn copy_failure_rolls_back_everything() {
        let (mk, ext) = user_images();
        let mut loader = Loader::new(MockPlatform::new(1), MockCpu::new());
        loader.platform.fail_copy();

        assert_eq!(
            loader.start_vmm(&args_for(&mk, &ext, 0)).unwrap_err(),
            LoaderError::CopyFailed
        );
        assert_eq!(loader.platform.outstanding(), 0);
    }

    #[test]
    fn per_cpu_failure_unwinds_started_cpus_and_frees() {
        let (mk, ext) = user_images();
        let mut loader = Loader::new(MockPlatform::new(4), MockCpu::new());
        loader.cpu.fail_start_on(2);

        assert_eq!(
            loader.start_vmm(&args_for(&mk, &ext, 0)).unwrap_err(),
            LoaderError::CpuStartFailed
        );
        assert_eq!(loader.status(), VmmStatus::Stopped);
        assert_eq!(loader.platform.outstanding(), 0);
        // CPUs 0 and 1 started; the reverse sweep visited 3..0.
        assert_eq!(*loader.cpu.started.borrow(), [0, 1]);
        assert_eq!(*loader.cpu.stopped.borrow(), [3, 2, 1, 0]);
        assert!(loader.cpu.active.borrow().is_empty());
    }

    #[test]
    fn failed_teardown_latches_corrupt_permanently() {
        let (mk, ext) = user_images();
        let mut loader = Loader::new(MockPlatform::new(2), MockCpu::new());
        loader.cpu.fail_start_on(1);
        loader.cpu.fail_stop();

        assert!(loader.start_vmm(&args_for(&mk, &ext, 0)).is_err());
        assert_eq!(loader.status(), VmmStatus::Corrupt);

        // Every future start refuses without allocating.
        loader.cpu.fail_start_on(u32::MAX);
        let allocs_before = loader.platform.alloc_count();
        assert_eq!(
            loader.start_vmm(&args_for(&mk, &ext, 0)).unwrap_err(),
            LoaderError::Corrupt
        );
        assert_eq!(loader.platform.alloc_count(), allocs_before);
        assert_eq!(loader.status(), VmmStatus::Corrupt);
    }

    #[test]
    fn starting_while_running_stops_the_previous_vmm_first() {
        let (mk, ext) = user_images();
        let mut loader = Loader::new(MockPlatform::new(2), MockCpu::new());

        loader.start_vmm(&args_for(&mk, &ext, 0)).unwrap();
        loader.start_vmm(&args_for(&mk, &ext, 2)).unwrap();

        assert_eq!(loader.status(), VmmStatus::Running);
        // First launch 0,1; reverse stop 1,0; second launch 0,1.
        assert_eq!(*loader.cpu.started.borrow(), [0, 1, 0, 1]);
        assert_eq!(*loader.cpu.stopped.borrow(), [1, 0]);
        // The second pool size was honored.
        assert_eq!(
            loader.resources.as_ref().unwrap().page_pool.as_ref().unwrap().size,
            PAGE_SIZE * 2
        );

        loader.stop_vmm().unwrap();
        assert_eq!(loader.platform.outstanding(), 0);
    }

    #[test]
    fn segments_map_with_their_elf_permissions() {
        let (mk, ext) = user_images();
        let mut loader = Loader::new(MockPlatform::new(1), MockCpu::new());
        loader.start_vmm(&args_for(&mk, &ext, 0)).unwrap();

        let resources = loader.resources.as_ref().unwrap();
        let root = resources.root_page_table.as_ref().unwrap();

        assert_eq!(
            root.translate(MK_ELF_SEGMENTS_ADDR).map(|(_, attr)| attr),
            Some(MapAttr::ReadExecute)
        );
        assert_eq!(
            root.translate(MK_ELF_SEGMENTS_ADDR + 0x2000).map(|(_, a)| a),
            Some(MapAttr::ReadWrite)
        );

        // Segment bytes were staged: code then zero-filled tail.
        let code = resources.mk_elf_segments[0].span.as_slice();
        assert_eq!(&code[..4], b"\x90\x90\x90\x90");
        assert!(code[4..].iter().all(|&b| b == 0));

        loader.stop_vmm().unwrap();
    }
}
