//! The shared host state every vCPU loads on VM exit.
//!
//! Built exactly once, before any CPU enters VMX operation: the VMM root
//! page table over the memory manager's descriptor list, and the derived
//! host CR0/CR3/CR4/PAT/EFER values the VMCS programmer writes into every
//! host-state area. Later callers observe the completed value.

use {
    crate::error::HypervisorError,
    alloc::{boxed::Box, vec::Vec},
    bitflags::bitflags,
    mirage_shared::{consts::PAGE_SHIFT, pte::Pte},
    spin::Once,
};

// CR0 bits.
const CR0_PE: u64 = 1 << 0;
const CR0_MP: u64 = 1 << 1;
const CR0_ET: u64 = 1 << 4;
const CR0_NE: u64 = 1 << 5;
const CR0_WP: u64 = 1 << 16;
const CR0_PG: u64 = 1 << 31;

// CR4 bits.
const CR4_VME: u64 = 1 << 0;
const CR4_PVI: u64 = 1 << 1;
const CR4_TSD: u64 = 1 << 2;
const CR4_DE: u64 = 1 << 3;
const CR4_PSE: u64 = 1 << 4;
const CR4_PAE: u64 = 1 << 5;
const CR4_MCE: u64 = 1 << 6;
const CR4_PGE: u64 = 1 << 7;
const CR4_PCE: u64 = 1 << 8;
const CR4_OSFXSR: u64 = 1 << 9;
const CR4_OSXMMEXCPT: u64 = 1 << 10;
const CR4_VMXE: u64 = 1 << 13;
const CR4_SMEP: u64 = 1 << 20;
const CR4_SMAP: u64 = 1 << 21;
const CR4_OSXSAVE: u64 = 1 << 18;

// IA32_EFER bits.
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;
const EFER_NXE: u64 = 1 << 11;

/// PAT programming the root table's memory types assume:
/// WB, WT, UC-, UC repeated across both halves.
const HOST_PAT: u64 = 0x0007_0406_0007_0406;

bitflags! {
    /// Access type of one memory-manager descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryType: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// One entry of the memory manager's descriptor list.
#[derive(Debug, Clone, Copy)]
pub struct MemoryDescriptor {
    pub virt: u64,
    pub phys: u64,
    pub typ: MemoryType,
}

/// A 4 KiB table of wire-format entries.
#[repr(C, align(4096))]
struct PtTable {
    entries: [Pte; 512],
}

impl PtTable {
    fn zeroed() -> Box<Self> {
        Box::new(Self {
            entries: [Pte::zero(); 512],
        })
    }
}

/// The VMM root page table: host virtual to host physical, 4 KiB mappings
/// only. Intermediate tables are allocated lazily and stay alive for the
/// lifetime of the VMM.
pub struct RootPageTable {
    pml4: Box<PtTable>,
    tables: Vec<Box<PtTable>>,
}

/// Mapping policy for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAttr {
    ReadWrite,
    ReadExecute,
}

impl RootPageTable {
    pub fn new() -> Self {
        Self {
            pml4: PtTable::zeroed(),
            tables: Vec::new(),
        }
    }

    /// Maps one 4 KiB page. Remapping an already-mapped virtual address
    /// fails without mutating the table.
    pub fn map_4k(&mut self, virt: u64, phys: u64, attr: PageAttr) -> Result<(), HypervisorError> {
        if virt & 0xFFF != 0 || phys & 0xFFF != 0 {
            return Err(HypervisorError::UnalignedAddress);
        }

        let pdpt = Self::next_table(&mut self.tables, &mut self.pml4, pml4_index(virt));
        let pd = Self::next_table(&mut self.tables, pdpt, pdpt_index(virt));
        let pt = Self::next_table(&mut self.tables, pd, pd_index(virt));

        let entry = &mut pt.entries[pt_index(virt)];
        if entry.p() {
            return Err(HypervisorError::PageAlreadyMapped);
        }

        entry.set_p(true);
        entry.set_rw(matches!(attr, PageAttr::ReadWrite));
        entry.set_nx(matches!(attr, PageAttr::ReadWrite));
        entry.set_g(true);
        entry.set_phys_addr(phys);

        Ok(())
    }

    /// Walks the table for one virtual address. Returns the physical
    /// address and the installed attribute.
    pub fn translate(&self, virt: u64) -> Option<(u64, PageAttr)> {
        let pdpt = self.walk_to(&self.pml4, pml4_index(virt))?;
        let pd = self.walk_to(pdpt, pdpt_index(virt))?;
        let pt = self.walk_to(pd, pd_index(virt))?;

        let entry = &pt.entries[pt_index(virt)];
        if !entry.p() {
            return None;
        }

        let attr = if entry.nx() {
            PageAttr::ReadWrite
        } else {
            PageAttr::ReadExecute
        };
        Some((entry.phys_addr() | (virt & 0xFFF), attr))
    }

    /// The physical root the host CR3 points at. Tables live in VMM
    /// memory, which is identity-accessible to the VMM itself.
    pub fn root_phys(&self) -> u64 {
        self.pml4.as_ref() as *const _ as u64
    }

    fn next_table<'a>(
        tables: &mut Vec<Box<PtTable>>,
        parent: &'a mut PtTable,
        index: usize,
    ) -> &'a mut PtTable {
        let entry = &mut parent.entries[index];
        if !entry.p() {
            let table = PtTable::zeroed();
            let pa = table.as_ref() as *const _ as u64;
            entry.set_p(true);
            entry.set_rw(true);
            entry.set_phys_addr(pa);
            tables.push(table);
        }

        let pa = entry.phys_addr();
        unsafe { &mut *(pa as *mut PtTable) }
    }

    fn walk_to<'a>(&self, parent: &'a PtTable, index: usize) -> Option<&'a PtTable> {
        let entry = &parent.entries[index];
        if !entry.p() {
            return None;
        }
        Some(unsafe { &*(entry.phys_addr() as *const PtTable) })
    }
}

impl Default for RootPageTable {
    fn default() -> Self {
        Self::new()
    }
}

fn pml4_index(virt: u64) -> usize {
    ((virt >> 39) & 0x1FF) as usize
}

fn pdpt_index(virt: u64) -> usize {
    ((virt >> 30) & 0x1FF) as usize
}

fn pd_index(virt: u64) -> usize {
    ((virt >> 21) & 0x1FF) as usize
}

fn pt_index(virt: u64) -> usize {
    ((virt >> PAGE_SHIFT) & 0x1FF) as usize
}

/// The completed host state.
pub struct HostState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub pat: u64,
    pub efer: u64,

    // Keeps the mapped tables alive; CR3 points into it.
    #[allow(dead_code)]
    table: RootPageTable,
}

// The table is only ever written during call_once.
unsafe impl Sync for HostState {}
unsafe impl Send for HostState {}

static HOST_STATE: Once<HostState> = Once::new();

/// Builds the host state from the descriptor list, exactly once.
/// Invocations beyond the first observe the completed state.
pub fn init(descriptors: &[MemoryDescriptor]) -> &'static HostState {
    HOST_STATE.call_once(|| build(descriptors))
}

/// The completed host state, if `init` has run.
pub fn get() -> Option<&'static HostState> {
    HOST_STATE.get()
}

fn build(descriptors: &[MemoryDescriptor]) -> HostState {
    let mut table = RootPageTable::new();

    for md in descriptors {
        let attr = if md.typ.contains(MemoryType::READ | MemoryType::EXECUTE) {
            PageAttr::ReadExecute
        } else {
            PageAttr::ReadWrite
        };

        // Descriptor lists come from the loader and never collide; a
        // duplicate would be a staging bug, not a runtime condition.
        let _ = table.map_4k(md.virt, md.phys, attr);
    }

    let cr0 = CR0_PE | CR0_MP | CR0_ET | CR0_NE | CR0_WP | CR0_PG;
    let efer = EFER_LME | EFER_LMA | EFER_NXE;
    let cr3 = table.root_phys();

    let mut cr4 = CR4_VME
        | CR4_PVI
        | CR4_TSD
        | CR4_DE
        | CR4_PSE
        | CR4_PAE
        | CR4_MCE
        | CR4_PGE
        | CR4_PCE
        | CR4_OSFXSR
        | CR4_OSXMMEXCPT
        | CR4_VMXE;

    let cpuid = x86::cpuid::CpuId::new();
    if cpuid.get_feature_info().map_or(false, |fi| fi.has_xsave()) {
        cr4 |= CR4_OSXSAVE;
    }
    if let Some(efi) = cpuid.get_extended_feature_info() {
        if efi.has_smep() {
            cr4 |= CR4_SMEP;
        }
        if efi.has_smap() {
            cr4 |= CR4_SMAP;
        }
    }

    HostState {
        cr0,
        cr3,
        cr4,
        pat: HOST_PAT,
        efer,
        table,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_execute_descriptors_map_without_nx() {
        let mut table = RootPageTable::new();
        table
            .map_4k(0x2000_0000_0000, 0x1000, PageAttr::ReadExecute)
            .unwrap();
        table
            .map_4k(0x2000_0000_1000, 0x2000, PageAttr::ReadWrite)
            .unwrap();

        assert_eq!(
            table.translate(0x2000_0000_0123),
            Some((0x1123, PageAttr::ReadExecute))
        );
        assert_eq!(
            table.translate(0x2000_0000_1FFF),
            Some((0x2FFF, PageAttr::ReadWrite))
        );
        assert_eq!(table.translate(0x2000_0000_2000), None);
    }

    #[test]
    fn remapping_a_mapped_page_fails() {
        let mut table = RootPageTable::new();
        table.map_4k(0x1000, 0x1000, PageAttr::ReadWrite).unwrap();
        assert!(table.map_4k(0x1000, 0x9000, PageAttr::ReadWrite).is_err());
        // The original mapping is intact.
        assert_eq!(table.translate(0x1000), Some((0x1000, PageAttr::ReadWrite)));
    }

    #[test]
    fn unaligned_mappings_are_rejected() {
        let mut table = RootPageTable::new();
        assert!(table.map_4k(0x1001, 0x1000, PageAttr::ReadWrite).is_err());
        assert!(table.map_4k(0x1000, 0x1001, PageAttr::ReadWrite).is_err());
    }
}
