//! The extended page table: second-level translation from guest-physical
//! to host-physical addresses.
//!
//! A 4-level tree whose leaves may be 1 GiB, 2 MiB, or 4 KiB, each
//! carrying a read / read-write / read-write-execute attribute.
//! Intermediate tables are allocated lazily and owned by the map; the map
//! must outlive every vCPU whose EPTP references it. Inserts that overlap
//! an existing leaf or subtree fail without mutating the tree. Callers
//! that insert while vCPUs are live must follow up with `invept` and keep
//! concurrent translations off the changed range.
//!
//! Reference: Intel SDM Vol 3, 29.3 The Extended Page Table Mechanism.

use {
    crate::{error::HypervisorError, intel::support::invept_all_contexts},
    alloc::{boxed::Box, vec::Vec},
    bitfield::bitfield,
    x86::bits64::paging::{BASE_PAGE_SHIFT, HUGE_PAGE_SIZE, LARGE_PAGE_SIZE},
};

/// Leaf page-size exponents returned by `virt_to_phys`.
pub const PAGE_SIZE_4K_BITS: u64 = 12;
pub const PAGE_SIZE_2M_BITS: u64 = 21;
pub const PAGE_SIZE_1G_BITS: u64 = 30;

const EPT_MEMORY_TYPE_WB: u64 = 6;

/// Attributes an EPT leaf can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptAttr {
    ReadOnly,
    ReadWrite,
    ReadWriteExecute,
}

bitfield! {
    /// An EPT paging-structure entry.
    ///
    /// Reference: Intel SDM Vol 3, 29.3.2 EPT Translation Mechanism.
    #[derive(Clone, Copy)]
    pub struct Entry(u64);
    impl Debug;

    pub readable, set_readable: 0;
    pub writable, set_writable: 1;
    pub executable, set_executable: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub large, set_large: 7;
    pub pfn, set_pfn: 51, 12;
}

impl Entry {
    fn is_present(&self) -> bool {
        self.readable() || self.writable() || self.executable()
    }

    fn set_attr(&mut self, attr: EptAttr) {
        self.set_readable(true);
        self.set_writable(!matches!(attr, EptAttr::ReadOnly));
        self.set_executable(matches!(attr, EptAttr::ReadWriteExecute));
    }

    fn phys(&self) -> u64 {
        self.pfn() << BASE_PAGE_SHIFT
    }
}

/// One 4 KiB table of 512 entries, at any level of the tree.
#[repr(C, align(4096))]
struct Table {
    entries: [Entry; 512],
}

impl Table {
    fn zeroed() -> Box<Self> {
        Box::new(Self {
            entries: [Entry(0); 512],
        })
    }
}

/// The extended page table map.
pub struct EptMap {
    pml4: Box<Table>,
    tables: Vec<Box<Table>>,
}

// Tables are only mutated through &mut self; vCPUs read them through the
// hardware walker, never through these references.
unsafe impl Send for EptMap {}
unsafe impl Sync for EptMap {}

impl EptMap {
    pub fn new() -> Self {
        Self {
            pml4: Table::zeroed(),
            tables: Vec::new(),
        }
    }

    /// Maps a 1 GiB leaf.
    pub fn map_1g(&mut self, gpa: u64, hpa: u64, attr: EptAttr) -> Result<(), HypervisorError> {
        check_aligned(gpa, hpa, HUGE_PAGE_SIZE as u64)?;

        let pdpt = Self::next_table(&mut self.tables, &mut self.pml4, pml4_index(gpa))?;
        Self::install_leaf(&mut pdpt.entries[pdpt_index(gpa)], hpa, attr, true)
    }

    /// Maps a 2 MiB leaf.
    pub fn map_2m(&mut self, gpa: u64, hpa: u64, attr: EptAttr) -> Result<(), HypervisorError> {
        check_aligned(gpa, hpa, LARGE_PAGE_SIZE as u64)?;

        let pdpt = Self::next_table(&mut self.tables, &mut self.pml4, pml4_index(gpa))?;
        let pd = Self::next_table(&mut self.tables, pdpt, pdpt_index(gpa))?;
        Self::install_leaf(&mut pd.entries[pd_index(gpa)], hpa, attr, true)
    }

    /// Maps a 4 KiB leaf.
    pub fn map_4k(&mut self, gpa: u64, hpa: u64, attr: EptAttr) -> Result<(), HypervisorError> {
        check_aligned(gpa, hpa, 1 << BASE_PAGE_SHIFT)?;

        let pdpt = Self::next_table(&mut self.tables, &mut self.pml4, pml4_index(gpa))?;
        let pd = Self::next_table(&mut self.tables, pdpt, pdpt_index(gpa))?;
        let pt = Self::next_table(&mut self.tables, pd, pd_index(gpa))?;
        Self::install_leaf(&mut pt.entries[pt_index(gpa)], hpa, attr, false)
    }

    /// Translates a guest-physical address. Returns the host-physical
    /// address and the leaf's page-size exponent (12, 21, or 30).
    pub fn virt_to_phys(&self, gpa: u64) -> Result<(u64, u64), HypervisorError> {
        let pml4e = &self.pml4.entries[pml4_index(gpa)];
        if !pml4e.is_present() {
            return Err(HypervisorError::EptNotPresent);
        }

        let pdpt = unsafe { &*(pml4e.phys() as *const Table) };
        let pdpte = &pdpt.entries[pdpt_index(gpa)];
        if !pdpte.is_present() {
            return Err(HypervisorError::EptNotPresent);
        }
        if pdpte.large() {
            let hpa = pdpte.phys() | (gpa & (HUGE_PAGE_SIZE as u64 - 1));
            return Ok((hpa, PAGE_SIZE_1G_BITS));
        }

        let pd = unsafe { &*(pdpte.phys() as *const Table) };
        let pde = &pd.entries[pd_index(gpa)];
        if !pde.is_present() {
            return Err(HypervisorError::EptNotPresent);
        }
        if pde.large() {
            let hpa = pde.phys() | (gpa & (LARGE_PAGE_SIZE as u64 - 1));
            return Ok((hpa, PAGE_SIZE_2M_BITS));
        }

        let pt = unsafe { &*(pde.phys() as *const Table) };
        let pte = &pt.entries[pt_index(gpa)];
        if !pte.is_present() {
            return Err(HypervisorError::EptNotPresent);
        }

        let hpa = pte.phys() | (gpa & ((1 << BASE_PAGE_SHIFT) - 1));
        Ok((hpa, PAGE_SIZE_4K_BITS))
    }

    /// Encodes the EPT pointer: PML4 base, write-back, 4-level walk.
    ///
    /// Reference: Intel SDM Vol 3, 25.6.11 Extended-Page-Table Pointer.
    pub fn eptp(&self) -> Result<u64, HypervisorError> {
        const EPT_PAGE_WALK_LENGTH_4: u64 = 3 << 3;

        let pml4_base = self.pml4.as_ref() as *const _ as u64;
        if pml4_base.trailing_zeros() < BASE_PAGE_SHIFT as u32 {
            return Err(HypervisorError::InvalidEptPointer);
        }

        Ok(pml4_base | EPT_PAGE_WALK_LENGTH_4 | EPT_MEMORY_TYPE_WB)
    }

    /// Flushes EPT-derived translations after a post-launch insert. Every
    /// vCPU referencing this map must observe the flush before touching
    /// the changed range.
    pub fn invalidate(&self) {
        invept_all_contexts();
    }

    fn install_leaf(
        entry: &mut Entry,
        hpa: u64,
        attr: EptAttr,
        large: bool,
    ) -> Result<(), HypervisorError> {
        // An occupied slot is either an existing leaf or a subtree of
        // smaller mappings; both overlap the requested range.
        if entry.is_present() {
            return Err(HypervisorError::EptCollision);
        }

        entry.set_attr(attr);
        entry.set_memory_type(EPT_MEMORY_TYPE_WB);
        entry.set_large(large);
        entry.set_pfn(hpa >> BASE_PAGE_SHIFT);
        Ok(())
    }

    fn next_table<'a>(
        tables: &mut Vec<Box<Table>>,
        parent: &'a mut Table,
        index: usize,
    ) -> Result<&'a mut Table, HypervisorError> {
        let entry = &mut parent.entries[index];

        if entry.is_present() && entry.large() {
            // A larger leaf already covers this range.
            return Err(HypervisorError::EptCollision);
        }

        if !entry.is_present() {
            let table = Table::zeroed();
            let pa = table.as_ref() as *const _ as u64;
            entry.set_readable(true);
            entry.set_writable(true);
            entry.set_executable(true);
            entry.set_pfn(pa >> BASE_PAGE_SHIFT);
            tables.push(table);
        }

        Ok(unsafe { &mut *(entry.phys() as *mut Table) })
    }
}

impl Default for EptMap {
    fn default() -> Self {
        Self::new()
    }
}

fn check_aligned(gpa: u64, hpa: u64, size: u64) -> Result<(), HypervisorError> {
    if gpa & (size - 1) != 0 || hpa & (size - 1) != 0 {
        return Err(HypervisorError::UnalignedAddress);
    }
    Ok(())
}

fn pml4_index(gpa: u64) -> usize {
    ((gpa >> 39) & 0x1FF) as usize
}

fn pdpt_index(gpa: u64) -> usize {
    ((gpa >> 30) & 0x1FF) as usize
}

fn pd_index(gpa: u64) -> usize {
    ((gpa >> 21) & 0x1FF) as usize
}

fn pt_index(gpa: u64) -> usize {
    ((gpa >> 12) & 0x1FF) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_leaves_translate_back_with_their_granularity() {
        let mut ept = EptMap::new();
        ept.map_1g(0x4000_0000, 0x1_0000_0000, EptAttr::ReadWrite)
            .unwrap();
        ept.map_2m(0x0020_0000, 0xAAA0_0000, EptAttr::ReadWriteExecute)
            .unwrap();
        ept.map_4k(0x0000_5000, 0x0003_2000, EptAttr::ReadOnly)
            .unwrap();

        assert_eq!(
            ept.virt_to_phys(0x4000_0000 + 0x123).unwrap(),
            (0x1_0000_0000 + 0x123, PAGE_SIZE_1G_BITS)
        );
        assert_eq!(
            ept.virt_to_phys(0x002F_F123).unwrap(),
            (0xAAAF_F123, PAGE_SIZE_2M_BITS)
        );
        assert_eq!(
            ept.virt_to_phys(0x0000_5FFF).unwrap(),
            (0x0003_2FFF, PAGE_SIZE_4K_BITS)
        );
    }

    #[test]
    fn unmapped_gpa_is_not_present() {
        let mut ept = EptMap::new();
        ept.map_4k(0x1000, 0x2000, EptAttr::ReadWrite).unwrap();

        assert_eq!(
            ept.virt_to_phys(0x8000_0000).unwrap_err(),
            HypervisorError::EptNotPresent
        );
        // Sibling slot in an existing table.
        assert_eq!(
            ept.virt_to_phys(0x2000).unwrap_err(),
            HypervisorError::EptNotPresent
        );
    }

    #[test]
    fn overlapping_inserts_fail_and_do_not_mutate() {
        let mut ept = EptMap::new();
        ept.map_2m(0x0020_0000, 0xAAA0_0000, EptAttr::ReadWrite)
            .unwrap();

        // A 4 KiB page inside the 2 MiB leaf.
        assert_eq!(
            ept.map_4k(0x0020_1000, 0x5000, EptAttr::ReadWrite)
                .unwrap_err(),
            HypervisorError::EptCollision
        );
        // The same 2 MiB leaf again.
        assert_eq!(
            ept.map_2m(0x0020_0000, 0xBBB0_0000, EptAttr::ReadWrite)
                .unwrap_err(),
            HypervisorError::EptCollision
        );
        // A 1 GiB leaf over a range that already holds a subtree.
        assert_eq!(
            ept.map_1g(0, 0x4000_0000, EptAttr::ReadWrite).unwrap_err(),
            HypervisorError::EptCollision
        );

        // The original mapping still translates.
        assert_eq!(
            ept.virt_to_phys(0x0020_0000).unwrap(),
            (0xAAA0_0000, PAGE_SIZE_2M_BITS)
        );
    }

    #[test]
    fn unaligned_leaves_are_rejected() {
        let mut ept = EptMap::new();
        assert_eq!(
            ept.map_2m(0x0020_1000, 0xAAA0_0000, EptAttr::ReadWrite)
                .unwrap_err(),
            HypervisorError::UnalignedAddress
        );
        assert_eq!(
            ept.map_1g(0x4000_0000, 0x123, EptAttr::ReadWrite).unwrap_err(),
            HypervisorError::UnalignedAddress
        );
    }

    #[test]
    fn eptp_encodes_walk_length_and_memory_type() {
        let ept = EptMap::new();
        let eptp = ept.eptp().unwrap();
        assert_eq!(eptp & 0xFFF, (3 << 3) | 6);
        assert_eq!(eptp & !0xFFF, ept.pml4.as_ref() as *const _ as u64);
    }
}
