//! The loader-built root page table handed to the VMM.
//!
//! 4-level, wire-format entries, 4 KiB mappings only. Every table page
//! comes from the platform and carries the `auto_release` mark so
//! teardown can free exactly what the builder allocated, in reverse
//! order. A software shadow tree keeps the kernel-virtual addresses of
//! the tables; the entries themselves hold only physical addresses, as
//! the hardware and the microkernel see them.

use {
    crate::{error::LoaderError, platform::Platform},
    alloc::{boxed::Box, collections::BTreeMap, vec::Vec},
    core::ptr::NonNull,
    mirage_shared::{consts::PAGE_SIZE, pte::Pte},
};

/// Mapping policy for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAttr {
    ReadWrite,
    ReadExecute,
}

struct TableNode {
    page: NonNull<Pte>,
    children: BTreeMap<usize, Box<TableNode>>,
}

impl TableNode {
    fn alloc<P: Platform>(platform: &P) -> Result<Self, LoaderError> {
        let page = platform.alloc(PAGE_SIZE).ok_or(LoaderError::AllocFailed)?;
        Ok(Self {
            page: page.cast::<Pte>(),
            children: BTreeMap::new(),
        })
    }

    fn entry(&self, index: usize) -> Pte {
        unsafe { self.page.as_ptr().add(index).read() }
    }

    fn set_entry(&self, index: usize, pte: Pte) {
        unsafe { self.page.as_ptr().add(index).write(pte) };
    }
}

/// The root page table under construction.
pub struct RootPageTable {
    root: TableNode,
}

impl RootPageTable {
    pub fn new<P: Platform>(platform: &P) -> Result<Self, LoaderError> {
        Ok(Self {
            root: TableNode::alloc(platform)?,
        })
    }

    /// Physical address of the PML4, for the VMM's CR3.
    pub fn root_phys<P: Platform>(&self, platform: &P) -> u64 {
        platform.virt_to_phys(self.root.page.as_ptr() as u64)
    }

    /// Maps one 4 KiB page. A virtual address that is already mapped
    /// fails without mutating the table.
    pub fn map_4k<P: Platform>(
        &mut self,
        platform: &P,
        virt: u64,
        phys: u64,
        attr: MapAttr,
    ) -> Result<(), LoaderError> {
        if virt % PAGE_SIZE != 0 || phys % PAGE_SIZE != 0 {
            return Err(LoaderError::MapFailed);
        }

        let pdpt = Self::next_table(platform, &mut self.root, index_of(virt, 39))?;
        let pd = Self::next_table(platform, pdpt, index_of(virt, 30))?;
        let pt = Self::next_table(platform, pd, index_of(virt, 21))?;

        let index = index_of(virt, 12);
        if pt.entry(index).p() {
            return Err(LoaderError::MapFailed);
        }

        let mut pte = Pte::zero();
        pte.set_p(true);
        pte.set_rw(matches!(attr, MapAttr::ReadWrite));
        pte.set_nx(matches!(attr, MapAttr::ReadWrite));
        pte.set_phys_addr(phys);
        pt.set_entry(index, pte);

        Ok(())
    }

    /// Walks the shadow tree for one virtual address.
    pub fn translate(&self, virt: u64) -> Option<(u64, MapAttr)> {
        let pdpt = self.root.children.get(&index_of(virt, 39))?;
        let pd = pdpt.children.get(&index_of(virt, 30))?;
        let pt = pd.children.get(&index_of(virt, 21))?;

        let pte = pt.entry(index_of(virt, 12));
        if !pte.p() {
            return None;
        }

        let attr = if pte.nx() {
            MapAttr::ReadWrite
        } else {
            MapAttr::ReadExecute
        };
        Some((pte.phys_addr() | (virt % PAGE_SIZE), attr))
    }

    /// Frees every auto-release table page, leaves first, in reverse
    /// allocation order within each table.
    pub fn release<P: Platform>(self, platform: &P) {
        release_node(platform, self.root);
    }

    fn next_table<'a, P: Platform>(
        platform: &P,
        parent: &'a mut TableNode,
        index: usize,
    ) -> Result<&'a mut TableNode, LoaderError> {
        if !parent.children.contains_key(&index) {
            let child = TableNode::alloc(platform)?;

            let mut pte = Pte::zero();
            pte.set_p(true);
            pte.set_rw(true);
            pte.set_phys_addr(platform.virt_to_phys(child.page.as_ptr() as u64));
            pte.set_auto_release(1);
            parent.set_entry(index, pte);

            parent.children.insert(index, Box::new(child));
        }

        parent
            .children
            .get_mut(&index)
            .map(|child| child.as_mut())
            .ok_or(LoaderError::MapFailed)
    }
}

fn release_node<P: Platform>(platform: &P, node: TableNode) {
    let children: Vec<_> = node.children.into_values().collect();
    for child in children.into_iter().rev() {
        release_node(platform, *child);
    }
    platform.free(node.page.cast::<u8>(), PAGE_SIZE);
}

fn index_of(virt: u64, shift: u64) -> usize {
    ((virt >> shift) & 0x1FF) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::MockPlatform;

    #[test]
    fn mappings_translate_with_their_attribute() {
        let platform = MockPlatform::new(1);
        let mut table = RootPageTable::new(&platform).unwrap();

        table
            .map_4k(&platform, 0x2000_0000_0000, 0x1000, MapAttr::ReadExecute)
            .unwrap();
        table
            .map_4k(&platform, 0x2000_0000_1000, 0x2000, MapAttr::ReadWrite)
            .unwrap();

        assert_eq!(
            table.translate(0x2000_0000_0ABC),
            Some((0x1ABC, MapAttr::ReadExecute))
        );
        assert_eq!(
            table.translate(0x2000_0000_1000),
            Some((0x2000, MapAttr::ReadWrite))
        );
        assert_eq!(table.translate(0x2000_0000_2000), None);

        table.release(&platform);
        assert_eq!(platform.outstanding(), 0);
    }

    #[test]
    fn double_mapping_fails_without_mutating() {
        let platform = MockPlatform::new(1);
        let mut table = RootPageTable::new(&platform).unwrap();

        table
            .map_4k(&platform, 0x1000, 0x1000, MapAttr::ReadWrite)
            .unwrap();
        assert_eq!(
            table
                .map_4k(&platform, 0x1000, 0x9000, MapAttr::ReadWrite)
                .unwrap_err(),
            LoaderError::MapFailed
        );
        assert_eq!(table.translate(0x1000), Some((0x1000, MapAttr::ReadWrite)));

        table.release(&platform);
    }

    #[test]
    fn table_allocation_failure_surfaces_as_alloc_failed() {
        let platform = MockPlatform::new(1);
        // The root consumes the first allocation; fail the next.
        let mut table = RootPageTable::new(&platform).unwrap();
        platform.fail_after(0);

        assert_eq!(
            table
                .map_4k(&platform, 0x1000, 0x1000, MapAttr::ReadWrite)
                .unwrap_err(),
            LoaderError::AllocFailed
        );

        platform.fail_after(usize::MAX);
        table.release(&platform);
        assert_eq!(platform.outstanding(), 0);
    }

    #[test]
    fn intermediate_tables_carry_the_auto_release_mark() {
        let platform = MockPlatform::new(1);
        let mut table = RootPageTable::new(&platform).unwrap();
        table
            .map_4k(&platform, 0x1000, 0x5000, MapAttr::ReadWrite)
            .unwrap();

        let pml4e = table.root.entry(0);
        assert!(pml4e.p());
        assert_eq!(pml4e.auto_release(), 1);

        // The leaf itself is not auto-released; its backing page is owned
        // by whichever stage staged it.
        let pdpt = table.root.children.get(&0).unwrap();
        let pd = pdpt.children.get(&0).unwrap();
        let pt = pd.children.get(&0).unwrap();
        assert_eq!(pt.entry(1).auto_release(), 0);

        table.release(&platform);
    }
}
