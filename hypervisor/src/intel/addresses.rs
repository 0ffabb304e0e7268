//! Guest address translation.
//!
//! Three walks compose here: `gpa_to_hpa` through the EPT (identity when
//! no EPT is configured), `gva_to_gpa` through the guest's own page
//! tables (identity when guest paging is off), and `gva_to_hpa` as their
//! composition. Guest table entries are read through 4 KiB EPT-backed
//! windows so the walk never trusts a guest-virtual pointer.

use crate::{error::HypervisorError, intel::ept::EptMap};

const CR0_PG: u64 = 1 << 31;

const ENTRY_PRESENT: u64 = 1 << 0;
const ENTRY_PS: u64 = 1 << 7;

const PHYS_MASK_4K: u64 = 0x000F_FFFF_FFFF_F000;
const PHYS_MASK_2M: u64 = 0x000F_FFFF_FFE0_0000;
const PHYS_MASK_1G: u64 = 0x000F_FFFF_C000_0000;

const SHIFT_4K: u64 = 12;
const SHIFT_2M: u64 = 21;
const SHIFT_1G: u64 = 30;

/// Translates a guest-physical to a host-physical address. Without an
/// EPT the mapping is identity and the page-size report is 0.
pub fn gpa_to_hpa(ept: Option<&EptMap>, gpa: u64) -> Result<(u64, u64), HypervisorError> {
    match ept {
        None => Ok((gpa, 0)),
        Some(map) => map.virt_to_phys(gpa),
    }
}

/// Translates a guest-virtual to a guest-physical address by walking the
/// guest's page tables from `guest_cr3`. Identity when guest CR0.PG is
/// clear. Returns the address and the mapping page's size exponent.
pub fn gva_to_gpa(
    ept: Option<&EptMap>,
    guest_cr0: u64,
    guest_cr3: u64,
    gva: u64,
) -> Result<(u64, u64), HypervisorError> {
    if guest_cr0 & CR0_PG == 0 {
        return Ok((gva, 0));
    }

    let pml4e = read_guest_entry(ept, guest_cr3 & PHYS_MASK_4K, index_of(gva, 39))?;
    if pml4e & ENTRY_PRESENT == 0 {
        return Err(HypervisorError::PageNotPresent);
    }

    let pdpte = read_guest_entry(ept, pml4e & PHYS_MASK_4K, index_of(gva, 30))?;
    if pdpte & ENTRY_PRESENT == 0 {
        return Err(HypervisorError::PageNotPresent);
    }
    if pdpte & ENTRY_PS != 0 {
        return Ok(((pdpte & PHYS_MASK_1G) | low_bits(gva, SHIFT_1G), SHIFT_1G));
    }

    let pde = read_guest_entry(ept, pdpte & PHYS_MASK_4K, index_of(gva, 21))?;
    if pde & ENTRY_PRESENT == 0 {
        return Err(HypervisorError::PageNotPresent);
    }
    if pde & ENTRY_PS != 0 {
        return Ok(((pde & PHYS_MASK_2M) | low_bits(gva, SHIFT_2M), SHIFT_2M));
    }

    let pte = read_guest_entry(ept, pde & PHYS_MASK_4K, index_of(gva, 12))?;
    if pte & ENTRY_PRESENT == 0 {
        return Err(HypervisorError::PageNotPresent);
    }

    Ok(((pte & PHYS_MASK_4K) | low_bits(gva, SHIFT_4K), SHIFT_4K))
}

/// Translates a guest-virtual to a host-physical address. Without an EPT
/// this is just `gva_to_gpa`.
pub fn gva_to_hpa(
    ept: Option<&EptMap>,
    guest_cr0: u64,
    guest_cr3: u64,
    gva: u64,
) -> Result<(u64, u64), HypervisorError> {
    let (gpa, size) = gva_to_gpa(ept, guest_cr0, guest_cr3, gva)?;

    match ept {
        None => Ok((gpa, size)),
        Some(map) => map.virt_to_phys(gpa),
    }
}

/// Reads one 8-byte guest table entry through a 4 KiB window mapped by
/// the EPT.
fn read_guest_entry(
    ept: Option<&EptMap>,
    table_gpa: u64,
    index: usize,
) -> Result<u64, HypervisorError> {
    let entry_gpa = table_gpa + (index as u64) * 8;
    let (entry_hpa, _) = gpa_to_hpa(ept, entry_gpa)?;

    // The VMM maps host-physical memory identity, so the window is a
    // direct read.
    Ok(unsafe { core::ptr::read_volatile(entry_hpa as *const u64) })
}

fn index_of(gva: u64, shift: u64) -> usize {
    ((gva >> shift) & 0x1FF) as usize
}

fn low_bits(gva: u64, shift: u64) -> u64 {
    gva & ((1u64 << shift) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel::ept::EptAttr;

    #[repr(C, align(4096))]
    struct GuestTable([u64; 512]);

    impl GuestTable {
        fn zeroed() -> Box<Self> {
            Box::new(Self([0; 512]))
        }

        fn addr(&self) -> u64 {
            self as *const _ as u64
        }
    }

    #[test]
    fn paging_disabled_is_identity() {
        assert_eq!(gva_to_gpa(None, 0, 0, 0x12345).unwrap(), (0x12345, 0));
        assert_eq!(gva_to_hpa(None, 0, 0, 0x12345).unwrap(), (0x12345, 0));
    }

    #[test]
    fn no_ept_makes_gpa_identity() {
        assert_eq!(gpa_to_hpa(None, 0xABCDE).unwrap(), (0xABCDE, 0));
    }

    #[test]
    fn four_level_walk_resolves_each_page_size() {
        // Hosted stand-in for guest memory: tables live at their own
        // "guest-physical" addresses, so the walk reads them directly.
        let mut pml4 = GuestTable::zeroed();
        let mut pdpt = GuestTable::zeroed();
        let mut pd = GuestTable::zeroed();
        let mut pt = GuestTable::zeroed();

        let gva_4k: u64 = 0x0000_0000_0040_3000;
        let gva_2m: u64 = 0x0000_0000_00A0_0000;
        let gva_1g: u64 = 0x0000_0001_4000_0000;

        pml4.0[0] = pdpt.addr() | ENTRY_PRESENT;

        // 1 GiB super-page at PDPT index 5.
        pdpt.0[5] = 0x2_4000_0000 | ENTRY_PRESENT | ENTRY_PS;
        // Table path for the rest.
        pdpt.0[0] = pd.addr() | ENTRY_PRESENT;

        // 2 MiB super-page at PD index 5.
        pd.0[5] = 0xAAA0_0000 | ENTRY_PRESENT | ENTRY_PS;
        pd.0[2] = pt.addr() | ENTRY_PRESENT;

        // 4 KiB leaf at PT index 3.
        pt.0[3] = 0x0003_2000 | ENTRY_PRESENT;

        let cr0 = CR0_PG;
        let cr3 = pml4.addr();

        assert_eq!(
            gva_to_gpa(None, cr0, cr3, gva_4k | 0xABC).unwrap(),
            (0x0003_2ABC, 12)
        );
        assert_eq!(
            gva_to_gpa(None, cr0, cr3, gva_2m | 0x1_2345).unwrap(),
            (0xAAA0_0000 | 0x1_2345, 21)
        );
        assert_eq!(
            gva_to_gpa(None, cr0, cr3, gva_1g | 0x123_4567).unwrap(),
            (0x2_4000_0000 | 0x123_4567, 30)
        );
    }

    #[test]
    fn cleared_present_bits_fail_the_walk() {
        let mut pml4 = GuestTable::zeroed();
        let pdpt = GuestTable::zeroed();
        pml4.0[0] = pdpt.addr() | ENTRY_PRESENT;

        let cr3 = pml4.addr();

        // PDPT entry 0 is not present.
        assert_eq!(
            gva_to_gpa(None, CR0_PG, cr3, 0x1000).unwrap_err(),
            HypervisorError::PageNotPresent
        );
        // PML4 entry 1 is not present.
        assert_eq!(
            gva_to_gpa(None, CR0_PG, cr3, 1u64 << 39).unwrap_err(),
            HypervisorError::PageNotPresent
        );
    }

    #[test]
    fn walk_reads_guest_tables_through_the_ept_window() {
        let mut pml4 = GuestTable::zeroed();
        let mut pdpt = GuestTable::zeroed();
        let mut pd = GuestTable::zeroed();
        let mut pt = GuestTable::zeroed();

        // The guest believes its tables live at these GPAs; the EPT
        // relocates each window onto the hosted tables.
        let pml4_gpa = 0x10_0000;
        let pdpt_gpa = 0x10_1000;
        let pd_gpa = 0x10_2000;
        let pt_gpa = 0x10_3000;

        let mut ept = EptMap::new();
        ept.map_4k(pml4_gpa, pml4.addr(), EptAttr::ReadWrite).unwrap();
        ept.map_4k(pdpt_gpa, pdpt.addr(), EptAttr::ReadWrite).unwrap();
        ept.map_4k(pd_gpa, pd.addr(), EptAttr::ReadWrite).unwrap();
        ept.map_4k(pt_gpa, pt.addr(), EptAttr::ReadWrite).unwrap();

        pml4.0[0] = pdpt_gpa | ENTRY_PRESENT;
        pdpt.0[0] = pd_gpa | ENTRY_PRESENT;
        pd.0[0] = pt_gpa | ENTRY_PRESENT;
        pt.0[7] = 0x0004_2000 | ENTRY_PRESENT;

        assert_eq!(
            gva_to_gpa(Some(&ept), CR0_PG, pml4_gpa, 0x7FFF).unwrap(),
            (0x0004_2FFF, 12)
        );

        // Composition also crosses the EPT: map the leaf GPA too.
        ept.map_4k(0x0004_2000, 0x9_9000_0000, EptAttr::ReadWrite)
            .unwrap();
        assert_eq!(
            gva_to_hpa(Some(&ept), CR0_PG, pml4_gpa, 0x7FFF).unwrap(),
            (0x9_9000_0FFF, 12)
        );
    }
}
