//! The 64-bit page table entry as the hardware and extensions see it.
//!
//! The `auto_release` field is a software extension carved out of the
//! ignored bits: nonzero means the loader owns the backing page and will
//! free it on teardown. The layout is wire-visible and must be preserved
//! bit-for-bit.

use bitfield::bitfield;
use static_assertions::const_assert_eq;

bitfield! {
    /// A loader/VMM page table entry.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Pte(u64);
    impl Debug;

    /// Present.
    pub p, set_p: 0;
    /// Read/write.
    pub rw, set_rw: 1;
    /// User/supervisor.
    pub us, set_us: 2;
    /// Page-level writethrough.
    pub pwt, set_pwt: 3;
    /// Page-level cache disable.
    pub pcd, set_pcd: 4;
    /// Accessed.
    pub a, set_a: 5;
    /// Dirty.
    pub d, set_d: 6;
    /// Page-attribute table.
    pub pat, set_pat: 7;
    /// Global.
    pub g, set_g: 8;
    /// Available to software.
    pub avl, set_avl: 11, 9;
    /// Physical frame number.
    pub phys, set_phys: 51, 12;
    /// Nonzero when the loader frees the backing page on teardown.
    pub auto_release, set_auto_release: 58, 52;
    /// Memory protection key.
    pub mpk, set_mpk: 62, 59;
    /// No-execute.
    pub nx, set_nx: 63;
}

const_assert_eq!(core::mem::size_of::<Pte>(), 8);

impl Pte {
    pub const fn zero() -> Self {
        Pte(0)
    }

    /// The full physical address encoded by the entry.
    pub fn phys_addr(&self) -> u64 {
        self.phys() << crate::consts::PAGE_SHIFT
    }

    pub fn set_phys_addr(&mut self, pa: u64) {
        self.set_phys(pa >> crate::consts::PAGE_SHIFT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_land_on_their_wire_bits() {
        let mut pte = Pte::zero();
        pte.set_p(true);
        assert_eq!(pte.0, 1 << 0);

        let mut pte = Pte::zero();
        pte.set_rw(true);
        assert_eq!(pte.0, 1 << 1);

        let mut pte = Pte::zero();
        pte.set_g(true);
        assert_eq!(pte.0, 1 << 8);

        let mut pte = Pte::zero();
        pte.set_avl(0b111);
        assert_eq!(pte.0, 0b111 << 9);

        let mut pte = Pte::zero();
        pte.set_phys_addr(0x000F_FFFF_FFFF_F000);
        assert_eq!(pte.0, 0x000F_FFFF_FFFF_F000);

        let mut pte = Pte::zero();
        pte.set_auto_release(1);
        assert_eq!(pte.0, 1 << 52);

        let mut pte = Pte::zero();
        pte.set_mpk(0xF);
        assert_eq!(pte.0, 0xF << 59);

        let mut pte = Pte::zero();
        pte.set_nx(true);
        assert_eq!(pte.0, 1 << 63);
    }

    #[test]
    fn phys_addr_round_trips() {
        let mut pte = Pte::zero();
        pte.set_phys_addr(0xAAA0_0000);
        assert_eq!(pte.phys_addr(), 0xAAA0_0000);
        assert_eq!(pte.phys(), 0xAAA00);
    }
}
