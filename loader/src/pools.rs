//! The VMM's backing pools.
//!
//! Sizes are given in pages, not bytes; zero selects the build default.
//! The page pool backs the microkernel's small-object allocator; the
//! huge pool is physically contiguous for its large allocations.

use {
    crate::{
        error::LoaderError,
        platform::{OwnedSpan, Platform},
    },
    mirage_shared::consts::{MK_HUGE_POOL_SIZE, MK_PAGE_POOL_SIZE, PAGE_SIZE},
};

/// Allocates the microkernel page pool. `size` is in pages; 0 selects
/// [`MK_PAGE_POOL_SIZE`].
pub fn alloc_mk_page_pool<P: Platform>(
    platform: &P,
    size: u32,
) -> Result<OwnedSpan, LoaderError> {
    let pages = if size == 0 { MK_PAGE_POOL_SIZE } else { size };
    platform.alloc_span(PAGE_SIZE * pages as u64)
}

/// Allocates the microkernel huge pool, physically contiguous. `size` is
/// in pages; 0 selects [`MK_HUGE_POOL_SIZE`].
pub fn alloc_mk_huge_pool<P: Platform>(
    platform: &P,
    size: u32,
) -> Result<OwnedSpan, LoaderError> {
    let pages = if size == 0 { MK_HUGE_POOL_SIZE } else { size };
    platform.alloc_contiguous_span(PAGE_SIZE * pages as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::MockPlatform;

    #[test]
    fn zero_selects_the_default_sizes() {
        let platform = MockPlatform::new(1);

        let pool = alloc_mk_page_pool(&platform, 0).unwrap();
        assert_eq!(pool.size, PAGE_SIZE * MK_PAGE_POOL_SIZE as u64);
        platform.free_span(pool);

        let pool = alloc_mk_huge_pool(&platform, 0).unwrap();
        assert_eq!(pool.size, PAGE_SIZE * MK_HUGE_POOL_SIZE as u64);
        platform.free_span(pool);

        assert_eq!(platform.outstanding(), 0);
    }

    #[test]
    fn explicit_sizes_are_in_pages() {
        let platform = MockPlatform::new(1);
        let pool = alloc_mk_page_pool(&platform, 3).unwrap();
        assert_eq!(pool.size, PAGE_SIZE * 3);
        platform.free_span(pool);
    }
}
