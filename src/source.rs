use crate::{platform, Pointer};

/// Number of pages requested from the OS at once. Carving many blocks out
/// of one large mapping amortizes the syscall and gives coalescing room to
/// work with, at the price of some slack after small allocations.
pub(crate) const PAGES_PER_MAP: usize = 32;

/// Supplier of fresh writable pages, modelling the OS mapping primitive.
///
/// The allocator is generic over this trait so tests can inject sources
/// with deterministic address patterns (contiguous regions to exercise
/// mapping fusion, gapped regions to exercise the registry, failing sources
/// to exercise the out-of-memory paths). Production code uses
/// [`OsPageSource`].
pub trait PageSource {
    /// Virtual memory page size of this source in bytes. Must be a power
    /// of two and must not change over the lifetime of the source.
    fn page_size(&self) -> usize;

    /// Returns a region of exactly `length` writable bytes, or `None` if
    /// the source is exhausted. `length` is always a positive multiple of
    /// 32 times [`PageSource::page_size`]. Regions may come in arbitrary
    /// address order.
    ///
    /// # Safety
    ///
    /// Implementations must return memory that nothing else reads or
    /// writes; the allocator takes ownership of it forever.
    unsafe fn map(&mut self, length: usize) -> Pointer<u8>;
}

/// The real thing: anonymous read-write pages from the kernel, `mmap` on
/// unix and `VirtualAlloc` on Windows.
#[derive(Clone, Copy, Default)]
pub struct OsPageSource;

impl PageSource for OsPageSource {
    fn page_size(&self) -> usize {
        platform::page_size()
    }

    unsafe fn map(&mut self, length: usize) -> Pointer<u8> {
        platform::request_memory(length)
    }
}

/// Smallest length the allocator passes to [`PageSource::map`]. Requests
/// are always rounded up to a multiple of this unit.
pub(crate) fn map_unit<S: PageSource>(source: &S) -> usize {
    PAGES_PER_MAP * source.page_size()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_source_returns_writable_page_multiples() {
        let mut source = OsPageSource;
        let page_size = source.page_size();
        assert!(page_size.is_power_of_two());

        let unit = map_unit(&source);
        assert_eq!(unit, 32 * page_size);

        unsafe {
            let region = source.map(unit).unwrap();
            assert_eq!(region.as_ptr() as usize % page_size, 0);

            // Touch both ends, the whole region must be ours to write.
            region.as_ptr().write(0xAB);
            region.as_ptr().add(unit - 1).write(0xCD);
            assert_eq!(region.as_ptr().read(), 0xAB);
            assert_eq!(region.as_ptr().add(unit - 1).read(), 0xCD);
        }
    }
}
