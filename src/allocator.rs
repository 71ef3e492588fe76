use std::{
    alloc::{GlobalAlloc, Layout},
    fmt,
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{
    align::{align_up, MEM_UNIT},
    block::{Block, ALLOC_OVERHEAD, MIN_BLOCK_SIZE},
    bucket::Buckets,
    header::MAX_BLOCK_SIZE,
    registry::MappingRegistry,
    source::{self, OsPageSource, PageSource},
    Pointer,
};

/// Reasons an allocation request can fail. This is the crate's version of
/// the classic `errno` protocol: the C allocation functions return null and
/// set `EINVAL` or `ENOMEM`, we return one of these through a [`Result`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocError {
    /// Zero-sized request, zero count, or a size computation overflowed.
    InvalidArgument,
    /// The page source refused to hand out more memory, or the mapping
    /// registry is at capacity.
    OutOfMemory,
}

impl AllocError {
    /// The errno value a C allocator would set for this failure. Useful
    /// when exposing the allocator behind a C-style interface.
    #[cfg(unix)]
    pub fn errno(self) -> libc::c_int {
        match self {
            AllocError::InvalidArgument => libc::EINVAL,
            AllocError::OutOfMemory => libc::ENOMEM,
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidArgument => f.write_str("invalid argument"),
            AllocError::OutOfMemory => f.write_str("out of memory"),
        }
    }
}

impl std::error::Error for AllocError {}

/// The single-threaded core. It owns the three pieces of state everything
/// else revolves around:
///
/// ```text
///             +-----------+-----------+-----------+----------+
/// buckets ->  | class 4   | class 5   |    ...    | class 165|
///             +-----|-----+-----------+-----------+-----|----+
///                   |                                   |
///                   v                                   v
///              free blocks of                      free blocks of
///              exactly 32 bytes                    2^44*8.. bytes
///
///             +--------------------+--------------------+------
/// registry -> | mapping 0 (lo, hi) | mapping 1 (lo, hi) |  ...
///             +--------------------+--------------------+------
///                   |
///                   v
///              +-------+-------+----------+-------+
///              | Block | Block |  Block   | Block |   <- blocks tile the
///              +-------+-------+----------+-------+      whole mapping
/// ```
///
/// Allocations are served best-fit from the buckets; on a miss a fresh
/// multi-page mapping is pulled from the page source, registered, and
/// carved. Freed blocks eagerly merge with free physical neighbours, never
/// across a mapping bound.
///
/// This struct needs mutable borrows to operate and is not thread safe, so
/// it has to be wrapped in some container like [`Mutex`] before it can back
/// a [`GlobalAlloc`]. See [`Buckalloc`] for the public API.
pub(crate) struct RawAllocator<S: PageSource> {
    /// One bucket per size class.
    buckets: Buckets,
    /// Every address range ever obtained from the page source.
    registry: MappingRegistry,
    /// Where the pages come from.
    source: S,
}

impl RawAllocator<OsPageSource> {
    pub const fn new() -> Self {
        Self::with_page_source(OsPageSource)
    }
}

impl<S: PageSource> RawAllocator<S> {
    pub const fn with_page_source(source: S) -> Self {
        Self {
            buckets: Buckets::new(),
            registry: MappingRegistry::new(),
            source,
        }
    }

    /// Total block size needed to serve a request of `size` user bytes:
    /// the size rounded up to [`MEM_UNIT`], plus header and footer, never
    /// below the minimum block. Rejects zero, arithmetic overflow and sizes
    /// the 48-bit header field cannot represent.
    fn block_size_for(size: usize) -> Result<usize, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidArgument);
        }

        let total = align_up(size)
            .and_then(|aligned| aligned.checked_add(ALLOC_OVERHEAD))
            .ok_or(AllocError::InvalidArgument)?;

        let total = if total < MIN_BLOCK_SIZE { MIN_BLOCK_SIZE } else { total };

        if total as u64 >= MAX_BLOCK_SIZE {
            return Err(AllocError::InvalidArgument);
        }

        Ok(total)
    }

    /// Returns an address where `size` bytes can be safely written, aligned
    /// to [`MEM_UNIT`].
    pub unsafe fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let want = Self::block_size_for(size)?;

        let block = match self.buckets.take_fit(want) {
            Some(block) => block,
            None => self.carve_mapping(want)?,
        };

        if let Some(tail) = Block::split_tail(block, want) {
            self.buckets.insert(tail);
        }

        Ok(Block::user_ptr_of(block))
    }

    /// Allocates `count * size` bytes and fills the whole content of the
    /// block with zeroes.
    pub unsafe fn allocate_zeroed(
        &mut self,
        count: usize,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if count == 0 {
            return Err(AllocError::InvalidArgument);
        }

        let total = count.checked_mul(size).ok_or(AllocError::InvalidArgument)?;
        let address = self.allocate(total)?;

        let content = Block::from_user_ptr(address).as_ref().content_size();
        address.as_ptr().write_bytes(0, content);

        Ok(address)
    }

    /// Returns the block that `address` belongs to back to its bucket and
    /// merges it with its free physical neighbours.
    pub unsafe fn deallocate(&mut self, address: NonNull<u8>) {
        self.release_block(Block::from_user_ptr(address));
    }

    /// The reallocation policy:
    ///
    /// - Null address: plain allocation (`None` for a zero size, which is
    ///   not an error).
    /// - Zero size: the address is released and `None` returned.
    /// - Shrink: done in place, carving the excess off the end of the
    ///   block. The address doesn't change.
    /// - Grow: a fresh allocation, a copy, and a release of the old block.
    ///   If the fresh allocation fails the old block is left untouched, so
    ///   the caller keeps its data. This is where we deliberately side with
    ///   the realloc man page: losing the content on failure is not an
    ///   option.
    pub unsafe fn reallocate(
        &mut self,
        address: Pointer<u8>,
        size: usize,
    ) -> Result<Pointer<u8>, AllocError> {
        let Some(address) = address else {
            if size == 0 {
                return Ok(None);
            }
            return self.allocate(size).map(Some);
        };

        if size == 0 {
            self.deallocate(address);
            return Ok(None);
        }

        let block = Block::from_user_ptr(address);
        let old_content = block.as_ref().content_size();

        if size <= old_content {
            let want = Self::block_size_for(size)?;
            if let Some(tail) = Block::split_tail(block, want) {
                // Through the ordinary release path, so the tail can merge
                // with a free successor right away.
                self.release_block(tail);
            }
            return Ok(Some(address));
        }

        let new_address = self.allocate(size)?;
        ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), old_content);
        self.deallocate(address);

        Ok(Some(new_address))
    }

    /// Pulls a fresh region from the page source, registers it, and hands
    /// back a single allocated block covering all of it. The caller splits
    /// off whatever it doesn't need.
    unsafe fn carve_mapping(&mut self, want: usize) -> Result<NonNull<Block>, AllocError> {
        let unit = source::map_unit(&self.source);
        let length = want
            .checked_add(unit - 1)
            .ok_or(AllocError::InvalidArgument)?
            / unit
            * unit;

        if length as u64 >= MAX_BLOCK_SIZE {
            return Err(AllocError::InvalidArgument);
        }

        let Some(region) = self.source.map(length) else {
            return Err(AllocError::OutOfMemory);
        };

        let lo = region.as_ptr() as usize;
        let Some(outcome) = self.registry.register(lo, lo + length) else {
            registry_full_note();
            return Err(AllocError::OutOfMemory);
        };

        let block = region.cast::<Block>();
        Block::initialize(block, length, outcome.index(), false);

        Ok(block)
    }

    /// Files `block` as free and eagerly coalesces: first with the block
    /// physically after it, then with the one physically before it, each
    /// only if it's free and the mapping doesn't end in between. The
    /// mapping index in the header makes both bound checks O(1), and the
    /// footer read below `block` is only performed once we know the bytes
    /// there are managed metadata.
    unsafe fn release_block(&mut self, block: NonNull<Block>) {
        let mut block = block;
        self.buckets.insert(block);

        let mapping = self.registry.get(block.as_ref().mapping());

        let end = block.as_ptr() as usize + block.as_ref().size();
        if end < mapping.hi {
            let next = Block::next_neighbour(block);
            if next.as_ref().is_free() {
                block = self.coalesce(block, next);
            }
        }

        if block.as_ptr() as usize > mapping.lo {
            let prev = Block::prev_neighbour(block);
            if prev.as_ref().is_free() {
                self.coalesce(prev, block);
            }
        }
    }

    /// Merges two physically adjacent free blocks into `lo`. Both leave
    /// their buckets, the merged block is filed under its new class.
    unsafe fn coalesce(&mut self, lo: NonNull<Block>, hi: NonNull<Block>) -> NonNull<Block> {
        debug_assert_eq!(
            lo.as_ptr() as usize + lo.as_ref().size(),
            hi.as_ptr() as usize
        );
        debug_assert_eq!(lo.as_ref().mapping(), hi.as_ref().mapping());

        self.buckets.remove(lo);
        self.buckets.remove(hi);

        let merged = lo.as_ref().size() + hi.as_ref().size();
        Block::set_size(lo, merged);

        self.buckets.insert(lo);

        lo
    }
}

/// One line to stderr when the mapping registry overflows, so the condition
/// is distinguishable from ordinary memory exhaustion. Raw `write` because
/// formatting macros may allocate, and this can run inside the global
/// allocator.
fn registry_full_note() {
    #[cfg(all(unix, not(miri)))]
    unsafe {
        let message = b"buckalloc: mapping registry full\n";
        let _ = libc::write(2, message.as_ptr().cast(), message.len());
    }
}

impl Block {
    /// Splits `block` in two when the part beyond `want` bytes is big
    /// enough to stand on its own:
    ///
    /// **Before**:
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |  Header   |
    /// Block   |     +-----------+
    ///         |     |  Content  | <- size bytes.
    ///         +-->  +-----------+
    /// ```
    ///
    /// **After**:
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |  Header   |
    /// Block   |     +-----------+
    ///         |     |  Content  | <- want bytes in total.
    ///         +-->  +-----------+
    ///         |     |  Header   |
    /// Tail    |     +-----------+
    ///         |     |  Content  | <- size - want bytes in total.
    ///         +-->  +-----------+
    /// ```
    ///
    /// The tail inherits the mapping index and is returned born allocated
    /// and unlinked; the caller decides whether it goes straight into a
    /// bucket or through the full release path. Returns `None` when the
    /// tail would be smaller than a minimum block, in which case `block` is
    /// left untouched and keeps its slack.
    ///
    /// # Safety
    ///
    /// `block` must be a valid allocated block of at least `want` bytes,
    /// with `want` a multiple of [`MEM_UNIT`].
    pub(crate) unsafe fn split_tail(block: NonNull<Block>, want: usize) -> Pointer<Block> {
        let excess = block.as_ref().size() - want;
        if excess < MIN_BLOCK_SIZE {
            return None;
        }

        let mapping = block.as_ref().mapping();
        Block::set_size(block, want);

        let tail = Block::next_neighbour(block);
        Block::initialize(tail, excess, mapping, false);

        Some(tail)
    }
}

/// This struct exposes the public interface. It wraps the single-threaded
/// core in one global [`Mutex`] held for the entire call, which is all the
/// locking this design ever does.
///
/// All pointers handed out are aligned to 8 bytes and stay valid until they
/// are passed back to [`Buckalloc::deallocate`] or resized away by
/// [`Buckalloc::reallocate`]. Alignment requirements above 8 are not
/// supported anywhere in this allocator.
///
/// # Examples
///
/// ```rust
/// use buckalloc::Buckalloc;
///
/// let allocator = Buckalloc::new();
///
/// let address = allocator.allocate(97).unwrap();
///
/// unsafe {
///     // 8-byte aligned, like everything this allocator returns.
///     assert_eq!(address.as_ptr() as usize % 8, 0);
///
///     address.as_ptr().write_bytes(0xA5, 97);
///     assert_eq!(address.as_ptr().add(96).read(), 0xA5);
///
///     allocator.deallocate(address);
/// }
/// ```
///
/// Zeroed allocation and reallocation follow their C counterparts:
///
/// ```rust
/// use buckalloc::Buckalloc;
///
/// let allocator = Buckalloc::new();
///
/// let address = allocator.allocate_zeroed(4, 256).unwrap();
///
/// unsafe {
///     assert_eq!(address.as_ptr().add(1023).read(), 0);
///
///     // Growing moves the content if it has to, never loses it.
///     address.as_ptr().write(42);
///     let grown = allocator.reallocate(Some(address), 4096).unwrap().unwrap();
///     assert_eq!(grown.as_ptr().read(), 42);
///
///     // Size zero releases and returns nothing.
///     assert_eq!(allocator.reallocate(Some(grown), 0), Ok(None));
/// }
/// ```
pub struct Buckalloc<S: PageSource = OsPageSource> {
    allocator: Mutex<RawAllocator<S>>,
}

unsafe impl<S: PageSource> Sync for Buckalloc<S> {}

impl Buckalloc<OsPageSource> {
    /// An allocator backed by anonymous pages from the OS. Usable in a
    /// `static`, no memory is requested until the first allocation.
    pub const fn new() -> Self {
        Self {
            allocator: Mutex::new(RawAllocator::new()),
        }
    }
}

impl<S: PageSource> Buckalloc<S> {
    /// An allocator drawing pages from the given source instead of the OS,
    /// so tests and embedders can drive it through fully deterministic
    /// address patterns.
    pub const fn with_page_source(source: S) -> Self {
        Self {
            allocator: Mutex::new(RawAllocator::with_page_source(source)),
        }
    }

    /// Allocates `size` bytes. Fails on a zero size, on overflowing size
    /// computations, and when no more memory can be obtained.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        match self.allocator.lock() {
            Ok(mut allocator) => unsafe { allocator.allocate(size) },
            Err(_) => Err(AllocError::OutOfMemory),
        }
    }

    /// Allocates an array of `count` elements of `size` bytes each, zeroed.
    /// Fails on a zero count and when `count * size` overflows.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        match self.allocator.lock() {
            Ok(mut allocator) => unsafe { allocator.allocate_zeroed(count, size) },
            Err(_) => Err(AllocError::OutOfMemory),
        }
    }

    /// Releases a previously allocated address.
    ///
    /// # Safety
    ///
    /// `address` must come from this allocator and must not have been
    /// released already; the memory must no longer be accessed afterwards.
    pub unsafe fn deallocate(&self, address: NonNull<u8>) {
        if let Ok(mut allocator) = self.allocator.lock() {
            allocator.deallocate(address);
        }
    }

    /// Resizes an allocation: shrinking happens in place (the address is
    /// returned unchanged), growing allocates, copies and releases. A null
    /// `address` behaves like an allocation, a zero `size` releases the
    /// address and returns `Ok(None)`. When growing fails the original
    /// allocation is left untouched and stays valid.
    ///
    /// # Safety
    ///
    /// A non-null `address` must come from this allocator and not have been
    /// released; on success it must no longer be accessed (the returned
    /// address replaces it), on failure it remains valid.
    pub unsafe fn reallocate(
        &self,
        address: Pointer<u8>,
        size: usize,
    ) -> Result<Pointer<u8>, AllocError> {
        match self.allocator.lock() {
            Ok(mut allocator) => allocator.reallocate(address, size),
            Err(_) => Err(AllocError::OutOfMemory),
        }
    }
}

impl Default for Buckalloc<OsPageSource> {
    fn default() -> Self {
        Buckalloc::new()
    }
}

/// Alignment is fixed at 8 bytes in this allocator, so any layout with a
/// stricter requirement is refused with a null pointer. That rules it out
/// as the process-wide `#[global_allocator]` for programs that allocate
/// higher-aligned types; it composes fine with collections of plain data.
unsafe impl<S: PageSource> GlobalAlloc for Buckalloc<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MEM_UNIT {
            return ptr::null_mut();
        }

        match self.allocate(layout.size()) {
            Ok(address) => address.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MEM_UNIT {
            return ptr::null_mut();
        }

        match self.allocate_zeroed(1, layout.size()) {
            Ok(address) => address.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(address) = NonNull::new(ptr) {
            self.deallocate(address);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > MEM_UNIT {
            return ptr::null_mut();
        }

        match self.reallocate(NonNull::new(ptr), new_size) {
            Ok(Some(address)) => address.as_ptr(),
            Ok(None) | Err(_) => ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{alloc::Layout as StdLayout, collections::HashSet};

    use super::*;
    use crate::{
        classes::{bucket_index, NUM_BUCKETS},
        source::PAGES_PER_MAP,
    };

    /// Page size used by the deterministic sources below. With 4096 byte
    /// pages the mapping unit is 131072 bytes.
    const PAGE: usize = 4096;

    const UNIT: usize = PAGES_PER_MAP * PAGE;

    /// Hands out consecutive chunks of one big leaked buffer, so every
    /// region starts exactly where the previous one ended and the registry
    /// fuses them all into a single mapping. Deterministic stand-in for a
    /// kernel that happens to return adjacent regions.
    struct SlabSource {
        base: *mut u8,
        capacity: usize,
        offset: usize,
    }

    impl SlabSource {
        fn new(capacity: usize) -> Self {
            let layout = StdLayout::from_size_align(capacity, PAGE).unwrap();
            let base = unsafe { std::alloc::alloc(layout) };
            assert!(!base.is_null());
            Self {
                base,
                capacity,
                offset: 0,
            }
        }
    }

    impl PageSource for SlabSource {
        fn page_size(&self) -> usize {
            PAGE
        }

        unsafe fn map(&mut self, length: usize) -> Pointer<u8> {
            if self.offset + length > self.capacity {
                return None;
            }

            let address = NonNull::new_unchecked(self.base.add(self.offset));
            self.offset += length;
            Some(address)
        }
    }

    /// One separate heap allocation per region with slack at the end, so no
    /// region can ever start at another one's high bound and every map call
    /// costs a registry slot. The slack byte count also keeps the addresses
    /// inside each chunk.
    struct GappySource {
        page: usize,
        remaining: usize,
    }

    impl GappySource {
        fn new(page: usize, budget: usize) -> Self {
            Self {
                page,
                remaining: budget,
            }
        }
    }

    impl PageSource for GappySource {
        fn page_size(&self) -> usize {
            self.page
        }

        unsafe fn map(&mut self, length: usize) -> Pointer<u8> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;

            let layout = StdLayout::from_size_align(length + self.page, self.page).unwrap();
            NonNull::new(std::alloc::alloc(layout))
        }
    }

    impl<S: PageSource> RawAllocator<S> {
        /// Checks every structural invariant of the allocator: blocks tile
        /// each mapping exactly, headers and footers agree, no two adjacent
        /// blocks are both free, buckets are sorted and hold exactly the
        /// free blocks, each under the class of its size.
        fn verify(&self) {
            let mut free_blocks = HashSet::new();

            for index in 0..self.registry.len() {
                let mapping = self.registry.get(index as u16);
                let mut address = mapping.lo;
                let mut previous_free = false;

                while address < mapping.hi {
                    let block = NonNull::new(address as *mut Block).unwrap();

                    unsafe {
                        let size = block.as_ref().size();
                        assert!(size >= MIN_BLOCK_SIZE);
                        assert_eq!(size % MEM_UNIT, 0);
                        assert_eq!(Block::footer_of(block), size as u64);
                        assert!(address + size <= mapping.hi);
                        assert_eq!(block.as_ref().mapping() as usize, index);

                        let free = block.as_ref().is_free();
                        assert!(
                            !(previous_free && free),
                            "adjacent free blocks escaped coalescing"
                        );

                        if free {
                            free_blocks.insert(address);
                        }

                        previous_free = free;
                        address += size;
                    }
                }

                assert_eq!(address, mapping.hi, "blocks don't tile the mapping");
            }

            let mut linked = 0;
            for class in 0..NUM_BUCKETS {
                let mut previous = 0;
                for block in self.buckets.class(class).blocks() {
                    let block = unsafe { block.as_ref() };
                    assert!(block.is_free());
                    assert_eq!(bucket_index(block.size()), class);
                    assert!(block.size() >= previous, "bucket out of order");
                    previous = block.size();

                    let address = block as *const Block as usize;
                    assert!(free_blocks.contains(&address));
                    linked += 1;
                }
            }

            assert_eq!(linked, free_blocks.len(), "free flag out of sync");
        }

        /// All free blocks as (class, size) pairs, in bucket order.
        fn free_blocks(&self) -> Vec<(usize, usize)> {
            let mut found = Vec::new();
            for class in 0..NUM_BUCKETS {
                for block in self.buckets.class(class).blocks() {
                    found.push((class, unsafe { block.as_ref().size() }));
                }
            }
            found
        }
    }

    #[test]
    fn cold_allocation_carves_a_fresh_mapping() {
        let mut allocator = RawAllocator::with_page_source(SlabSource::new(UNIT));

        unsafe {
            let address = allocator.allocate(8).unwrap();
            allocator.verify();

            let block = Block::from_user_ptr(address);
            assert_eq!(block.as_ref().size(), MIN_BLOCK_SIZE);
            assert_eq!(
                Block::user_ptr_of(block).as_ptr() as usize,
                block.as_ptr() as usize + 8
            );

            // One mapping of exactly one unit, with the remainder of the
            // carve sitting free in its power-of-two class.
            assert_eq!(allocator.registry.len(), 1);
            let mapping = allocator.registry.get(0);
            assert_eq!(mapping.hi - mapping.lo, UNIT);

            let tail = UNIT - MIN_BLOCK_SIZE;
            assert_eq!(allocator.free_blocks(), [(bucket_index(tail), tail)]);
        }
    }

    #[test]
    fn released_block_is_reused() {
        let mut allocator = RawAllocator::with_page_source(SlabSource::new(UNIT));

        unsafe {
            let first = allocator.allocate(8).unwrap();
            allocator.deallocate(first);
            allocator.verify();

            // The release merged the whole mapping back into one block.
            assert_eq!(allocator.free_blocks(), [(bucket_index(UNIT), UNIT)]);

            // So the next allocation re-splits it at the same spot.
            let second = allocator.allocate(8).unwrap();
            allocator.verify();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn coalescing_merges_both_neighbours() {
        let mut allocator = RawAllocator::with_page_source(SlabSource::new(UNIT));

        unsafe {
            let first = allocator.allocate(1000).unwrap();
            let second = allocator.allocate(1000).unwrap();
            allocator.verify();

            assert_eq!(Block::from_user_ptr(first).as_ref().size(), 1016);

            // Freeing in allocation order: the first release has allocated
            // neighbours on both sides, the second merges forward with the
            // mapping remainder and backward with the first block.
            allocator.deallocate(first);
            allocator.verify();
            assert_eq!(allocator.free_blocks().len(), 2);

            allocator.deallocate(second);
            allocator.verify();
            assert_eq!(allocator.free_blocks(), [(bucket_index(UNIT), UNIT)]);
        }
    }

    #[test]
    fn zeroed_allocation_and_grow_preserve_content() {
        let mut allocator = RawAllocator::with_page_source(SlabSource::new(UNIT));

        unsafe {
            let address = allocator.allocate_zeroed(4, 1024).unwrap();
            allocator.verify();

            for i in 0..4096 {
                assert_eq!(address.as_ptr().add(i).read(), 0, "byte {i} not zeroed");
            }

            for i in 0..4096 {
                address.as_ptr().add(i).write((i % 251) as u8);
            }

            let grown = allocator
                .reallocate(Some(address), 8192)
                .unwrap()
                .unwrap();
            allocator.verify();

            for i in 0..4096 {
                assert_eq!(grown.as_ptr().add(i).read(), (i % 251) as u8);
            }
        }
    }

    #[test]
    fn shrink_stays_in_place_and_frees_the_excess() {
        let mut allocator = RawAllocator::with_page_source(SlabSource::new(UNIT));

        unsafe {
            let address = allocator.allocate(4000).unwrap();
            for i in 0..100 {
                address.as_ptr().add(i).write(i as u8);
            }

            let shrunk = allocator.reallocate(Some(address), 100).unwrap().unwrap();
            allocator.verify();

            assert_eq!(shrunk, address);
            for i in 0..100 {
                assert_eq!(shrunk.as_ptr().add(i).read(), i as u8);
            }

            // The carved tail merged with the mapping remainder: one free
            // block covering everything but the shrunk allocation.
            let block_size = Block::from_user_ptr(shrunk).as_ref().size();
            assert_eq!(block_size, 120);
            let remainder = UNIT - block_size;
            assert_eq!(
                allocator.free_blocks(),
                [(bucket_index(remainder), remainder)]
            );
        }
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let mut allocator = RawAllocator::with_page_source(SlabSource::new(UNIT));

        unsafe {
            assert_eq!(allocator.allocate(0), Err(AllocError::InvalidArgument));
            assert_eq!(
                allocator.allocate(usize::MAX),
                Err(AllocError::InvalidArgument)
            );
            assert_eq!(
                allocator.allocate(1 << 48),
                Err(AllocError::InvalidArgument)
            );
            assert_eq!(
                allocator.allocate_zeroed(0, 16),
                Err(AllocError::InvalidArgument)
            );
            assert_eq!(
                allocator.allocate_zeroed(8, usize::MAX / 4),
                Err(AllocError::InvalidArgument)
            );

            // Nothing happened to the allocator state.
            assert_eq!(allocator.registry.len(), 0);
            allocator.verify();
        }

        #[cfg(unix)]
        {
            assert_eq!(AllocError::InvalidArgument.errno(), libc::EINVAL);
            assert_eq!(AllocError::OutOfMemory.errno(), libc::ENOMEM);
        }
    }

    #[test]
    fn grow_failure_leaves_the_block_untouched() {
        // Enough budget for exactly one mapping.
        let mut allocator = RawAllocator::with_page_source(GappySource::new(PAGE, 1));

        unsafe {
            let address = allocator.allocate(100).unwrap();
            address.as_ptr().write_bytes(0x42, 100);

            // Growing past the mapping needs a second map call, which the
            // source refuses.
            let result = allocator.reallocate(Some(address), UNIT * 2);
            assert_eq!(result, Err(AllocError::OutOfMemory));
            allocator.verify();

            // The original block survived, data intact.
            for i in 0..100 {
                assert_eq!(address.as_ptr().add(i).read(), 0x42);
            }
            assert!(!Block::from_user_ptr(address).as_ref().is_free());

            // And ordinary allocations still work from the first mapping.
            assert!(allocator.allocate(64).is_ok());
            allocator.verify();
        }
    }

    #[test]
    fn adjacent_regions_fuse_and_coalesce_across_the_seam() {
        let mut allocator = RawAllocator::with_page_source(SlabSource::new(2 * UNIT));

        unsafe {
            // Consume the first unit entirely, then force a second carve.
            let first = allocator.allocate(UNIT - 16).unwrap();
            allocator.verify();
            assert!(allocator.free_blocks().is_empty());

            let second = allocator.allocate(8).unwrap();
            allocator.verify();

            // The second region started at the first one's high bound, so
            // there is still a single mapping, now two units long.
            assert_eq!(allocator.registry.len(), 1);
            let mapping = allocator.registry.get(0);
            assert_eq!(mapping.hi - mapping.lo, 2 * UNIT);

            // Releasing both merges across the seam into one block covering
            // the whole fused mapping.
            allocator.deallocate(first);
            allocator.verify();
            allocator.deallocate(second);
            allocator.verify();

            assert_eq!(
                allocator.free_blocks(),
                [(bucket_index(2 * UNIT), 2 * UNIT)]
            );

            // The fused mapping serves new allocations from the bottom.
            assert_eq!(allocator.allocate(UNIT - 16).unwrap(), first);
        }
    }

    #[test]
    fn registry_exhaustion_is_out_of_memory() {
        use crate::registry::MAX_MAPPINGS;

        // Tiny pages keep this scenario cheap: the mapping unit is 512
        // bytes and each allocation below consumes its mapping completely,
        // so every single one needs a fresh registry slot.
        let page = 16;
        let unit = PAGES_PER_MAP * page;
        let mut allocator =
            Box::new(RawAllocator::with_page_source(GappySource::new(page, usize::MAX)));

        unsafe {
            for _ in 0..MAX_MAPPINGS {
                allocator.allocate(unit - 16).unwrap();
            }

            assert_eq!(allocator.registry.len(), MAX_MAPPINGS);
            assert_eq!(
                allocator.allocate(unit - 16),
                Err(AllocError::OutOfMemory)
            );
            allocator.verify();
        }
    }

    #[test]
    fn wrapper_locks_and_implements_global_alloc() {
        let allocator = Buckalloc::new();

        unsafe {
            // The four operations through the public wrapper, backed by
            // real OS pages.
            let address = allocator.allocate_zeroed(2, 512).unwrap();
            assert_eq!(address.as_ptr().add(1023).read(), 0);

            let grown = allocator
                .reallocate(Some(address), 2048)
                .unwrap()
                .unwrap();
            grown.as_ptr().write_bytes(7, 2048);
            allocator.deallocate(grown);

            // GlobalAlloc surface.
            let layout = StdLayout::from_size_align(256, 8).unwrap();
            let ptr = allocator.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % 8, 0);

            let ptr = allocator.realloc(ptr, layout, 512);
            assert!(!ptr.is_null());
            allocator.dealloc(ptr, StdLayout::from_size_align(512, 8).unwrap());

            // Stricter alignments than 8 are refused, zero sizes too.
            let aligned = StdLayout::from_size_align(64, 16).unwrap();
            assert!(allocator.alloc(aligned).is_null());
            assert!(allocator
                .alloc(StdLayout::from_size_align(0, 8).unwrap())
                .is_null());
        }
    }

    #[test]
    fn usable_as_a_static() {
        static ALLOCATOR: Buckalloc = Buckalloc::new();

        let address = ALLOCATOR.allocate(64).unwrap();
        unsafe {
            address.as_ptr().write_bytes(1, 64);
            ALLOCATOR.deallocate(address);
        }
    }
}
