use std::{mem, ptr::NonNull};

use crate::{header::HeaderWord, Pointer};

/// A managed block. The struct describes the first 24 bytes of the raw
/// memory of every block, but only the header word is always meaningful.
/// The sibling links are live while the block sits in a bucket; as soon as
/// it is handed to the user they become the first 16 bytes of the content:
///
/// ```text
///              Free block                        Allocated block
/// +--------------------------------+    +--------------------------------+
/// | {size:48, mapping:15, free:1}  |    | {size:48, mapping:15, free:0}  |
/// +--------------------------------+    +--------------------------------+
/// | next free block in bucket      |    |          User content          | <- User pointer.
/// +--------------------------------+    |              ...               |
/// | prev free block in bucket      |    |              ...               |
/// +--------------------------------+    |              ...               |
/// |              ...               |    |              ...               |
/// +--------------------------------+    +--------------------------------+
/// | size                           |    | size                           | <- Footer.
/// +--------------------------------+    +--------------------------------+
/// ```
///
/// The links are [`Pointer<Block>`] rather than bare [`NonNull`] because the
/// user is allowed to write anything over them, including zeroes, and we
/// still read the struct through references afterwards. Every bit pattern
/// is a valid `Option<NonNull>`, so no read can ever produce an invalid
/// value.
///
/// The footer exists so that a block can find the header of its physical
/// predecessor: read the predecessor's size from the 8 bytes right below
/// your own header and subtract it from your own address. That walk is only
/// legal away from the low bound of the mapping, which the caller checks
/// through the mapping index stored in the header word.
#[repr(C)]
pub(crate) struct Block {
    word: HeaderWord,
    /// Next block in this block's bucket. Only valid while free.
    pub next: Pointer<Block>,
    /// Previous block in this block's bucket. Only valid while free.
    pub prev: Pointer<Block>,
}

/// Part of the block that precedes the user content.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<HeaderWord>();

/// Trailing size copy.
pub(crate) const FOOTER_SIZE: usize = mem::size_of::<u64>();

/// Metadata cost of an allocated block: header word plus footer. The user
/// content of a block of total size `s` is `s - ALLOC_OVERHEAD` bytes.
pub(crate) const ALLOC_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

/// Smallest block this allocator can manage. While free, a block needs its
/// header word, both sibling links and a valid footer all at once, which is
/// what bounds the value.
pub(crate) const MIN_BLOCK_SIZE: usize = mem::size_of::<Block>() + FOOTER_SIZE;

impl Block {
    /// Returns a pointer to the [`Block`] whose content starts at `address`.
    ///
    /// ```text
    /// +-------------+
    /// |   Header    | <- Returned pointer points here.
    /// +-------------+
    /// |   Content   | <- Given address points here.
    /// +-------------+
    /// |     ...     |
    /// +-------------+
    /// ```
    ///
    /// # Safety
    ///
    /// Caller must guarantee that `address` was previously handed out by
    /// [`Self::user_ptr_of`]. As long as that's true this is safe, otherwise
    /// it's undefined behaviour.
    #[inline]
    pub unsafe fn from_user_ptr(address: NonNull<u8>) -> NonNull<Block> {
        NonNull::new_unchecked(address.as_ptr().sub(HEADER_SIZE).cast())
    }

    /// Address of the first content byte of `block`, the one the user
    /// receives. Inverse of [`Self::from_user_ptr`].
    #[inline]
    pub unsafe fn user_ptr_of(block: NonNull<Block>) -> NonNull<u8> {
        NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(HEADER_SIZE))
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.word.size()
    }

    #[inline]
    pub fn mapping(&self) -> u16 {
        self.word.mapping()
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.word.is_free()
    }

    /// Number of bytes the user may write through the pointer of an
    /// allocated block.
    #[inline]
    pub fn content_size(&self) -> usize {
        self.size() - ALLOC_OVERHEAD
    }

    /// Flips the free flag. The footer only stores the size, so it doesn't
    /// need to be touched here.
    #[inline]
    pub fn set_free(&mut self, free: bool) {
        self.word = self.word.with_free(free);
    }

    /// Writes a brand new header word and the matching footer. Used when a
    /// block is born, either carved out of a fresh mapping or split off an
    /// existing block.
    ///
    /// # Safety
    ///
    /// `block` must point to `size` bytes of memory owned by the allocator.
    pub unsafe fn initialize(block: NonNull<Block>, size: usize, mapping: u16, free: bool) {
        (*block.as_ptr()).word = HeaderWord::new(size, mapping, free);
        Self::write_footer(block, size);
    }

    /// Updates the size in the header word and rewrites the footer at the
    /// new end of the block, so that no caller ever observes one without
    /// the other.
    ///
    /// # Safety
    ///
    /// The block must own the memory up to its new end address.
    pub unsafe fn set_size(mut block: NonNull<Block>, size: usize) {
        let word = block.as_ref().word;
        block.as_mut().word = word.with_size(size);
        Self::write_footer(block, size);
    }

    #[inline]
    unsafe fn write_footer(block: NonNull<Block>, size: usize) {
        let footer = block.as_ptr().cast::<u8>().add(size - FOOTER_SIZE);
        footer.cast::<u64>().write(size as u64);
    }

    /// Returns the block that physically follows `block` in its mapping.
    ///
    /// # Safety
    ///
    /// Caller must check first that `block` doesn't reach the high bound of
    /// its mapping, otherwise the returned pointer is not managed memory.
    #[inline]
    pub unsafe fn next_neighbour(block: NonNull<Block>) -> NonNull<Block> {
        let size = block.as_ref().size();
        NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(size).cast())
    }

    /// Returns the block that physically precedes `block` in its mapping,
    /// located through the predecessor's footer:
    ///
    /// ```text
    /// +-------------+  <- Returned pointer, `block` minus the read size.
    /// |   Header    |
    /// +-------------+
    /// |     ...     |
    /// +-------------+
    /// |   Footer    | <- Read 8 bytes right below `block`.
    /// +-------------+
    /// |   Header    | <- `block` points here.
    /// +-------------+
    /// |     ...     |
    /// +-------------+
    /// ```
    ///
    /// # Safety
    ///
    /// Caller must check first that `block` is not at the low bound of its
    /// mapping, otherwise the footer read is not managed memory.
    #[inline]
    pub unsafe fn prev_neighbour(block: NonNull<Block>) -> NonNull<Block> {
        let size = block.as_ptr().cast::<u64>().offset(-1).read() as usize;
        NonNull::new_unchecked(block.as_ptr().cast::<u8>().sub(size).cast())
    }

    /// Reads the footer back. The allocator keeps header and footer equal at
    /// all times, tests use this to prove it.
    #[cfg(test)]
    pub unsafe fn footer_of(block: NonNull<Block>) -> u64 {
        let size = block.as_ref().size();
        block.as_ptr().cast::<u8>().add(size - FOOTER_SIZE).cast::<u64>().read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backing memory for a handful of fabricated blocks. 8-aligned like
    /// every real mapping.
    fn arena(words: usize) -> Vec<u64> {
        vec![0; words]
    }

    #[test]
    fn layout_constants() {
        assert_eq!(HEADER_SIZE, 8);
        assert_eq!(FOOTER_SIZE, 8);
        assert_eq!(ALLOC_OVERHEAD, 16);
        assert_eq!(mem::size_of::<Block>(), 24);
        assert_eq!(MIN_BLOCK_SIZE, 32);
    }

    #[test]
    fn user_ptr_round_trip() {
        let mut memory = arena(8);
        let block = NonNull::new(memory.as_mut_ptr().cast::<Block>()).unwrap();

        unsafe {
            let user = Block::user_ptr_of(block);
            assert_eq!(user.as_ptr() as usize - block.as_ptr() as usize, 8);
            assert_eq!(Block::from_user_ptr(user), block);
        }
    }

    #[test]
    fn header_and_footer_stay_in_sync() {
        let mut memory = arena(16);
        let block = NonNull::new(memory.as_mut_ptr().cast::<Block>()).unwrap();

        unsafe {
            Block::initialize(block, 128, 3, false);
            assert_eq!(block.as_ref().size(), 128);
            assert_eq!(block.as_ref().mapping(), 3);
            assert_eq!(block.as_ref().content_size(), 112);
            assert!(!block.as_ref().is_free());
            assert_eq!(Block::footer_of(block), 128);

            Block::set_size(block, 64);
            assert_eq!(block.as_ref().size(), 64);
            assert_eq!(Block::footer_of(block), 64);
            // Mapping and flag survive the resize.
            assert_eq!(block.as_ref().mapping(), 3);
            assert!(!block.as_ref().is_free());
        }
    }

    #[test]
    fn physical_navigation() {
        let mut memory = arena(16); // 128 bytes, two 64 byte blocks.
        let first = NonNull::new(memory.as_mut_ptr().cast::<Block>()).unwrap();

        unsafe {
            Block::initialize(first, 64, 0, false);
            let second = Block::next_neighbour(first);
            assert_eq!(
                second.as_ptr() as usize - first.as_ptr() as usize,
                64
            );

            Block::initialize(second, 64, 0, true);
            assert_eq!(Block::prev_neighbour(second), first);
            assert_eq!(Block::next_neighbour(second).as_ptr() as usize,
                memory.as_ptr() as usize + 128
            );
        }
    }
}
