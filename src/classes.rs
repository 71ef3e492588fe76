use crate::align::MEM_UNIT;

/// Number of size classes. Blocks are kept in one bucket per class:
///
/// ```text
/// 0:   <empty>
/// 1:   <empty>
/// ...
/// 4:   32
/// 5:   40
/// n:   8*n
/// ...
/// 127: 1016
/// 128: {8*k : 2^7  <= k < 2^8}    (1024..2048)
/// 129: {8*k : 2^8  <= k < 2^9}    (2048..4096)
/// ...
/// n:   {8*k : 2^(n - 121) <= k < 2^(n - 120)}
/// ...
/// 165: {8*k : 2^44 <= k < 2^45}
/// ```
///
/// The address space is assumed to be at most 48 bits long, so it is
/// impossible, even theoretically, to manage a block of 2^48 bytes or more.
/// That's why the table stops at index 165. See
/// <https://stackoverflow.com/questions/6716946/why-do-x86-64-systems-have-only-a-48-bit-virtual-address-space>.
pub(crate) const NUM_BUCKETS: usize = 166;

/// Classes below this index hold exactly one block size (8 times the index),
/// the rest cover a power of two range each.
pub(crate) const EXACT_CLASSES: usize = 128;

/// Returns the index of the bucket that holds blocks of `size` total bytes.
/// Total for all sizes greater than zero. Monotonic non-decreasing in `size`.
pub(crate) fn bucket_index(size: usize) -> usize {
    if size < EXACT_CLASSES * MEM_UNIT {
        return size / MEM_UNIT;
    }

    // Linear scan for the top bit. The first range class covers 1024..2048,
    // so the scan starts at log2(1024) and classes are offset by 118.
    let mut log2 = 10;
    while log2 + 1 < usize::BITS as usize && (1usize << (log2 + 1)) <= size {
        log2 += 1;
    }

    log2 + 118
}
