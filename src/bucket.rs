use std::ptr::NonNull;

use crate::{
    block::Block,
    classes::{bucket_index, EXACT_CLASSES, NUM_BUCKETS},
    Pointer,
};

/// One size class worth of free blocks: a circular doubly-linked list kept
/// in non-decreasing size order, ties broken oldest-first. The links live
/// inside the free blocks themselves (see [`crate::block`]), the bucket only
/// stores the entry point:
///
/// ```text
///             +--------------------------------------------+
///             |                                            |
///             v                                            |
///         +-------+      +-------+      +-------+          |
/// head -> |  32   | <--> |  32   | <--> |  48   | <--------+
///         +-------+      +-------+      +-------+
///           oldest         newest
/// ```
///
/// An empty bucket is just a `None` head, so the zeroed state of the
/// allocator is already a valid engine and nothing needs a lazy
/// initialization pass.
pub(crate) struct Bucket {
    head: Pointer<Block>,
}

impl Bucket {
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Appends `block` right before the head, which in a circular list is
    /// the tail position. Constant time. For a bucket whose blocks all have
    /// the same size this is exactly a sorted insert that breaks ties
    /// oldest-first, so the exact-size classes use it as a fast path.
    ///
    /// # Safety
    ///
    /// `block` must be a valid block that is not linked anywhere.
    pub unsafe fn push_back(&mut self, block: NonNull<Block>) {
        match self.head {
            None => self.link_only_node(block),
            Some(head) => self.link_before(block, head),
        }
    }

    /// Inserts `block` keeping the list sorted by size in non-decreasing
    /// order. Walks past every node of smaller or equal size, so among
    /// equally sized blocks the oldest stays first. O(k) for a bucket of k
    /// blocks.
    ///
    /// # Safety
    ///
    /// `block` must be a valid block that is not linked anywhere.
    pub unsafe fn insert_sorted(&mut self, block: NonNull<Block>) {
        let Some(head) = self.head else {
            return self.link_only_node(block);
        };

        let size = block.as_ref().size();
        let mut current = head;

        loop {
            if current.as_ref().size() > size {
                self.link_before(block, current);
                if current == head {
                    self.head = Some(block);
                }
                return;
            }

            current = current.as_ref().next.unwrap();
            if current == head {
                // Wrapped around: nothing is larger, append at the tail.
                return self.link_before(block, head);
            }
        }
    }

    /// Unlinks `block`. Constant time thanks to the sibling links.
    ///
    /// # Safety
    ///
    /// `block` must currently be linked into this bucket.
    pub unsafe fn remove(&mut self, block: NonNull<Block>) {
        let next = block.as_ref().next.unwrap();

        if next == block {
            // Only node in the circle.
            self.head = None;
            return;
        }

        let mut prev = block.as_ref().prev.unwrap();
        let mut next = next;
        prev.as_mut().next = Some(next);
        next.as_mut().prev = Some(prev);

        if self.head == Some(block) {
            self.head = Some(next);
        }
    }

    /// Returns the first block that can hold `size` bytes in total, without
    /// unlinking it. Because the list is sorted this is also the best fit
    /// within the bucket.
    ///
    /// # Safety
    ///
    /// The bucket must only contain valid free blocks.
    pub unsafe fn best_fit(&self, size: usize) -> Pointer<Block> {
        let head = self.head?;
        let mut current = head;

        loop {
            if current.as_ref().size() >= size {
                return Some(current);
            }

            current = current.as_ref().next.unwrap();
            if current == head {
                return None;
            }
        }
    }

    unsafe fn link_only_node(&mut self, mut block: NonNull<Block>) {
        block.as_mut().next = Some(block);
        block.as_mut().prev = Some(block);
        self.head = Some(block);
    }

    /// Links `block` between `at.prev` and `at`. Does not touch the head.
    unsafe fn link_before(&mut self, mut block: NonNull<Block>, mut at: NonNull<Block>) {
        let mut prev = at.as_ref().prev.unwrap();
        block.as_mut().prev = Some(prev);
        block.as_mut().next = Some(at);
        prev.as_mut().next = Some(block);
        at.as_mut().prev = Some(block);
    }

    /// Sizes of the linked blocks in list order. Only used to inspect state
    /// from tests.
    #[cfg(test)]
    pub fn block_sizes(&self) -> Vec<usize> {
        self.blocks()
            .map(|block| unsafe { block.as_ref().size() })
            .collect()
    }

    #[cfg(test)]
    pub fn blocks(&self) -> impl Iterator<Item = NonNull<Block>> {
        let head = self.head;
        let mut current = head;

        std::iter::from_fn(move || {
            let block = current?;
            let next = unsafe { block.as_ref().next.unwrap() };
            current = if Some(next) == head { None } else { Some(next) };
            Some(block)
        })
    }
}

/// The complete free-block engine: one [`Bucket`] per size class. Blocks
/// enter through [`Buckets::insert`] when they are freed and leave through
/// [`Buckets::take_fit`] when an allocation claims them, or through
/// [`Buckets::remove`] when a neighbour absorbs them during coalescing.
pub(crate) struct Buckets {
    classes: [Bucket; NUM_BUCKETS],
}

impl Buckets {
    pub const fn new() -> Self {
        const BUCKET: Bucket = Bucket::new();
        Self {
            classes: [BUCKET; NUM_BUCKETS],
        }
    }

    /// Files `block` under the bucket of its size class and marks it free.
    ///
    /// # Safety
    ///
    /// `block` must be a valid unlinked block owned by the allocator.
    pub unsafe fn insert(&mut self, mut block: NonNull<Block>) {
        let class = bucket_index(block.as_ref().size());

        if class < EXACT_CLASSES {
            self.classes[class].push_back(block);
        } else {
            self.classes[class].insert_sorted(block);
        }

        block.as_mut().set_free(true);
    }

    /// Unlinks `block` from its bucket and clears the free flag.
    ///
    /// # Safety
    ///
    /// `block` must currently be linked, i.e. its free flag must be set.
    pub unsafe fn remove(&mut self, mut block: NonNull<Block>) {
        self.classes[bucket_index(block.as_ref().size())].remove(block);
        block.as_mut().set_free(false);
    }

    /// Best-fit search: starting at the class of `size`, scans each bucket
    /// in ascending size order and takes the first block that fits. The hit
    /// is unlinked and marked allocated before it is returned.
    ///
    /// # Safety
    ///
    /// The buckets must only contain valid free blocks.
    pub unsafe fn take_fit(&mut self, size: usize) -> Pointer<Block> {
        for class in bucket_index(size)..NUM_BUCKETS {
            if let Some(block) = self.classes[class].best_fit(size) {
                self.remove(block);
                return Some(block);
            }
        }

        None
    }

    #[cfg(test)]
    pub fn class(&self, index: usize) -> &Bucket {
        &self.classes[index]
    }
}
