use crate::{
    list::{Chain, Chunk, Link},
    state::{FREE_TABLE_SIZE, HeapState},
    utils::{WORD, checked_align},
};

/// Rounds `size` up to a multiple of the word size and then to the next
/// power of two. This is the exact number of bytes a chunk of `size` takes
/// from the heap. A zero size still takes one word.
///
/// Returns `None` when the class does not fit in a `usize`.
pub fn size_class(size: usize) -> Option<usize> {
    checked_align(size.max(1), WORD)?.checked_next_power_of_two()
}

/// Index of the free-table bucket holding chunks of `size`:
/// `ceil(log2(size_class(size)))`.
pub fn bucket_index(size: usize) -> Option<usize> {
    let index = size_class(size)?.trailing_zeros() as usize;
    debug_assert!(index < FREE_TABLE_SIZE);
    Some(index)
}

/// Table of free chunks, one bucket per power of two.
///
/// Every bucket is an intrusive [`Chain`] whose head lives in
/// [`HeapState::free_table`]:
///
/// ```text
///  free_table
/// +----------+
/// |   [3]  ---------> 8 byte chunk -> 8 byte chunk -> 0
/// +----------+
/// |   [4]  ---------> 16 byte chunk -> 0
/// +----------+
/// |   ...    |
/// +----------+
/// ```
///
/// Chunks are never split, merged or moved between buckets, and a freed
/// chunk is never handed back to the bump region.
///
/// There is no check that a chunk is released with the size it was
/// allocated with. Releasing with a different size files the chunk under
/// the wrong bucket and a later allocation of that class will overlap its
/// neighbours. Callers must pass the size they allocated with.
pub(crate) struct FreeTable<'a> {
    state: &'a mut HeapState,
}

impl<'a> FreeTable<'a> {
    pub fn new(state: &'a mut HeapState) -> Self {
        Self { state }
    }

    fn bucket(&mut self, index: usize) -> Chain<'_> {
        Chain::new(&mut self.state.free_table[index])
    }

    /// Takes a previously freed chunk of class `class`.
    ///
    /// # Safety
    /// Every chunk recorded in the bucket must still be mapped.
    pub unsafe fn take(&mut self, class: usize) -> Link {
        let index = class.trailing_zeros() as usize;
        unsafe { self.bucket(index).pop() }
    }

    /// Files `chunk` under the bucket for `class`.
    ///
    /// # Safety
    /// `chunk` must be mapped, at least a word long and no longer in use.
    pub unsafe fn give(&mut self, chunk: Chunk, class: usize) {
        let index = class.trailing_zeros() as usize;
        unsafe { self.bucket(index).push(chunk) }
    }

    /// Number of chunks waiting in each bucket.
    ///
    /// # Safety
    /// Every chunk recorded in the table must still be mapped.
    pub unsafe fn lengths(&mut self) -> [usize; FREE_TABLE_SIZE] {
        let mut lengths = [0; FREE_TABLE_SIZE];
        for (index, len) in lengths.iter_mut().enumerate() {
            let bucket = self.bucket(index);
            *len = unsafe { bucket.iter() }.count();
        }
        lengths
    }
}
