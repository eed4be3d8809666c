//! Helper functions shared by the region layout and the allocator.
//! These don't belong to any concrete component of the heap.

use std::mem;

/// Width of a machine word. Every control field of the region and every
/// allocation size is a multiple of this.
pub const WORD: usize = mem::size_of::<usize>();

/// Alignment of the first bump-allocated byte after the region header.
pub const HEAP_ALIGN: usize = 16;

/// It aligns `to_be_aligned` up to the next multiple of `aligment`, which
/// must be a power of two.
///
/// Used to widen the lock attribute slot to a word and to place the start
/// of the bump region on a [`HEAP_ALIGN`] boundary.
pub const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around.
pub const fn checked_align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    match to_be_aligned.checked_add(aligment - 1) {
        Some(sum) => Some(sum & !(aligment - 1)),
        None => None,
    }
}
