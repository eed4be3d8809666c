use std::mem;

use crate::utils::WORD;

/// One bucket per size-class exponent.
pub const FREE_TABLE_SIZE: usize = 64;

pub(crate) const HEAP_STATE_SIZE: usize = mem::size_of::<HeapState>();

/// The mutable allocator state. Two of these live back to back in the
/// region header; the indirection cell designates the current one and a
/// transaction mutates the other before publishing it.
///
/// Every field is a machine word holding an absolute address (0 for null),
/// so the record is bit-identical to a struct of native pointers and stays
/// valid across processes that map the region at the same base.
///
/// ```text
/// +--------------------+
/// |      states        | -> address of slot 0 of the pair
/// +--------------------+
/// |  free_table[0..64] | -> head chunk of each bucket
/// +--------------------+
/// |      context       |
/// +--------------------+
/// | begin | head | end | -> bump cursors
/// +--------------------+
/// |     file_name      | -> NUL terminated path in the header
/// +--------------------+
/// |     break_ptr      |
/// +--------------------+
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapState {
    pub(crate) states: usize,
    pub(crate) free_table: [usize; FREE_TABLE_SIZE],
    pub(crate) context: usize,
    pub(crate) begin: usize,
    pub(crate) head: usize,
    pub(crate) end: usize,
    pub(crate) file_name: usize,
    pub(crate) break_ptr: usize,
}

const _: () = assert!(HEAP_STATE_SIZE == (FREE_TABLE_SIZE + 7) * WORD);

impl HeapState {
    /// State of a transient heap: no file, no bump region, empty free table.
    pub(crate) const fn detached(break_ptr: usize) -> Self {
        Self {
            states: 0,
            free_table: [0; FREE_TABLE_SIZE],
            context: 0,
            begin: 0,
            head: 0,
            end: 0,
            file_name: 0,
            break_ptr,
        }
    }

    /// Address of the slot of the pair that `current` is not.
    pub(crate) fn other_slot(&self, current: usize) -> usize {
        if current == self.states {
            self.states + HEAP_STATE_SIZE
        } else {
            self.states
        }
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn break_ptr(&self) -> usize {
        self.break_ptr
    }

    pub fn is_persistent(&self) -> bool {
        self.file_name != 0
    }
}
