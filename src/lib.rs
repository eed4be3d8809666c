//! Persistent heap.
//!
//! A file-backed region mapped at a fixed virtual address, shared by every
//! process that opens the same file. Objects allocated inside store plain
//! pointers to each other: the region always comes back at the address it
//! was created at, so nothing needs relocating between runs.
//!
//! ```text
//!   process A            region file             process B
//!  +----------+      +-----------------+      +----------+
//!  | Heap     |----->| header + lock   |<-----| Heap     |
//!  |          |      | HeapState x2    |      |          |
//!  |          |      | bump heap ...   |      |          |
//!  +----------+      +-----------------+      +----------+
//! ```
//!
//! Allocation is a size-classed free list in front of a bump pointer. All
//! mutations happen under one robust, process-shared lock, and batches of
//! them are published atomically through a [`Transaction`].
//!
//! ```no_run
//! use pheap::{Heap, HeapSettings};
//!
//! let heap = Heap::create("heap.img".as_ref(), &HeapSettings::default())?;
//! let mut tx = heap.stage()?;
//! let cell = tx.allocate(64)?;
//! tx.set_context(Some(cell));
//! tx.commit()?;
//! # Ok::<(), pheap::HeapError>(())
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("the persistent heap needs Linux: fixed shared mappings and robust process-shared mutexes");

#[cfg(not(target_pointer_width = "64"))]
compile_error!("the persistent heap needs a 64 bit address space");

mod config;
mod error;
mod freelist;
mod heap;
mod kernel;
mod list;
mod lock;
mod region;
mod state;
mod transaction;
mod utils;

pub use config::{DEFAULT_BASE_ADDRESS, DEFAULT_REGION_SIZE, HeapArgs, HeapSettings, Mode, configuration_error};
pub use error::{ErrorClass, HeapError, fatal};
pub use freelist::{bucket_index, size_class};
pub use heap::{Heap, HeapGuard, HeapStats};
pub use list::Chunk;
pub use state::{FREE_TABLE_SIZE, HeapState};
pub use transaction::Transaction;
