//! Crash-consistent publication of allocator state.
//!
//! The two [`HeapState`] slots of a region form a double buffer. Staging
//! copies the published slot into the other one and points the working
//! state of this process at the copy; every allocation, free and context
//! update of the transaction lands there. Committing swings the root cell
//! to the copy with a single word-sized release store.
//!
//! ```text
//!   stage                         commit
//!
//!   root --> [ slot 0 ]           root     [ slot 0 ]
//!            [ slot 1 ] <-- work      \--> [ slot 1 ]
//! ```
//!
//! A process that dies before the store leaves the old slot published, one
//! that dies after leaves the new one; nobody can observe a mix. The global
//! lock is held from stage to commit, so at most one transaction is in
//! flight across all processes sharing the region.

use std::{
    mem::{self, ManuallyDrop},
    ops::{Deref, DerefMut},
    ptr,
    sync::atomic::{Ordering, fence},
};

use crate::{
    error::HeapError,
    heap::{Heap, HeapGuard},
    state::HeapState,
};

/// A staged batch of allocator mutations. Derefs to the [`HeapGuard`]
/// holding the global lock; everything done through it targets the staged
/// copy until [`Transaction::commit`].
///
/// Dropping a transaction without committing abandons it: the lock is
/// released and the published state stays what it was before staging.
pub struct Transaction<'h> {
    guard: ManuallyDrop<HeapGuard<'h>>,
    /// Address of the staged slot, 0 for a transient heap.
    staged: usize,
}

impl Heap {
    /// Takes the global lock and copies the published state into the
    /// inactive slot. A transient heap only takes the lock.
    pub fn stage(&self) -> Result<Transaction<'_>, HeapError> {
        let guard = self.lock()?;

        if !self.is_persistent() {
            return Ok(Transaction {
                guard: ManuallyDrop::new(guard),
                staged: 0,
            });
        }

        let root = self.root().load(Ordering::Acquire);
        let current = root as *const HeapState;
        // SAFETY: the root names one of the two slots and we hold the lock
        let staged = unsafe { (*current).other_slot(root) };
        unsafe { ptr::copy_nonoverlapping(current, staged as *mut HeapState, 1) };

        self.staged().store(staged, Ordering::Relaxed);
        log::debug!("staged state {:#x} -> {:#x}", root, staged);

        Ok(Transaction {
            guard: ManuallyDrop::new(guard),
            staged,
        })
    }
}

impl Transaction<'_> {
    /// Publishes the staged state and releases the lock.
    pub fn commit(mut self) -> Result<(), HeapError> {
        if self.staged != 0 {
            let heap = self.guard.heap();
            heap.staged().store(0, Ordering::Relaxed);

            fence(Ordering::Release);
            heap.root().store(self.staged, Ordering::Release);
            log::debug!("committed state {:#x}", self.staged);
        }

        // SAFETY: `self` is forgotten right after, the guard is taken once
        let guard = unsafe { ManuallyDrop::take(&mut self.guard) };
        mem::forget(self);
        guard.unlock()
    }

    /// Whether this transaction works on a staged copy, which is only the
    /// case for a persistent heap.
    pub fn is_staged(&self) -> bool {
        self.staged != 0
    }
}

impl<'h> Deref for Transaction<'h> {
    type Target = HeapGuard<'h>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.staged != 0 {
            log::warn!("abandoned staged state {:#x}", self.staged);
            self.guard.heap().staged().store(0, Ordering::Relaxed);
        }
        // SAFETY: dropped exactly once, here
        unsafe { ManuallyDrop::drop(&mut self.guard) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{in_child, scratch_heap, scratch_path, scratch_settings};
    use std::ptr::NonNull;

    #[test]
    fn commit_publishes_staged_slot() {
        let (_dir, heap) = scratch_heap();
        let before_root = heap.root().load(Ordering::Acquire);
        let before = heap.lock().unwrap().snapshot();

        let mut tx = heap.stage().unwrap();
        assert!(tx.is_staged());
        let ptr = tx.allocate(48).unwrap();

        // The published slot is not touched while staging.
        assert_eq!(before_root, heap.root().load(Ordering::Acquire));
        assert_eq!(before, unsafe { *(before_root as *const HeapState) });

        tx.commit().unwrap();

        let after_root = heap.root().load(Ordering::Acquire);
        assert_ne!(before_root, after_root);
        let after = heap.lock().unwrap().snapshot();
        assert_eq!(before.head() + 64, after.head());
        assert_eq!(ptr.addr().get(), before.head());
        assert_eq!(0, heap.staged().load(Ordering::Relaxed));
    }

    #[test]
    fn transactions_alternate_slots() {
        let (_dir, heap) = scratch_heap();
        let first = heap.root().load(Ordering::Acquire);

        heap.stage().unwrap().commit().unwrap();
        let second = heap.root().load(Ordering::Acquire);
        heap.stage().unwrap().commit().unwrap();
        let third = heap.root().load(Ordering::Acquire);

        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn abandoned_transaction_keeps_published_state() {
        let (_dir, heap) = scratch_heap();
        let root = heap.root().load(Ordering::Acquire);
        let before = heap.lock().unwrap().snapshot();

        {
            let mut tx = heap.stage().unwrap();
            let ptr = tx.allocate(16).unwrap();
            unsafe { tx.free(ptr, 16).unwrap() };
            tx.set_context(NonNull::new(0x40 as *mut u8));
            assert_eq!(NonNull::new(0x40 as *mut u8), tx.context());
        }

        assert_eq!(root, heap.root().load(Ordering::Acquire));
        let guard = heap.lock().unwrap();
        assert_eq!(before, guard.snapshot());
        assert_eq!(None, guard.context());
    }

    #[test]
    fn unsafe_context_follows_working_state() {
        let (_dir, heap) = scratch_heap();
        let value = NonNull::new(0x80 as *mut u8);

        let mut tx = heap.stage().unwrap();
        tx.set_context(value);
        assert_eq!(value, unsafe { heap.context_unsafe() });
        tx.commit().unwrap();

        assert_eq!(value, heap.context(|_| {}).unwrap());
    }

    #[test]
    fn transient_transaction_is_plain_lock() {
        let heap = Heap::transient();
        let root = heap.root().load(Ordering::Acquire);

        let mut tx = heap.stage().unwrap();
        assert!(!tx.is_staged());
        let ptr = tx.allocate(8).unwrap();
        unsafe { tx.free(ptr, 8).unwrap() };
        tx.commit().unwrap();

        assert_eq!(root, heap.root().load(Ordering::Acquire));
    }

    #[test]
    fn committed_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir);
        let settings = scratch_settings();

        let heap = Heap::create(&path, &settings).unwrap();
        let mut tx = heap.stage().unwrap();
        let kept = tx.allocate(32).unwrap();
        let freed = tx.allocate(32).unwrap();
        unsafe {
            kept.as_ptr().cast::<u64>().write(0xdead_beef);
            tx.free(freed, 32).unwrap();
        }
        tx.commit().unwrap();
        let published = heap.lock().unwrap().snapshot();
        drop(heap);

        let heap = Heap::load(&path).unwrap();
        let mut guard = heap.lock().unwrap();
        let loaded = guard.snapshot();
        assert_eq!(published.free_table, loaded.free_table);
        assert_eq!(published.head(), loaded.head());
        assert_eq!(0xdead_beef, unsafe { kept.as_ptr().cast::<u64>().read() });
        assert_eq!(freed, guard.allocate(20).unwrap());
    }

    #[test]
    fn crash_before_commit_is_invisible_on_reload() {
        let (dir, heap) = scratch_heap();
        {
            let mut tx = heap.stage().unwrap();
            tx.allocate(128).unwrap();
            tx.commit().unwrap();
        }
        let root = heap.root().load(Ordering::Acquire);
        let before = heap.lock().unwrap().snapshot();

        // The child dies between stage and commit, still holding the lock.
        let status = in_child(|| {
            let Ok(mut tx) = heap.stage() else { return 1 };
            if tx.allocate(64).is_err() || tx.allocate(4096).is_err() {
                return 2;
            }
            tx.set_context(NonNull::new(0xbad as *mut u8));
            mem::forget(tx);
            0
        });
        assert_eq!(0, status);
        drop(heap);

        // Loading takes the lock, which recovers it from the dead owner.
        let heap = Heap::load(&scratch_path(&dir)).unwrap();
        assert_eq!(root, heap.root().load(Ordering::Acquire));

        let guard = heap.lock().unwrap();
        let mut expected = before;
        expected.break_ptr = guard.snapshot().break_ptr();
        assert_eq!(expected, guard.snapshot());
        assert_eq!(None, guard.context());
        drop(guard);

        // Consistent again: a full transaction goes through.
        let mut tx = heap.stage().unwrap();
        assert_eq!(before.head(), tx.allocate(64).unwrap().addr().get());
        tx.commit().unwrap();
    }

    #[test]
    fn lock_held_by_dead_process_is_recovered() {
        let (_dir, heap) = scratch_heap();

        let status = in_child(|| {
            let Ok(guard) = heap.lock() else { return 1 };
            mem::forget(guard);
            0
        });
        assert_eq!(0, status);

        let mut guard = heap.lock().unwrap();
        assert!(heap.assert_held().is_ok());
        guard.allocate(8).unwrap();
        guard.unlock().unwrap();
        assert!(heap.assert_held().is_err());
    }

    #[test]
    fn commit_in_other_process_is_visible() {
        let (_dir, heap) = scratch_heap();
        let root = heap.root().load(Ordering::Acquire);
        let head = heap.lock().unwrap().snapshot().head();

        let status = in_child(|| {
            let Ok(mut tx) = heap.stage() else { return 1 };
            if tx.allocate(256).is_err() {
                return 2;
            }
            tx.set_context(NonNull::new(0x100 as *mut u8));
            match tx.commit() {
                Ok(()) => 0,
                Err(_) => 3,
            }
        });
        assert_eq!(0, status);

        assert_ne!(root, heap.root().load(Ordering::Acquire));
        let guard = heap.lock().unwrap();
        assert_eq!(head + 256, guard.snapshot().head());
        assert_eq!(NonNull::new(0x100 as *mut u8), guard.context());
    }

    #[test]
    fn gensym_is_shared_between_processes() {
        let (_dir, heap) = scratch_heap();
        assert_eq!(1, heap.gensym());

        let status = in_child(|| match heap.gensym() {
            2 => 0,
            _ => 1,
        });
        assert_eq!(0, status);
        assert_eq!(3, heap.gensym());
    }
}
