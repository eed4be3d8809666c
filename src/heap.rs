use std::{
    alloc::{self, Layout},
    cell::UnsafeCell,
    ffi::OsStr,
    marker::PhantomData,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    ptr::NonNull,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use crate::{
    config::{HeapSettings, Mode},
    error::{self, HeapError},
    freelist::{FreeTable, size_class},
    kernel,
    list::Chunk,
    lock::GlobalLock,
    region::Region,
    state::{FREE_TABLE_SIZE, HeapState},
    utils::WORD,
};

/// Runtime handle of the heap. Built once at startup and passed to
/// everything that allocates.
///
/// A persistent heap keeps all of its shared structures (state pair,
/// indirection cell, lock, identifier counter) inside the mapped region, so
/// every process that maps the same file sees the same physical memory. A
/// transient heap keeps the same structures in process memory.
pub struct Heap {
    backing: Backing,
    lock: GlobalLock,
    /// Slot a transaction of this process is mutating, 0 when none is in
    /// flight. While set, it replaces the root cell as the working state.
    staged: AtomicUsize,
    /// Bytes handed out by this process and not freed yet.
    allocated: AtomicUsize,
}

enum Backing {
    Mapped(Region),
    Transient(Box<TransientCells>),
}

struct TransientCells {
    state: UnsafeCell<HeapState>,
    root: AtomicUsize,
    gensym: AtomicU64,
    constants: AtomicUsize,
}

// SAFETY: shared state is only mutated while holding the global lock, the
// remaining cells are atomics
unsafe impl Send for Heap {}
// SAFETY: shared state is only mutated while holding the global lock, the
// remaining cells are atomics
unsafe impl Sync for Heap {}

/// Counters for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub begin: usize,
    pub head: usize,
    pub end: usize,
    /// Free chunks waiting in each bucket.
    pub free_chunks: [usize; FREE_TABLE_SIZE],
    /// Bytes this process allocated and did not free yet.
    pub allocated: usize,
}

impl HeapStats {
    /// Bytes of the bump region handed out so far.
    pub fn bumped(&self) -> usize {
        self.head - self.begin
    }

    /// Bytes left for bump allocation.
    pub fn remaining(&self) -> usize {
        self.end - self.head
    }
}

impl Heap {
    pub fn open(mode: &Mode, settings: &HeapSettings) -> Result<Self, HeapError> {
        match mode {
            Mode::Transient => Ok(Self::transient()),
            Mode::Create(path) => Self::create(path, settings),
            Mode::Load(path) => Self::load(path),
        }
    }

    /// Creates a new region file at `path`.
    pub fn create(path: &Path, settings: &HeapSettings) -> Result<Self, HeapError> {
        let (region, lock) = Region::create(path, settings)?;
        Ok(Self::with_backing(Backing::Mapped(region), lock))
    }

    /// Maps an existing region file and records this process' break in the
    /// published state, replacing the break of whoever opened it before.
    pub fn load(path: &Path) -> Result<Self, HeapError> {
        let (region, lock) = Region::load(path)?;
        let heap = Self::with_backing(Backing::Mapped(region), lock);

        {
            let mut guard = heap.lock()?;
            guard.state_mut().break_ptr = kernel::program_break();
        }

        Ok(heap)
    }

    /// Process-local heap. Allocation goes to the global allocator and
    /// nothing survives the process.
    pub fn transient() -> Self {
        let cells = Box::new(TransientCells {
            state: UnsafeCell::new(HeapState::detached(kernel::program_break())),
            root: AtomicUsize::new(0),
            gensym: AtomicU64::new(1),
            constants: AtomicUsize::new(0),
        });
        cells.root.store(cells.state.get() as usize, Ordering::Release);
        log::debug!("transient heap, no backing file");

        Self::with_backing(Backing::Transient(cells), GlobalLock::transient())
    }

    fn with_backing(backing: Backing, lock: GlobalLock) -> Self {
        Self {
            backing,
            lock,
            staged: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    /// Path the region file was created with.
    pub fn path(&self) -> Option<PathBuf> {
        match &self.backing {
            Backing::Mapped(region) => {
                Some(PathBuf::from(OsStr::from_bytes(region.recorded_path().to_bytes())))
            }
            Backing::Transient(_) => None,
        }
    }

    /// Acquires the global lock. Everything that reads or mutates the
    /// allocator state goes through the returned guard.
    pub fn lock(&self) -> Result<HeapGuard<'_>, HeapError> {
        self.lock.lock()?;
        Ok(HeapGuard {
            heap: self,
            _not_send: PhantomData,
        })
    }

    /// Fails with [`HeapError::UnsafeOperation`] unless this process holds
    /// the lock. A development aid: guards already enforce this.
    pub fn assert_held(&self) -> Result<(), HeapError> {
        self.lock.assert_held()
    }

    pub(crate) fn root(&self) -> &AtomicUsize {
        match &self.backing {
            Backing::Mapped(region) => region.root(),
            Backing::Transient(cells) => &cells.root,
        }
    }

    fn gensym_cell(&self) -> &AtomicU64 {
        match &self.backing {
            Backing::Mapped(region) => region.gensym(),
            Backing::Transient(cells) => &cells.gensym,
        }
    }

    fn constants_cell(&self) -> &AtomicUsize {
        match &self.backing {
            Backing::Mapped(region) => region.constants(),
            Backing::Transient(cells) => &cells.constants,
        }
    }

    pub(crate) fn staged(&self) -> &AtomicUsize {
        &self.staged
    }

    /// The state operations currently act on: the staged copy inside a
    /// transaction of this process, the published one otherwise.
    fn working_state(&self) -> NonNull<HeapState> {
        let staged = self.staged.load(Ordering::Relaxed);
        let addr = if staged != 0 {
            staged
        } else {
            self.root().load(Ordering::Acquire)
        };
        // SAFETY: the root cell always names one of the two slots
        unsafe { NonNull::new_unchecked(addr as *mut HeapState) }
    }

    /// Next identifier. Unique across every process sharing the region;
    /// the values say nothing about the ordering of other memory effects.
    pub fn gensym(&self) -> u64 {
        self.gensym_cell().fetch_add(1, Ordering::Relaxed)
    }

    /// Whether `ptr` comes from the program image or its data segment
    /// rather than from this heap. Such pointers must never be freed here.
    ///
    /// The break compared against lives in the shared state and is the one
    /// recorded by the process that created or most recently loaded the
    /// region, for every process mapping it.
    pub fn is_static<T>(&self, ptr: *const T) -> bool {
        // SAFETY: break_ptr is a single word only rewritten on open
        let brk = unsafe { (*self.working_state().as_ptr()).break_ptr };
        ptr.addr() <= brk
    }

    /// Reads the execution context under the lock and hands a non-null
    /// value to `retain` before the lock is released.
    pub fn context<F>(&self, retain: F) -> Result<Option<NonNull<u8>>, HeapError>
    where
        F: FnOnce(NonNull<u8>),
    {
        let guard = self.lock()?;
        let context = guard.context();
        if let Some(context) = context {
            retain(context);
        }
        Ok(context)
    }

    pub fn set_context(&self, context: Option<NonNull<u8>>) -> Result<(), HeapError> {
        let mut guard = self.lock()?;
        guard.set_context(context);
        Ok(())
    }

    /// # Safety
    /// No lock is taken and no retain hook runs. The caller must already
    /// have exclusive access to the heap by other means.
    pub unsafe fn context_unsafe(&self) -> Option<NonNull<u8>> {
        let state = self.working_state();
        NonNull::new(unsafe { (*state.as_ptr()).context } as *mut u8)
    }

    /// # Safety
    /// See [`Heap::context_unsafe`].
    pub unsafe fn set_context_unsafe(&self, context: Option<NonNull<u8>>) {
        let state = self.working_state();
        unsafe { (*state.as_ptr()).context = context.map_or(0, |c| c.addr().get()) };
    }

    /// Bytes this process allocated and did not free yet.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// Proof that the global lock is held. Released on drop, on every path.
///
/// Not `Send`: a pthread mutex must be released by the thread that locked it.
pub struct HeapGuard<'h> {
    heap: &'h Heap,
    _not_send: PhantomData<*const ()>,
}

impl<'h> HeapGuard<'h> {
    pub(crate) fn heap(&self) -> &'h Heap {
        self.heap
    }

    fn state_ref(&self) -> &HeapState {
        // SAFETY: we hold the lock, nobody else mutates the working state
        unsafe { self.heap.working_state().as_ref() }
    }

    fn state_mut(&mut self) -> &mut HeapState {
        // SAFETY: we hold the lock, nobody else touches the working state
        unsafe { self.heap.working_state().as_mut() }
    }

    /// Copy of the working state.
    pub fn snapshot(&self) -> HeapState {
        *self.state_ref()
    }

    /// Allocates a chunk for `size` bytes.
    ///
    /// A persistent heap rounds `size` to its [`size_class`], reuses a
    /// freed chunk of that class if there is one and bumps `head`
    /// otherwise. Running out of bump space is final: the state is left
    /// untouched and [`HeapError::OutOfMemory`] is returned.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if !self.heap.is_persistent() {
            return self.allocate_transient(size);
        }
        let heap = self.heap;
        heap.assert_held()?;

        let class = size_class(size).ok_or(HeapError::OutOfMemory { requested: size })?;
        let state = self.state_mut();

        // SAFETY: free chunks are inside the mapping
        if let Some(chunk) = unsafe { FreeTable::new(state).take(class) } {
            log::trace!("reused {:#x} for {} bytes", chunk.addr(), class);
            heap.allocated.fetch_add(class, Ordering::Relaxed);
            return Ok(chunk.as_ptr());
        }

        let result = state.head;
        match result.checked_add(class) {
            Some(next) if next < state.end => state.head = next,
            _ => return Err(HeapError::OutOfMemory { requested: size }),
        }
        log::trace!("bumped {:#x} for {} bytes", result, class);

        heap.allocated.fetch_add(class, Ordering::Relaxed);
        // SAFETY: head is inside the mapping, above its base
        Ok(unsafe { NonNull::new_unchecked(result as *mut u8) })
    }

    fn allocate_transient(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let layout = transient_layout(size)?;
        // SAFETY: the layout has a non-zero size
        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).ok_or(HeapError::OutOfMemory { requested: size })?;
        self.heap.allocated.fetch_add(layout.size(), Ordering::Relaxed);
        Ok(ptr)
    }

    /// Gives a chunk back.
    ///
    /// # Safety
    /// `ptr` must come from [`HeapGuard::allocate`] on this heap with the
    /// same `size`, and must not be used afterwards. The size is not
    /// checked: freeing with another size files the chunk under the wrong
    /// bucket and corrupts later allocations.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), HeapError> {
        if !self.heap.is_persistent() {
            let layout = transient_layout(size)?;
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            self.heap.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
            return Ok(());
        }
        let heap = self.heap;
        heap.assert_held()?;

        let class = size_class(size).ok_or(HeapError::OutOfMemory { requested: size })?;
        let state = self.state_mut();
        debug_assert!(state.begin <= ptr.addr().get() && ptr.addr().get() < state.end);

        unsafe { FreeTable::new(state).give(Chunk::from_ptr(ptr), class) };
        log::trace!("freed {:p} into the {} byte bucket", ptr, class);

        heap.allocated.fetch_sub(class, Ordering::Relaxed);
        Ok(())
    }

    pub fn context(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.state_ref().context as *mut u8)
    }

    pub fn set_context(&mut self, context: Option<NonNull<u8>>) {
        self.state_mut().context = context.map_or(0, |c| c.addr().get());
    }

    /// Address stored in the constants-table slot of the region.
    pub fn constants(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.heap.constants_cell().load(Ordering::Relaxed) as *mut u8)
    }

    pub fn set_constants(&mut self, table: Option<NonNull<u8>>) {
        let addr = table.map_or(0, |t| t.addr().get());
        self.heap.constants_cell().store(addr, Ordering::Relaxed);
    }

    pub fn stats(&mut self) -> HeapStats {
        let allocated = self.heap.allocated_bytes();
        let persistent = self.heap.is_persistent();
        let state = self.state_mut();
        let free_chunks = if persistent {
            // SAFETY: free chunks are inside the mapping
            unsafe { FreeTable::new(state).lengths() }
        } else {
            [0; FREE_TABLE_SIZE]
        };

        HeapStats {
            begin: state.begin,
            head: state.head,
            end: state.end,
            free_chunks,
            allocated,
        }
    }

    /// Releases the lock, reporting failure instead of terminating.
    pub fn unlock(self) -> Result<(), HeapError> {
        let heap = self.heap;
        std::mem::forget(self);
        heap.lock.unlock()
    }
}

impl Drop for HeapGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.heap.lock.unlock() {
            error::fatal(&err);
        }
    }
}

fn transient_layout(size: usize) -> Result<Layout, HeapError> {
    Layout::from_size_align(size.max(1), WORD).map_err(|_| HeapError::OutOfMemory { requested: size })
}
