use std::{
    fmt, mem,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::lock_api::RawMutex as _;

use crate::error::HeapError;

pub(crate) const LOCK_ATTR_SIZE: usize = mem::size_of::<libc::pthread_mutexattr_t>();
pub(crate) const LOCK_SIZE: usize = mem::size_of::<libc::pthread_mutex_t>();

/// Region-wide mutual exclusion.
///
/// For a persistent heap this is a robust, process-shared pthread mutex
/// that lives inside the mapping, so every process sharing the file
/// contends on the same physical lock. A holder that dies while locked does
/// not wedge the region: the next acquirer is told the owner died, marks
/// the mutex consistent and carries on.
///
/// A transient heap has no other process to share with; its lock only
/// serializes the threads of this process.
pub(crate) struct GlobalLock {
    mutex: Mutex,
    /// Process-local record of whether this process believes it holds the
    /// lock. Only used to catch unguarded mutations during development.
    held: AtomicBool,
}

enum Mutex {
    Local(parking_lot::RawMutex),
    Shared(NonNull<libc::pthread_mutex_t>),
}

// SAFETY: the mutex is process-shared and designed to be used from any thread
unsafe impl Send for GlobalLock {}
// SAFETY: the mutex is process-shared and designed to be used from any thread
unsafe impl Sync for GlobalLock {}

impl GlobalLock {
    pub fn transient() -> Self {
        Self {
            mutex: Mutex::Local(parking_lot::RawMutex::INIT),
            held: AtomicBool::new(false),
        }
    }

    /// Initializes attributes and mutex in place.
    ///
    /// # Safety
    /// Both pointers must be writable, suitably aligned and must not be in
    /// use by any other process yet.
    pub unsafe fn init(
        attr: NonNull<libc::pthread_mutexattr_t>,
        mutex: NonNull<libc::pthread_mutex_t>,
    ) -> Result<Self, HeapError> {
        let attr = attr.as_ptr();
        unsafe {
            check("pthread_mutexattr_init", libc::pthread_mutexattr_init(attr))?;
            check(
                "pthread_mutexattr_setpshared",
                libc::pthread_mutexattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED),
            )?;
            check(
                "pthread_mutexattr_setrobust",
                libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST),
            )?;
            check("pthread_mutex_init", libc::pthread_mutex_init(mutex.as_ptr(), attr))?;
        }
        log::debug!("initialized robust process-shared lock at {:p}", mutex);

        Ok(Self::attach(mutex))
    }

    /// Uses a mutex some process already initialized.
    pub fn attach(mutex: NonNull<libc::pthread_mutex_t>) -> Self {
        Self {
            mutex: Mutex::Shared(mutex),
            held: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> Result<(), HeapError> {
        let mutex = match &self.mutex {
            Mutex::Shared(mutex) => *mutex,
            Mutex::Local(raw) => {
                raw.lock();
                self.held.store(true, Ordering::Relaxed);
                return Ok(());
            }
        };

        // SAFETY: the mutex lives in the mapping, which outlives `self`
        let code = unsafe { libc::pthread_mutex_lock(mutex.as_ptr()) };
        match code {
            0 => {}
            libc::EOWNERDEAD => {
                log::warn!("previous holder of the global lock died, marking it consistent");
                // SAFETY: we own the mutex after EOWNERDEAD
                let code = unsafe { libc::pthread_mutex_consistent(mutex.as_ptr()) };
                check("pthread_mutex_consistent", code)?;
            }
            code => return Err(HeapError::LockFailed { op: "pthread_mutex_lock", code }),
        }

        self.held.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub fn unlock(&self) -> Result<(), HeapError> {
        self.held.store(false, Ordering::Relaxed);
        let mutex = match &self.mutex {
            Mutex::Shared(mutex) => *mutex,
            Mutex::Local(raw) => {
                // SAFETY: only called by the guard that locked it
                unsafe { raw.unlock() };
                return Ok(());
            }
        };

        // SAFETY: the mutex lives in the mapping, which outlives `self`
        let code = unsafe { libc::pthread_mutex_unlock(mutex.as_ptr()) };
        check("pthread_mutex_unlock", code)
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    pub fn assert_held(&self) -> Result<(), HeapError> {
        if self.is_held() {
            Ok(())
        } else {
            Err(HeapError::UnsafeOperation)
        }
    }
}

impl fmt::Debug for GlobalLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("GlobalLock");
        match &self.mutex {
            Mutex::Local(_) => out.field("mutex", &"local"),
            Mutex::Shared(mutex) => out.field("mutex", mutex),
        };
        out.field("held", &self.is_held()).finish()
    }
}

fn check(op: &'static str, code: i32) -> Result<(), HeapError> {
    match code {
        0 => Ok(()),
        code => Err(HeapError::LockFailed { op, code }),
    }
}
