use std::{fs::File, io, ptr::NonNull};

/// Virtual memory page size of the computer. This is usually 4096.
/// Computed lazily since we don't know the value at compile time.
static PAGE_SIZE: std::sync::OnceLock<usize> = std::sync::OnceLock::new();

/// The platform-facing side of the heap. Here is where we issue the low
/// level memory requests: fixed-address file mappings and the program break.
pub(crate) struct Kernel;

/// This trait provides an abstraction over the syscalls the region mapper
/// needs. The heap, our top level view of this, has nothing to do with the
/// concrete APIs offered by each kernel.
trait PlatformMemory {
    /// Maps `len` bytes of `file` shared at exactly `addr`. Fails instead of
    /// replacing an existing mapping.
    unsafe fn map_file_at(file: &File, addr: NonNull<u8>, len: usize) -> io::Result<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn unmap(addr: NonNull<u8>, len: usize);

    /// Current end of the process data segment.
    fn program_break() -> usize;

    /// Returns the virtual memory page size of the computer in bytes.
    fn page_size() -> usize;
}

#[inline]
pub(crate) fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(Kernel::page_size)
}

/// Wrapper to use [`Kernel::map_file_at`]
///
/// # Safety
/// The range `addr..addr + len` must not be in use by anything the caller
/// still relies on.
#[inline]
pub(crate) unsafe fn map_file_at(file: &File, addr: NonNull<u8>, len: usize) -> io::Result<NonNull<u8>> {
    unsafe { Kernel::map_file_at(file, addr, len) }
}

/// Wrapper to use [`Kernel::unmap`]
///
/// # Safety
/// `addr` and `len` must describe a mapping created by [`map_file_at`] that
/// nothing references any more.
#[inline]
pub(crate) unsafe fn unmap(addr: NonNull<u8>, len: usize) {
    unsafe { Kernel::unmap(addr, len) }
}

/// Wrapper to use [`Kernel::program_break`]
#[inline]
pub(crate) fn program_break() -> usize {
    Kernel::program_break()
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use std::{fs::File, io, os::fd::AsRawFd, os::raw::{c_int, c_void}, ptr::NonNull};

    impl PlatformMemory for Kernel {
        unsafe fn map_file_at(file: &File, addr: NonNull<u8>, len: usize) -> io::Result<NonNull<u8>> {
            // Read-Write, visible to every process mapping the same file.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE;

            let wanted = addr.as_ptr() as *mut c_void;
            let mapped = unsafe { libc::mmap(wanted, len, PROT, FLAGS, file.as_raw_fd(), 0) };

            if mapped == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            // Kernels older than 4.17 treat MAP_FIXED_NOREPLACE as a hint.
            if mapped != wanted {
                unsafe { libc::munmap(mapped, len) };
                return Err(io::Error::from_raw_os_error(libc::EEXIST));
            }

            Ok(addr)
        }

        unsafe fn unmap(addr: NonNull<u8>, len: usize) {
            unsafe { libc::munmap(addr.as_ptr().cast(), len) };
        }

        fn program_break() -> usize {
            // SAFETY: sbrk(0) only queries the current break
            unsafe { libc::sbrk(0) as usize }
        }

        fn page_size() -> usize {
            // SAFETY: sysconf has no preconditions
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
    }
}
