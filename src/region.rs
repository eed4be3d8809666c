use std::{
    ffi::CStr,
    fs::{self, File, OpenOptions},
    io::{self, Read},
    mem,
    os::unix::{
        ffi::OsStrExt,
        fs::{FileExt, OpenOptionsExt},
    },
    path::Path,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use crate::{
    config::HeapSettings,
    error::HeapError,
    kernel,
    lock::{GlobalLock, LOCK_ATTR_SIZE, LOCK_SIZE},
    state::{FREE_TABLE_SIZE, HEAP_STATE_SIZE, HeapState},
    utils::{HEAP_ALIGN, WORD, align, checked_align},
};

/// Format/version tag at offset 0 of every region.
pub(crate) const MAGIC: u64 = u64::from_le_bytes(*b"PHEAP\0\0\x01");

/// Fixed offsets of the region header. They are a compatibility contract:
/// a loaded region is never inspected to find them, they are recomputed
/// exactly as they were when the file was created.
///
/// ```text
/// +-----------------------+ 0
/// |        magic          |
/// +-----------------------+ BASE
/// |  recorded base addr   |
/// +-----------------------+ LOCK_ATTR
/// |  mutex attributes     |  widened to a word
/// +-----------------------+ LOCK
/// |       mutex           |
/// +-----------------------+ STATES
/// |    HeapState [0]      |
/// |    HeapState [1]      |
/// +-----------------------+ ROOT
/// |  current HeapState    |
/// +-----------------------+ GENSYM
/// |  identifier counter   |
/// +-----------------------+ CONSTS
/// |  constants table      |
/// +-----------------------+ PATH
/// |  path ... \0          |
/// +-----------------------+ align 16
/// |                       |
/// |   bump heap           |
/// |                       |
/// +-----------------------+ region size
/// ```
pub(crate) mod layout {
    use super::*;

    pub const MAGIC: usize = 0;
    pub const BASE: usize = MAGIC + mem::size_of::<u64>();
    pub const LOCK_ATTR: usize = BASE + WORD;
    pub const LOCK: usize = LOCK_ATTR + align(LOCK_ATTR_SIZE, WORD);
    pub const STATES: usize = LOCK + LOCK_SIZE;
    pub const ROOT: usize = STATES + 2 * HEAP_STATE_SIZE;
    pub const GENSYM: usize = ROOT + WORD;
    pub const CONSTS: usize = GENSYM + mem::size_of::<u64>();
    pub const PATH: usize = CONSTS + WORD;

    const _: () = assert!(LOCK % mem::align_of::<libc::pthread_mutex_t>() == 0);
    const _: () = assert!(STATES % mem::align_of::<HeapState>() == 0);
    const _: () = assert!(GENSYM % mem::align_of::<AtomicU64>() == 0);

    /// Offset of the first bump-allocated byte for a path of `path_len`
    /// bytes (without terminator).
    pub fn heap_start(path_len: usize) -> Option<usize> {
        checked_align(PATH.checked_add(path_len)?.checked_add(1)?, HEAP_ALIGN)
    }
}

/// A mapped region. Either freshly created or loaded from a file; in both
/// cases it sits at the address recorded in its own header, so pointers
/// stored inside stay valid without relocation.
///
/// Everything is reached through byte offsets from [`Region::base`] with
/// typed accessors; nothing outside this module does address arithmetic on
/// the header.
#[derive(Debug)]
pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Creates `path` and lays out a fresh region in it.
    ///
    /// The file is sparse: a single byte written at offset `region_size`
    /// gives it its length. Slot 0 becomes the current state and owns the
    /// whole bump range; the identifier counter starts at 1.
    pub fn create(path: &Path, settings: &HeapSettings) -> Result<(Self, GlobalLock), HeapError> {
        settings.validate()?;

        if path.exists() {
            return Err(HeapError::AlreadyExists(path.to_path_buf()));
        }

        let path_bytes = path.as_os_str().as_bytes();
        let needed = layout::PATH + path_bytes.len() + 1;
        let heap_start = layout::heap_start(path_bytes.len())
            .filter(|&start| start < settings.region_size)
            .ok_or(HeapError::Initialization {
                needed,
                available: settings.region_size,
            })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(|err| match err.kind() {
                io::ErrorKind::AlreadyExists => HeapError::AlreadyExists(path.to_path_buf()),
                _ => HeapError::Io(err),
            })?;

        let region = match Self::map_new(&file, settings) {
            Ok(region) => region,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(path);
                return Err(err);
            }
        };

        let base = region.base.addr().get();
        let slot0 = region.address(layout::STATES);

        // SAFETY: the mapping is ours alone and every offset lies inside it
        unsafe {
            region.at::<u64>(layout::MAGIC).write(MAGIC);
            region.at::<usize>(layout::BASE).write(base);

            let name = region.at::<u8>(layout::PATH).as_ptr();
            ptr::copy_nonoverlapping(path_bytes.as_ptr(), name, path_bytes.len());
            name.add(path_bytes.len()).write(0);

            region.at::<HeapState>(layout::STATES).write(HeapState {
                states: slot0,
                free_table: [0; FREE_TABLE_SIZE],
                context: 0,
                begin: base + heap_start,
                head: base + heap_start,
                end: base + region.len,
                file_name: region.address(layout::PATH),
                break_ptr: kernel::program_break(),
            });
        }

        region.root().store(slot0, Ordering::Release);
        region.gensym().store(1, Ordering::Relaxed);
        region.constants().store(0, Ordering::Relaxed);

        // SAFETY: attribute and mutex storage are inside the fresh mapping
        let lock = unsafe { GlobalLock::init(region.at(layout::LOCK_ATTR), region.at(layout::LOCK))? };

        log::info!(
            "created heap {} at {:#x} ({} bytes, heap starts at +{:#x})",
            path.display(),
            base,
            region.len,
            heap_start
        );

        Ok((region, lock))
    }

    fn map_new(file: &File, settings: &HeapSettings) -> Result<Self, HeapError> {
        file.write_all_at(&[0], settings.region_size as u64)?;

        let wanted = NonNull::new(settings.base_address as *mut u8)
            .ok_or(HeapError::InvalidSettings("base address must be > 0"))?;
        // SAFETY: MAP_FIXED_NOREPLACE refuses ranges that are already in use
        let base = unsafe { kernel::map_file_at(file, wanted, settings.region_size) }
            .map_err(HeapError::MapFailed)?;

        Ok(Self {
            base,
            len: settings.region_size,
        })
    }

    /// Maps an existing region file at the base address recorded in it.
    pub fn load(path: &Path) -> Result<(Self, GlobalLock), HeapError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| {
                log::debug!("open {} failed: {err}", path.display());
                HeapError::NotFound(path.to_path_buf())
            })?;

        let mut word = [0u8; 8];
        read_header_word(&mut file, &mut word, HeapError::BadMagic)?;
        if u64::from_ne_bytes(word) != MAGIC {
            return Err(HeapError::BadMagic);
        }

        let mut word = [0u8; WORD];
        read_header_word(&mut file, &mut word, HeapError::TruncatedHeader)?;
        let recorded = usize::from_ne_bytes(word);

        // The trailing byte only exists to give the sparse file its length.
        let file_len = file.metadata()?.len() as usize;
        if file_len <= layout::PATH + 1 {
            return Err(HeapError::TruncatedHeader);
        }
        let len = file_len - 1;

        let wanted = NonNull::new(recorded as *mut u8).ok_or(HeapError::TruncatedHeader)?;
        // SAFETY: MAP_FIXED_NOREPLACE refuses ranges that are already in use
        let base = unsafe { kernel::map_file_at(&file, wanted, len) }.map_err(HeapError::MapFailed)?;

        let region = Self { base, len };
        let lock = GlobalLock::attach(region.at(layout::LOCK));

        log::info!("loaded heap {} at {:#x} ({} bytes)", path.display(), recorded, len);

        Ok((region, lock))
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Absolute address of `offset`.
    #[inline]
    pub fn address(&self, offset: usize) -> usize {
        self.base.addr().get() + offset
    }

    /// Typed pointer to the header field at `offset`.
    #[inline]
    pub fn at<T>(&self, offset: usize) -> NonNull<T> {
        debug_assert!(offset + mem::size_of::<T>() <= self.len);
        debug_assert!(offset.is_multiple_of(mem::align_of::<T>()));
        // SAFETY: the offset is inside the mapping
        unsafe { self.base.add(offset).cast() }
    }

    /// The indirection cell naming the current [`HeapState`].
    pub fn root(&self) -> &AtomicUsize {
        // SAFETY: aligned, inside the mapping, lives as long as `self`
        unsafe { self.at::<AtomicUsize>(layout::ROOT).as_ref() }
    }

    pub fn gensym(&self) -> &AtomicU64 {
        // SAFETY: aligned, inside the mapping, lives as long as `self`
        unsafe { self.at::<AtomicU64>(layout::GENSYM).as_ref() }
    }

    pub fn constants(&self) -> &AtomicUsize {
        // SAFETY: aligned, inside the mapping, lives as long as `self`
        unsafe { self.at::<AtomicUsize>(layout::CONSTS).as_ref() }
    }

    /// Path recorded when the region was created.
    pub fn recorded_path(&self) -> &CStr {
        // SAFETY: create always terminates the path with NUL inside the header
        unsafe { CStr::from_ptr(self.at::<libc::c_char>(layout::PATH).as_ptr()) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        log::debug!("unmapping region at {:p}", self.base);
        // SAFETY: mapped by create/load and nothing borrows from us any more
        unsafe { kernel::unmap(self.base, self.len) };
    }
}

fn read_header_word(file: &mut File, buf: &mut [u8], short: HeapError) -> Result<(), HeapError> {
    match file.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(short),
        Err(err) => Err(HeapError::Io(err)),
    }
}
