use std::{marker::PhantomData, num::NonZeroUsize, ptr::NonNull};

/// Address of a free chunk inside the mapped region.
///
/// Chunks are handled by address instead of by reference: the only thing
/// we ever touch is the chunk's first word, which stores the address of the
/// next chunk of the same bucket. The bit pattern on disk is exactly a
/// native pointer (0 for the end of a chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Chunk(NonZeroUsize);

/// Possibly absent chunk, encoded as 0 in the region.
pub(crate) type Link = Option<Chunk>;

impl Chunk {
    #[inline]
    pub fn new(addr: usize) -> Link {
        NonZeroUsize::new(addr).map(Self)
    }

    #[inline]
    pub fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self(ptr.addr())
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.get()
    }

    #[inline]
    pub fn as_ptr(self) -> NonNull<u8> {
        // SAFETY: chunk addresses are never 0
        unsafe { NonNull::new_unchecked(self.addr() as *mut u8) }
    }

    /// Reads the link stored in the first word of the chunk.
    ///
    /// # Safety
    /// The chunk must be a word-aligned, readable free chunk.
    #[inline]
    unsafe fn next(self) -> Link {
        let word = unsafe { (self.addr() as *const usize).read() };
        Chunk::new(word)
    }

    /// # Safety
    /// The chunk must be a word-aligned, writable chunk that nobody else uses.
    #[inline]
    unsafe fn set_next(self, next: Link) {
        unsafe { (self.addr() as *mut usize).write(encode(next)) };
    }
}

#[inline]
fn encode(link: Link) -> usize {
    link.map_or(0, Chunk::addr)
}

/// Intrusive singly linked list threaded through free chunks. The list
/// itself is just the head word, which lives in a free-table bucket.
///
/// ```text
///  head word          chunk               chunk
/// +--------+       +--------+----+     +--------+----+
/// |   ---------->  |  next -------->   |   0    |    |
/// +--------+       +--------+----+     +--------+----+
/// ```
///
/// The chain never allocates: it only rewrites the first word of the
/// chunks pushed onto it.
pub(crate) struct Chain<'a> {
    head: &'a mut usize,
}

pub(crate) struct Iter<'a> {
    current: Link,
    marker: PhantomData<&'a usize>,
}

impl<'a> Chain<'a> {
    pub fn new(head: &'a mut usize) -> Self {
        Self { head }
    }

    #[inline]
    pub fn first(&self) -> Link {
        Chunk::new(*self.head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        *self.head == 0
    }

    /// Pushes `chunk` in front of the chain.
    ///
    /// # Safety
    /// `chunk` must be writable for a word and must not be in any chain.
    pub unsafe fn push(&mut self, chunk: Chunk) {
        unsafe { chunk.set_next(self.first()) };
        *self.head = chunk.addr();
    }

    /// Removes and returns the first chunk.
    ///
    /// # Safety
    /// Every chunk in the chain must be readable.
    pub unsafe fn pop(&mut self) -> Link {
        let chunk = self.first()?;
        *self.head = encode(unsafe { chunk.next() });
        Some(chunk)
    }

    /// # Safety
    /// Every chunk in the chain must stay readable while iterating.
    pub unsafe fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.first(),
            marker: PhantomData,
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.current?;
        // SAFETY: guaranteed by the contract of `Chain::iter`
        self.current = unsafe { chunk.next() };
        Some(chunk)
    }
}
