//! Backing-page pool for guest physical memory.
//!
//! Guest physical memory is a fixed-capacity table of independently locked
//! 4 KiB slots indexed by page number. Pages are installed when the configured
//! guest physical size grows past their offset and released when it shrinks
//! below it, so the pool never reserves more host memory than the guest is
//! currently configured to use.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Mutex;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Upper bound on guest physical memory: 1 Mi pages = 4 GiB.
pub const MAX_GUEST_PAGES: usize = 1 << 20;

type PageBox = Box<[u8; PAGE_SIZE]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The requested range ends past the configured guest physical size.
    OutOfRange { addr: u64, limit: u64 },
    /// The covering slot holds no backing page.
    Unbacked { page: usize },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::OutOfRange { addr, limit } => write!(
                f,
                "guest physical access out of range: addr=0x{addr:x} limit=0x{limit:x}"
            ),
            PoolError::Unbacked { page } => {
                write!(f, "guest physical page {page} has no backing page")
            }
        }
    }
}

impl std::error::Error for PoolError {}

pub type PoolResult<T> = Result<T, PoolError>;

/// Fixed-capacity table of lockable backing pages.
///
/// The pool itself carries no notion of a configured size; callers pass the
/// current limit to the read paths and drive [`PagePool::resize`] from their
/// own size bookkeeping. Slot locks are short-held and never taken while
/// another slot's lock is held.
pub struct PagePool {
    slots: Vec<Mutex<Option<PageBox>>>,
}

impl PagePool {
    pub fn new() -> Self {
        Self::with_capacity(MAX_GUEST_PAGES)
    }

    pub fn with_capacity(pages: usize) -> Self {
        let mut slots = Vec::with_capacity(pages);
        slots.resize_with(pages, || Mutex::new(None));
        Self { slots }
    }

    #[inline]
    pub fn capacity_pages(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn capacity_bytes(&self) -> u64 {
        (self.slots.len() as u64) << PAGE_SHIFT
    }

    /// Grow or shrink the backed range from `old_size` to `new_size` bytes.
    ///
    /// Growth allocates zeroed pages one at a time and installs each under its
    /// slot lock; it stops at the first allocation failure and returns the
    /// size actually reached, which callers must compare against the request.
    /// Shrinking frees pages under the slot lock and always returns
    /// `new_size`. Sizes are page-aligned by contract.
    pub fn resize(&self, old_size: u64, new_size: u64) -> u64 {
        debug_assert_eq!(old_size & (PAGE_SIZE as u64 - 1), 0);
        debug_assert_eq!(new_size & (PAGE_SIZE as u64 - 1), 0);
        debug_assert!(new_size <= self.capacity_bytes());

        if old_size == new_size {
            return new_size;
        }

        if new_size < old_size {
            let mut s = new_size;
            while s < old_size {
                let index = (s >> PAGE_SHIFT) as usize;
                // Take the page out under the lock; drop it outside.
                let page = self.slots[index].lock().unwrap().take();
                drop(page);
                s += PAGE_SIZE as u64;
            }
            return new_size;
        }

        let mut achieved = old_size;
        let mut s = old_size;
        while s < new_size {
            let index = (s >> PAGE_SHIFT) as usize;
            if index >= self.slots.len() {
                break;
            }
            let Some(page) = alloc_zeroed_page() else {
                break;
            };
            *self.slots[index].lock().unwrap() = Some(page);
            s += PAGE_SIZE as u64;
            achieved = s;
        }
        achieved
    }

    /// Read the 4-byte little-endian word at guest physical `addr`.
    ///
    /// `limit` is the owning context's configured physical size; the read
    /// fails when it would end past the limit or when a covering slot holds no
    /// page. Reads that straddle a page boundary are split across both slots.
    pub fn read_word(&self, limit: u64, addr: u32) -> PoolResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(limit, addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read `dst.len()` bytes starting at guest physical `addr`, honoring
    /// `limit` as in [`PagePool::read_word`].
    pub fn read_into(&self, limit: u64, addr: u32, dst: &mut [u8]) -> PoolResult<()> {
        let end = u64::from(addr) + dst.len() as u64;
        if end > limit {
            return Err(PoolError::OutOfRange {
                addr: u64::from(addr),
                limit,
            });
        }

        let mut cur = addr as usize;
        let mut remaining = dst;
        while !remaining.is_empty() {
            let page = cur >> PAGE_SHIFT;
            let off = cur & (PAGE_SIZE - 1);
            let take = (PAGE_SIZE - off).min(remaining.len());

            // The caller's limit is not trusted to fit the pool.
            let slot = self.slots.get(page).ok_or(PoolError::Unbacked { page })?;
            let guard = slot.lock().unwrap();
            let Some(backing) = guard.as_ref() else {
                return Err(PoolError::Unbacked { page });
            };
            remaining[..take].copy_from_slice(&backing[off..off + take]);
            drop(guard);

            cur += take;
            remaining = &mut remaining[take..];
        }
        Ok(())
    }

    /// Whether the slot for `page` currently holds an owned backing page.
    pub fn page_is_backed(&self, page: usize) -> bool {
        self.slots
            .get(page)
            .is_some_and(|slot| slot.lock().unwrap().is_some())
    }

    /// Run `f` against the backing page for `page` under its slot lock.
    pub fn with_page<R>(&self, page: usize, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> PoolResult<R> {
        let slot = self.slots.get(page).ok_or(PoolError::Unbacked { page })?;
        let mut guard = slot.lock().unwrap();
        match guard.as_mut() {
            Some(backing) => Ok(f(backing)),
            None => Err(PoolError::Unbacked { page }),
        }
    }
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePool")
            .field("capacity_pages", &self.slots.len())
            .finish_non_exhaustive()
    }
}

fn alloc_zeroed_page() -> Option<PageBox> {
    let mut bytes = Vec::new();
    bytes.try_reserve_exact(PAGE_SIZE).ok()?;
    bytes.resize(PAGE_SIZE, 0u8);
    let boxed: Box<[u8]> = bytes.into_boxed_slice();
    boxed.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = PAGE_SIZE as u64;

    #[test]
    fn resize_is_idempotent() {
        let pool = PagePool::with_capacity(8);

        assert_eq!(pool.resize(0, 4 * PAGE), 4 * PAGE);
        assert_eq!(pool.resize(4 * PAGE, 4 * PAGE), 4 * PAGE);
        for page in 0..4 {
            assert!(pool.page_is_backed(page));
        }
        for page in 4..8 {
            assert!(!pool.page_is_backed(page));
        }

        assert_eq!(pool.resize(4 * PAGE, 0), 0);
        assert_eq!(pool.resize(0, 0), 0);
        for page in 0..8 {
            assert!(!pool.page_is_backed(page));
        }
    }

    #[test]
    fn grown_pages_are_zeroed() {
        let pool = PagePool::with_capacity(2);
        pool.resize(0, PAGE);
        pool.with_page(0, |p| p[100] = 0xAB).unwrap();

        // Shrink then regrow: the slot must come back zeroed.
        pool.resize(PAGE, 0);
        pool.resize(0, PAGE);
        assert_eq!(pool.read_word(PAGE, 100).unwrap(), 0);
    }

    #[test]
    fn read_word_round_trip() {
        let pool = PagePool::with_capacity(4);
        let size = pool.resize(0, 2 * PAGE);
        assert_eq!(size, 2 * PAGE);

        pool.with_page(1, |p| p[8..12].copy_from_slice(&0xCAFE_BABEu32.to_le_bytes()))
            .unwrap();
        assert_eq!(pool.read_word(size, PAGE_SIZE as u32 + 8).unwrap(), 0xCAFE_BABE);
    }

    #[test]
    fn read_word_enforces_limit() {
        let pool = PagePool::with_capacity(4);
        let size = pool.resize(0, PAGE);

        assert_eq!(
            pool.read_word(size, PAGE_SIZE as u32 - 2),
            Err(PoolError::OutOfRange {
                addr: PAGE - 2,
                limit: PAGE,
            })
        );
        // A stricter caller-supplied limit wins over what is actually backed.
        assert_eq!(
            pool.read_word(16, 16),
            Err(PoolError::OutOfRange { addr: 16, limit: 16 })
        );
    }

    #[test]
    fn read_word_reports_unbacked_slot() {
        let pool = PagePool::with_capacity(4);
        pool.resize(0, 2 * PAGE);
        pool.resize(2 * PAGE, PAGE);

        // Lie about the limit: the slot itself must be reported missing.
        assert_eq!(
            pool.read_word(2 * PAGE, PAGE_SIZE as u32),
            Err(PoolError::Unbacked { page: 1 })
        );
    }

    #[test]
    fn read_word_splits_across_page_boundary() {
        let pool = PagePool::with_capacity(4);
        let size = pool.resize(0, 2 * PAGE);

        pool.with_page(0, |p| {
            p[PAGE_SIZE - 2] = 0x11;
            p[PAGE_SIZE - 1] = 0x22;
        })
        .unwrap();
        pool.with_page(1, |p| {
            p[0] = 0x33;
            p[1] = 0x44;
        })
        .unwrap();

        assert_eq!(
            pool.read_word(size, PAGE_SIZE as u32 - 2).unwrap(),
            0x4433_2211
        );
    }

    #[test]
    fn read_word_rejects_pages_past_capacity() {
        let pool = PagePool::with_capacity(2);
        pool.resize(0, 2 * PAGE);

        // A limit beyond the pool's capacity must fail cleanly, not index
        // past the slot table.
        assert_eq!(
            pool.read_word(4 * PAGE, 2 * PAGE_SIZE as u32),
            Err(PoolError::Unbacked { page: 2 })
        );
    }

    #[test]
    fn with_page_rejects_missing_pages() {
        let pool = PagePool::with_capacity(2);
        assert_eq!(pool.with_page(0, |_| ()), Err(PoolError::Unbacked { page: 0 }));
        assert_eq!(pool.with_page(9, |_| ()), Err(PoolError::Unbacked { page: 9 }));
    }
}
