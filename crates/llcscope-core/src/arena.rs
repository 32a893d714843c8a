//! The candidate arena: one big page-aligned mapping that every candidate
//! pool, view and eviction set points into.
//!
//! The arena hands out index-typed [`LineHandle`]s instead of raw pointers;
//! a handle names a page, and a view or set pairs handles with one in-page
//! offset. Shifting a view to another cache-line offset is therefore a
//! zero-copy projection: same arena, same handles, different offset. The
//! mapping is released when the last `Arc<Arena>` drops.

use std::sync::Arc;

use crate::cache::{PAGE_SIZE, PAGE_SHIFT};
use crate::error::ResourceError;

/// One page of the arena. Copy-sized so views can reorder freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineHandle(pub(crate) u32);

impl LineHandle {
    pub fn page(self) -> u32 {
        self.0
    }
}

/// Page-aligned anonymous shared mapping of `n_pages` 4 KiB pages.
pub struct Arena {
    base: *mut u8,
    n_pages: u64,
}

// SAFETY: the arena is plain memory; all mutation after creation happens
// through volatile cache-line reads/writes that carry no aliasing
// requirements. Handles are indices, so concurrent readers never see a
// dangling pointer while they hold the Arc.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Map and zero-fill `n_pages`, splitting the fill across
    /// `memset_threads` workers (single-threaded when < 2).
    pub fn new(n_pages: u64, memset_threads: u32) -> Result<Arc<Self>, ResourceError> {
        let bytes = n_pages * PAGE_SIZE as u64;
        // SAFETY: anonymous shared mapping, no fd; checked against MAP_FAILED.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ResourceError::Mmap {
                bytes,
                source: std::io::Error::last_os_error(),
            });
        }
        debug_assert_eq!(base as usize & (PAGE_SIZE - 1), 0);

        let arena = Arc::new(Self {
            base: base as *mut u8,
            n_pages,
        });
        arena.zero_fill(memset_threads);
        Ok(arena)
    }

    fn zero_fill(&self, threads: u32) {
        let total = (self.n_pages * PAGE_SIZE as u64) as usize;
        if threads < 2 {
            // SAFETY: the freshly mapped region is ours and `total` bytes long.
            unsafe { std::ptr::write_bytes(self.base, 0, total) };
            return;
        }

        let threads = threads as usize;
        let chunk = total / threads;
        let remainder = total % threads;
        let base_addr = self.base as usize;

        std::thread::scope(|s| {
            let mut start = 0usize;
            for i in 0..threads {
                let len = chunk + if i < remainder { 1 } else { 0 };
                let begin = base_addr + start;
                s.spawn(move || {
                    // SAFETY: disjoint [begin, begin+len) chunks of the mapping.
                    unsafe { std::ptr::write_bytes(begin as *mut u8, 0, len) };
                });
                start += len;
            }
        });
    }

    pub fn n_pages(&self) -> u64 {
        self.n_pages
    }

    /// Resolve a handle + in-page offset to the line address.
    #[inline(always)]
    pub fn line_ptr(&self, h: LineHandle, offset: u32) -> *const u8 {
        debug_assert!((h.0 as u64) < self.n_pages);
        debug_assert!((offset as usize) < PAGE_SIZE);
        // SAFETY: handle and offset are bounds-checked above; the mapping is
        // live as long as self is.
        unsafe {
            self.base
                .add(((h.0 as usize) << PAGE_SHIFT) + offset as usize) as *const u8
        }
    }

    /// Inverse of `line_ptr`, discarding the in-page offset.
    #[inline]
    pub fn handle_of(&self, ptr: *const u8) -> LineHandle {
        let delta = ptr as usize - self.base as usize;
        LineHandle((delta >> PAGE_SHIFT) as u32)
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        let p = ptr as usize;
        let b = self.base as usize;
        p >= b && p < b + (self.n_pages as usize) * PAGE_SIZE
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: base/n_pages describe exactly the region mapped in new().
        unsafe {
            libc::munmap(self.base as *mut _, (self.n_pages as usize) * PAGE_SIZE);
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("n_pages", &self.n_pages)
            .finish()
    }
}

/// A reorderable sequence of lines inside one arena, all at the same page
/// offset. Owned by whichever builder is currently pruning it.
#[derive(Clone, Debug)]
pub struct CandidateView {
    arena: Arc<Arena>,
    offset: u32,
    pub(crate) lines: Vec<LineHandle>,
}

impl CandidateView {
    /// View over every page of the arena at the given in-page offset, in
    /// page order. Each line gets a distinct first byte written so the pages
    /// are backed before any timing runs.
    pub fn full(arena: &Arc<Arena>, offset: u32) -> Self {
        let lines: Vec<LineHandle> = (0..arena.n_pages() as u32).map(LineHandle).collect();
        for &h in &lines {
            // SAFETY: handle comes straight from the arena's page range.
            unsafe {
                std::ptr::write_volatile(arena.line_ptr(h, offset) as *mut u8, h.0 as u8);
            }
        }
        Self {
            arena: Arc::clone(arena),
            offset,
            lines,
        }
    }

    /// Same arena and handles at a different in-page offset.
    pub fn shift(&self, offset: u32) -> Self {
        Self {
            arena: Arc::clone(&self.arena),
            offset,
            lines: self.lines.clone(),
        }
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Resolve to raw line addresses, in current order.
    pub fn resolve(&self) -> Vec<*const u8> {
        self.lines
            .iter()
            .map(|&h| self.arena.line_ptr(h, self.offset))
            .collect()
    }

    /// Replace the line order/content from a pruned pointer array. Every
    /// pointer must have come out of `resolve()` on the same arena.
    pub(crate) fn adopt(&mut self, ptrs: &[*const u8]) {
        debug_assert!(ptrs.iter().all(|&p| self.arena.contains(p)));
        self.lines = ptrs.iter().map(|&p| self.arena.handle_of(p)).collect();
    }

}

/// Arena sizing rule: enough pages that each (hidden set bits × slice)
/// combination expects `ways · cand_scale` lines at any page offset.
pub fn arena_pages(uncertainty: u64, ways: u32, cand_scale: u32) -> u64 {
    uncertainty * ways as u64 * cand_scale as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_maps_and_resolves() {
        let arena = Arena::new(8, 1).unwrap();
        assert_eq!(arena.n_pages(), 8);
        let p0 = arena.line_ptr(LineHandle(0), 0);
        let p3 = arena.line_ptr(LineHandle(3), 128);
        assert_eq!(p3 as usize - p0 as usize, 3 * PAGE_SIZE + 128);
        assert_eq!(arena.handle_of(p3), LineHandle(3));
        assert!(arena.contains(p3));
        assert!(!arena.contains(std::ptr::null()));
    }

    #[test]
    fn parallel_zero_fill_covers_region() {
        let arena = Arena::new(16, 4).unwrap();
        for page in 0..16u32 {
            let p = arena.line_ptr(LineHandle(page), PAGE_SIZE as u32 - 1);
            // SAFETY: in-bounds resolved pointer.
            assert_eq!(unsafe { std::ptr::read_volatile(p) }, 0);
        }
    }

    #[test]
    fn view_projects_page_stride() {
        let arena = Arena::new(4, 1).unwrap();
        let view = CandidateView::full(&arena, 192);
        assert_eq!(view.len(), 4);
        let ptrs = view.resolve();
        for (i, w) in ptrs.windows(2).enumerate() {
            assert_eq!(
                w[1] as usize - w[0] as usize,
                PAGE_SIZE,
                "stride broken at {i}"
            );
        }
        assert_eq!(ptrs[0] as usize % PAGE_SIZE, 192);
    }

    #[test]
    fn shift_shares_arena_and_handles() {
        let arena = Arena::new(4, 1).unwrap();
        let v0 = CandidateView::full(&arena, 0);
        let strong_before = Arc::strong_count(&arena);
        let v1 = v0.shift(64);
        assert_eq!(Arc::strong_count(&arena), strong_before + 1);
        assert_eq!(v1.offset(), 64);
        assert_eq!(v1.len(), v0.len());
        // Same page, different line within it.
        assert_eq!(
            v1.resolve()[2] as usize - v0.resolve()[2] as usize,
            64
        );
    }

    #[test]
    fn refcount_returns_to_zero_on_last_drop() {
        let arena = Arena::new(2, 1).unwrap();
        let v0 = CandidateView::full(&arena, 0);
        let v1 = v0.shift(64);
        assert_eq!(Arc::strong_count(&arena), 3);
        drop(v0);
        drop(v1);
        assert_eq!(Arc::strong_count(&arena), 1);
        // dropping the last Arc unmaps; nothing left to observe beyond not crashing
        drop(arena);
    }

    #[test]
    fn adopt_roundtrips_through_pointers() {
        let arena = Arena::new(6, 1).unwrap();
        let mut view = CandidateView::full(&arena, 0);
        let mut ptrs = view.resolve();
        ptrs.swap(0, 5);
        ptrs.truncate(3);
        view.adopt(&ptrs);
        assert_eq!(view.len(), 3);
        assert_eq!(view.lines[0], LineHandle(5));
        assert_eq!(view.lines[1], LineHandle(1));
    }

    #[test]
    fn arena_pages_rule() {
        // SKX L3: 640 combinations, 11 ways, scale 3
        assert_eq!(arena_pages(640, 11, 3), 21120);
    }
}
