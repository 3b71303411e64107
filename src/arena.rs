//! Typed memory arenas (component A).
//!
//! Five fixed lifetime domains — `REQUEST`, `RESPONSE`, `CACHE`, `STATIC`, `TASK` — each
//! backed by one of two interchangeable allocator strategies:
//!
//! - [`AllocatorBackend::General`]: every arena shares the process heap. `free` actually
//!   deallocates; `purge` is a no-op. This is the conforming fallback.
//! - [`AllocatorBackend::MultiArena`]: each arena owns an independent [`bumpalo::Bump`].
//!   `free` only updates bookkeeping (bump arenas cannot reclaim a single allocation);
//!   `purge` resets the whole arena at once, which is the bump allocator's actual free.
//!
//! Both backends satisfy the same invariant: any allocation handed out by arena X's
//! `alloc` must be freeable only via arena X's `free`. [`ArenaPtr`] carries its owning
//! [`ArenaId`] so that crossing arenas on `free`/`realloc` is a programming error caught
//! at the API boundary rather than silently corrupting bookkeeping.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bumpalo::Bump;
use thiserror::Error;

/// One of the five fixed allocation domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArenaId {
    Request,
    Response,
    Cache,
    Static,
    Task,
}

impl ArenaId {
    const ALL: [ArenaId; 5] = [
        ArenaId::Request,
        ArenaId::Response,
        ArenaId::Cache,
        ArenaId::Static,
        ArenaId::Task,
    ];

    fn index(self) -> usize {
        match self {
            ArenaId::Request => 0,
            ArenaId::Response => 1,
            ArenaId::Cache => 2,
            ArenaId::Static => 3,
            ArenaId::Task => 4,
        }
    }

    /// Whether this arena is purged automatically at the end of each request
    /// (`REQUEST`/`RESPONSE`) or persists across requests (`CACHE`/`STATIC`/`TASK`).
    pub fn is_per_request(self) -> bool {
        matches!(self, ArenaId::Request | ArenaId::Response)
    }
}

impl fmt::Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArenaId::Request => "REQUEST",
            ArenaId::Response => "RESPONSE",
            ArenaId::Cache => "CACHE",
            ArenaId::Static => "STATIC",
            ArenaId::Task => "TASK",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("allocation failed in arena {0}")]
    AllocationFailed(ArenaId),
    #[error("pointer belongs to arena {owner} but was freed via arena {requested}")]
    ArenaMismatch { owner: ArenaId, requested: ArenaId },
    #[error("requested size {0} exceeds layout limits")]
    InvalidLayout(usize),
}

/// A handle to a live allocation. Tags the arena it came from so a cross-arena
/// free/realloc is rejected instead of silently misattributing bookkeeping.
pub struct ArenaPtr {
    ptr: NonNull<u8>,
    len: usize,
    arena: ArenaId,
}

impl ArenaPtr {
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn arena(&self) -> ArenaId {
        self.arena
    }

    /// Borrow the allocation as a byte slice.
    ///
    /// # Safety
    /// The caller must ensure the allocation is still live (not freed/purged) and that
    /// no other mutable borrow of the same bytes is outstanding.
    #[inline]
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// Borrow the allocation as a mutable byte slice.
    ///
    /// # Safety
    /// Same requirements as [`ArenaPtr::as_slice`], plus exclusive access.
    #[inline]
    pub unsafe fn as_slice_mut(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

/// Point-in-time allocation counters for one arena.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArenaStats {
    /// Cumulative bytes ever allocated (not reduced by free/purge).
    pub allocated: u64,
    /// Bytes currently considered live (approximate under the multi-arena backend,
    /// since individual `free` cannot shrink a bump region — only `purge` can).
    pub active: u64,
    /// Bytes resident in the backing allocator (capacity under management).
    pub resident: u64,
    /// Outstanding `alloc - free` call count; used by testable property #6.
    pub allocation_count: u64,
    pub deallocation_count: u64,
}

struct Counters {
    allocated: AtomicU64,
    active: AtomicU64,
    resident: AtomicU64,
    allocation_count: AtomicU64,
    deallocation_count: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            allocated: AtomicU64::new(0),
            active: AtomicU64::new(0),
            resident: AtomicU64::new(0),
            allocation_count: AtomicU64::new(0),
            deallocation_count: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> ArenaStats {
        ArenaStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            resident: self.resident.load(Ordering::Relaxed),
            allocation_count: self.allocation_count.load(Ordering::Relaxed),
            deallocation_count: self.deallocation_count.load(Ordering::Relaxed),
        }
    }

    fn record_alloc(&self, size: u64) {
        self.allocated.fetch_add(size, Ordering::Relaxed);
        self.active.fetch_add(size, Ordering::Relaxed);
        self.resident.fetch_add(size, Ordering::Relaxed);
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_free(&self, size: u64) {
        self.active.fetch_sub(size, Ordering::Relaxed);
        self.deallocation_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_purge(&self) {
        self.active.store(0, Ordering::Relaxed);
        self.resident.store(0, Ordering::Relaxed);
    }
}

/// Backend selection. Fixed at server init (see [`crate::config::AllocatorBackend`]);
/// once an [`Arenas`] value is built it cannot switch backend.
enum Backend {
    General,
    MultiArena([Mutex<Bump>; 5]),
}

/// The process-wide set of five arenas. Lives for the process; built once at startup.
pub struct Arenas {
    backend: Backend,
    counters: [Counters; 5],
}

impl fmt::Debug for Arenas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arenas")
            .field(
                "backend",
                &match &self.backend {
                    Backend::General => "general",
                    Backend::MultiArena(_) => "multi-arena",
                },
            )
            .finish()
    }
}

impl Arenas {
    /// Build arenas backed by the shared process heap (conforming fallback).
    pub fn general() -> Self {
        Arenas {
            backend: Backend::General,
            counters: std::array::from_fn(|_| Counters::new()),
        }
    }

    /// Build arenas backed by five independent bump allocators.
    pub fn multi_arena() -> Self {
        Arenas {
            backend: Backend::MultiArena(std::array::from_fn(|_| Mutex::new(Bump::new()))),
            counters: std::array::from_fn(|_| Counters::new()),
        }
    }

    fn layout(size: usize) -> Result<Layout, ArenaError> {
        Layout::from_size_align(size.max(1), std::mem::align_of::<usize>())
            .map_err(|_| ArenaError::InvalidLayout(size))
    }

    /// Allocate `size` bytes from `arena`. Returns `None` (not an error) on allocator
    /// exhaustion, mirroring the C `malloc`-style `null` return the spec names.
    pub fn alloc(&self, arena: ArenaId, size: usize) -> Result<ArenaPtr, ArenaError> {
        let layout = Self::layout(size)?;
        let ptr = match &self.backend {
            Backend::General => unsafe {
                let raw = alloc::alloc(layout);
                NonNull::new(raw).ok_or(ArenaError::AllocationFailed(arena))?
            },
            Backend::MultiArena(bumps) => {
                let bump = bumps[arena.index()]
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                // Safety: `bump` outlives the returned pointer for the lifetime of this
                // `Arenas` value; individual allocations are only reclaimed in bulk by
                // `purge`, which requires `&self` and therefore cannot race a live borrow
                // created through the safe `as_slice`/`as_slice_mut` accessors.
                bump.alloc_layout(layout)
            }
        };
        self.counters[arena.index()].record_alloc(layout.size() as u64);
        Ok(ArenaPtr {
            ptr,
            len: size,
            arena,
        })
    }

    /// Grow or shrink an existing allocation in place or via a fresh allocation + copy.
    pub fn realloc(&self, mut ptr: ArenaPtr, new_size: usize) -> Result<ArenaPtr, ArenaError> {
        let arena = ptr.arena;
        match &self.backend {
            Backend::General => {
                let old_layout = Self::layout(ptr.len)?;
                let raw = unsafe { alloc::realloc(ptr.ptr.as_ptr(), old_layout, new_size.max(1)) };
                let new_ptr = NonNull::new(raw).ok_or(ArenaError::AllocationFailed(arena))?;
                let counters = &self.counters[arena.index()];
                if new_size > ptr.len {
                    counters.record_alloc((new_size - ptr.len) as u64);
                } else {
                    counters.record_free((ptr.len - new_size) as u64);
                }
                ptr.ptr = new_ptr;
                ptr.len = new_size;
                Ok(ptr)
            }
            Backend::MultiArena(_) => {
                // Bump arenas never shrink/grow in place: allocate fresh, copy, leave the
                // old region to be reclaimed wholesale on the next `purge`.
                let fresh = self.alloc(arena, new_size)?;
                let copy_len = ptr.len.min(new_size);
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr.ptr.as_ptr(), fresh.ptr.as_ptr(), copy_len);
                }
                Ok(fresh)
            }
        }
    }

    /// Free an allocation via its owning arena. Freeing through the wrong arena is a
    /// programming error and returns [`ArenaError::ArenaMismatch`] without freeing.
    pub fn free(&self, arena: ArenaId, ptr: ArenaPtr) -> Result<(), ArenaError> {
        if ptr.arena != arena {
            return Err(ArenaError::ArenaMismatch {
                owner: ptr.arena,
                requested: arena,
            });
        }
        match &self.backend {
            Backend::General => {
                let layout = Self::layout(ptr.len)?;
                unsafe { alloc::dealloc(ptr.ptr.as_ptr(), layout) };
            }
            Backend::MultiArena(_) => {
                // Individual allocations inside a bump region cannot be reclaimed; the
                // bytes are only reused after the next `purge`. We still count the free
                // so `allocation_count - deallocation_count` reaches zero once the
                // owning request purges the arena (testable property #6).
            }
        }
        self.counters[arena.index()].record_free(ptr.len as u64);
        Ok(())
    }

    /// Bulk-purge an arena. No-op under the general backend; resets the bump region
    /// under the multi-arena backend, reclaiming every allocation at once.
    pub fn purge(&self, arena: ArenaId) {
        match &self.backend {
            Backend::General => {}
            Backend::MultiArena(bumps) => {
                let mut bump = bumps[arena.index()]
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                bump.reset();
            }
        }
        self.counters[arena.index()].record_purge();
    }

    pub fn stats(&self, arena: ArenaId) -> ArenaStats {
        self.counters[arena.index()].snapshot()
    }

    /// Stats for all five arenas, in [`ArenaId`] declaration order.
    pub fn all_stats(&self) -> [(ArenaId, ArenaStats); 5] {
        std::array::from_fn(|i| (ArenaId::ALL[i], self.counters[i].snapshot()))
    }
}

/// Allocator for objects that cross into the scripting bridge collaborator (§4.A). This
/// bypasses the arenas entirely — the bridge's own GC may retain or move these objects,
/// which the arena bookkeeping above does not tolerate.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeAllocator;

impl BridgeAllocator {
    /// Allocate directly from the process heap, outside arena bookkeeping.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1), std::mem::align_of::<usize>()).ok()?;
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    /// Free a [`BridgeAllocator::alloc`]'d pointer.
    ///
    /// # Safety
    /// `ptr`/`size` must match a prior `alloc` call exactly.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        if let Ok(layout) = Layout::from_size_align(size.max(1), std::mem::align_of::<usize>()) {
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}
