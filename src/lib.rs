#![allow(clippy::missing_safety_doc)]

//! stratum: a three-tier thread-caching allocator for small-to-medium objects.
//!
//! Allocation flows through three layers, cheapest first:
//! - [`ThreadCache`]: per-thread free lists, zero synchronization
//! - [`CentralCache`]: shared per-size-class lists, one spinlock per class
//! - [`PageCache`]: span manager over anonymous OS pages
//!
//! Free blocks carry no metadata; the next-pointer of a free list is threaded
//! through the block's own first word, so [`deallocate`] needs the original
//! request size back from the caller. Requests above [`MAX_BYTES`] bypass all
//! three layers and map pages directly.
//!
//! A standalone single-size pool built on the same carving discipline lives
//! in [`fixed_pool`].

use core::{
  ptr::null_mut,
  sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering},
};
use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Instant;

use parking_lot::Mutex;

pub mod fixed_pool;

pub use fixed_pool::{FixedPool, HashBucket, delete_element, new_element};

// =============================================================================
// Constants
// =============================================================================

/// Every pointer handed out is aligned to this.
pub const ALIGNMENT: usize = 8;

/// OS page size assumed by the span layer.
pub const PAGE_SIZE: usize = 4096;

/// Largest request served by the caches; anything bigger maps pages directly.
pub const MAX_BYTES: usize = 256 * 1024;

/// One size class per ALIGNMENT step: class `i` serves `(i + 1) * ALIGNMENT`.
pub const FREE_LIST_SIZE: usize = MAX_BYTES / ALIGNMENT;

/// Pages fetched per refill for classes that fit inside one such span.
const SPAN_PAGES: usize = 8;

/// Upper bound on bytes moved per ThreadCache refill.
const BATCH_CAP_BYTES: usize = 4096;

/// Per-class block count that triggers a spill back to CentralCache.
const THREAD_RETURN_THRESHOLD: usize = 64;

/// Spans tracked for reclamation. Spans past the cap still serve blocks,
/// they are just never handed back to the page layer.
const MAX_SPAN_TRACKERS: usize = 1024;

/// Returns into a class before its reclaim scan runs.
const MAX_DELAY_COUNT: usize = 48;

/// Wall-clock alternative to the return-count gate.
const DELAY_INTERVAL_MS: u64 = 1000;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(ALIGNMENT >= size_of::<*mut u8>());
const _: () = assert!(PAGE_SIZE % ALIGNMENT == 0);
const _: () = assert!(MAX_BYTES % ALIGNMENT == 0);
const _: () = assert!(FREE_LIST_SIZE == 32_768);
const _: () = assert!(BATCH_CAP_BYTES <= SPAN_PAGES * PAGE_SIZE);
const _: () = assert!(MAX_SPAN_TRACKERS >= 1);

// =============================================================================
// Size Classes
// =============================================================================

/// Round a request up to the next ALIGNMENT multiple.
#[inline(always)]
const fn round_up(bytes: usize) -> usize {
  (bytes + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Free-list index for a request. Sub-ALIGNMENT requests land in class 0.
#[inline(always)]
const fn class_index(bytes: usize) -> usize {
  let bytes = if bytes < ALIGNMENT { ALIGNMENT } else { bytes };
  (bytes + ALIGNMENT - 1) / ALIGNMENT - 1
}

/// Block size served by a class (inverse of `class_index`).
#[inline(always)]
const fn class_size(index: usize) -> usize {
  (index + 1) * ALIGNMENT
}

/// Blocks moved per ThreadCache refill: small classes travel in big batches,
/// capped at BATCH_CAP_BYTES per transfer.
#[inline]
const fn batch_num(block_size: usize) -> usize {
  let base = if block_size <= 32 {
    64
  } else if block_size <= 64 {
    32
  } else if block_size <= 128 {
    16
  } else if block_size <= 256 {
    8
  } else if block_size <= 512 {
    4
  } else if block_size <= 1024 {
    2
  } else {
    1
  };

  let cap = BATCH_CAP_BYTES / block_size;
  let cap = if cap == 0 { 1 } else { cap };
  if base < cap { base } else { cap }
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_map(bytes: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      bytes,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_unmap(ptr: *mut u8, bytes: usize) {
  unsafe { libc::munmap(ptr.cast(), bytes) };
}

// =============================================================================
// Free-list links
// =============================================================================

/// Read the embedded next pointer from a free block's first word.
#[inline(always)]
unsafe fn next_block(block: *mut u8) -> *mut u8 {
  unsafe { *(block as *mut *mut u8) }
}

#[inline(always)]
unsafe fn set_next_block(block: *mut u8, next: *mut u8) {
  unsafe { *(block as *mut *mut u8) = next };
}

// =============================================================================
// SpinLock
// =============================================================================

/// Test-and-set lock with a yield on every failed attempt. Critical sections
/// are a bounded pointer walk, so a full mutex is not worth the hand-off.
struct SpinLock {
  locked: AtomicBool,
}

struct SpinGuard<'a> {
  lock: &'a SpinLock,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) -> SpinGuard<'_> {
    while self.locked.swap(true, Ordering::Acquire) {
      std::thread::yield_now();
    }
    SpinGuard { lock: self }
  }
}

impl Drop for SpinGuard<'_> {
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}

// =============================================================================
// PageCache
// =============================================================================

/// A contiguous run of pages. Ownership lives in `span_map`; `free` says
/// whether the run is currently sitting in `free_spans`.
#[derive(Clone, Copy)]
struct Span {
  num_pages: usize,
  free: bool,
}

struct PageInner {
  /// Page count -> stack of free-span start addresses of exactly that size.
  free_spans: BTreeMap<usize, Vec<usize>>,
  /// Span start address -> descriptor, for free and loaned-out spans both.
  span_map: BTreeMap<usize, Span>,
}

/// Owns all page-granularity memory and hands out contiguous spans by page
/// count. Mapped regions are never returned to the OS; a freed span waits in
/// the pool for reuse.
pub struct PageCache {
  inner: Mutex<PageInner>,
}

impl PageCache {
  pub const fn new() -> Self {
    Self {
      inner: Mutex::new(PageInner {
        free_spans: BTreeMap::new(),
        span_map: BTreeMap::new(),
      }),
    }
  }

  /// Hand out a span of exactly `num_pages` pages, splitting a larger free
  /// span or mapping fresh pages. Null when the OS refuses memory.
  pub fn allocate_span(&self, num_pages: usize) -> *mut u8 {
    if num_pages == 0 {
      return null_mut();
    }

    let mut inner = self.inner.lock();

    // Smallest free span with at least num_pages.
    let found = inner.free_spans.range(num_pages..).next().map(|(&k, _)| k);
    let detached = found.and_then(|k| {
      let list = inner.free_spans.get_mut(&k)?;
      let addr = list.pop()?;
      if list.is_empty() {
        inner.free_spans.remove(&k);
      }
      Some((addr, k))
    });

    if let Some((addr, have_pages)) = detached {
      if have_pages > num_pages {
        // Split: the tail pages go straight back into the pool.
        let tail_addr = addr + num_pages * PAGE_SIZE;
        let tail_pages = have_pages - num_pages;
        inner.span_map.insert(
          tail_addr,
          Span {
            num_pages: tail_pages,
            free: true,
          },
        );
        inner
          .free_spans
          .entry(tail_pages)
          .or_default()
          .push(tail_addr);
      }
      inner.span_map.insert(
        addr,
        Span {
          num_pages,
          free: false,
        },
      );
      return addr as *mut u8;
    }

    // Nothing suitable cached; map fresh pages.
    let ptr = unsafe { os_map(num_pages * PAGE_SIZE) };
    if ptr.is_null() {
      return null_mut();
    }
    inner.span_map.insert(
      ptr as usize,
      Span {
        num_pages,
        free: false,
      },
    );
    ptr
  }

  /// Return a span to the pool. Addresses this cache never handed out are
  /// ignored, as are spans already back in the pool. The immediately
  /// following span is absorbed when it is free.
  pub fn deallocate_span(&self, addr: *mut u8, num_pages: usize) {
    let addr = addr as usize;
    let mut inner = self.inner.lock();

    let Some(span) = inner.span_map.get(&addr).copied() else {
      return;
    };
    if span.free {
      return;
    }
    debug_assert_eq!(span.num_pages, num_pages);
    let mut pages = span.num_pages;

    // Forward coalesce: absorb the next-door span if it is in the pool.
    let next_addr = addr + pages * PAGE_SIZE;
    if let Some(next) = inner.span_map.get(&next_addr).copied()
      && next.free
      && detach_free_span(&mut inner.free_spans, next_addr, next.num_pages)
    {
      inner.span_map.remove(&next_addr);
      pages += next.num_pages;
    }

    inner.span_map.insert(
      addr,
      Span {
        num_pages: pages,
        free: true,
      },
    );
    inner.free_spans.entry(pages).or_default().push(addr);
  }
}

impl Default for PageCache {
  fn default() -> Self {
    Self::new()
  }
}

/// Splice one span out of the free pool. False when it is not there.
fn detach_free_span(
  free_spans: &mut BTreeMap<usize, Vec<usize>>,
  addr: usize,
  num_pages: usize,
) -> bool {
  let Some(list) = free_spans.get_mut(&num_pages) else {
    return false;
  };
  let Some(pos) = list.iter().position(|&a| a == addr) else {
    return false;
  };
  list.swap_remove(pos);
  if list.is_empty() {
    free_spans.remove(&num_pages);
  }
  true
}

// =============================================================================
// CentralCache
// =============================================================================

/// Slot marker while a tracker's fields are being written.
const TRACKER_CLAIMED: usize = usize::MAX;

/// Reclamation bookkeeping for one span carved into class blocks. A zero
/// `span_addr` marks a free slot; `free_count` counts the span's blocks
/// currently sitting on the class list.
struct SpanTracker {
  span_addr: AtomicUsize,
  num_pages: AtomicUsize,
  total_blocks: AtomicUsize,
  free_count: AtomicUsize,
  class: AtomicUsize,
}

impl SpanTracker {
  fn new() -> Self {
    Self {
      span_addr: AtomicUsize::new(0),
      num_pages: AtomicUsize::new(0),
      total_blocks: AtomicUsize::new(0),
      free_count: AtomicUsize::new(0),
      class: AtomicUsize::new(0),
    }
  }
}

/// Per-class delayed-return state: the reclaim scan runs only after enough
/// returns or enough wall-clock time, never on every return.
struct DelayState {
  return_count: AtomicUsize,
  last_return_ms: AtomicU64,
}

impl DelayState {
  fn new() -> Self {
    Self {
      return_count: AtomicUsize::new(0),
      last_return_ms: AtomicU64::new(0),
    }
  }
}

/// Shared middle layer: one free list and one spinlock per size class, so
/// threads working different sizes never contend. Refills come from a
/// [`PageCache`] span carved into equal blocks; fully-free spans drift back
/// down under a delayed-return policy.
pub struct CentralCache {
  free_lists: Box<[AtomicPtr<u8>]>,
  locks: Box<[SpinLock]>,
  trackers: Box<[SpanTracker]>,
  delays: Box<[DelayState]>,
  epoch: Instant,
}

impl CentralCache {
  pub fn new() -> Self {
    Self {
      free_lists: (0..FREE_LIST_SIZE)
        .map(|_| AtomicPtr::new(null_mut()))
        .collect(),
      locks: (0..FREE_LIST_SIZE).map(|_| SpinLock::new()).collect(),
      trackers: (0..MAX_SPAN_TRACKERS).map(|_| SpanTracker::new()).collect(),
      delays: (0..FREE_LIST_SIZE).map(|_| DelayState::new()).collect(),
      epoch: Instant::now(),
    }
  }

  /// Detach up to `batch_num` blocks of class `index` as a null-terminated
  /// chain, refilling from `pages` when the class list is empty. The chain
  /// may run shorter than asked. Null on a bad argument or OS exhaustion.
  pub fn fetch_range(&self, pages: &PageCache, index: usize, batch_num: usize) -> *mut u8 {
    if index >= FREE_LIST_SIZE || batch_num == 0 {
      return null_mut();
    }

    let _guard = self.locks[index].lock();

    let head = self.free_lists[index].load(Ordering::Relaxed);
    if head.is_null() {
      return self.refill(pages, index, batch_num);
    }

    // Walk off up to batch_num blocks and cut the chain there.
    self.tracker_borrowed(head);
    let mut tail = head;
    let mut taken = 1;
    unsafe {
      while taken < batch_num {
        let next = next_block(tail);
        if next.is_null() {
          break;
        }
        tail = next;
        taken += 1;
        self.tracker_borrowed(tail);
      }
      let rest = next_block(tail);
      set_next_block(tail, null_mut());
      self.free_lists[index].store(rest, Ordering::Release);
    }
    head
  }

  /// Splice a returned chain back onto its class list, head first.
  /// `total_bytes` bounds the tail walk; an early null terminator wins.
  pub unsafe fn return_range(
    &self,
    pages: &PageCache,
    head: *mut u8,
    total_bytes: usize,
    index: usize,
  ) {
    if head.is_null() || index >= FREE_LIST_SIZE {
      return;
    }
    let block_count = (total_bytes / class_size(index)).max(1);

    let _guard = self.locks[index].lock();

    unsafe {
      // Find the tail, crediting each block back to its span.
      self.tracker_returned(head);
      let mut tail = head;
      let mut count = 1;
      while count < block_count {
        let next = next_block(tail);
        if next.is_null() {
          break;
        }
        tail = next;
        count += 1;
        self.tracker_returned(tail);
      }

      let current = self.free_lists[index].load(Ordering::Relaxed);
      set_next_block(tail, current);
      self.free_lists[index].store(head, Ordering::Release);
    }

    self.maybe_reclaim(pages, index);
  }

  /// Carve a fresh span: the first `min(batch_num, total)` blocks go to the
  /// caller, the remainder becomes the class list. Caller holds the lock.
  fn refill(&self, pages: &PageCache, index: usize, batch_num: usize) -> *mut u8 {
    let block_size = class_size(index);

    // Classes up to one span's worth refill from a fixed-size span; larger
    // classes get exactly the pages one block needs.
    let num_pages = if block_size <= SPAN_PAGES * PAGE_SIZE {
      SPAN_PAGES
    } else {
      block_size.div_ceil(PAGE_SIZE)
    };

    let start = pages.allocate_span(num_pages);
    if start.is_null() {
      return null_mut();
    }

    let total_blocks = (num_pages * PAGE_SIZE) / block_size;
    let alloc_blocks = batch_num.min(total_blocks);

    unsafe {
      // Thread every block through its own first word.
      for i in 1..total_blocks {
        set_next_block(start.add((i - 1) * block_size), start.add(i * block_size));
      }
      set_next_block(start.add((total_blocks - 1) * block_size), null_mut());

      if alloc_blocks < total_blocks {
        let split = start.add((alloc_blocks - 1) * block_size);
        let remain = next_block(split);
        set_next_block(split, null_mut());
        self.free_lists[index].store(remain, Ordering::Release);
      }
    }

    self.register_span(start, num_pages, total_blocks, alloc_blocks, index);
    start
  }

  /// Claim a tracker slot for a freshly carved span. The address is
  /// published last, so a racing reader either skips the slot or sees it
  /// whole. With every slot busy the span simply goes untracked.
  fn register_span(
    &self,
    start: *mut u8,
    num_pages: usize,
    total_blocks: usize,
    alloc_blocks: usize,
    index: usize,
  ) {
    for tracker in self.trackers.iter() {
      if tracker
        .span_addr
        .compare_exchange(0, TRACKER_CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
      {
        tracker.num_pages.store(num_pages, Ordering::Relaxed);
        tracker.total_blocks.store(total_blocks, Ordering::Relaxed);
        tracker
          .free_count
          .store(total_blocks - alloc_blocks, Ordering::Relaxed);
        tracker.class.store(index, Ordering::Relaxed);
        tracker.span_addr.store(start as usize, Ordering::Release);
        return;
      }
    }
  }

  /// Linear scan mapping a block to the span that owns it. Acceptable at
  /// the tracker cap; high span churn would want an address-keyed map.
  fn tracker_for(&self, block: *mut u8) -> Option<&SpanTracker> {
    let addr = block as usize;
    self.trackers.iter().find(|t| {
      let span = t.span_addr.load(Ordering::Acquire);
      if span == 0 || span == TRACKER_CLAIMED {
        return false;
      }
      let len = t.num_pages.load(Ordering::Relaxed) * PAGE_SIZE;
      addr >= span && addr < span + len
    })
  }

  fn tracker_borrowed(&self, block: *mut u8) {
    if let Some(t) = self.tracker_for(block) {
      t.free_count.fetch_sub(1, Ordering::Relaxed);
    }
  }

  fn tracker_returned(&self, block: *mut u8) {
    if let Some(t) = self.tracker_for(block) {
      t.free_count.fetch_add(1, Ordering::Relaxed);
    }
  }

  /// Delayed-return gate: after MAX_DELAY_COUNT returns or DELAY_INTERVAL_MS
  /// of wall-clock, whichever comes first, sweep the class for idle spans.
  fn maybe_reclaim(&self, pages: &PageCache, index: usize) {
    let delay = &self.delays[index];
    let count = delay.return_count.fetch_add(1, Ordering::Relaxed) + 1;
    let now = self.epoch.elapsed().as_millis() as u64;
    let last = delay.last_return_ms.load(Ordering::Relaxed);
    if count < MAX_DELAY_COUNT && now.wrapping_sub(last) < DELAY_INTERVAL_MS {
      return;
    }
    delay.return_count.store(0, Ordering::Relaxed);
    delay.last_return_ms.store(now, Ordering::Relaxed);
    self.reclaim_class(pages, index);
  }

  /// Hand every fully-free span of this class back to the page cache.
  /// Caller holds the class lock.
  fn reclaim_class(&self, pages: &PageCache, index: usize) {
    for tracker in self.trackers.iter() {
      let span = tracker.span_addr.load(Ordering::Acquire);
      if span == 0 || span == TRACKER_CLAIMED {
        continue;
      }
      if tracker.class.load(Ordering::Relaxed) != index {
        continue;
      }
      let total = tracker.total_blocks.load(Ordering::Relaxed);
      if tracker.free_count.load(Ordering::Relaxed) != total {
        continue;
      }
      let num_pages = tracker.num_pages.load(Ordering::Relaxed);
      let end = span + num_pages * PAGE_SIZE;

      // Unlink every block inside the span from the class list.
      let mut removed = 0usize;
      unsafe {
        let mut head = self.free_lists[index].load(Ordering::Relaxed);
        while !head.is_null() && in_range(head, span, end) {
          head = next_block(head);
          removed += 1;
        }
        if !head.is_null() {
          let mut prev = head;
          let mut cur = next_block(prev);
          while !cur.is_null() {
            let next = next_block(cur);
            if in_range(cur, span, end) {
              set_next_block(prev, next);
              removed += 1;
            } else {
              prev = cur;
            }
            cur = next;
          }
        }
        self.free_lists[index].store(head, Ordering::Release);
      }
      debug_assert_eq!(removed, total);

      tracker.span_addr.store(0, Ordering::Release);
      pages.deallocate_span(span as *mut u8, num_pages);
    }
  }
}

impl Default for CentralCache {
  fn default() -> Self {
    Self::new()
  }
}

#[inline(always)]
fn in_range(block: *mut u8, start: usize, end: usize) -> bool {
  let addr = block as usize;
  addr >= start && addr < end
}

// =============================================================================
// ThreadCache
// =============================================================================

/// Per-thread front end. Every field is owned by exactly one thread; nothing
/// here is ever touched cross-thread, so the hot path takes no lock at all.
pub struct ThreadCache {
  free_list: [*mut u8; FREE_LIST_SIZE],
  list_len: [usize; FREE_LIST_SIZE],
}

impl ThreadCache {
  pub const fn new() -> Self {
    Self {
      free_list: [null_mut(); FREE_LIST_SIZE],
      list_len: [0; FREE_LIST_SIZE],
    }
  }

  /// Serve `size` bytes. Zero-size requests are promoted to ALIGNMENT;
  /// requests above MAX_BYTES map pages directly and touch no tier.
  pub fn allocate(&mut self, central: &CentralCache, pages: &PageCache, size: usize) -> *mut u8 {
    let size = if size == 0 { ALIGNMENT } else { size };
    if size > MAX_BYTES {
      return large_map(size);
    }

    let index = class_index(round_up(size));
    let head = self.free_list[index];
    if !head.is_null() {
      self.free_list[index] = unsafe { next_block(head) };
      self.list_len[index] -= 1;
      return head;
    }

    self.refill(central, pages, index)
  }

  /// Take a block back. Oversized blocks were never cached and unmap
  /// directly; everything else is pushed onto the class list, spilling to
  /// CentralCache once the list outgrows THREAD_RETURN_THRESHOLD.
  pub unsafe fn deallocate(
    &mut self,
    central: &CentralCache,
    pages: &PageCache,
    ptr: *mut u8,
    size: usize,
  ) {
    if ptr.is_null() {
      return;
    }
    let size = if size == 0 { ALIGNMENT } else { size };
    if size > MAX_BYTES {
      unsafe { large_unmap(ptr, size) };
      return;
    }

    let index = class_index(size);
    unsafe { set_next_block(ptr, self.free_list[index]) };
    self.free_list[index] = ptr;
    self.list_len[index] += 1;

    if self.list_len[index] > THREAD_RETURN_THRESHOLD {
      self.spill(central, pages, index);
    }
  }

  /// Pull a batch from CentralCache, keep the tail, hand back the head.
  fn refill(&mut self, central: &CentralCache, pages: &PageCache, index: usize) -> *mut u8 {
    let batch = batch_num(class_size(index));
    let head = central.fetch_range(pages, index, batch);
    if head.is_null() {
      return null_mut();
    }

    // The chain may be shorter than asked for; count what arrived.
    unsafe {
      let rest = next_block(head);
      let mut count = 0usize;
      let mut cur = rest;
      while !cur.is_null() {
        count += 1;
        cur = next_block(cur);
      }
      self.free_list[index] = rest;
      self.list_len[index] += count;
    }
    head
  }

  /// Keep a quarter of the list locally and hand the rest back.
  fn spill(&mut self, central: &CentralCache, pages: &PageCache, index: usize) {
    let total = self.list_len[index];
    if total <= 1 {
      return;
    }
    let keep = (total / 4).max(1);

    unsafe {
      // Walk keep-1 links to the split node.
      let mut split = self.free_list[index];
      let mut kept = 1;
      while kept < keep {
        let next = next_block(split);
        if next.is_null() {
          break;
        }
        split = next;
        kept += 1;
      }

      let spill_head = next_block(split);
      set_next_block(split, null_mut());
      self.list_len[index] = kept;

      if spill_head.is_null() {
        return;
      }
      let return_num = total - kept;
      central.return_range(pages, spill_head, return_num * class_size(index), index);
    }
  }

  /// Hand every cached block back to CentralCache. Lists are left empty, so
  /// a second call is a no-op.
  pub fn release_all(&mut self, central: &CentralCache, pages: &PageCache) {
    for index in 0..FREE_LIST_SIZE {
      let head = self.free_list[index];
      if head.is_null() {
        continue;
      }
      let len = self.list_len[index];
      self.free_list[index] = null_mut();
      self.list_len[index] = 0;
      unsafe { central.return_range(pages, head, len * class_size(index), index) };
    }
  }
}

impl Default for ThreadCache {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for ThreadCache {
  fn drop(&mut self) {
    // Abandon the lists to the process-wide cache; otherwise the memory
    // stays stranded with the dead thread.
    let Some(central) = CENTRAL_CACHE.get() else {
      return;
    };
    self.release_all(central, &PAGE_CACHE);
  }
}

// =============================================================================
// Globals + TLS
// =============================================================================

static PAGE_CACHE: PageCache = PageCache::new();
static CENTRAL_CACHE: OnceLock<CentralCache> = OnceLock::new();

fn central() -> &'static CentralCache {
  CENTRAL_CACHE.get_or_init(CentralCache::new)
}

thread_local! {
  static CACHE: UnsafeCell<ThreadCache> = const { UnsafeCell::new(ThreadCache::new()) };
}

/// Run `f` against this thread's cache. During TLS teardown the cache is
/// already gone; `fallback` then talks to CentralCache directly so late
/// allocations still work.
fn with_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R, fallback: impl FnOnce() -> R) -> R {
  match CACHE.try_with(|c| f(unsafe { &mut *c.get() })) {
    Ok(r) => r,
    Err(_) => fallback(),
  }
}

// =============================================================================
// Public API
// =============================================================================

/// OS bypass for requests above MAX_BYTES: map exactly the pages needed.
fn large_map(size: usize) -> *mut u8 {
  unsafe { os_map(size.div_ceil(PAGE_SIZE) * PAGE_SIZE) }
}

unsafe fn large_unmap(ptr: *mut u8, size: usize) {
  unsafe { os_unmap(ptr, size.div_ceil(PAGE_SIZE) * PAGE_SIZE) };
}

/// Allocate `size` bytes, 8-byte aligned. Zero-size requests get a distinct
/// ALIGNMENT-sized block. Null only when the OS is out of memory.
pub fn allocate(size: usize) -> *mut u8 {
  with_cache(
    |cache| cache.allocate(central(), &PAGE_CACHE, size),
    || {
      let size = if size == 0 { ALIGNMENT } else { size };
      if size > MAX_BYTES {
        return large_map(size);
      }
      central().fetch_range(&PAGE_CACHE, class_index(round_up(size)), 1)
    },
  )
}

/// Release a block obtained from [`allocate`]. `size` must be the size
/// originally requested; no per-block metadata exists to recover it, and
/// passing a different size is undefined behavior. Null is a no-op.
pub unsafe fn deallocate(ptr: *mut u8, size: usize) {
  if ptr.is_null() {
    return;
  }
  with_cache(
    |cache| unsafe { cache.deallocate(central(), &PAGE_CACHE, ptr, size) },
    || {
      let size = if size == 0 { ALIGNMENT } else { size };
      if size > MAX_BYTES {
        unsafe { large_unmap(ptr, size) };
        return;
      }
      let index = class_index(size);
      unsafe {
        set_next_block(ptr, null_mut());
        central().return_range(&PAGE_CACHE, ptr, class_size(index), index);
      }
    },
  )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  // --- size classes ---

  #[test]
  fn round_up_alignment_steps() {
    assert_eq!(round_up(0), 0);
    assert_eq!(round_up(1), 8);
    assert_eq!(round_up(8), 8);
    assert_eq!(round_up(9), 16);
    assert_eq!(round_up(15), 16);
    assert_eq!(round_up(MAX_BYTES), MAX_BYTES);
  }

  #[test]
  fn class_index_boundaries() {
    assert_eq!(class_index(0), 0);
    assert_eq!(class_index(1), 0);
    assert_eq!(class_index(8), 0);
    assert_eq!(class_index(9), 1);
    assert_eq!(class_index(16), 1);
    assert_eq!(class_index(17), 2);
    assert_eq!(class_index(MAX_BYTES), FREE_LIST_SIZE - 1);
  }

  #[test]
  fn class_size_inverts_index() {
    for index in [0, 1, 7, 100, FREE_LIST_SIZE - 1] {
      assert_eq!(class_index(class_size(index)), index);
    }
  }

  #[test]
  fn batch_num_table_and_cap() {
    assert_eq!(batch_num(8), 64);
    assert_eq!(batch_num(32), 64);
    assert_eq!(batch_num(40), 32);
    assert_eq!(batch_num(128), 16);
    assert_eq!(batch_num(512), 4);
    assert_eq!(batch_num(1024), 2);
    // The byte cap takes over past BATCH_CAP_BYTES.
    assert_eq!(batch_num(2048), 1);
    assert_eq!(batch_num(MAX_BYTES), 1);
  }

  // --- page cache ---

  #[test]
  fn span_split_serves_from_the_front() {
    let cache = PageCache::new();
    let big = cache.allocate_span(12);
    assert!(!big.is_null());
    cache.deallocate_span(big, 12);

    let a = cache.allocate_span(4);
    assert_eq!(a, big);
    let b = cache.allocate_span(4);
    assert_eq!(b as usize, big as usize + 4 * PAGE_SIZE);
    let c = cache.allocate_span(4);
    assert_eq!(c as usize, big as usize + 8 * PAGE_SIZE);
  }

  #[test]
  fn span_coalescing_absorbs_forward_neighbor() {
    let cache = PageCache::new();
    // One mapped run split three ways so the spans are truly adjacent.
    let big = cache.allocate_span(12);
    cache.deallocate_span(big, 12);
    let first = cache.allocate_span(4);
    let middle = cache.allocate_span(4);
    let third = cache.allocate_span(4);

    cache.deallocate_span(middle, 4);
    cache.deallocate_span(first, 4); // absorbs middle
    cache.deallocate_span(third, 4);

    let inner = cache.inner.lock();
    let entries: usize = inner.free_spans.values().map(Vec::len).sum();
    let total_pages: usize = inner
      .span_map
      .values()
      .filter(|s| s.free)
      .map(|s| s.num_pages)
      .sum();
    assert!(entries <= 3);
    assert_eq!(total_pages, 12);
    // first + middle merged into one 8-page span.
    assert_eq!(inner.span_map[&(first as usize)].num_pages, 8);
  }

  #[test]
  fn unknown_span_address_is_ignored() {
    let cache = PageCache::new();
    cache.deallocate_span(0xdead_0000 as *mut u8, 4);
    assert!(cache.inner.lock().span_map.is_empty());
  }

  #[test]
  fn double_span_free_is_ignored() {
    let cache = PageCache::new();
    let a = cache.allocate_span(2);
    cache.deallocate_span(a, 2);
    cache.deallocate_span(a, 2);
    let inner = cache.inner.lock();
    let entries: usize = inner.free_spans.values().map(Vec::len).sum();
    assert_eq!(entries, 1);
  }

  // --- central cache ---

  unsafe fn chain_len(mut head: *mut u8) -> usize {
    let mut n = 0;
    while !head.is_null() {
      n += 1;
      head = unsafe { next_block(head) };
    }
    n
  }

  #[test]
  fn refill_keeps_the_remainder() {
    let pages = PageCache::new();
    let central = CentralCache::new();

    let head = central.fetch_range(&pages, 0, 1);
    assert!(!head.is_null());
    assert_eq!(head as usize % ALIGNMENT, 0);
    assert_eq!(unsafe { chain_len(head) }, 1);

    // 8 pages of 8-byte blocks minus the one handed out.
    let rest = central.free_lists[0].load(Ordering::Relaxed);
    assert_eq!(unsafe { chain_len(rest) }, SPAN_PAGES * PAGE_SIZE / 8 - 1);
  }

  #[test]
  fn fetch_rejects_bad_arguments() {
    let pages = PageCache::new();
    let central = CentralCache::new();
    assert!(central.fetch_range(&pages, FREE_LIST_SIZE, 1).is_null());
    assert!(central.fetch_range(&pages, 0, 0).is_null());
  }

  #[test]
  fn fetch_returns_short_chain_when_list_is_short() {
    let pages = PageCache::new();
    let central = CentralCache::new();

    // Drain the span entirely, then give three blocks back.
    let total = SPAN_PAGES * PAGE_SIZE / 8;
    let head = central.fetch_range(&pages, 0, total);
    assert_eq!(unsafe { chain_len(head) }, total);

    unsafe {
      let b1 = head;
      let b2 = next_block(b1);
      let b3 = next_block(b2);
      set_next_block(b3, null_mut());
      central.return_range(&pages, b1, 3 * 8, 0);
    }

    let chain = central.fetch_range(&pages, 0, 10);
    assert_eq!(unsafe { chain_len(chain) }, 3);
  }

  #[test]
  fn return_walk_stops_at_byte_bound() {
    let pages = PageCache::new();
    let central = CentralCache::new();

    let head = central.fetch_range(&pages, 0, 8);
    // Hand back only the first two blocks' worth of bytes; the walk must
    // cut there even though the chain continues.
    unsafe { central.return_range(&pages, head, 2 * 8, 0) };

    let got = central.fetch_range(&pages, 0, 2);
    assert_eq!(unsafe { chain_len(got) }, 2);
  }

  #[test]
  fn idle_span_returns_to_page_cache_by_count() {
    let pages = PageCache::new();
    let central = CentralCache::new();

    // Pull MAX_DELAY_COUNT singles, then trickle them back one at a time.
    let mut blocks = Vec::new();
    for _ in 0..MAX_DELAY_COUNT {
      let b = central.fetch_range(&pages, 0, 1);
      assert!(!b.is_null());
      blocks.push(b);
    }
    for b in blocks {
      unsafe {
        set_next_block(b, null_mut());
        central.return_range(&pages, b, 8, 0);
      }
    }

    // The 48th return opened the gate with every block home again.
    assert!(central.free_lists[0].load(Ordering::Relaxed).is_null());
    assert_eq!(central.trackers[0].span_addr.load(Ordering::Relaxed), 0);
    let inner = pages.inner.lock();
    assert!(
      inner
        .span_map
        .values()
        .any(|s| s.free && s.num_pages == SPAN_PAGES)
    );
  }

  #[test]
  fn idle_span_returns_to_page_cache_by_time() {
    let pages = PageCache::new();
    let central = CentralCache::new();
    let total = SPAN_PAGES * PAGE_SIZE / 8;

    let head = central.fetch_range(&pages, 0, total);
    unsafe { central.return_range(&pages, head, total * 8, 0) };
    // First return: gate closed, span still carved up.
    assert_ne!(central.trackers[0].span_addr.load(Ordering::Relaxed), 0);

    std::thread::sleep(std::time::Duration::from_millis(DELAY_INTERVAL_MS + 100));

    let one = central.fetch_range(&pages, 0, 1);
    unsafe {
      set_next_block(one, null_mut());
      central.return_range(&pages, one, 8, 0);
    }

    assert_eq!(central.trackers[0].span_addr.load(Ordering::Relaxed), 0);
    assert!(central.free_lists[0].load(Ordering::Relaxed).is_null());
  }

  // --- thread cache against private tiers ---

  #[test]
  fn hot_class_reuses_spans_frugally() {
    let pages = PageCache::new();
    let central = CentralCache::new();
    let mut cache = ThreadCache::new();

    let mut ptrs = Vec::with_capacity(10_000);
    for _ in 0..10_000 {
      let p = cache.allocate(&central, &pages, 8);
      assert!(!p.is_null());
      assert_eq!(p as usize % ALIGNMENT, 0);
      ptrs.push(p);
    }
    for p in ptrs.into_iter().rev() {
      unsafe { cache.deallocate(&central, &pages, p, 8) };
    }

    // 10k live 8-byte blocks fit in three 8-page spans.
    assert!(pages.inner.lock().span_map.len() <= 20);

    cache.release_all(&central, &pages);
  }

  #[test]
  fn refill_counts_what_actually_arrived() {
    let pages = PageCache::new();
    let central = CentralCache::new();
    let mut cache = ThreadCache::new();

    let p = cache.allocate(&central, &pages, 8);
    assert!(!p.is_null());
    // batch_num(8) is 64: one handed out, the rest cached locally.
    assert_eq!(cache.list_len[0], 63);
    assert_eq!(unsafe { chain_len(cache.free_list[0]) }, 63);

    unsafe { cache.deallocate(&central, &pages, p, 8) };
    assert_eq!(cache.list_len[0], 64);

    cache.release_all(&central, &pages);
  }

  #[test]
  fn spill_keeps_a_quarter() {
    let pages = PageCache::new();
    let central = CentralCache::new();
    let mut cache = ThreadCache::new();

    // batch_num(2048) is 1, so refills leave nothing behind and the list
    // length is exactly the number of frees.
    let mut ptrs = Vec::new();
    for _ in 0..THREAD_RETURN_THRESHOLD + 1 {
      ptrs.push(cache.allocate(&central, &pages, 2048));
    }
    for p in ptrs {
      unsafe { cache.deallocate(&central, &pages, p, 2048) };
    }

    // The push past the threshold spilled down to total/4.
    assert_eq!(
      cache.list_len[class_index(2048)],
      (THREAD_RETURN_THRESHOLD + 1) / 4
    );

    cache.release_all(&central, &pages);
  }

  #[test]
  fn release_all_empties_every_list() {
    let pages = PageCache::new();
    let central = CentralCache::new();
    let mut cache = ThreadCache::new();

    for size in [8, 64, 1024] {
      let p = cache.allocate(&central, &pages, size);
      unsafe { cache.deallocate(&central, &pages, p, size) };
    }
    cache.release_all(&central, &pages);

    for index in 0..FREE_LIST_SIZE {
      assert!(cache.free_list[index].is_null());
      assert_eq!(cache.list_len[index], 0);
    }
  }

  // --- public surface ---

  #[test]
  fn write_read_identity_round_trip() {
    let sizes = [0, 1, 8, 24, 100, 4096, MAX_BYTES];
    for &size in &sizes {
      let p = allocate(size);
      assert!(!p.is_null());
      assert_eq!(p as usize % ALIGNMENT, 0);
      let usable = round_up(size.max(1));
      unsafe {
        for i in 0..usable {
          p.add(i).write((i % 251) as u8);
        }
        for i in 0..usable {
          assert_eq!(p.add(i).read(), (i % 251) as u8);
        }
        deallocate(p, size);
      }
    }
  }

  #[test]
  fn bypass_path_above_max_bytes() {
    let size = MAX_BYTES + 1;
    let p = allocate(size);
    assert!(!p.is_null());
    assert_eq!(p as usize % PAGE_SIZE, 0);
    unsafe {
      p.write(0xab);
      p.add(size - 1).write(0xcd);
      assert_eq!(p.read(), 0xab);
      deallocate(p, size);
    }
  }

  #[test]
  fn zero_size_allocations_are_distinct() {
    let a = allocate(0);
    let b = allocate(0);
    assert!(!a.is_null() && !b.is_null());
    assert_ne!(a, b);
    unsafe {
      deallocate(a, 0);
      deallocate(b, 0);
    }
  }

  #[test]
  fn null_deallocate_is_a_no_op() {
    unsafe { deallocate(null_mut(), 64) };
  }
}
