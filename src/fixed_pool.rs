//! Single-size pool allocator.
//!
//! One configured slot size, OS-backed blocks carved into slots, and a
//! lock-free free list of reclaimed slots. This is the standalone version of
//! the carving discipline the tiered caches apply per size class; callers
//! that only ever need one size use it without paying for the tiers.
//!
//! [`HashBucket`] fans a small range of sizes out over 64 pools and backs the
//! typed [`new_element`] / [`delete_element`] helpers.

use core::{
  alloc::Layout,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};
use std::sync::Once;

use parking_lot::Mutex;

use crate::{os_map, os_unmap};

/// Bytes mapped from the OS per block; each block is carved into slots.
const BLOCK_SIZE: usize = 4096;

/// Smallest slot, and the slot-size step between [`HashBucket`] pools.
pub const SLOT_BASE_SIZE: usize = 8;

/// Number of pools behind [`HashBucket`].
pub const MEMORY_POOL_NUM: usize = 64;

const _: () = assert!(BLOCK_SIZE % SLOT_BASE_SIZE == 0);
const _: () = assert!(SLOT_BASE_SIZE >= size_of::<*mut u8>());

/// A reclaimed slot; the next pointer lives in the slot's first word.
#[repr(C)]
struct Slot {
  next: *mut Slot,
}

/// Bump region inside the newest OS block, plus the block chain itself.
struct Bump {
  /// Head of the block chain, linked through each block's first word.
  /// Walked only at teardown.
  first_block: *mut u8,
  cur_slot: *mut u8,
  /// One past the last address a whole slot still fits at.
  last_slot: *mut u8,
}

/// Allocator for one fixed slot size.
///
/// Reclaimed slots sit on a lock-free stack; fresh slots come from a bump
/// pointer inside the newest OS block. The bump state is behind a mutex
/// because growing mutates several fields at once.
pub struct FixedPool {
  /// Set once by [`init`](Self::init); zero means unconfigured.
  slot_size: AtomicUsize,
  free_list: AtomicPtr<Slot>,
  bump: Mutex<Bump>,
}

unsafe impl Send for FixedPool {}
unsafe impl Sync for FixedPool {}

impl FixedPool {
  pub const fn new() -> Self {
    Self {
      slot_size: AtomicUsize::new(0),
      free_list: AtomicPtr::new(null_mut()),
      bump: Mutex::new(Bump {
        first_block: null_mut(),
        cur_slot: null_mut(),
        last_slot: null_mut(),
      }),
    }
  }

  /// Configure the slot size. Must happen before the first allocation; slots
  /// are at least pointer-sized so the free list can thread through them.
  pub fn init(&self, slot_size: usize) {
    debug_assert!(slot_size >= size_of::<*mut u8>());
    debug_assert!(slot_size <= BLOCK_SIZE - size_of::<*mut u8>());
    self.slot_size.store(slot_size, Ordering::Relaxed);
  }

  /// Pop a reclaimed slot, or bump-allocate from the current block, mapping
  /// a new block once the bump region is spent. Null when the pool is
  /// unconfigured or the OS refuses memory.
  pub fn allocate(&self) -> *mut u8 {
    if let Some(slot) = self.pop_free() {
      return slot as *mut u8;
    }

    let slot_size = self.slot_size.load(Ordering::Relaxed);
    if slot_size == 0 {
      return null_mut();
    }

    let mut bump = self.bump.lock();
    if bump.cur_slot >= bump.last_slot && !grow(&mut bump, slot_size) {
      return null_mut();
    }
    let slot = bump.cur_slot;
    bump.cur_slot = unsafe { slot.add(slot_size) };
    slot
  }

  /// Push a slot back onto the free list. Null is ignored.
  pub unsafe fn deallocate(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    let slot = ptr as *mut Slot;
    loop {
      let old = self.free_list.load(Ordering::Relaxed);
      unsafe { (*slot).next = old };
      if self
        .free_list
        .compare_exchange_weak(old, slot, Ordering::Release, Ordering::Relaxed)
        .is_ok()
      {
        return;
      }
    }
  }

  fn pop_free(&self) -> Option<*mut Slot> {
    loop {
      let old = self.free_list.load(Ordering::Acquire);
      if old.is_null() {
        return None;
      }
      // Classic ABA window: a slot popped and re-pushed between this read
      // and the CAS leaves `next` stale. Slots are not recycled across
      // unrelated callers within one retry window; adversarial workloads
      // want tagged pointers here.
      let next = unsafe { (*old).next };
      if self
        .free_list
        .compare_exchange_weak(old, next, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
      {
        return Some(old);
      }
    }
  }
}

impl Default for FixedPool {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for FixedPool {
  fn drop(&mut self) {
    // Walk the block chain and hand every block back to the OS.
    let mut block = self.bump.get_mut().first_block;
    while !block.is_null() {
      let next = unsafe { *(block as *mut *mut u8) };
      unsafe { os_unmap(block, BLOCK_SIZE) };
      block = next;
    }
  }
}

/// Map a fresh block, link it into the teardown chain, and reset the bump
/// region so slot 0 is aligned to the slot size.
fn grow(bump: &mut Bump, slot_size: usize) -> bool {
  let block = unsafe { os_map(BLOCK_SIZE) };
  if block.is_null() {
    return false;
  }

  unsafe {
    // Block header: forward pointer to the previously mapped block.
    *(block as *mut *mut u8) = bump.first_block;
    bump.first_block = block;

    let body = block.add(size_of::<*mut u8>());
    bump.cur_slot = body.add(pad_to(body, slot_size));
    bump.last_slot = block.add(BLOCK_SIZE - slot_size + 1);
  }
  true
}

/// Padding that brings `p` up to the next multiple of `align`.
#[inline(always)]
fn pad_to(p: *mut u8, align: usize) -> usize {
  let addr = p as usize;
  align.wrapping_sub(addr % align) % align
}

// =============================================================================
// HashBucket
// =============================================================================

/// Process-wide array of pools stepping [`SLOT_BASE_SIZE`] bytes apart:
/// pool `i` serves slots of `(i + 1) * SLOT_BASE_SIZE` bytes. Sizes past the
/// largest pool fall through to the system allocator.
pub struct HashBucket;

static POOLS: [FixedPool; MEMORY_POOL_NUM] = [const { FixedPool::new() }; MEMORY_POOL_NUM];
static POOLS_READY: Once = Once::new();

impl HashBucket {
  /// Largest size served from a pool.
  pub const MAX_SLOT_SIZE: usize = MEMORY_POOL_NUM * SLOT_BASE_SIZE;

  /// Size every pool. Safe under races; runs once.
  pub fn init_all() {
    POOLS_READY.call_once(|| {
      for (i, pool) in POOLS.iter().enumerate() {
        pool.init((i + 1) * SLOT_BASE_SIZE);
      }
    });
  }

  #[inline]
  fn pool_index(size: usize) -> usize {
    (size - 1) / SLOT_BASE_SIZE
  }

  /// Alignment of fall-through allocations, matching what general-purpose
  /// heaps guarantee. Pool slots are aligned to their own slot size.
  const FALLBACK_ALIGN: usize = 16;

  /// Allocate `size` bytes from the size-matched pool.
  pub fn allocate(size: usize) -> *mut u8 {
    let size = size.max(1);
    if size > Self::MAX_SLOT_SIZE {
      let Ok(layout) = Layout::from_size_align(size, Self::FALLBACK_ALIGN) else {
        return null_mut();
      };
      return unsafe { std::alloc::alloc(layout) };
    }
    Self::init_all();
    POOLS[Self::pool_index(size)].allocate()
  }

  /// Release a block from [`allocate`](Self::allocate); `size` must match
  /// the original request. Null is ignored.
  pub unsafe fn deallocate(ptr: *mut u8, size: usize) {
    if ptr.is_null() {
      return;
    }
    let size = size.max(1);
    if size > Self::MAX_SLOT_SIZE {
      let Ok(layout) = Layout::from_size_align(size, Self::FALLBACK_ALIGN) else {
        return;
      };
      unsafe { std::alloc::dealloc(ptr, layout) };
      return;
    }
    unsafe { POOLS[Self::pool_index(size)].deallocate(ptr) };
  }
}

/// Move `value` into a slot from the size-matched pool. None when the OS is
/// out of memory.
pub fn new_element<T>(value: T) -> Option<NonNull<T>> {
  let ptr = HashBucket::allocate(size_of::<T>()) as *mut T;
  let ptr = NonNull::new(ptr)?;
  unsafe { ptr.as_ptr().write(value) };
  Some(ptr)
}

/// Drop the value in place and hand its slot back.
pub unsafe fn delete_element<T>(ptr: NonNull<T>) {
  unsafe {
    ptr.as_ptr().drop_in_place();
    HashBucket::deallocate(ptr.as_ptr() as *mut u8, size_of::<T>());
  }
}

// =============================================================================
// Tests
// =============================================================================
