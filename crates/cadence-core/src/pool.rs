//! Lock-free block pool for the render thread
//!
//! All storage is allocated once at construction. Each size class tracks its
//! free blocks in a bitmap of 64-bit words, one bit per block. Acquiring
//! clears a set bit with a bounded number of compare-and-swap attempts;
//! releasing sets it again with a single `fetch_or`, so release is wait-free.
//!
//! Storage is shared between the pool and every outstanding [`Block`], so a
//! block stays valid even if the pool handle is dropped first.
//!
//! # Memory ordering
//!
//! `release` publishes the block contents with a `Release` RMW on its bitmap
//! word; `acquire` observes them through the `Acquire` side of the CAS that
//! claims the bit. A block is never handed out while another owner's writes
//! are in flight.
//!
//! # Usage
//!
//! ```ignore
//! let pool = MemoryPool::<StereoSample>::new(&[PoolClassConfig { block_frames: 4096, blocks: 64 }]);
//! let mut block = pool.acquire(0)?;
//! block.as_mut_slice().fill(StereoSample::silence());
//! pool.release(block);
//! ```

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

use crate::config::PoolClassConfig;
use crate::error::{EngineError, EngineResult};

/// Upper bound on CAS attempts in [`MemoryPool::acquire`]
pub const MAX_ACQUIRE_RETRIES: usize = 64;

const WORD_BITS: usize = u64::BITS as usize;

struct SizeClass<T> {
    block_len: usize,
    storage: Box<[UnsafeCell<T>]>,
    /// Bit `i % 64` of word `i / 64` is set while block `i` is free
    free: Box<[CachePadded<AtomicU64>]>,
    available: AtomicUsize,
}

impl<T: Copy + Default> SizeClass<T> {
    fn new(block_len: usize, blocks: usize) -> Self {
        let storage = (0..block_len * blocks)
            .map(|_| UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let free = (0..blocks.div_ceil(WORD_BITS))
            .map(|word| {
                let used = (blocks - word * WORD_BITS).min(WORD_BITS);
                let bits = if used == WORD_BITS { u64::MAX } else { (1u64 << used) - 1 };
                CachePadded::new(AtomicU64::new(bits))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            block_len,
            storage,
            free,
            available: AtomicUsize::new(blocks),
        }
    }
}

struct PoolStorage<T> {
    classes: Box<[SizeClass<T>]>,
}

// SAFETY: block regions are only reached through unique `Block` handles and
// the free bitmaps are atomics.
unsafe impl<T: Send> Send for PoolStorage<T> {}
unsafe impl<T: Send> Sync for PoolStorage<T> {}

/// A block borrowed from a [`MemoryPool`]
///
/// Not `Clone`: exactly one owner may touch the block's memory until it is
/// handed back with [`MemoryPool::release`]. A block dropped without being
/// released is lost to the pool. If it held the last reference to the pool
/// storage, dropping it frees that storage on the dropping thread.
pub struct Block<T> {
    ptr: NonNull<T>,
    len: usize,
    class: usize,
    index: usize,
    storage: Arc<PoolStorage<T>>,
}

// SAFETY: a Block is the unique handle to a disjoint region of storage that
// it keeps alive itself.
unsafe impl<T: Send> Send for Block<T> {}

impl<T> Block<T> {
    /// Number of elements in the block
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Blocks are never empty, but clippy expects the pair
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size class this block was taken from
    #[inline]
    pub fn size_class(&self) -> usize {
        self.class
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: ptr/len describe a region of `self.storage`, which this
        // handle keeps alive and owns exclusively until released.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: see `as_slice`; `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Fixed-capacity, lock-free block allocator
pub struct MemoryPool<T> {
    storage: Arc<PoolStorage<T>>,
}

impl<T: Copy + Default> MemoryPool<T> {
    /// Allocate every size class up front
    ///
    /// Classes keep the order given; callers address them by index.
    pub fn new(classes: &[PoolClassConfig]) -> Self {
        let classes = classes
            .iter()
            .map(|c| SizeClass::new(c.block_frames, c.blocks))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            storage: Arc::new(PoolStorage { classes }),
        }
    }

    /// Claim a free block from `size_class`
    ///
    /// Fails with `PoolExhausted` when the class is empty or contention
    /// outlasts [`MAX_ACQUIRE_RETRIES`] attempts. Never blocks.
    pub fn acquire(&self, size_class: usize) -> EngineResult<Block<T>> {
        let class = self
            .storage
            .classes
            .get(size_class)
            .ok_or(EngineError::PoolExhausted { size_class })?;

        let mut attempts = 0;
        for (word_index, word) in class.free.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                if attempts == MAX_ACQUIRE_RETRIES {
                    return Err(EngineError::PoolExhausted { size_class });
                }
                attempts += 1;

                let bit = bits.trailing_zeros() as usize;
                match word.compare_exchange_weak(
                    bits,
                    bits & !(1u64 << bit),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        class.available.fetch_sub(1, Ordering::Relaxed);
                        return Ok(self.block(class, size_class, word_index * WORD_BITS + bit));
                    }
                    Err(actual) => bits = actual,
                }
            }
        }
        Err(EngineError::PoolExhausted { size_class })
    }

    fn block(&self, class: &SizeClass<T>, size_class: usize, index: usize) -> Block<T> {
        let offset = index * class.block_len;
        // SAFETY: index < blocks, so offset + block_len <= storage.len(); the
        // pointer is derived from the whole slice so it may span the block.
        let ptr = unsafe { UnsafeCell::raw_get(class.storage.as_ptr().add(offset)) };
        Block {
            // SAFETY: derived from a live boxed slice, never null.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len: class.block_len,
            class: size_class,
            index,
            storage: Arc::clone(&self.storage),
        }
    }

    /// Claim a block from the smallest class holding at least `len` elements
    ///
    /// Falls through to larger classes when the best fit is exhausted.
    pub fn acquire_len(&self, len: usize) -> EngineResult<Block<T>> {
        let mut last_class = 0;
        for (i, class) in self.storage.classes.iter().enumerate() {
            if class.block_len < len {
                continue;
            }
            last_class = i;
            if let Ok(block) = self.acquire(i) {
                return Ok(block);
            }
        }
        Err(EngineError::PoolExhausted { size_class: last_class })
    }

    /// Mark a block free again
    ///
    /// One atomic `fetch_or`, no retry loop. Blocks from another pool are
    /// ignored (and trip a debug assertion).
    pub fn release(&self, block: Block<T>) {
        let own = Arc::ptr_eq(&block.storage, &self.storage);
        debug_assert!(own, "block released into a foreign pool");
        if !own {
            return;
        }
        let class = &self.storage.classes[block.class];
        class.free[block.index / WORD_BITS]
            .fetch_or(1u64 << (block.index % WORD_BITS), Ordering::Release);
        class.available.fetch_add(1, Ordering::Relaxed);
    }

    /// Free blocks in a size class (approximate under contention)
    pub fn available(&self, size_class: usize) -> usize {
        self.storage
            .classes
            .get(size_class)
            .map_or(0, |c| c.available.load(Ordering::Relaxed))
    }
}
