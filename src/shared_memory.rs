// Shared Memory - regions visible to both the caller and the cipher service
//
// Buffers are carved from a bounded pool standing in for the isolated
// environment's shared-memory carveout. A buffer is allocated once per run,
// reused by every iteration, and returns its reservation when released or
// dropped, whichever comes first.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::RngCore;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::tee::{ErrorOrigin, ResultCode, TeeError};

/// Reservation granularity of the pool
pub const PAGE_SIZE: usize = 4096;

/// Default pool capacity (64 MiB)
pub const DEFAULT_POOL_CAPACITY: usize = 64 * 1024 * 1024;

/// Directions in which the service may access a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemFlags(pub u32);

impl MemFlags {
    /// Service reads from the buffer
    pub const INPUT: MemFlags = MemFlags(0x1);
    /// Service writes into the buffer
    pub const OUTPUT: MemFlags = MemFlags(0x2);
    pub const INOUT: MemFlags = MemFlags(0x3);

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// At least one direction and no unknown bits
    pub fn is_valid(&self) -> bool {
        self.0 != 0 && self.0 & !Self::INOUT.0 == 0
    }

    pub fn contains(&self, other: MemFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl fmt::Display for MemFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MemFlags::INPUT => write!(f, "input"),
            MemFlags::OUTPUT => write!(f, "output"),
            MemFlags::INOUT => write!(f, "inout"),
            MemFlags(bits) => write!(f, "0x{:x}", bits),
        }
    }
}

#[derive(Debug, Default)]
struct PoolUsage {
    reserved: usize,
    live: usize,
}

#[derive(Debug)]
struct PoolInner {
    capacity: usize,
    usage: Mutex<PoolUsage>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn reclaim(&self, reserved: usize) {
        let mut usage = self.usage.lock();
        usage.reserved -= reserved;
        usage.live -= 1;
    }
}

/// Bounded source of shared buffers
#[derive(Debug, Clone)]
pub struct SharedMemoryPool {
    inner: Arc<PoolInner>,
}

impl Default for SharedMemoryPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

fn page_align(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

impl SharedMemoryPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity: page_align(capacity),
                usage: Mutex::new(PoolUsage::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bytes currently reserved, page aligned
    pub fn in_use(&self) -> usize {
        self.inner.usage.lock().reserved
    }

    pub fn live_buffers(&self) -> usize {
        self.inner.usage.lock().live
    }

    /// Allocate a zero-filled region of `len` bytes
    pub fn allocate(&self, len: usize, flags: MemFlags) -> Result<SharedBuffer, TeeError> {
        if !flags.is_valid() {
            return Err(TeeError::allocation(
                ResultCode::BAD_PARAMETERS,
                ErrorOrigin::Api,
                format!("invalid shared memory flags {}", flags),
            ));
        }

        let reserved = page_align(len);
        {
            let mut usage = self.inner.usage.lock();
            if usage.reserved + reserved > self.inner.capacity {
                return Err(TeeError::allocation(
                    ResultCode::OUT_OF_MEMORY,
                    ErrorOrigin::Tee,
                    format!(
                        "cannot reserve {} bytes, {} of {} in use",
                        reserved, usage.reserved, self.inner.capacity
                    ),
                ));
            }
            usage.reserved += reserved;
            usage.live += 1;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, len, %flags, "shared buffer allocated");
        Ok(SharedBuffer {
            id,
            flags,
            reserved,
            region: RwLock::new(vec![0u8; len].into_boxed_slice()),
            pool: Arc::clone(&self.inner),
        })
    }
}

/// Region shared with the cipher service for the lifetime of one run
pub struct SharedBuffer {
    id: u64,
    flags: MemFlags,
    /// Page-aligned capacity held in the pool
    reserved: usize,
    region: RwLock<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl SharedBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    /// Declared length; never exceeds `capacity()`
    pub fn len(&self) -> usize {
        self.region.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.reserved
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.region.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.region.write()
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, Box<[u8]>>> {
        self.region.try_read()
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, Box<[u8]>>> {
        self.region.try_write()
    }

    /// Overwrite the whole region from an entropy source
    pub fn fill_with<R: RngCore + ?Sized>(&self, rng: &mut R) {
        rng.fill_bytes(&mut self.region.write());
    }

    pub fn zero(&self) {
        self.region.write().fill(0);
    }

    /// Return the region to the pool
    pub fn release(self) {
        trace!(id = self.id, "shared buffer release requested");
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        self.pool.reclaim(self.reserved);
        debug!(id = self.id, "shared buffer released");
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("capacity", &self.reserved)
            .finish_non_exhaustive()
    }
}

/// Window onto a shared buffer for one command parameter
#[derive(Debug, Clone, Copy)]
pub struct MemRef<'a> {
    buffer: &'a SharedBuffer,
    offset: usize,
    size: usize,
}

impl<'a> MemRef<'a> {
    pub fn whole(buffer: &'a SharedBuffer) -> Self {
        Self {
            buffer,
            offset: 0,
            size: buffer.len(),
        }
    }

    /// Partial window; rejected when it reaches past the buffer
    pub fn partial(buffer: &'a SharedBuffer, offset: usize, size: usize) -> Result<Self, TeeError> {
        match offset.checked_add(size) {
            Some(end) if end <= buffer.len() => Ok(Self {
                buffer,
                offset,
                size,
            }),
            _ => Err(TeeError::protocol(
                ResultCode::BAD_PARAMETERS,
                ErrorOrigin::Api,
                format!(
                    "memref [{}, +{}) outside buffer {} of {} bytes",
                    offset,
                    size,
                    buffer.id(),
                    buffer.len()
                ),
            )),
        }
    }

    pub fn buffer(&self) -> &'a SharedBuffer {
        self.buffer
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }

    /// Same window shortened to what the service reported writing
    pub fn truncated(&self, size: usize) -> Self {
        Self {
            size: size.min(self.size),
            ..*self
        }
    }
}
