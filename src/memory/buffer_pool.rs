//! Buffer recycling.
//!
//! A [`BufferRecycler`] keeps released buffers and hands them back out when a
//! new request fits one, instead of allocating:
//! - A request fits a candidate when `request.fits_in(&candidate.config())`
//! - Released buffers are reset (attributes, metadata, size) before reuse
//! - At most `max_idle` buffers are kept; extra releases are dropped
//!
//! # Example
//!
//! ```rust,ignore
//! use avbuffer::memory::buffer_pool::BufferRecycler;
//!
//! let recycler = BufferRecycler::new(Default::default());
//! let config = BufferConfig::shared_memory(1920 * 1080 * 3 / 2, MemoryFlag::READ_WRITE);
//!
//! let buffer = recycler.acquire(&config)?;   // allocates
//! recycler.release(buffer);
//! let buffer = recycler.acquire(&config)?;   // reused
//! assert_eq!(recycler.stats().hits, 1);
//! ```

use super::defaults;
use crate::buffer::AvBuffer;
use crate::config::BufferConfig;
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Recycler settings.
#[derive(Debug, Clone)]
pub struct RecyclerConfig {
    /// Most idle buffers kept for reuse.
    pub max_idle: usize,
}

impl Default for RecyclerConfig {
    fn default() -> Self {
        Self {
            max_idle: defaults::RECYCLER_MAX_IDLE,
        }
    }
}

/// Statistics about recycler usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecyclerStats {
    /// Acquisitions served by an idle buffer.
    pub hits: u64,
    /// Acquisitions that allocated.
    pub misses: u64,
    /// Releases dropped because the idle list was full.
    pub dropped: u64,
    /// Buffers currently idle.
    pub idle: usize,
}

/// Keeps released buffers for reuse by compatible requests.
pub struct BufferRecycler {
    config: RecyclerConfig,
    idle: Mutex<VecDeque<AvBuffer>>,
    hits: AtomicU64,
    misses: AtomicU64,
    dropped: AtomicU64,
}

impl BufferRecycler {
    /// Create an empty recycler.
    pub fn new(config: RecyclerConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(VecDeque::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// A buffer satisfying `request`: an idle one if any fits, else a new one.
    pub fn acquire(&self, request: &BufferConfig) -> Result<AvBuffer> {
        let reused = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            idle.iter()
                .position(|candidate| request.fits_in(&candidate.config()))
                .and_then(|index| idle.remove(index))
        };

        match reused {
            Some(buffer) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(uid = buffer.unique_id(), "reused buffer");
                Ok(buffer)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                AvBuffer::from_config(request)
            }
        }
    }

    /// Return a buffer for reuse. Attributes-only buffers are not kept.
    pub fn release(&self, mut buffer: AvBuffer) {
        if buffer.is_attributes_only() {
            return;
        }
        buffer.reset();

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.config.max_idle {
            idle.push_back(buffer);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every idle buffer.
    pub fn clear(&self) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Get recycler statistics.
    pub fn stats(&self) -> RecyclerStats {
        RecyclerStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            idle: self.idle.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }
}

impl Default for BufferRecycler {
    fn default() -> Self {
        Self::new(RecyclerConfig::default())
    }
}

impl std::fmt::Debug for BufferRecycler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRecycler")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryFlag, MemoryType};

    #[test]
    fn test_recycler_reuses_fitting_buffer() {
        let recycler = BufferRecycler::default();
        let config = BufferConfig::shared_memory(4096, MemoryFlag::READ_WRITE);

        let mut buffer = recycler.acquire(&config).unwrap();
        buffer.memory_mut().unwrap().write(b"stale", None);
        buffer.pts = 9;
        let uid = buffer.unique_id();
        recycler.release(buffer);
        assert_eq!(recycler.stats().idle, 1);

        let smaller = BufferConfig::shared_memory(1024, MemoryFlag::READ_ONLY);
        let buffer = recycler.acquire(&smaller).unwrap();
        assert_eq!(buffer.unique_id(), uid);
        assert_eq!(buffer.pts, 0);
        assert_eq!(buffer.memory().unwrap().size(), 0);

        let stats = recycler.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.idle, 0);
    }

    #[test]
    fn test_recycler_allocates_when_nothing_fits() {
        let recycler = BufferRecycler::default();
        recycler.release(recycler.acquire(&BufferConfig::virtual_memory(64)).unwrap());

        let bigger = recycler.acquire(&BufferConfig::virtual_memory(128)).unwrap();
        assert_eq!(bigger.memory().unwrap().capacity(), 128);

        let other_type = BufferConfig::shared_memory(16, MemoryFlag::READ_WRITE);
        let shared = recycler.acquire(&other_type).unwrap();
        assert_eq!(shared.memory().unwrap().memory_type(), MemoryType::Shared);

        assert_eq!(recycler.stats().misses, 3);
        assert_eq!(recycler.stats().idle, 1);
    }

    #[test]
    fn test_recycler_respects_max_idle() {
        let recycler = BufferRecycler::new(RecyclerConfig { max_idle: 2 });
        let config = BufferConfig::virtual_memory(32);
        let buffers: Vec<_> = (0..3).map(|_| recycler.acquire(&config).unwrap()).collect();
        for buffer in buffers {
            recycler.release(buffer);
        }
        let stats = recycler.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.dropped, 1);

        recycler.clear();
        assert_eq!(recycler.stats().idle, 0);
    }

    #[test]
    fn test_recycler_ignores_attributes_only() {
        let recycler = BufferRecycler::default();
        recycler.release(AvBuffer::new());
        assert_eq!(recycler.stats().idle, 0);
    }
}
