//! Share fixed-size disk blocks between threads through a bounded, lock-sharded cache.
//!
//! # Overview
//!
//! A [Cache] keeps copies of recently used disk blocks in a fixed number of slots. Threads look
//! up blocks by [Key] (a device and a block number) and receive a [Buf]: exclusive access to the
//! slot holding the block, for as long as the [Buf] is held. At most one slot ever holds a given
//! block, so every thread reading a block sees the modifications of the previous holder.
//!
//! Writes go straight through to the underlying [disk::Disk]; there are no dirty blocks to flush.
//!
//! # Structure
//!
//! - Referenced slots are found through a hash index split into independently locked buckets,
//!   so lookups of unrelated blocks rarely contend.
//! - Unreferenced slots sit on a single free list ordered by release time. They keep their content
//!   until they are reused, so a block released and requested again is served without any I/O.
//! - When a block is not cached, the least recently released slot is reused.
//!
//! If every slot is referenced, lookups of uncached blocks either fail with [Error::Exhausted] or
//! wait for a slot to be released (see [Exhaustion]).
//!
//! # Example
//!
//! ```rust
//! use bcache::{disk::memory, Cache, Config};
//! use prometheus_client::registry::Registry;
//!
//! let cfg = Config::default();
//! let disk = memory::Disk::new(cfg.block_size);
//! let cache = Cache::new(disk, cfg, &mut Registry::default()).unwrap();
//!
//! // Load a block, modify it, and write it through
//! let mut buf = cache.read(1, 10).unwrap();
//! buf[0] = 42;
//! buf.write().unwrap();
//! buf.release();
//!
//! // The block is still cached
//! let buf = cache.read(1, 10).unwrap();
//! assert_eq!(buf[0], 42);
//! ```

use std::{fmt, num::NonZeroUsize};
use thiserror::Error;

mod cache;
pub mod disk;
mod freelist;
mod index;
mod metrics;
mod pool;
pub mod sleeplock;

pub use cache::{Buf, Cache, Handle, Snapshot};
pub use pool::SlotId;

/// Identifies a block: a device and a block number on that device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub dev: u32,
    pub block: u64,
}

impl Key {
    pub const fn new(dev: u32, block: u64) -> Self {
        Self { dev, block }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dev, self.block)
    }
}

/// What a lookup does when the block is not cached and every slot is referenced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Exhaustion {
    /// Return [Error::Exhausted].
    #[default]
    Fail,

    /// Sleep until some slot is released, then retry.
    Block,
}

/// Configuration for a [Cache].
#[derive(Clone, Debug)]
pub struct Config {
    /// The number of slots.
    pub capacity: NonZeroUsize,

    /// The number of hash buckets the index is split into.
    pub buckets: NonZeroUsize,

    /// The size of every block in bytes (must match the disk).
    pub block_size: NonZeroUsize,

    /// What to do when every slot is referenced.
    pub exhaustion: Exhaustion,
}

impl Config {
    /// Size a cache to fit `bytes` of block payloads.
    ///
    /// Returns `None` if `bytes` cannot hold a single block.
    pub fn from_budget(
        bytes: usize,
        block_size: NonZeroUsize,
        buckets: NonZeroUsize,
    ) -> Option<Self> {
        let capacity = NonZeroUsize::new(bytes / block_size.get())?;
        Some(Self {
            capacity,
            buckets,
            block_size,
            exhaustion: Exhaustion::default(),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(30).unwrap(),
            buckets: NonZeroUsize::new(13).unwrap(),
            block_size: NonZeroUsize::new(1024).unwrap(),
            exhaustion: Exhaustion::Fail,
        }
    }
}

/// Errors that can occur when interacting with a [Cache].
#[derive(Debug, Error)]
pub enum Error {
    #[error("cache exhausted")]
    Exhausted,
    #[error("block size mismatch: cache {cache} disk {disk}")]
    BlockSizeMismatch { cache: usize, disk: usize },
    #[error("disk error: {0}")]
    Disk(#[from] disk::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.capacity.get(), 30);
        assert_eq!(cfg.buckets.get(), 13);
        assert_eq!(cfg.block_size.get(), 1024);
        assert_eq!(cfg.exhaustion, Exhaustion::Fail);
    }

    #[test_case(0, None; "empty budget")]
    #[test_case(1023, None; "below one block")]
    #[test_case(1024, Some(1); "one block")]
    #[test_case(4096 + 100, Some(4); "partial block ignored")]
    fn test_config_from_budget(bytes: usize, expected: Option<usize>) {
        let cfg = Config::from_budget(
            bytes,
            NonZeroUsize::new(1024).unwrap(),
            NonZeroUsize::new(7).unwrap(),
        );
        assert_eq!(cfg.as_ref().map(|cfg| cfg.capacity.get()), expected);
        if let Some(cfg) = cfg {
            assert_eq!(cfg.buckets.get(), 7);
            assert_eq!(cfg.exhaustion, Exhaustion::Fail);
        }
    }

    #[test]
    fn test_key_display_and_order() {
        assert_eq!(Key::new(3, 42).to_string(), "3/42");
        assert!(Key::new(1, 99) < Key::new(2, 0));
        assert!(Key::new(1, 1) < Key::new(1, 2));
    }
}
