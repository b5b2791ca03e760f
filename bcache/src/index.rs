//! The hash index locating cached blocks by [Key].
//!
//! The index is split into independently locked buckets. A block always maps to the same bucket,
//! so holding a bucket's lock serializes every lookup, insertion, and removal of the blocks that
//! hash to it. Threads never hold two bucket locks at once.

use crate::{pool::SlotId, Key};
use spin::{Mutex, MutexGuard};
use std::num::NonZeroUsize;

/// Multiplier used to spread keys across buckets (2^64 divided by the golden ratio).
const MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Map `key` onto one of `buckets` buckets.
///
/// Consecutive block numbers on the same device land in different buckets, as do equal block
/// numbers on different devices.
pub(crate) fn hash(key: Key, buckets: usize) -> usize {
    let mixed = (key.block ^ (u64::from(key.dev) << 40 | u64::from(key.dev))).wrapping_mul(MIX);
    ((mixed >> 32) % buckets as u64) as usize
}

/// An active slot in a [Bucket].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Entry {
    /// The block cached by `slot`.
    pub key: Key,

    /// The slot holding the block.
    pub slot: SlotId,

    /// The number of outstanding references (holders and pins) to `slot`. Always positive for an
    /// indexed entry.
    pub refs: u32,
}

/// The active slots whose keys hash to one bucket.
#[derive(Debug, Default)]
pub(crate) struct Bucket {
    entries: Vec<Entry>,
}

impl Bucket {
    /// Return the entry caching `key`, if any.
    pub(crate) fn find(&mut self, key: Key) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|entry| entry.key == key)
    }

    /// Add `slot` as the cache of `key` with `refs` references.
    ///
    /// # Panics
    ///
    /// Panics if `key` or `slot` is already a member of the bucket.
    pub(crate) fn insert(&mut self, key: Key, slot: SlotId, refs: u32) {
        for entry in &self.entries {
            if entry.key == key {
                panic!("invariant violated: {key} already cached by slot {}", entry.slot);
            }
            if entry.slot == slot {
                panic!("invariant violated: slot {slot} already indexed for {}", entry.key);
            }
        }
        self.entries.push(Entry { key, slot, refs });
    }

    /// Unlink the entry for `key` and return it.
    ///
    /// # Panics
    ///
    /// Panics if `key` is not a member of the bucket.
    pub(crate) fn remove(&mut self, key: Key) -> Entry {
        let Some(position) = self.entries.iter().position(|entry| entry.key == key) else {
            panic!("invariant violated: {key} is not indexed");
        };
        self.entries.swap_remove(position)
    }

    /// The number of active slots in the bucket.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate over the active slots in the bucket (in no particular order).
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }
}

/// A fixed number of spin-locked [Bucket]s.
pub(crate) struct Index {
    buckets: Box<[Mutex<Bucket>]>,
}

impl Index {
    /// Create an index with `buckets` empty buckets, each pre-sized so that the whole pool of
    /// `capacity` slots fits without reallocating when keys spread evenly.
    pub(crate) fn new(buckets: NonZeroUsize, capacity: NonZeroUsize) -> Self {
        let per_bucket = capacity.get().div_ceil(buckets.get());
        let buckets = (0..buckets.get())
            .map(|_| {
                Mutex::new(Bucket {
                    entries: Vec::with_capacity(per_bucket),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { buckets }
    }

    /// The bucket `key` hashes to.
    pub(crate) fn bucket_of(&self, key: Key) -> usize {
        hash(key, self.buckets.len())
    }

    /// Lock the bucket `key` hashes to.
    pub(crate) fn lock(&self, key: Key) -> MutexGuard<'_, Bucket> {
        self.buckets[self.bucket_of(key)].lock()
    }

    /// Lock the bucket at `position`.
    pub(crate) fn lock_at(&self, position: usize) -> MutexGuard<'_, Bucket> {
        self.buckets[position].lock()
    }

    /// The number of buckets.
    pub(crate) fn buckets(&self) -> usize {
        self.buckets.len()
    }
}
