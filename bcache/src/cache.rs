//! The cache manager: the lookup, install, and release protocol tying the [Pool], [Index], and
//! [FreeList] together.
//!
//! # Locking
//!
//! Three kinds of locks are involved:
//!
//! - One spin lock per hash bucket, guarding bucket membership and the reference counts of the
//!   slots in it.
//! - One spin lock over the free list.
//! - One [crate::sleeplock::SleepLock] per slot, guarding its payload.
//!
//! Spin locks are only held across bookkeeping: never across disk I/O and never while waiting for
//! a sleep lock. A thread holds at most one bucket lock at a time and may take the free list lock
//! while holding it (never the reverse).
//!
//! # Misses
//!
//! A miss keeps the destination bucket locked from the lookup until the victim slot is inserted,
//! so two threads can never install the same block twice. When no victim is available and the
//! cache is configured to wait ([Exhaustion::Block]), every lock is dropped before sleeping and the
//! lookup starts over once a slot is released (another thread may have installed the block in the
//! meantime).

use crate::{
    disk::Disk,
    freelist::FreeList,
    index::{Bucket, Entry, Index},
    metrics::Metrics,
    pool::{Pool, SlotId},
    sleeplock::SleepGuard,
    Config, Error, Exhaustion, Key,
};
use prometheus_client::registry::Registry;
use spin::Mutex;
use std::{
    fmt,
    ops::{Deref, DerefMut},
    ptr,
    sync::{Condvar, Mutex as StdMutex},
};
use tracing::{debug, error, trace, warn};

/// A bounded cache of disk blocks shared by many threads.
///
/// Blocks are handed out as [Buf]s: a [Buf] gives its holder exclusive access to the block's
/// payload until it is released (or dropped). Any number of threads may wait for the same block;
/// they are served one at a time, from the same slot.
pub struct Cache<D: Disk> {
    cfg: Config,
    disk: D,

    pool: Pool,
    index: Index,
    free: Mutex<FreeList>,

    /// Lookups waiting for a free slot park here (only with [Exhaustion::Block]).
    waiting: StdMutex<()>,
    released: Condvar,

    metrics: Metrics,
}

impl<D: Disk> Cache<D> {
    /// Allocate a cache of `cfg.capacity` slots in front of `disk`, registering its metrics in
    /// `registry`. Every slot starts out free.
    pub fn new(disk: D, cfg: Config, registry: &mut Registry) -> Result<Self, Error> {
        if disk.block_size() != cfg.block_size.get() {
            return Err(Error::BlockSizeMismatch {
                cache: cfg.block_size.get(),
                disk: disk.block_size(),
            });
        }

        let pool = Pool::new(cfg.capacity, cfg.block_size);
        let index = Index::new(cfg.buckets, cfg.capacity);
        let free = FreeList::new(pool.len());
        let metrics = Metrics::new(registry);
        metrics.free.set(free.len() as i64);
        debug!(
            capacity = pool.len(),
            buckets = index.buckets(),
            block_size = pool.block_size(),
            "initialized cache"
        );

        Ok(Self {
            cfg,
            disk,
            pool,
            index,
            free: Mutex::new(free),
            waiting: StdMutex::new(()),
            released: Condvar::new(),
            metrics,
        })
    }

    /// The configuration the cache was created with.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// The number of slots in the cache.
    pub fn capacity(&self) -> usize {
        self.pool.len()
    }

    /// The disk behind the cache.
    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// Return the slot caching block `block` of device `dev`, with its reference count
    /// incremented and its payload locked by the caller.
    ///
    /// The payload is only meaningful if it was loaded before (use [Cache::read] to load it when
    /// needed). Blocks until any other holder of the block releases it.
    ///
    /// # Errors
    ///
    /// Returns [Error::Exhausted] if the block is not cached and every slot is referenced (unless
    /// the cache is configured with [Exhaustion::Block], in which case the caller waits for a
    /// slot to be released).
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the block.
    pub fn get(&self, dev: u32, block: u64) -> Result<Buf<'_, D>, Error> {
        let key = Key::new(dev, block);
        loop {
            let mut bucket = self.index.lock(key);

            // Someone else references the block: share its slot
            if let Some(entry) = bucket.find(key) {
                entry.refs += 1;
                let slot = entry.slot;
                drop(bucket);
                self.metrics.hits.inc();
                trace!(%key, %slot, "hit");
                return Ok(self.hold(key, slot));
            }

            let mut free = self.free.lock();

            // The block was released but its slot has not been reused yet
            if let Some(slot) = free.take(key) {
                self.metrics.free.set(free.len() as i64);
                drop(free);
                bucket.insert(key, slot, 1);
                drop(bucket);
                self.metrics.active.inc();
                self.metrics.hits.inc();
                trace!(%key, %slot, "revived");
                return Ok(self.hold(key, slot));
            }

            // Reuse the least recently released slot
            if let Some((slot, evicted)) = free.pop_back() {
                self.metrics.free.set(free.len() as i64);
                drop(free);

                // Nothing references the victim, so its payload can be disowned before the slot
                // becomes visible under its new key.
                self.pool.get(slot).set_valid(false);
                bucket.insert(key, slot, 1);
                drop(bucket);
                self.metrics.active.inc();
                self.metrics.misses.inc();
                match evicted {
                    Some(evicted) => {
                        self.metrics.evictions.inc();
                        debug!(%key, %evicted, %slot, "evicted");
                    }
                    None => trace!(%key, %slot, "installed"),
                }
                return Ok(self.hold(key, slot));
            }

            // Every slot is referenced
            let pushes = free.pushes();
            drop(free);
            drop(bucket);
            self.metrics.exhausted.inc();
            match self.cfg.exhaustion {
                Exhaustion::Fail => {
                    warn!(%key, capacity = self.capacity(), "no free slot");
                    return Err(Error::Exhausted);
                }
                Exhaustion::Block => {
                    debug!(%key, "waiting for a free slot");
                    self.wait_for_release(pushes);
                }
            }
        }
    }

    /// Return a [Buf] holding the content of block `block` of device `dev`, loading it from the
    /// disk if the cache does not hold it yet.
    ///
    /// If the load fails, the slot is released (and remains unloaded) before the error is
    /// returned.
    pub fn read(&self, dev: u32, block: u64) -> Result<Buf<'_, D>, Error> {
        let mut buf = self.get(dev, block)?;
        let slot = self.pool.get(buf.slot);
        if !slot.is_valid() {
            if let Err(err) = self.disk.read_block(dev, block, &mut buf.page[..]) {
                error!(key = %buf.key, ?err, "failed to read block");
                return Err(err.into());
            }
            slot.set_valid(true);
            self.metrics.reads.inc();
        }
        Ok(buf)
    }

    /// Write the payload of `buf` through to the disk.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold `buf` or `buf` belongs to another cache.
    pub fn write(&self, buf: &Buf<'_, D>) -> Result<(), Error> {
        self.check_held(buf, "write");
        if let Err(err) = self
            .disk
            .write_block(buf.key.dev, buf.key.block, &buf.page[..])
        {
            error!(key = %buf.key, ?err, "failed to write block");
            return Err(err.into());
        }

        // The payload now matches the disk, even if it was never loaded
        self.pool.get(buf.slot).set_valid(true);
        self.metrics.writes.inc();
        Ok(())
    }

    /// Give up `buf`. Once the last reference to a slot is gone, the slot moves to the head of the
    /// free list (keeping its content until it is reused).
    ///
    /// Dropping a [Buf] has the same effect.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold `buf` or `buf` belongs to another cache.
    pub fn release(&self, buf: Buf<'_, D>) {
        self.check_held(&buf, "release");
        drop(buf);
    }

    /// Take an extra reference to a slot without taking exclusive access, preventing it from
    /// being reused until [Cache::unpin] is called.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not referenced (pins can only be taken on a held or pinned slot).
    pub fn pin(&self, handle: Handle) {
        let mut bucket = self.index.lock(handle.key);
        let entry = Self::entry(&mut bucket, handle);
        entry.refs += 1;
        trace!(key = %handle.key, slot = %handle.slot, refs = entry.refs, "pinned");
    }

    /// Drop a reference taken by [Cache::pin].
    ///
    /// If the pin was the last reference (its holder already released the block), the slot moves
    /// to the head of the free list just as if it had been released.
    ///
    /// # Panics
    ///
    /// Panics if the slot is no longer referenced.
    pub fn unpin(&self, handle: Handle) {
        trace!(key = %handle.key, slot = %handle.slot, "unpinning");
        self.unref(handle);
    }

    /// Capture the content of every bucket and the free list.
    ///
    /// Buckets are visited one at a time, so the result is only a consistent picture of the cache
    /// when no other thread is using it.
    pub fn snapshot(&self) -> Snapshot {
        let mut buckets = Vec::with_capacity(self.index.buckets());
        for position in 0..self.index.buckets() {
            let bucket = self.index.lock_at(position);
            buckets.push(
                bucket
                    .iter()
                    .map(|entry| (entry.key, entry.slot, entry.refs))
                    .collect(),
            );
        }
        let free = self.free.lock().iter().collect();
        Snapshot { buckets, free }
    }

    /// Log the content of every bucket and the free list.
    pub fn dump(&self) {
        debug!(state = %self.snapshot(), "cache state");
    }

    fn hold(&self, key: Key, slot: SlotId) -> Buf<'_, D> {
        let page = self.pool.get(slot).page().acquire();
        Buf {
            cache: self,
            key,
            slot,
            page,
        }
    }

    fn entry(bucket: &mut Bucket, handle: Handle) -> &mut Entry {
        let Some(entry) = bucket.find(handle.key) else {
            panic!("invariant violated: {} is not indexed", handle.key);
        };
        if entry.slot != handle.slot {
            panic!(
                "invariant violated: {} is cached by slot {} not {}",
                handle.key, entry.slot, handle.slot
            );
        }
        entry
    }

    fn check_held(&self, buf: &Buf<'_, D>, op: &str) {
        if !ptr::eq(buf.cache, self) {
            panic!("{op}: buffer for {} belongs to another cache", buf.key);
        }
        if !buf.page.holding() {
            panic!("{op}: exclusive access to {} not held", buf.key);
        }
    }

    /// Drop one reference, moving the slot to the free list when it was the last. On release this
    /// runs while the caller still holds the payload lock.
    fn unref(&self, handle: Handle) {
        let mut bucket = self.index.lock(handle.key);
        let entry = Self::entry(&mut bucket, handle);
        entry.refs -= 1;
        if entry.refs > 0 {
            return;
        }
        bucket.remove(handle.key);
        let mut free = self.free.lock();
        free.push_front(handle.slot, Some(handle.key));
        self.metrics.free.set(free.len() as i64);
        drop(free);
        drop(bucket);
        self.metrics.active.dec();
        trace!(key = %handle.key, slot = %handle.slot, "released");

        if self.cfg.exhaustion == Exhaustion::Block {
            drop(self.waiting.lock().unwrap());
            self.released.notify_all();
        }
    }

    /// Sleep until the free list has seen a push since it had performed `seen` pushes.
    fn wait_for_release(&self, seen: u64) {
        let mut waiting = self.waiting.lock().unwrap();
        loop {
            let pushes = self.free.lock().pushes();
            if pushes != seen {
                return;
            }
            waiting = self.released.wait(waiting).unwrap();
        }
    }
}

/// A block held by the calling thread.
///
/// Dereferences to the block payload. The holder has exclusive access to the payload until the
/// [Buf] is released with [Cache::release] or dropped.
pub struct Buf<'a, D: Disk> {
    cache: &'a Cache<D>,
    key: Key,
    slot: SlotId,
    page: SleepGuard<'a, Box<[u8]>>,
}

impl<D: Disk> Buf<'_, D> {
    /// The block held.
    pub fn key(&self) -> Key {
        self.key
    }

    /// The slot caching the block.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// A handle that can be used to [Cache::pin] the slot (from any thread).
    pub fn handle(&self) -> Handle {
        Handle {
            key: self.key,
            slot: self.slot,
        }
    }

    /// Write the payload through to the disk (see [Cache::write]).
    pub fn write(&self) -> Result<(), Error> {
        self.cache.write(self)
    }

    /// Release the block (see [Cache::release]).
    pub fn release(self) {
        self.cache.release(self);
    }
}

impl<D: Disk> Deref for Buf<'_, D> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.page
    }
}

impl<D: Disk> DerefMut for Buf<'_, D> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.page
    }
}

impl<D: Disk> fmt::Debug for Buf<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("key", &self.key)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl<D: Disk> Drop for Buf<'_, D> {
    fn drop(&mut self) {
        // `page` (and with it the payload lock) is only released after the bookkeeping is done.
        self.cache.unref(self.handle());
    }
}

/// Identifies a referenced slot for [Cache::pin] and [Cache::unpin].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    key: Key,
    slot: SlotId,
}

impl Handle {
    /// The block cached by the slot.
    pub fn key(&self) -> Key {
        self.key
    }

    /// The slot.
    pub fn slot(&self) -> SlotId {
        self.slot
    }
}

/// The membership of every bucket and the free list at some point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// For each bucket, the referenced slots in it (with their reference counts).
    pub buckets: Vec<Vec<(Key, SlotId, u32)>>,

    /// The free list from head (most recently released) to tail (next victim), with the block
    /// each slot still holds.
    pub free: Vec<(SlotId, Option<Key>)>,
}

impl Snapshot {
    /// The number of referenced slots.
    pub fn active(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// The reference count of `key`, if it is referenced.
    pub fn refs(&self, key: Key) -> Option<u32> {
        self.entry(key).map(|(_, _, refs)| *refs)
    }

    /// The slot caching `key`, whether referenced or free.
    pub fn slot(&self, key: Key) -> Option<SlotId> {
        self.entry(key).map(|(_, slot, _)| *slot).or_else(|| {
            self.free
                .iter()
                .find(|(_, retained)| *retained == Some(key))
                .map(|(slot, _)| *slot)
        })
    }

    /// Returns true if `slot` is on the free list.
    pub fn is_free(&self, slot: SlotId) -> bool {
        self.free.iter().any(|(free, _)| *free == slot)
    }

    fn entry(&self, key: Key) -> Option<&(Key, SlotId, u32)> {
        self.buckets
            .iter()
            .flatten()
            .find(|(cached, _, _)| *cached == key)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "buckets:")?;
        for (position, bucket) in self.buckets.iter().enumerate() {
            write!(f, "{position}\t")?;
            for (key, slot, refs) in bucket {
                write!(f, "{key}({slot} refs={refs}) ")?;
            }
            writeln!(f)?;
        }
        write!(f, "free:\t")?;
        for (slot, key) in &self.free {
            match key {
                Some(key) => write!(f, "{slot}({key}) ")?,
                None => write!(f, "{slot} ")?,
            }
        }
        Ok(())
    }
}
