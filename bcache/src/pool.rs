//! The fixed arena of block buffers backing the cache.

use crate::sleeplock::SleepLock;
use std::{
    fmt,
    num::NonZeroUsize,
    sync::atomic::{AtomicBool, Ordering},
};

/// Stable address of a slot in the [Pool]. Slots never move, so two [SlotId]s are equal if and
/// only if they name the same buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(usize);

impl SlotId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The position of the slot in the pool.
    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One in-memory block buffer.
pub(crate) struct Slot {
    /// Whether `page` holds the content of the block currently assigned to the slot.
    ///
    /// Cleared under the destination bucket lock when the slot is handed to a new block (at that
    /// point no thread references the slot), and otherwise only written by the holder of `page`.
    valid: AtomicBool,

    /// The block payload, guarded by the exclusive-access lock.
    page: SleepLock<Box<[u8]>>,
}

impl Slot {
    fn new(block_size: usize) -> Self {
        Self {
            valid: AtomicBool::new(false),
            page: SleepLock::new(vec![0u8; block_size].into_boxed_slice()),
        }
    }

    pub(crate) fn page(&self) -> &SleepLock<Box<[u8]>> {
        &self.page
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }
}

/// A fixed-capacity array of [Slot]s allocated once at startup.
pub(crate) struct Pool {
    slots: Box<[Slot]>,
    block_size: usize,
}

impl Pool {
    /// Allocate `capacity` zeroed slots of `block_size` bytes each.
    pub(crate) fn new(capacity: NonZeroUsize, block_size: NonZeroUsize) -> Self {
        let block_size = block_size.get();
        let slots = (0..capacity.get())
            .map(|_| Slot::new(block_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots, block_size }
    }

    /// Resolve a [SlotId] to its slot.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not issued by this pool.
    pub(crate) fn get(&self, id: SlotId) -> &Slot {
        &self.slots[id.index()]
    }

    /// The number of slots in the pool.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }
}
