//! A blocking, single-owner lock that may be held across disk I/O.
//!
//! Unlike the short structural locks guarding the hash buckets and the free list (which spin),
//! a [SleepLock] parks waiters on a condition variable until the holder releases it. Ownership is
//! tracked per thread so that callers can ask whether they currently hold the lock
//! ([SleepLock::holding]), which the cache uses to enforce its `write`/`release` contract.

use std::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::{Condvar, Mutex},
    thread::{self, ThreadId},
};

/// A lock that puts contending threads to sleep instead of spinning.
pub struct SleepLock<T> {
    /// The thread currently holding the lock, if any.
    owner: Mutex<Option<ThreadId>>,

    /// Signalled whenever `owner` is cleared.
    released: Condvar,

    /// The protected value.
    data: UnsafeCell<T>,
}

// Access to `data` is serialized by `owner`, exactly like `std::sync::Mutex`.
unsafe impl<T: Send> Send for SleepLock<T> {}
unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// Create a new unlocked [SleepLock] protecting `data`.
    pub fn new(data: T) -> Self {
        Self {
            owner: Mutex::new(None),
            released: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until the lock is owned by the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the lock (it would otherwise sleep forever).
    pub fn acquire(&self) -> SleepGuard<'_, T> {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap();
        if *owner == Some(me) {
            drop(owner);
            panic!("sleep lock already held by the calling thread");
        }
        while owner.is_some() {
            owner = self.released.wait(owner).unwrap();
        }
        *owner = Some(me);
        SleepGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquire the lock only if no other thread holds it.
    #[cfg(test)]
    pub(crate) fn try_acquire(&self) -> Option<SleepGuard<'_, T>> {
        let mut owner = self.owner.lock().unwrap();
        if owner.is_some() {
            return None;
        }
        *owner = Some(thread::current().id());
        Some(SleepGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Returns true if the calling thread holds the lock.
    pub fn holding(&self) -> bool {
        *self.owner.lock().unwrap() == Some(thread::current().id())
    }

    /// Returns true if any thread holds the lock.
    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.owner.lock().unwrap().is_some()
    }

    fn release(&self) {
        let mut owner = self.owner.lock().unwrap();
        if *owner != Some(thread::current().id()) {
            drop(owner);
            panic!("sleep lock released by a thread that does not hold it");
        }
        *owner = None;
        drop(owner);
        self.released.notify_one();
    }
}

impl<T> fmt::Debug for SleepLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SleepLock")
            .field("owner", &*self.owner.lock().unwrap())
            .finish_non_exhaustive()
    }
}

/// Proof that the current thread holds a [SleepLock]. Dropping the guard releases the lock and
/// wakes one waiter.
///
/// The guard cannot be sent to another thread: the lock is owned by the thread that acquired it.
pub struct SleepGuard<'a, T> {
    lock: &'a SleepLock<T>,
    _not_send: PhantomData<*const ()>,
}

// Sharing a `&SleepGuard` only hands out `&T`.
unsafe impl<T: Sync> Sync for SleepGuard<'_, T> {}

impl<T> SleepGuard<'_, T> {
    /// Returns true if the calling thread holds the lock behind this guard.
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<T> Deref for SleepGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    #[test_traced]
    fn test_sleeplock_exclusive() {
        let lock = Arc::new(SleepLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    let mut guard = lock.acquire();
                    // A torn read-modify-write would lose increments
                    let value = *guard;
                    thread::yield_now();
                    *guard = value + 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.acquire(), 8_000);
    }

    #[test_traced]
    fn test_sleeplock_holding() {
        let lock = Arc::new(SleepLock::new(()));
        assert!(!lock.holding());
        assert!(!lock.is_locked());

        let guard = lock.acquire();
        assert!(lock.holding());
        assert!(guard.holding());
        assert!(lock.is_locked());

        // Another thread observes the lock as taken, but not as its own
        let other = {
            let lock = lock.clone();
            thread::spawn(move || {
                (
                    lock.holding(),
                    lock.is_locked(),
                    lock.try_acquire().is_none(),
                )
            })
        };
        assert_eq!(other.join().unwrap(), (false, true, true));

        drop(guard);
        assert!(!lock.holding());
        assert!(lock.try_acquire().is_some());
    }

    #[test_traced]
    fn test_sleeplock_waiter_sleeps_until_release() {
        let lock = Arc::new(SleepLock::new(0u8));
        let acquired = Arc::new(AtomicBool::new(false));

        let mut guard = lock.acquire();
        let waiter = {
            let lock = lock.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                let guard = lock.acquire();
                acquired.store(true, Ordering::SeqCst);
                *guard
            })
        };

        // The waiter cannot proceed while we hold the lock
        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        // Publish a value and release
        *guard = 42;
        drop(guard);
        assert_eq!(waiter.join().unwrap(), 42);
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "already held by the calling thread")]
    fn test_sleeplock_reacquire_panics() {
        let lock = SleepLock::new(());
        let _guard = lock.acquire();
        let _again = lock.acquire();
    }
}
