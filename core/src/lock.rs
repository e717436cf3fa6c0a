//! Spin-based locks guarding the cache.
//!
//! [`MajorMinorLock`] is a multiple-reader/single-writer lock: any number of
//! *minor* (shared) holders may coexist, a *major* (exclusive) holder excludes
//! everyone. Both fields of its bookkeeping (the major flag and the minor
//! counter) live behind one atomically swapped state word, and a thread that
//! cannot make progress yields and retries instead of parking.
//!
//! The lock is not fair. A major acquirer first registers itself and then
//! waits for the minor count to drain; readers arriving after registration
//! are turned away, but a reader that wins the state word in the same instant
//! the writer is registering gets in once more. A saturated stream of readers
//! can therefore starve a writer, and a writer that never releases starves all
//! readers. There are no timeouts.
//!
//! [`SpinMutex`] is the plain mutual-exclusion variant.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

const UNLOCKED: u32 = 0;
const BUSY: u32 = 1;

#[derive(Debug, Default)]
struct Registry {
    major: bool,
    minors: u32,
}

pub struct MajorMinorLock<T> {
    state: AtomicU32,
    registry: UnsafeCell<Registry>,
    data: UnsafeCell<T>,
}

// The registry is only touched while `state` is BUSY and `data` only through
// guards, which follow the usual reader/writer exclusion rules.
unsafe impl<T: Send> Send for MajorMinorLock<T> {}
unsafe impl<T: Send + Sync> Sync for MajorMinorLock<T> {}

impl<T: Default> Default for MajorMinorLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> MajorMinorLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            registry: UnsafeCell::new(Registry::default()),
            data: UnsafeCell::new(data),
        }
    }

    /// Runs `f` with exclusive access to the registry.
    fn with_registry<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        while self
            .state
            .compare_exchange_weak(UNLOCKED, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            thread::yield_now();
        }
        // SAFETY: winning the CAS above makes us the only thread inside the
        // busy section until the store below.
        let out = f(unsafe { &mut *self.registry.get() });
        self.state.store(UNLOCKED, Ordering::Release);
        out
    }

    /// Shared acquire. Blocks only while a major holder is active or registered.
    pub fn minor(&self) -> MinorGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_minor() {
                return guard;
            }
            thread::yield_now();
        }
    }

    /// Single shared acquire attempt.
    pub fn try_minor(&self) -> Option<MinorGuard<'_, T>> {
        let granted = self.with_registry(|reg| {
            if reg.major {
                false
            } else {
                reg.minors += 1;
                true
            }
        });
        granted.then(|| MinorGuard { lock: self })
    }

    /// Exclusive acquire.
    ///
    /// Registers as the major holder as soon as no other major holder is
    /// present, then waits for the already granted minor holders to release.
    pub fn major(&self) -> MajorGuard<'_, T> {
        let mut registered = false;
        loop {
            let granted = self.with_registry(|reg| {
                if !registered && !reg.major {
                    reg.major = true;
                    registered = true;
                }
                registered && reg.minors == 0
            });
            if granted {
                return MajorGuard { lock: self };
            }
            thread::yield_now();
        }
    }

    /// Number of live minor holders.
    pub fn minor_holders(&self) -> u32 {
        self.with_registry(|reg| reg.minors)
    }

    /// Whether a major holder is active or waiting for readers to drain.
    pub fn major_registered(&self) -> bool {
        self.with_registry(|reg| reg.major)
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn release_minor(&self) {
        self.with_registry(|reg| reg.minors = reg.minors.saturating_sub(1));
    }

    fn release_major(&self) {
        self.with_registry(|reg| reg.major = false);
    }
}

pub struct MinorGuard<'a, T> {
    lock: &'a MajorMinorLock<T>,
}

impl<T> Deref for MinorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: minor holders exclude a granted major holder.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for MinorGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_minor();
    }
}

pub struct MajorGuard<'a, T> {
    lock: &'a MajorMinorLock<T>,
}

impl<T> Deref for MajorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a granted major holder is alone.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for MajorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: a granted major holder is alone.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for MajorGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_major();
    }
}

/// Mutual exclusion only, same spin-and-yield strategy.
pub struct SpinMutex<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T: Default> Default for SpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> SpinMutex<T> {
    pub fn new(data: T) -> Self {
        Self { state: AtomicU32::new(UNLOCKED), data: UnsafeCell::new(data) }
    }

    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        while self
            .state
            .compare_exchange_weak(UNLOCKED, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            thread::yield_now();
        }
        SpinMutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        self.state
            .compare_exchange(UNLOCKED, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinMutexGuard { mutex: self })
    }
}

pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard owns the BUSY state.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard owns the BUSY state.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.state.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    #[test]
    fn parallel_minor_holders_coexist() {
        let lock = Arc::new(MajorMinorLock::new(7u32));
        let n = 8;
        let barrier = Arc::new(Barrier::new(n));
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let guard = lock.minor();
                    // every reader holds its guard while waiting for the others
                    barrier.wait();
                    *guard
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 7);
        }
        assert_eq!(lock.minor_holders(), 0);
    }

    #[test]
    fn pending_major_blocks_later_minors_and_waits_for_earlier_ones() {
        let lock = Arc::new(MajorMinorLock::new(0u32));
        let early = lock.minor();

        let granted = Arc::new(AtomicBool::new(false));
        let writer = {
            let lock = Arc::clone(&lock);
            let granted = Arc::clone(&granted);
            thread::spawn(move || {
                let mut guard = lock.major();
                granted.store(true, Ordering::SeqCst);
                *guard += 1;
            })
        };

        while !lock.major_registered() {
            thread::yield_now();
        }
        assert!(lock.try_minor().is_none());
        thread::sleep(Duration::from_millis(20));
        assert!(!granted.load(Ordering::SeqCst));

        drop(early);
        writer.join().unwrap();
        assert!(granted.load(Ordering::SeqCst));
        assert_eq!(*lock.minor(), 1);
        assert!(!lock.major_registered());
    }

    #[test]
    fn majors_exclude_each_other() {
        let lock = Arc::new(MajorMinorLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut g = lock.major();
                        let v = *g;
                        thread::yield_now();
                        *g = v + 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.minor(), 4000);
    }

    #[test]
    fn spin_mutex_serializes() {
        let m = Arc::new(SpinMutex::new(Vec::new()));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let m = Arc::clone(&m);
                thread::spawn(move || m.lock().push(i))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.lock().len(), 4);
        let held = m.lock();
        assert!(m.try_lock().is_none());
        drop(held);
        assert!(m.try_lock().is_some());
    }
}
