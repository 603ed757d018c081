//! Read/write lock with atomic writer-to-reader downgrade.
//!
//! `std::sync::RwLock` cannot convert a held write lock into a read lock
//! without an unlocked gap in between, and that gap is exactly what the
//! refresh path must close: the thread that just rewrote the table has to
//! become a reader of its own data before any other writer can get in.
//! This lock is built from a `Mutex` + `Condvar` pair and exposes the
//! transition as [`WriteGuard::downgrade`].
//!
//! Writers are preferred: once a writer is queued, new readers wait behind
//! it, so a writer cannot be starved by a steady stream of readers.
//! Acquisitions are not reentrant; a thread must drop its read guard
//! before requesting the write lock, or it will deadlock.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug)]
struct LockState {
    /// Live read guards.
    readers: usize,
    /// Whether a write guard is live.
    writer: bool,
    /// Writers blocked in `write()`. New readers queue behind them.
    writers_waiting: usize,
}

/// Multiple-reader/single-writer lock supporting lock downgrade.
pub struct DowngradeRwLock<T> {
    state: Mutex<LockState>,
    cv: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is mediated by the reader/writer protocol. A
// `WriteGuard` exists only while `writer` is set and `readers == 0`, and
// `ReadGuard`s only hand out shared references.
unsafe impl<T: Send> Send for DowngradeRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for DowngradeRwLock<T> {}

impl<T> DowngradeRwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(LockState {
                readers: 0,
                writer: false,
                writers_waiting: 0,
            }),
            cv: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Locks the internal state, recovering from poisoning.
    ///
    /// The state only holds counters, so it is consistent even if a thread
    /// panicked while its guard was live. Recovery also keeps the guard
    /// `Drop` impls from panicking mid-unwind, which would abort.
    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, LockState>) -> MutexGuard<'a, LockState> {
        match self.cv.wait(guard) {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    /// Acquires the lock in shared mode.
    ///
    /// Blocks while a writer is live or queued.
    pub fn read(&self) -> ReadGuard<'_, T> {
        let mut st = self.lock_state();
        while st.writer || st.writers_waiting > 0 {
            st = self.wait(st);
        }
        st.readers += 1;
        drop(st);
        ReadGuard { lock: self }
    }

    /// Acquires the lock in exclusive mode.
    ///
    /// Blocks until every read and write guard is gone.
    pub fn write(&self) -> WriteGuard<'_, T> {
        let mut st = self.lock_state();
        st.writers_waiting += 1;
        while st.writer || st.readers > 0 {
            st = self.wait(st);
        }
        st.writers_waiting -= 1;
        st.writer = true;
        drop(st);
        WriteGuard { lock: self }
    }
}

/// Shared access to the locked data. Dropping the guard releases the lock.
#[must_use = "the read lock is held until the guard is dropped"]
pub struct ReadGuard<'a, T> {
    lock: &'a DowngradeRwLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a live ReadGuard keeps `readers > 0`, which excludes any
        // WriteGuard, so shared access cannot race a mutation.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut st = self.lock.lock_state();
        st.readers -= 1;
        let wake = st.readers == 0;
        drop(st);
        if wake {
            self.lock.cv.notify_all();
        }
    }
}

/// Exclusive access to the locked data. Dropping the guard releases the
/// lock; [`WriteGuard::downgrade`] converts it into a read hold instead.
#[must_use = "the write lock is held until the guard is dropped"]
pub struct WriteGuard<'a, T> {
    lock: &'a DowngradeRwLock<T>,
}

impl<'a, T> WriteGuard<'a, T> {
    /// Atomically converts this write hold into a read hold.
    ///
    /// The reader is registered in the same critical section that clears
    /// the writer flag, so no other writer can acquire the lock in
    /// between. Queued writers stay blocked until the returned guard is
    /// dropped; blocked readers are admitted unless a writer is queued.
    pub fn downgrade(self) -> ReadGuard<'a, T> {
        let lock = self.lock;
        {
            let mut st = lock.lock_state();
            st.writer = false;
            st.readers += 1;
        }
        lock.cv.notify_all();
        std::mem::forget(self);
        ReadGuard { lock }
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a live WriteGuard is exclusive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: a live WriteGuard is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut st = self.lock.lock_state();
        st.writer = false;
        drop(st);
        self.lock.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_read_guards_coexist() {
        let lock = DowngradeRwLock::new(7);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a, 7);
        assert_eq!(*b, 7);
    }

    #[test]
    fn test_write_guard_mutates() {
        let lock = DowngradeRwLock::new(0);
        {
            let mut w = lock.write();
            *w = 42;
        }
        assert_eq!(*lock.read(), 42);
    }

    #[test]
    fn test_writer_waits_for_reader() {
        let lock = Arc::new(DowngradeRwLock::new(0));
        let r = lock.read();

        let entered = Arc::new(AtomicBool::new(false));
        let th = {
            let lock = Arc::clone(&lock);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let mut w = lock.write();
                entered.store(true, Ordering::SeqCst);
                *w = 1;
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst), "writer should be blocked");

        drop(r);
        th.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert_eq!(*lock.read(), 1);
    }

    #[test]
    fn test_reader_waits_for_writer() {
        let lock = Arc::new(DowngradeRwLock::new(0));
        let w = lock.write();

        let entered = Arc::new(AtomicBool::new(false));
        let th = {
            let lock = Arc::clone(&lock);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let r = lock.read();
                entered.store(true, Ordering::SeqCst);
                *r
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst), "reader should be blocked");

        drop(w);
        th.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_downgrade_keeps_other_writers_out() {
        let lock = Arc::new(DowngradeRwLock::new(0));
        let w = lock.write();

        let entered = Arc::new(AtomicBool::new(false));
        let th = {
            let lock = Arc::clone(&lock);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let mut w = lock.write();
                entered.store(true, Ordering::SeqCst);
                *w = 99;
            })
        };

        // Let the second writer queue up, then downgrade.
        thread::sleep(Duration::from_millis(50));
        let r = w.downgrade();
        assert_eq!(*r, 0, "downgraded reader must see its own write state");

        thread::sleep(Duration::from_millis(50));
        assert!(
            !entered.load(Ordering::SeqCst),
            "queued writer must wait for the downgraded reader"
        );

        drop(r);
        th.join().unwrap();
        assert_eq!(*lock.read(), 99);
    }

    #[test]
    fn test_queued_writer_goes_before_new_readers() {
        let lock = Arc::new(DowngradeRwLock::new(0));
        let r = lock.read();

        let order = Arc::new(AtomicUsize::new(0));
        let writer_turn = Arc::new(AtomicUsize::new(0));
        let writer = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            let writer_turn = Arc::clone(&writer_turn);
            thread::spawn(move || {
                let mut w = lock.write();
                writer_turn.store(order.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
                *w = 1;
            })
        };

        // Writer is queued; a newly arriving reader must wait behind it.
        thread::sleep(Duration::from_millis(50));
        let reader_turn = Arc::new(AtomicUsize::new(0));
        let reader = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            let reader_turn = Arc::clone(&reader_turn);
            thread::spawn(move || {
                let r = lock.read();
                reader_turn.store(order.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
                *r
            })
        };

        thread::sleep(Duration::from_millis(50));
        drop(r);
        writer.join().unwrap();
        reader.join().unwrap();

        assert_eq!(writer_turn.load(Ordering::SeqCst), 1);
        assert_eq!(reader_turn.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_stress() {
        let lock = Arc::new(DowngradeRwLock::new(0u64));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..200 {
                        if i % 2 == 0 {
                            let mut w = lock.write();
                            *w += 1;
                        } else {
                            let r = lock.read();
                            let _ = *r;
                        }
                        thread::yield_now();
                    }
                })
            })
            .collect();

        for th in threads {
            th.join().unwrap();
        }
        assert_eq!(*lock.read(), 4 * 200);
    }
}
