// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC

//! Testing [`TestNopSyncTypes`] and [`Future`](future::Future) polling
//! helpers.
//!
//! The nop locks don't spin or block: contention is considered a bug in the
//! single-threaded unit tests using them and makes them panic. In
//! particular, recursive locking gets caught that way.

extern crate alloc;
use alloc::sync;

use crate::sync_types;
use core::{cell, convert, future, marker, ops, pin, sync::atomic, task};

/// Dummy [`Lock`](sync_types::Lock) for testing purposes.
///
/// Any attempt to lock an already locked `TestNopLock` will panic.
pub struct TestNopLock<T: marker::Send> {
    locked: atomic::AtomicBool,
    v: cell::UnsafeCell<T>,
}

impl<T: marker::Send> convert::From<T> for TestNopLock<T> {
    fn from(value: T) -> Self {
        Self {
            locked: atomic::AtomicBool::new(false),
            v: cell::UnsafeCell::new(value),
        }
    }
}

// Safety: access to the inner value is serialized through the locked flag.
unsafe impl<T: marker::Send> marker::Send for TestNopLock<T> {}
unsafe impl<T: marker::Send> marker::Sync for TestNopLock<T> {}

impl<T: marker::Send> sync_types::Lock<T> for TestNopLock<T> {
    type Guard<'a>
        = TestNopLockGuard<'a, T>
    where
        Self: 'a;

    fn lock(&self) -> Self::Guard<'_> {
        assert!(
            self.locked
                .compare_exchange(false, true, atomic::Ordering::Acquire, atomic::Ordering::Relaxed)
                .is_ok(),
            "TestNopLock contended, recursive locking?"
        );
        TestNopLockGuard { lock: self }
    }
}

impl<T: marker::Send> sync_types::ConstructibleLock<T> for TestNopLock<T> {
    fn get_mut(&mut self) -> &mut T {
        self.v.get_mut()
    }
}

/// The [locking guard](sync_types::Lock::Guard) associated with
/// [`TestNopLock`].
pub struct TestNopLockGuard<'a, T: marker::Send> {
    lock: &'a TestNopLock<T>,
}

impl<'a, T: marker::Send> Drop for TestNopLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, atomic::Ordering::Release);
    }
}

impl<'a, T: marker::Send> ops::Deref for TestNopLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: the guard's existence implies exclusive access.
        unsafe { &*self.lock.v.get() }
    }
}

impl<'a, T: marker::Send> ops::DerefMut for TestNopLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: the guard's existence implies exclusive access.
        unsafe { &mut *self.lock.v.get() }
    }
}

/// Dummy [`RwLock`](sync_types::RwLock) for testing purposes.
///
/// Readers may share the lock. Any attempt to write-lock a locked
/// `TestNopRwLock` or to read-lock a write-locked one will panic.
pub struct TestNopRwLock<T: marker::Send + marker::Sync> {
    /// Number of readers, or -1 if write locked.
    state: atomic::AtomicIsize,
    v: cell::UnsafeCell<T>,
}

impl<T: marker::Send + marker::Sync> convert::From<T> for TestNopRwLock<T> {
    fn from(value: T) -> Self {
        Self {
            state: atomic::AtomicIsize::new(0),
            v: cell::UnsafeCell::new(value),
        }
    }
}

// Safety: access to the inner value is serialized through the state counter.
unsafe impl<T: marker::Send + marker::Sync> marker::Send for TestNopRwLock<T> {}
unsafe impl<T: marker::Send + marker::Sync> marker::Sync for TestNopRwLock<T> {}

impl<T: marker::Send + marker::Sync> sync_types::RwLock<T> for TestNopRwLock<T> {
    type ReadGuard<'a>
        = TestNopRwLockReadGuard<'a, T>
    where
        Self: 'a;
    type WriteGuard<'a>
        = TestNopRwLockWriteGuard<'a, T>
    where
        Self: 'a;

    fn read(&self) -> Self::ReadGuard<'_> {
        assert!(
            self.state.fetch_add(1, atomic::Ordering::Acquire) >= 0,
            "TestNopRwLock read-locked while write-locked."
        );
        TestNopRwLockReadGuard { lock: self }
    }

    fn write(&self) -> Self::WriteGuard<'_> {
        assert!(
            self.state
                .compare_exchange(0, -1, atomic::Ordering::Acquire, atomic::Ordering::Relaxed)
                .is_ok(),
            "TestNopRwLock contended, recursive locking?"
        );
        TestNopRwLockWriteGuard { lock: self }
    }

    fn get_mut(&mut self) -> &mut T {
        self.v.get_mut()
    }
}

/// The [read lock guard](sync_types::RwLock::ReadGuard) associated with
/// [`TestNopRwLock`].
pub struct TestNopRwLockReadGuard<'a, T: marker::Send + marker::Sync> {
    lock: &'a TestNopRwLock<T>,
}

impl<'a, T: marker::Send + marker::Sync> Drop for TestNopRwLockReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, atomic::Ordering::Release);
    }
}

impl<'a, T: marker::Send + marker::Sync> ops::Deref for TestNopRwLockReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: no writer can exist while the read guard is alive.
        unsafe { &*self.lock.v.get() }
    }
}

/// The [write lock guard](sync_types::RwLock::WriteGuard) associated with
/// [`TestNopRwLock`].
pub struct TestNopRwLockWriteGuard<'a, T: marker::Send + marker::Sync> {
    lock: &'a TestNopRwLock<T>,
}

impl<'a, T: marker::Send + marker::Sync> Drop for TestNopRwLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, atomic::Ordering::Release);
    }
}

impl<'a, T: marker::Send + marker::Sync> ops::Deref for TestNopRwLockWriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: the write guard's existence implies exclusive access.
        unsafe { &*self.lock.v.get() }
    }
}

impl<'a, T: marker::Send + marker::Sync> ops::DerefMut for TestNopRwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: the write guard's existence implies exclusive access.
        unsafe { &mut *self.lock.v.get() }
    }
}

/// Dummy [`SyncTypes`](sync_types::SyncTypes) collection for testing purposes.
pub struct TestNopSyncTypes;

impl sync_types::SyncTypes for TestNopSyncTypes {
    type Lock<T: marker::Send> = TestNopLock<T>;
    type RwLock<T: marker::Send + marker::Sync> = TestNopRwLock<T>;
}

/// [`Waker`](task::Waker) backend counting its invocations.
///
/// Used for asserting on whether or not some operation woke a pending
/// [`Future`](future::Future).
pub struct TestWakeCounter {
    count: atomic::AtomicUsize,
}

impl TestWakeCounter {
    /// Create a `TestWakeCounter` and a [`Waker`](task::Waker) bumping it.
    pub fn new_waker() -> (sync::Arc<Self>, task::Waker) {
        let counter = sync::Arc::new(Self {
            count: atomic::AtomicUsize::new(0),
        });
        let waker = task::Waker::from(counter.clone());
        (counter, waker)
    }

    /// Number of wakeups observed so far.
    pub fn count(&self) -> usize {
        self.count.load(atomic::Ordering::Relaxed)
    }
}

impl alloc::task::Wake for TestWakeCounter {
    fn wake(self: sync::Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &sync::Arc<Self>) {
        self.count.fetch_add(1, atomic::Ordering::Relaxed);
    }
}

/// Poll a [`Future`](future::Future) once with a no-op
/// [`Waker`](task::Waker).
pub fn test_poll_once<F: future::Future + ?Sized>(f: pin::Pin<&mut F>) -> task::Poll<F::Output> {
    let mut cx = task::Context::from_waker(task::Waker::noop());
    future::Future::poll(f, &mut cx)
}

#[test]
fn test_nop_rwlock_shared_readers() {
    use sync_types::RwLock as _;

    let l = TestNopRwLock::from(5u32);
    let r0 = l.read();
    let r1 = l.read();
    assert_eq!(*r0 + *r1, 10);
    drop(r0);
    drop(r1);
    *l.write() = 7;
    assert_eq!(*l.read(), 7);
}

#[test]
#[should_panic]
fn test_nop_lock_recursive() {
    use sync_types::Lock as _;

    let l = TestNopLock::from(0u32);
    let _g0 = l.lock();
    let _g1 = l.lock();
}
