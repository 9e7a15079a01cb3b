// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC

//! Implementation of [`AsyncSemaphore`]

extern crate alloc;
use alloc::collections::VecDeque;

use crate::sync_types::{self, Lock as _};
use crate::utils_common::alloc::TryNewError;
use core::{future, num, pin, task};

/// Error information returned by the [`AsyncSemaphore`] API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncSemaphoreError {
    /// Memory allocation failure.
    MemoryAllocationFailure,

    /// Internal error.
    Internal,
}

impl From<TryNewError> for AsyncSemaphoreError {
    fn from(value: TryNewError) -> Self {
        match value {
            TryNewError::MemoryAllocationFailure => Self::MemoryAllocationFailure,
        }
    }
}

/// Internal representation of a waiter enqueued at an [`AsyncSemaphore`].
struct AsyncSemaphoreWaiter {
    /// The waiter's assigned id.
    waiter_id: num::NonZeroU64,
    /// Total number of permits requested.
    requested: usize,
    /// Number of permits handed over to the waiter so far.
    granted: usize,
    /// The waker to invoke once `granted` reaches `requested`.
    waker: Option<task::Waker>,
}

/// State of an [`AsyncSemaphore`], protected by a [`Lock`](sync_types::Lock).
struct AsyncSemaphoreState {
    /// Permits not granted to anybody.
    available: usize,
    /// Waiters in FIFO order. A waiter stays enqueued until it observes its
    /// completion in [`AsyncSemaphoreAcquireFuture::poll()`].
    waiters: VecDeque<AsyncSemaphoreWaiter>,
    /// Last waiter id allocated in the course of enqueueing.
    last_waiter_id: u64,
}

impl AsyncSemaphoreState {
    fn waiter_position(&self, waiter_id: num::NonZeroU64) -> Option<usize> {
        self.waiters.iter().position(|w| w.waiter_id == waiter_id)
    }

    fn has_unsatisfied_waiters(&self) -> bool {
        self.waiters.iter().any(|w| w.granted < w.requested)
    }
}

/// Counting semaphore.
///
/// In contrast to a plain counter, an `AsyncSemaphore` supports waiting for
/// permits to become available through the [`acquire()`](Self::acquire)
/// [`Future`](future::Future). Permits released are handed over to waiters in
/// FIFO order, and only what's left thereafter becomes available to the
/// non-waiting [`try_acquire()`](Self::try_acquire).
///
/// Permits are not tied to any guard objects: whoever acquired them is
/// responsible for [releasing](Self::release) them eventually, possibly from
/// a different context.
pub struct AsyncSemaphore<ST: sync_types::SyncTypes> {
    state: ST::Lock<AsyncSemaphoreState>,
}

impl<ST: sync_types::SyncTypes> AsyncSemaphore<ST> {
    /// Create a new `AsyncSemaphore`.
    ///
    /// # Arguments:
    ///
    /// * `permits` - Initial number of available permits.
    pub fn new(permits: usize) -> Self {
        Self {
            state: ST::Lock::from(AsyncSemaphoreState {
                available: permits,
                waiters: VecDeque::new(),
                last_waiter_id: 0,
            }),
        }
    }

    /// Number of currently available permits.
    pub fn available_permits(&self) -> usize {
        self.state.lock().available
    }

    /// Attempt to acquire permits without waiting.
    ///
    /// Return `true` if `count` permits have been acquired, `false` if not
    /// enough were available. Pending [`acquire()`](Self::acquire) waiters
    /// take precedence, i.e. the attempt fails as long as there are any.
    ///
    /// # Arguments:
    ///
    /// * `count` - Number of permits to acquire.
    pub fn try_acquire(&self, count: usize) -> bool {
        let mut state = self.state.lock();
        if state.has_unsatisfied_waiters() || state.available < count {
            return false;
        }
        state.available -= count;
        true
    }

    /// Release permits.
    ///
    /// The released permits are handed to enqueued waiters first, any
    /// remainder becomes available.
    ///
    /// # Arguments:
    ///
    /// * `count` - Number of permits to release.
    pub fn release(&self, count: usize) {
        let mut remaining = count;
        while remaining != 0 {
            let mut state = self.state.lock();
            let waker = match state.waiters.iter_mut().find(|w| w.granted < w.requested) {
                Some(waiter) => {
                    let grant = remaining.min(waiter.requested - waiter.granted);
                    waiter.granted += grant;
                    remaining -= grant;
                    if waiter.granted == waiter.requested {
                        waiter.waker.take()
                    } else {
                        None
                    }
                }
                None => {
                    state.available += remaining;
                    return;
                }
            };
            // Don't invoke foreign code with the lock held.
            drop(state);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }

    /// Acquire permits, waiting for them to become available if needed.
    ///
    /// Permits get accumulated as they're released, so that a waiter for a
    /// large count makes progress even if released one by one.
    ///
    /// # Arguments:
    ///
    /// * `count` - Number of permits to acquire.
    pub fn acquire(&self, count: usize) -> AsyncSemaphoreAcquireFuture<'_, ST> {
        AsyncSemaphoreAcquireFuture {
            sem: self,
            count,
            waiter_id: None,
            done: false,
        }
    }
}

/// [`Future`](future::Future) returned by [`AsyncSemaphore::acquire()`].
///
/// Dropping an incomplete `AsyncSemaphoreAcquireFuture` returns any permits
/// accumulated so far back to the [`AsyncSemaphore`].
pub struct AsyncSemaphoreAcquireFuture<'a, ST: sync_types::SyncTypes> {
    sem: &'a AsyncSemaphore<ST>,
    count: usize,
    waiter_id: Option<num::NonZeroU64>,
    done: bool,
}

impl<'a, ST: sync_types::SyncTypes> future::Future for AsyncSemaphoreAcquireFuture<'a, ST> {
    type Output = Result<(), AsyncSemaphoreError>;

    fn poll(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        if this.done {
            unreachable!("Attempt to poll completed future.");
        }

        let mut state = this.sem.state.lock();
        match this.waiter_id {
            None => {
                if !state.has_unsatisfied_waiters() && state.available >= this.count {
                    state.available -= this.count;
                    this.done = true;
                    return task::Poll::Ready(Ok(()));
                }

                if state.waiters.try_reserve(1).is_err() {
                    return task::Poll::Ready(Err(AsyncSemaphoreError::MemoryAllocationFailure));
                }
                let granted = if state.has_unsatisfied_waiters() {
                    0
                } else {
                    state.available
                };
                state.available -= granted;
                state.last_waiter_id += 1;
                let waiter_id = match num::NonZeroU64::new(state.last_waiter_id) {
                    Some(waiter_id) => waiter_id,
                    None => return task::Poll::Ready(Err(AsyncSemaphoreError::Internal)),
                };
                state.waiters.push_back(AsyncSemaphoreWaiter {
                    waiter_id,
                    requested: this.count,
                    granted,
                    waker: Some(cx.waker().clone()),
                });
                this.waiter_id = Some(waiter_id);
                task::Poll::Pending
            }
            Some(waiter_id) => {
                let pos = match state.waiter_position(waiter_id) {
                    Some(pos) => pos,
                    None => return task::Poll::Ready(Err(AsyncSemaphoreError::Internal)),
                };
                let waiter = &mut state.waiters[pos];
                if waiter.granted == waiter.requested {
                    state.waiters.remove(pos);
                    this.waiter_id = None;
                    this.done = true;
                    task::Poll::Ready(Ok(()))
                } else {
                    waiter.waker = Some(cx.waker().clone());
                    task::Poll::Pending
                }
            }
        }
    }
}

impl<'a, ST: sync_types::SyncTypes> Drop for AsyncSemaphoreAcquireFuture<'a, ST> {
    fn drop(&mut self) {
        let waiter_id = match self.waiter_id.take() {
            Some(waiter_id) => waiter_id,
            None => return,
        };
        let mut state = self.sem.state.lock();
        let granted = match state.waiter_position(waiter_id) {
            Some(pos) => state.waiters.remove(pos).map(|w| w.granted).unwrap_or(0),
            None => 0,
        };
        drop(state);
        if granted != 0 {
            self.sem.release(granted);
        }
    }
}

#[cfg(test)]
fn test_poll<F: future::Future + Unpin>(f: &mut F, waker: &task::Waker) -> task::Poll<F::Output> {
    let mut cx = task::Context::from_waker(waker);
    future::Future::poll(pin::Pin::new(f), &mut cx)
}

#[test]
fn test_try_acquire_release() {
    use crate::test::TestNopSyncTypes;

    let sem = AsyncSemaphore::<TestNopSyncTypes>::new(0);
    assert!(!sem.try_acquire(1));
    sem.release(2);
    assert_eq!(sem.available_permits(), 2);
    assert!(sem.try_acquire(1));
    assert!(sem.try_acquire(1));
    assert!(!sem.try_acquire(1));
    assert!(sem.try_acquire(0));
}

#[test]
fn test_acquire_accumulates() {
    use crate::test::{TestNopSyncTypes, TestWakeCounter};

    let sem = AsyncSemaphore::<TestNopSyncTypes>::new(1);
    let (wake_counter, waker) = TestWakeCounter::new_waker();

    let mut f = sem.acquire(3);
    assert!(test_poll(&mut f, &waker).is_pending());
    // The single available permit got handed to the waiter.
    assert_eq!(sem.available_permits(), 0);

    sem.release(1);
    assert_eq!(wake_counter.count(), 0);
    // Partially satisfied waiter still enqueued, no stealing.
    assert!(!sem.try_acquire(1));
    assert_eq!(sem.available_permits(), 0);
    sem.release(2);
    assert_eq!(wake_counter.count(), 1);
    assert_eq!(sem.available_permits(), 1);
    assert_eq!(test_poll(&mut f, &waker), task::Poll::Ready(Ok(())));
    drop(f);
    assert_eq!(sem.available_permits(), 1);
}

#[test]
fn test_acquire_immediate() {
    use crate::test::TestNopSyncTypes;

    let sem = AsyncSemaphore::<TestNopSyncTypes>::new(2);
    let waker = task::Waker::noop();
    let mut f = sem.acquire(2);
    assert_eq!(test_poll(&mut f, waker), task::Poll::Ready(Ok(())));
    drop(f);
    assert_eq!(sem.available_permits(), 0);
}

#[test]
fn test_acquire_drop_returns_permits() {
    use crate::test::TestNopSyncTypes;

    let sem = AsyncSemaphore::<TestNopSyncTypes>::new(2);
    let waker = task::Waker::noop();
    let mut f = sem.acquire(5);
    assert!(test_poll(&mut f, waker).is_pending());
    assert_eq!(sem.available_permits(), 0);
    drop(f);
    assert_eq!(sem.available_permits(), 2);
    assert!(sem.try_acquire(2));
}

#[test]
fn test_waiters_fifo() {
    use crate::test::{TestNopSyncTypes, TestWakeCounter};

    let sem = AsyncSemaphore::<TestNopSyncTypes>::new(0);
    let (wake_counter0, waker0) = TestWakeCounter::new_waker();
    let (wake_counter1, waker1) = TestWakeCounter::new_waker();

    let mut f0 = sem.acquire(1);
    let mut f1 = sem.acquire(1);
    assert!(test_poll(&mut f0, &waker0).is_pending());
    assert!(test_poll(&mut f1, &waker1).is_pending());

    sem.release(1);
    assert_eq!(wake_counter0.count(), 1);
    assert_eq!(wake_counter1.count(), 0);
    assert!(test_poll(&mut f1, &waker1).is_pending());
    assert_eq!(test_poll(&mut f0, &waker0), task::Poll::Ready(Ok(())));

    sem.release(1);
    assert_eq!(wake_counter1.count(), 1);
    assert_eq!(test_poll(&mut f1, &waker1), task::Poll::Ready(Ok(())));
}
