// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! The decrypt work queue shared among crypt targets.

extern crate alloc;
use alloc::{boxed::Box, collections::VecDeque};

use crate::utils_async::sync_types::{self, Lock as _};
use crate::utils_common::alloc::TryNewError;
use core::{future, marker, pin, task};

/// Deferred work executed by a [`CryptWorkQueue`].
pub trait CryptWorkItem: marker::Send {
    fn run(self: Box<Self>);
}

struct CryptWorkQueueState {
    items: VecDeque<Box<dyn CryptWorkItem>>,
    waker: Option<task::Waker>,
    shutdown: bool,
}

/// Queue of work not to be executed from within IO completion context.
///
/// Read data gets decrypted from here. The queue gets drained either by
/// polling a [`CryptWorker`] obtained through [`worker()`](Self::worker),
/// typically from a dedicated thread, or by explicit calls to
/// [`process_pending()`](Self::process_pending).
pub struct CryptWorkQueue<ST: sync_types::SyncTypes> {
    state: ST::Lock<CryptWorkQueueState>,
}

impl<ST: sync_types::SyncTypes> CryptWorkQueue<ST> {
    pub fn new() -> Self {
        Self {
            state: ST::Lock::from(CryptWorkQueueState {
                items: VecDeque::new(),
                waker: None,
                shutdown: false,
            }),
        }
    }

    /// Grow the queue's capacity by `additional` items.
    ///
    /// Each crypt target sharing the queue reserves capacity for its maximum
    /// number of IOs in flight.
    pub fn reserve(&self, additional: usize) -> Result<(), TryNewError> {
        let mut state = self.state.lock();
        let unused = state.items.capacity() - state.items.len();
        state.items.try_reserve(unused + additional)?;
        Ok(())
    }

    /// Enqueue a work item and wake the [`CryptWorker`].
    pub fn queue(&self, item: Box<dyn CryptWorkItem>) {
        let waker = {
            let mut state = self.state.lock();
            state.items.push_back(item);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn dequeue(&self) -> Option<Box<dyn CryptWorkItem>> {
        self.state.lock().items.pop_front()
    }

    /// Run all queued work items, including any queued meanwhile, and
    /// return their number.
    pub fn process_pending(&self) -> usize {
        let mut count = 0;
        while let Some(item) = self.dequeue() {
            item.run();
            count += 1;
        }
        count
    }

    /// Number of queued work items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the [`CryptWorker`] complete once the queue has been drained.
    pub fn shutdown(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Obtain a [`Future`](future::Future) processing the queue until
    /// [`shutdown()`](Self::shutdown).
    pub fn worker(&self) -> CryptWorker<'_, ST> {
        CryptWorker { queue: self }
    }
}

impl<ST: sync_types::SyncTypes> Default for CryptWorkQueue<ST> {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Future`](future::Future) returned by [`CryptWorkQueue::worker()`].
pub struct CryptWorker<'a, ST: sync_types::SyncTypes> {
    queue: &'a CryptWorkQueue<ST>,
}

impl<'a, ST: sync_types::SyncTypes> future::Future for CryptWorker<'a, ST> {
    type Output = ();

    fn poll(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let queue = self.queue;
        loop {
            let item = {
                let mut state = queue.state.lock();
                match state.items.pop_front() {
                    Some(item) => item,
                    None => {
                        if state.shutdown {
                            return task::Poll::Ready(());
                        }
                        state.waker = Some(cx.waker().clone());
                        return task::Poll::Pending;
                    }
                }
            };
            item.run();
        }
    }
}

#[cfg(test)]
struct TestCountingWorkItem {
    counter: alloc::sync::Arc<core::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl CryptWorkItem for TestCountingWorkItem {
    fn run(self: Box<Self>) {
        self.counter.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    }
}

#[test]
fn test_crypt_work_queue_worker() {
    use crate::utils_async::test::{TestNopSyncTypes, TestWakeCounter};
    use alloc::sync::Arc;
    use core::sync::atomic;

    let counter = Arc::new(atomic::AtomicUsize::new(0));
    let queue = CryptWorkQueue::<TestNopSyncTypes>::new();
    queue.reserve(4).unwrap();
    let (wakes, waker) = TestWakeCounter::new_waker();
    let mut cx = task::Context::from_waker(&waker);

    let mut worker = pin::pin!(queue.worker());
    assert!(future::Future::poll(worker.as_mut(), &mut cx).is_pending());
    queue.queue(Box::new(TestCountingWorkItem {
        counter: counter.clone(),
    }));
    assert_eq!(wakes.count(), 1);
    assert!(future::Future::poll(worker.as_mut(), &mut cx).is_pending());
    assert_eq!(counter.load(atomic::Ordering::Relaxed), 1);

    queue.queue(Box::new(TestCountingWorkItem {
        counter: counter.clone(),
    }));
    assert_eq!(queue.process_pending(), 1);
    queue.shutdown();
    assert!(future::Future::poll(worker.as_mut(), &mut cx).is_ready());
    assert_eq!(counter.load(atomic::Ordering::Relaxed), 2);
}
