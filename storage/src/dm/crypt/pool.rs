// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Buffer page and IO descriptor pools of a crypt target.

extern crate alloc;
use alloc::{boxed::Box, sync::Arc, vec::Vec};

use crate::blkdev::PAGE_SIZE;
use crate::utils_async::sync_types::{self, Lock as _};
use crate::utils_common::alloc::{TryNewError, try_alloc_page};
use core::sync::atomic;

struct CryptPagePoolState {
    reserve: Vec<Box<[u8]>>,
    outstanding: usize,
}

/// Pool of pages for encrypted write buffers.
///
/// Keeps a reserve of preallocated pages and falls back to the heap once the
/// reserve is exhausted. The total number of pages handed out at a time may
/// optionally be capped, which is how memory pressure manifests to the
/// crypt target: [`alloc()`](Self::alloc) never blocks but fails instead.
pub struct CryptPagePool<ST: sync_types::SyncTypes> {
    state: ST::Lock<CryptPagePoolState>,
    min_pages: usize,
    max_pages: Option<usize>,
}

impl<ST: sync_types::SyncTypes> CryptPagePool<ST> {
    /// Create a new `CryptPagePool`.
    ///
    /// # Arguments:
    ///
    /// * `min_pages` - Number of pages to keep in reserve.
    /// * `max_pages` - Optional limit on the number of pages handed out at a
    ///   time.
    pub fn new(min_pages: usize, max_pages: Option<usize>) -> Result<Self, TryNewError> {
        let nreserve = max_pages.map(|max| max.min(min_pages)).unwrap_or(min_pages);
        let mut reserve = Vec::new();
        reserve.try_reserve_exact(min_pages)?;
        for _ in 0..nreserve {
            reserve.push(try_alloc_page(PAGE_SIZE)?);
        }
        Ok(Self {
            state: ST::Lock::from(CryptPagePoolState {
                reserve,
                outstanding: 0,
            }),
            min_pages,
            max_pages,
        })
    }

    /// Allocate a page, return `None` on failure.
    pub fn alloc(&self) -> Option<Box<[u8]>> {
        let page = {
            let mut state = self.state.lock();
            if self.max_pages.is_some_and(|max| state.outstanding >= max) {
                return None;
            }
            state.outstanding += 1;
            state.reserve.pop()
        };

        match page {
            Some(page) => Some(page),
            None => match try_alloc_page(PAGE_SIZE) {
                Ok(page) => Some(page),
                Err(_) => {
                    self.state.lock().outstanding -= 1;
                    None
                }
            },
        }
    }

    /// Return a page obtained from [`alloc()`](Self::alloc).
    pub fn free(&self, page: Box<[u8]>) {
        let excess = {
            let mut state = self.state.lock();
            debug_assert_ne!(state.outstanding, 0);
            state.outstanding -= 1;
            if state.reserve.len() < self.min_pages {
                state.reserve.push(page);
                None
            } else {
                Some(page)
            }
        };
        drop(excess);
    }

    /// Number of pages currently handed out.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }
}

/// Bounds the number of IO descriptors of a crypt target in flight.
pub struct CryptIoPool {
    capacity: usize,
    in_use: atomic::AtomicUsize,
}

impl CryptIoPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: atomic::AtomicUsize::new(0),
        }
    }

    /// Obtain a [`CryptIoPoolLease`], return `None` if all are in use.
    pub fn try_get(self: &Arc<Self>) -> Option<CryptIoPoolLease> {
        self.in_use
            .fetch_update(atomic::Ordering::AcqRel, atomic::Ordering::Acquire, |n| {
                if n < self.capacity { Some(n + 1) } else { None }
            })
            .ok()?;
        Some(CryptIoPoolLease { pool: self.clone() })
    }

    /// Number of leases currently held.
    pub fn in_use(&self) -> usize {
        self.in_use.load(atomic::Ordering::Acquire)
    }
}

/// A slot in a [`CryptIoPool`], returned on drop.
pub struct CryptIoPoolLease {
    pool: Arc<CryptIoPool>,
}

impl Drop for CryptIoPoolLease {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, atomic::Ordering::AcqRel);
    }
}

#[test]
fn test_crypt_page_pool_limit() {
    use crate::utils_async::test::TestNopSyncTypes;

    let pool = CryptPagePool::<TestNopSyncTypes>::new(1, Some(2)).unwrap();
    let p0 = pool.alloc().unwrap();
    let p1 = pool.alloc().unwrap();
    assert_eq!(p0.len(), PAGE_SIZE);
    assert!(pool.alloc().is_none());
    pool.free(p0);
    assert_eq!(pool.outstanding(), 1);
    let p2 = pool.alloc().unwrap();
    pool.free(p1);
    pool.free(p2);
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(pool.state.lock().reserve.len(), 1);
}

#[test]
fn test_crypt_io_pool() {
    let pool = Arc::new(CryptIoPool::new(1));
    let lease = pool.try_get().unwrap();
    assert!(pool.try_get().is_none());
    drop(lease);
    assert_eq!(pool.in_use(), 0);
    assert!(pool.try_get().is_some());
}
