// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Dirty region log interface and an in-memory implementation.
//!
//! A [`DirtyLog`] persistently records which regions of a mirrored device
//! are known to be in sync between the mirror legs and which regions have
//! writes in flight ("marked"). It is consulted and updated by the
//! [`RegionHash`](super::region_hash::RegionHash).

extern crate alloc;
use alloc::vec::Vec;

use crate::utils_common::alloc::{TryNewError, try_alloc_vec};
use core::{marker, sync::atomic};

/// Error type returned by [`DirtyLog`] primitives.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DirtyLogError {
    /// The query could not be answered without blocking.
    WouldBlock,
    /// Unspecified IO failure on the log's backing storage.
    IoFailure,
}

/// Dirty region log.
///
/// All primitives take `&self`, implementations synchronize internally.
pub trait DirtyLog: marker::Send + marker::Sync {
    /// Number of regions tracked.
    fn region_count(&self) -> u64;

    /// Query whether a region is in sync.
    ///
    /// # Arguments:
    ///
    /// * `region` - The region to query.
    /// * `may_block` - Whether the implementation is allowed to block, for
    ///   example on IO to its backing storage. If `false` and the answer is
    ///   not readily available, [`DirtyLogError::WouldBlock`] is returned.
    fn in_sync(&self, region: u64, may_block: bool) -> Result<bool, DirtyLogError>;

    /// Record that writes to a region are in flight.
    fn mark_region(&self, region: u64);

    /// Record that no writes to a region are in flight anymore.
    fn clear_region(&self, region: u64);

    /// Set a region's sync status.
    ///
    /// Also concludes any resync work handed out for the region through
    /// [`get_resync_work()`](Self::get_resync_work).
    fn set_region_sync(&self, region: u64, in_sync: bool);

    /// Obtain the next region to resynchronize, if any.
    ///
    /// A region handed out is considered under recovery until its
    /// [sync status gets set](Self::set_region_sync) and won't be returned
    /// again before that.
    fn get_resync_work(&self) -> Option<u64>;

    /// Commit all updates to the backing storage.
    fn flush(&self) -> Result<(), DirtyLogError>;
}

/// Fixed size bitmap of atomic words.
struct AtomicBitmap {
    words: Vec<atomic::AtomicU64>,
}

impl AtomicBitmap {
    fn new(bits: u64, set: bool) -> Result<Self, TryNewError> {
        let nwords = usize::try_from(bits.div_ceil(64)).map_err(|_| TryNewError::MemoryAllocationFailure)?;
        let words = try_alloc_vec::<u64>(nwords)?;
        let init = if set { u64::MAX } else { 0 };
        Ok(Self {
            words: words.into_iter().map(|_| atomic::AtomicU64::new(init)).collect(),
        })
    }

    fn pos(bit: u64) -> (usize, u64) {
        ((bit / 64) as usize, 1u64 << (bit % 64))
    }

    fn test(&self, bit: u64) -> bool {
        let (i, mask) = Self::pos(bit);
        self.words[i].load(atomic::Ordering::Acquire) & mask != 0
    }

    /// Set a bit and return its previous value.
    fn set(&self, bit: u64) -> bool {
        let (i, mask) = Self::pos(bit);
        self.words[i].fetch_or(mask, atomic::Ordering::AcqRel) & mask != 0
    }

    /// Clear a bit and return its previous value.
    fn clear(&self, bit: u64) -> bool {
        let (i, mask) = Self::pos(bit);
        self.words[i].fetch_and(!mask, atomic::Ordering::AcqRel) & mask != 0
    }
}

/// In-memory [`DirtyLog`].
///
/// Nothing gets persisted, [`flush()`](DirtyLog::flush) only counts its
/// invocations. For testing, [`in_sync()`](DirtyLog::in_sync) queries can
/// be made to fail.
pub struct CoreDirtyLog {
    region_count: u64,
    clean_bits: AtomicBitmap,
    sync_bits: AtomicBitmap,
    recovering_bits: AtomicBitmap,
    flush_count: atomic::AtomicU64,
    fail_in_sync: atomic::AtomicBool,
}

impl CoreDirtyLog {
    /// Create a new `CoreDirtyLog`.
    ///
    /// # Arguments:
    ///
    /// * `region_count` - Number of regions to track.
    /// * `in_sync` - Initial sync status of all regions.
    pub fn new(region_count: u64, in_sync: bool) -> Result<Self, TryNewError> {
        Ok(Self {
            region_count,
            clean_bits: AtomicBitmap::new(region_count, true)?,
            sync_bits: AtomicBitmap::new(region_count, in_sync)?,
            recovering_bits: AtomicBitmap::new(region_count, false)?,
            flush_count: atomic::AtomicU64::new(0),
            fail_in_sync: atomic::AtomicBool::new(false),
        })
    }

    /// Whether no writes are in flight for a region.
    pub fn is_clean(&self, region: u64) -> bool {
        self.clean_bits.test(region)
    }

    /// Number of [`flush()`](DirtyLog::flush) invocations so far.
    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(atomic::Ordering::Relaxed)
    }

    /// Number of regions not in sync.
    pub fn out_of_sync_count(&self) -> u64 {
        (0..self.region_count).filter(|r| !self.sync_bits.test(*r)).count() as u64
    }

    /// Make subsequent [`in_sync()`](DirtyLog::in_sync) queries fail with
    /// [`DirtyLogError::IoFailure`].
    pub fn set_fail_in_sync(&self, fail: bool) {
        self.fail_in_sync.store(fail, atomic::Ordering::Relaxed);
    }
}

impl DirtyLog for CoreDirtyLog {
    fn region_count(&self) -> u64 {
        self.region_count
    }

    fn in_sync(&self, region: u64, _may_block: bool) -> Result<bool, DirtyLogError> {
        if self.fail_in_sync.load(atomic::Ordering::Relaxed) {
            return Err(DirtyLogError::IoFailure);
        }
        if region >= self.region_count {
            return Err(DirtyLogError::IoFailure);
        }
        Ok(self.sync_bits.test(region))
    }

    fn mark_region(&self, region: u64) {
        if region < self.region_count {
            self.clean_bits.clear(region);
        }
    }

    fn clear_region(&self, region: u64) {
        if region < self.region_count {
            self.clean_bits.set(region);
        }
    }

    fn set_region_sync(&self, region: u64, in_sync: bool) {
        if region >= self.region_count {
            return;
        }
        if in_sync {
            self.sync_bits.set(region);
        } else {
            self.sync_bits.clear(region);
        }
        self.recovering_bits.clear(region);
    }

    fn get_resync_work(&self) -> Option<u64> {
        for (i, (sync_word, recovering_word)) in self
            .sync_bits
            .words
            .iter()
            .zip(self.recovering_bits.words.iter())
            .enumerate()
        {
            let mut candidates =
                !sync_word.load(atomic::Ordering::Acquire) & !recovering_word.load(atomic::Ordering::Acquire);
            while candidates != 0 {
                let bit = candidates.trailing_zeros();
                candidates &= !(1u64 << bit);
                let region = (i as u64) * 64 + bit as u64;
                if region >= self.region_count {
                    return None;
                }
                // Claim it, someone else might have been faster.
                if !self.recovering_bits.set(region) {
                    if !self.sync_bits.test(region) {
                        return Some(region);
                    }
                    self.recovering_bits.clear(region);
                }
            }
        }
        None
    }

    fn flush(&self) -> Result<(), DirtyLogError> {
        self.flush_count.fetch_add(1, atomic::Ordering::Relaxed);
        Ok(())
    }
}

#[test]
fn test_core_dirty_log_resync_work() {
    let log = CoreDirtyLog::new(130, true).unwrap();
    assert_eq!(log.get_resync_work(), None);

    log.set_region_sync(3, false);
    log.set_region_sync(129, false);
    assert_eq!(log.out_of_sync_count(), 2);
    assert_eq!(log.get_resync_work(), Some(3));
    // Region 3 is under recovery now.
    assert_eq!(log.get_resync_work(), Some(129));
    assert_eq!(log.get_resync_work(), None);

    log.set_region_sync(3, true);
    assert_eq!(log.in_sync(3, false), Ok(true));
    // Failed recovery, becomes eligible again.
    log.set_region_sync(129, false);
    assert_eq!(log.get_resync_work(), Some(129));
}

#[test]
fn test_core_dirty_log_mark_clear() {
    let log = CoreDirtyLog::new(8, false).unwrap();
    assert!(log.is_clean(5));
    log.mark_region(5);
    assert!(!log.is_clean(5));
    log.clear_region(5);
    assert!(log.is_clean(5));

    log.set_fail_in_sync(true);
    assert_eq!(log.in_sync(0, true), Err(DirtyLogError::IoFailure));
    assert_eq!(log.flush(), Ok(()));
    assert_eq!(log.flush_count(), 1);
}
