// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Per-request state of the crypt target.

extern crate alloc;
use alloc::{boxed::Box, sync::Arc, vec::Vec};

use super::{
    CryptConfig,
    convert::CryptConvertContext,
    pool::CryptIoPoolLease,
    worker::CryptWorkItem,
};
use crate::blkdev::{self, BioDirection, BioEndIoStatus, BioSegment, BlkDevIoError};
use crate::dm::DmError;
use crate::{blkdev_err_internal, dm_err_internal};
use crate::utils_async::sync_types::{self, Lock as _};
use crate::utils_common::alloc::TryNewError;
use core::sync::atomic;

/// Bookkeeping shared by all fragments of a request.
///
/// The request holds an extra reference on it until finalization.
pub(super) struct CryptFirstClone {
    nr_fragments: atomic::AtomicUsize,
}

impl CryptFirstClone {
    pub(super) fn nr_fragments(&self) -> usize {
        self.nr_fragments.load(atomic::Ordering::Acquire)
    }
}

/// Crypt IO descriptor.
///
/// Owns the original request while its fragments are in flight and completes
/// it once the last of them has been accounted for through
/// [`dec_pending()`](Self::dec_pending).
pub(super) struct CryptIo<ST: sync_types::SyncTypes> {
    config: Arc<CryptConfig<ST>>,
    base_bio: ST::Lock<Option<blkdev::Bio>>,
    first_clone: ST::Lock<Option<Arc<CryptFirstClone>>>,
    /// Fragments in flight plus one for the submitter.
    pending: atomic::AtomicUsize,
    /// The last error reported by any fragment.
    error: ST::Lock<Result<(), BlkDevIoError>>,
    lease: ST::Lock<Option<CryptIoPoolLease>>,
}

impl<ST: sync_types::SyncTypes> CryptIo<ST> {
    pub(super) fn new(config: Arc<CryptConfig<ST>>, lease: CryptIoPoolLease) -> Self {
        Self {
            config,
            base_bio: ST::Lock::from(None),
            first_clone: ST::Lock::from(None),
            pending: atomic::AtomicUsize::new(1),
            error: ST::Lock::from(Ok(())),
            lease: ST::Lock::from(Some(lease)),
        }
    }

    pub(super) fn set_base_bio(&self, bio: blkdev::Bio) {
        *self.base_bio.lock() = Some(bio);
    }

    pub(super) fn take_base_bio(&self) -> Option<blkdev::Bio> {
        self.base_bio.lock().take()
    }

    /// Account for a new fragment and return the shared fragment bookkeeping.
    pub(super) fn note_fragment(&self) -> Arc<CryptFirstClone> {
        let first_clone = {
            let mut first_clone = self.first_clone.lock();
            match first_clone.as_ref() {
                Some(first_clone) => first_clone.clone(),
                None => {
                    let new = Arc::new(CryptFirstClone {
                        nr_fragments: atomic::AtomicUsize::new(0),
                    });
                    *first_clone = Some(new.clone());
                    new
                }
            }
        };
        first_clone.nr_fragments.fetch_add(1, atomic::Ordering::AcqRel);
        first_clone
    }

    pub(super) fn inc_pending(&self) {
        self.pending.fetch_add(1, atomic::Ordering::AcqRel);
    }

    /// Drop one pending reference, recording `result`.
    ///
    /// Upon dropping the last one, the original request gets completed with
    /// the recorded status.
    pub(super) fn dec_pending(&self, result: Result<(), BlkDevIoError>) {
        if let Err(e) = result {
            *self.error.lock() = Err(e);
        }

        let prev = self.pending.fetch_sub(1, atomic::Ordering::AcqRel);
        assert_ne!(prev, 0, "Crypt IO pending count underflow");
        if prev != 1 {
            return;
        }

        let first_clone = self.first_clone.lock().take();
        if let Some(first_clone) = first_clone {
            log::trace!("Crypt IO completed in {} fragments", first_clone.nr_fragments());
        }

        let error = *self.error.lock();
        let base_bio = self.base_bio.lock().take();
        match base_bio {
            Some(mut base_bio) => {
                let size = base_bio.size();
                base_bio.endio(size, error);
            }
            None => {
                let _ = blkdev_err_internal!();
            }
        }
        drop(self.lease.lock().take());
    }

    /// Move the pages of a range of the original request's segments into
    /// fresh segments for a read fragment.
    pub(super) fn take_read_pages(&self, first: usize, count: usize) -> Result<Vec<BioSegment>, DmError> {
        let mut segments = Vec::new();
        segments.try_reserve_exact(count).map_err(TryNewError::from)?;

        let mut base_bio = self.base_bio.lock();
        let base_bio = match base_bio.as_mut() {
            Some(base_bio) => base_bio,
            None => return Err(dm_err_internal!()),
        };
        for seg in base_bio.segments_mut()[first..first + count].iter_mut() {
            let (offset, len) = (seg.offset(), seg.len());
            match seg.take_page() {
                Some(page) => segments.push(BioSegment::new(page, offset, len)),
                None => return Err(dm_err_internal!()),
            }
        }
        Ok(segments)
    }

    /// Give the pages of a read fragment's segments back to the original
    /// request.
    pub(super) fn restore_read_pages(&self, first: usize, segments: Vec<BioSegment>) {
        let mut base_bio = self.base_bio.lock();
        if let Some(base_bio) = base_bio.as_mut() {
            for (seg, frag_seg) in base_bio.segments_mut()[first..].iter_mut().zip(segments) {
                if let Some(page) = frag_seg.into_page() {
                    seg.restore_page(page);
                }
            }
        }
    }
}

/// Deferred decryption of a completed read fragment.
pub(super) struct CryptReadFragment<ST: sync_types::SyncTypes> {
    io: Arc<CryptIo<ST>>,
    first_segment: usize,
    /// IV sector of the fragment's first sector.
    sector: u64,
    segments: Vec<BioSegment>,
}

impl<ST: sync_types::SyncTypes> CryptReadFragment<ST> {
    pub(super) fn new(io: Arc<CryptIo<ST>>, first_segment: usize, sector: u64) -> Self {
        Self {
            io,
            first_segment,
            sector,
            segments: Vec::new(),
        }
    }
}

impl<ST: sync_types::SyncTypes> CryptWorkItem for CryptReadFragment<ST> {
    fn run(self: Box<Self>) {
        let Self {
            io,
            first_segment,
            sector,
            mut segments,
        } = *self;

        let params = io.config.convert_params();
        let result = CryptConvertContext::new(sector, false)
            .convert_in_place(&params, &mut segments)
            .map_err(|_| BlkDevIoError::CryptoFailure);
        io.restore_read_pages(first_segment, segments);
        io.dec_pending(result);
    }
}

/// Completion hook installed on fragments.
pub(super) struct CryptFragmentEndIo<ST: sync_types::SyncTypes> {
    io: Arc<CryptIo<ST>>,
    _first_clone: Arc<CryptFirstClone>,
    orig_size: usize,
    first_segment: usize,
    /// Preallocated work item for the decryption of reads.
    read_work: Option<Box<CryptReadFragment<ST>>>,
}

impl<ST: sync_types::SyncTypes> CryptFragmentEndIo<ST> {
    pub(super) fn new_write(io: Arc<CryptIo<ST>>, first_clone: Arc<CryptFirstClone>, orig_size: usize) -> Self {
        Self {
            io,
            _first_clone: first_clone,
            orig_size,
            first_segment: 0,
            read_work: None,
        }
    }

    pub(super) fn new_read(
        io: Arc<CryptIo<ST>>,
        first_clone: Arc<CryptFirstClone>,
        orig_size: usize,
        read_work: Box<CryptReadFragment<ST>>,
    ) -> Self {
        let first_segment = read_work.first_segment;
        Self {
            io,
            _first_clone: first_clone,
            orig_size,
            first_segment,
            read_work: Some(read_work),
        }
    }

    /// Return the pages of all segments completed so far to the pool.
    fn free_completed_pages(&self, bio: &mut blkdev::Bio) {
        let done = self.orig_size - bio.size();
        let mut end = 0;
        for seg in bio.segments_mut() {
            end += seg.len();
            if end > done {
                break;
            }
            if let Some(page) = seg.take_page() {
                self.io.config.page_pool.free(page);
            }
        }
    }
}

impl<ST: sync_types::SyncTypes> blkdev::BioEndIo for CryptFragmentEndIo<ST> {
    fn end_io(
        &mut self,
        bio: &mut blkdev::Bio,
        _bytes_done: usize,
        result: Result<(), BlkDevIoError>,
    ) -> BioEndIoStatus {
        match bio.direction() {
            BioDirection::Write => {
                self.free_completed_pages(bio);
                if bio.size() != 0 {
                    return BioEndIoStatus::InProgress;
                }
                self.io.dec_pending(result);
            }
            BioDirection::Read => {
                if bio.size() != 0 {
                    return BioEndIoStatus::InProgress;
                }
                let segments = bio.take_segments();
                match (result, self.read_work.take()) {
                    (Ok(()), Some(mut read_work)) => {
                        read_work.segments = segments;
                        self.io.config.work_queue.queue(read_work);
                    }
                    (result, _) => {
                        self.io.restore_read_pages(self.first_segment, segments);
                        self.io
                            .dec_pending(result.and_then(|_| Err(blkdev_err_internal!())));
                    }
                }
            }
        }
        BioEndIoStatus::Completed
    }
}
