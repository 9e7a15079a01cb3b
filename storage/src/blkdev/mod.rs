// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC

//! Definition of the [`BlkDev`] trait, the block IO abstraction device-mapper
//! style targets submit their (transformed) IO to.
//!
//! IO is described by [`Bio`] requests addressing a contiguous range of
//! [sectors](SECTOR_SIZE) and carrying the data in a list of
//! [`BioSegment`]s. Completion is reported asynchronously through the
//! request's [`BioEndIo`] hook, possibly from a different thread than the
//! one the request had been [submitted](BlkDev::submit_bio) from, and
//! possibly in multiple parts.

extern crate alloc;
use alloc::{boxed::Box, string::String, sync, vec::Vec};

use crate::utils_common::alloc::TryNewError;
use core::{convert, marker, mem};


/// Base-2 logarithm of the [sector size](SECTOR_SIZE).
pub const SECTOR_SHIFT: u32 = 9;

/// Sector size, the unit [`Bio`] addressing is specified in.
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

/// Size of the pages [`BioSegment`] buffers are allocated in.
pub const PAGE_SIZE: usize = 4096;

/// Error type reported for [`Bio`] completions and [`BlkDev`] primitives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlkDevIoError {
    /// Logic error.
    Internal,

    /// A memory allocation has failed.
    MemoryAllocationFailure,

    /// Some requested operation is not supported.
    OperationNotSupported,

    /// Read or write region out of the device's bounds.
    SectorOutOfRange,

    /// Unspecified IO failure.
    IoFailure,

    /// Some cryptographic transformation of the data failed.
    CryptoFailure,
}

impl convert::From<TryNewError> for BlkDevIoError {
    fn from(value: TryNewError) -> Self {
        match value {
            TryNewError::MemoryAllocationFailure => Self::MemoryAllocationFailure,
        }
    }
}

/// Debugging friendly helper for instantiating [`BlkDevIoError::Internal`].
///
/// Panics if `cfg!(debug_assertions)` is on, to allow for debugger examination
/// at the point the logic error has happened. Otherwise a
/// [`BlkDevIoError::Internal`] is returned.
#[macro_export]
macro_rules! blkdev_err_internal {
    () => {{
        if cfg!(debug_assertions) {
            panic!("BlkDevIoError::Internal");
        } else {
            $crate::blkdev::BlkDevIoError::Internal
        }
    }};
}

/// Data transfer direction of a [`Bio`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BioDirection {
    Read,
    Write,
}

/// A single, contiguous data buffer within a [`Bio`].
///
/// Refers to the range `offset..offset + len` of the owned page. The page may
/// get [taken away](Self::take_page) before the segment itself is dropped, in
/// which case the segment's data range becomes empty.
pub struct BioSegment {
    page: Option<Box<[u8]>>,
    offset: usize,
    len: usize,
}

impl BioSegment {
    /// Create a new `BioSegment`.
    ///
    /// # Arguments:
    ///
    /// * `page` - The buffer backing the segment.
    /// * `offset` - Beginning of the segment's data within `page`.
    /// * `len` - Length of the segment's data.
    pub fn new(page: Box<[u8]>, offset: usize, len: usize) -> Self {
        debug_assert!(offset.checked_add(len).is_some_and(|end| end <= page.len()));
        Self {
            page: Some(page),
            offset,
            len,
        }
    }

    /// Offset of the data within the backing page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the segment's data.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the segment has no data.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The segment's data.
    pub fn data(&self) -> &[u8] {
        match self.page.as_deref() {
            Some(page) => &page[self.offset..self.offset + self.len],
            None => &[],
        }
    }

    /// The segment's data, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.page.as_deref_mut() {
            Some(page) => &mut page[self.offset..self.offset + self.len],
            None => &mut [],
        }
    }

    /// Take the backing page away from the segment.
    pub fn take_page(&mut self) -> Option<Box<[u8]>> {
        self.page.take()
    }

    /// Give a page previously [taken away](Self::take_page) back to the
    /// segment.
    pub fn restore_page(&mut self, page: Box<[u8]>) {
        debug_assert!(self.page.is_none());
        debug_assert!(self.offset + self.len <= page.len());
        self.page = Some(page);
    }

    /// Consume the segment and return the backing page, if still present.
    pub fn into_page(self) -> Option<Box<[u8]>> {
        self.page
    }
}

/// Status returned from [`BioEndIo::end_io()`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BioEndIoStatus {
    /// The [`Bio`] has completed, the hook has been consumed.
    Completed,
    /// The [`Bio`] has been completed only partially so far, keep the hook
    /// armed for further completions.
    InProgress,
}

/// Completion hook of a [`Bio`].
///
/// Invoked through [`Bio::endio()`], possibly multiple times for partial
/// completions. Implementations must not block.
pub trait BioEndIo: marker::Send {
    /// Handle a (partial) completion.
    ///
    /// # Arguments:
    ///
    /// * `bio` - The [`Bio`] being completed. Its [`size()`](Bio::size) has
    ///   already been reduced by `bytes_done` and will be zero for the final
    ///   completion.
    /// * `bytes_done` - The number of bytes completed with this invocation.
    /// * `result` - The completion status.
    fn end_io(&mut self, bio: &mut Bio, bytes_done: usize, result: Result<(), BlkDevIoError>) -> BioEndIoStatus;
}

impl<F> BioEndIo for F
where
    F: FnMut(&mut Bio, usize, Result<(), BlkDevIoError>) -> BioEndIoStatus + marker::Send,
{
    fn end_io(&mut self, bio: &mut Bio, bytes_done: usize, result: Result<(), BlkDevIoError>) -> BioEndIoStatus {
        self(bio, bytes_done, result)
    }
}

/// Block IO request.
pub struct Bio {
    direction: BioDirection,
    sector: u64,
    segments: Vec<BioSegment>,
    /// Number of bytes not completed yet.
    size: usize,
    end_io: Option<Box<dyn BioEndIo>>,
}

impl Bio {
    /// Create a new `Bio`.
    ///
    /// The request's [size](Self::size) is initialized to the total length of
    /// all `segments`.
    ///
    /// # Arguments:
    ///
    /// * `direction` - The data transfer direction.
    /// * `sector` - The first sector addressed.
    /// * `segments` - The data buffers.
    pub fn new(direction: BioDirection, sector: u64, segments: Vec<BioSegment>) -> Self {
        let size = segments.iter().map(|s| s.len()).sum();
        Self {
            direction,
            sector,
            segments,
            size,
            end_io: None,
        }
    }

    /// Install the completion hook.
    pub fn set_end_io(&mut self, end_io: Box<dyn BioEndIo>) {
        self.end_io = Some(end_io);
    }

    /// The data transfer direction.
    pub fn direction(&self) -> BioDirection {
        self.direction
    }

    /// The first sector addressed.
    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Remaining number of bytes not completed yet.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of sectors covered by the remaining [size](Self::size).
    pub fn sectors(&self) -> u64 {
        (self.size >> SECTOR_SHIFT) as u64
    }

    pub fn segments(&self) -> &[BioSegment] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [BioSegment] {
        &mut self.segments
    }

    /// Take all of the segments out, leaving none behind.
    ///
    /// The request's [size](Self::size) is not affected.
    pub fn take_segments(&mut self) -> Vec<BioSegment> {
        mem::take(&mut self.segments)
    }

    /// Report a (partial) completion.
    ///
    /// Reduces the remaining [size](Self::size) by `bytes_done` and invokes
    /// the [completion hook](BioEndIo), if any. The hook stays installed for
    /// subsequent invocations only if it returns
    /// [`BioEndIoStatus::InProgress`].
    ///
    /// # Arguments:
    ///
    /// * `bytes_done` - Number of bytes completed.
    /// * `result` - The completion status.
    pub fn endio(&mut self, bytes_done: usize, result: Result<(), BlkDevIoError>) -> BioEndIoStatus {
        let bytes_done = bytes_done.min(self.size);
        self.size -= bytes_done;
        match self.end_io.take() {
            Some(mut end_io) => {
                let status = end_io.end_io(self, bytes_done, result);
                if status == BioEndIoStatus::InProgress {
                    self.end_io = Some(end_io);
                }
                status
            }
            None => BioEndIoStatus::Completed,
        }
    }
}

/// Block device abstraction.
///
/// Accepts [`Bio`]s for asynchronous processing. Errors are never reported
/// from [`submit_bio()`](Self::submit_bio) directly, but through the
/// [`Bio`]'s [completion](Bio::endio).
pub trait BlkDev: marker::Send + marker::Sync {
    /// Size of the device in units of [sectors](SECTOR_SIZE).
    fn sectors(&self) -> u64;

    /// Maximum size of a single [`Bio`] in bytes, if the device imposes any
    /// limit.
    fn max_bio_bytes(&self) -> Option<usize> {
        None
    }

    /// Submit a [`Bio`].
    fn submit_bio(&self, bio: Bio);

    /// Back off for a short, bounded amount of time to give in-flight IO a
    /// chance to complete.
    fn congestion_wait(&self) {}
}

/// Resolver for device names found in target table lines.
pub trait BlkDevLookup {
    /// Lookup a [`BlkDev`] by name.
    fn lookup(&self, name: &str) -> Option<sync::Arc<dyn BlkDev>>;
}

/// Trivial [`BlkDevLookup`] over a list of named devices.
#[derive(Default)]
pub struct BlkDevTable {
    devs: Vec<(String, sync::Arc<dyn BlkDev>)>,
}

impl BlkDevTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under `name`.
    pub fn insert(&mut self, name: &str, dev: sync::Arc<dyn BlkDev>) -> Result<(), TryNewError> {
        let mut owned_name = String::new();
        owned_name.try_reserve_exact(name.len())?;
        owned_name.push_str(name);
        self.devs.try_reserve(1)?;
        self.devs.push((owned_name, dev));
        Ok(())
    }
}

impl BlkDevLookup for BlkDevTable {
    fn lookup(&self, name: &str) -> Option<sync::Arc<dyn BlkDev>> {
        self.devs.iter().find(|(n, _)| n == name).map(|(_, dev)| dev.clone())
    }
}
