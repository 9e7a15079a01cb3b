// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Device-mapper style targets.
//!
//! A dispatcher, not part of this crate, routes requests against a virtual
//! block device to [`DmTarget`]s, each covering a contiguous range of the
//! virtual device's sectors as described by a [`DmTargetGeometry`].
//!
//! * [`crypt`] - transparent encryption of a range of an underlying
//!   [`BlkDev`](crate::blkdev::BlkDev).
//! * [`region_hash`] - dirty region tracking and recovery coordination for
//!   mirroring targets, backed by a [`dirty_log`].

extern crate alloc;
use alloc::string::String;

use crate::blkdev::{self, BlkDevIoError};
use crate::crypto;
use crate::utils_async::asynchronous::AsyncSemaphoreError;
use crate::utils_common::alloc::TryNewError;
use core::{convert, marker};

pub mod crypt;
pub mod dirty_log;
pub mod region_hash;

/// [`DmError::InvalidArgument`] details.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DmInvalidArgument {
    /// Wrong number of table line arguments.
    ArgumentCount,
    /// Unknown cipher chaining mode.
    ChainingMode,
    /// The cipher is not available.
    CipherUnavailable,
    /// The cipher is not a block cipher.
    NotBlockCipher,
    /// The key is not a valid hex string.
    KeyDecoding,
    /// The cipher rejected the key.
    KeySetup,
    /// IV offset sector failed to parse.
    IvOffset,
    /// Device start sector failed to parse.
    DeviceSector,
    /// The device could not be resolved.
    DeviceLookup,
    /// The region size is not a power of two.
    RegionSize,
}

/// Error type returned by the device-mapper targets.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DmError {
    /// Logic error.
    Internal,

    /// A memory allocation has failed.
    MemoryAllocationFailure,

    /// Bad target configuration.
    InvalidArgument(DmInvalidArgument),

    /// IO error.
    IoError(BlkDevIoError),

    /// Some cryptographic primitive failed.
    CryptoError(crypto::CryptoError),
}

impl convert::From<TryNewError> for DmError {
    fn from(value: TryNewError) -> Self {
        match value {
            TryNewError::MemoryAllocationFailure => Self::MemoryAllocationFailure,
        }
    }
}

impl convert::From<BlkDevIoError> for DmError {
    fn from(value: BlkDevIoError) -> Self {
        match value {
            BlkDevIoError::Internal => Self::Internal,
            BlkDevIoError::MemoryAllocationFailure => Self::MemoryAllocationFailure,
            e => Self::IoError(e),
        }
    }
}

impl convert::From<crypto::CryptoError> for DmError {
    fn from(value: crypto::CryptoError) -> Self {
        match value {
            crypto::CryptoError::MemoryAllocationFailure => Self::MemoryAllocationFailure,
            crypto::CryptoError::Internal => Self::Internal,
            e => Self::CryptoError(e),
        }
    }
}

impl convert::From<AsyncSemaphoreError> for DmError {
    fn from(value: AsyncSemaphoreError) -> Self {
        match value {
            AsyncSemaphoreError::MemoryAllocationFailure => Self::MemoryAllocationFailure,
            AsyncSemaphoreError::Internal => Self::Internal,
        }
    }
}

impl convert::From<DmError> for BlkDevIoError {
    fn from(value: DmError) -> Self {
        match value {
            DmError::Internal => Self::Internal,
            DmError::MemoryAllocationFailure => Self::MemoryAllocationFailure,
            DmError::InvalidArgument(_) => Self::OperationNotSupported,
            DmError::IoError(e) => e,
            DmError::CryptoError(_) => Self::CryptoFailure,
        }
    }
}

/// Debugging friendly helper for instantiating [`DmError::Internal`].
///
/// Panics if `cfg!(debug_assertions)` is on, to allow for debugger examination
/// at the point the logic error has happened. Otherwise a
/// [`DmError::Internal`] is returned.
#[macro_export]
macro_rules! dm_err_internal {
    () => {{
        if cfg!(debug_assertions) {
            panic!("DmError::Internal");
        } else {
            $crate::dm::DmError::Internal
        }
    }};
}

/// Location of a [`DmTarget`] within the virtual device.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct DmTargetGeometry {
    /// First virtual device sector covered by the target.
    pub begin: u64,
    /// Number of sectors covered.
    pub len: u64,
}

/// Kind of status requested through [`DmTarget::status()`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DmStatusType {
    /// Transient runtime information.
    Info,
    /// The table line the target could get reconstructed from.
    Table,
}

/// Interface implemented by device-mapper targets.
pub trait DmTarget: marker::Send + marker::Sync {
    /// Map a [`Bio`](blkdev::Bio) onto the target's backing storage.
    ///
    /// On success, the target has taken over the request and will complete it
    /// asynchronously through its [completion hook](blkdev::BioEndIo), exactly
    /// once. On failure, the request is handed back untouched.
    fn map(&self, bio: blkdev::Bio) -> Result<(), (blkdev::Bio, DmError)>;

    /// Report the target's status.
    fn status(&self, status_type: DmStatusType) -> Result<String, DmError>;
}
