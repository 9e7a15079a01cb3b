// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Cryptographic primitives used by the dmtargets storage stack.

#![no_std]

// Lifetimes are not always obvious at first sight, allow for making them explicit even if
// redundant.
#![allow(clippy::needless_lifetimes)]

extern crate alloc;

use dmtargets_utils_common as utils_common;

use core::convert;
use utils_common::alloc::TryNewError;

pub mod symcipher;

/// Error information returned by the cryptographic primitives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// Memory allocation failure.
    MemoryAllocationFailure,
    /// Internal error.
    Internal,
    /// The requested algorithm is not supported by the build configuration.
    UnsupportedAlgorithm,
    /// The supplied key's length is invalid for the algorithm.
    KeySize,
    /// Invalid parameters, like an IV or input of inappropriate length.
    InvalidParams,
}

impl convert::From<TryNewError> for CryptoError {
    fn from(value: TryNewError) -> Self {
        match value {
            TryNewError::MemoryAllocationFailure => Self::MemoryAllocationFailure,
        }
    }
}
