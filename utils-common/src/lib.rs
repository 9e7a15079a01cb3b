// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

#![no_std]

pub mod alloc;
pub mod hex;

#[cfg(feature = "zeroize")]
pub use zeroize;
