// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

#![no_std]

// Lifetimes are not always obvious at first sight, allow for making them explicit even if
// redundant.
#![allow(clippy::needless_lifetimes)]

use dmtargets_utils_common as utils_common;

pub mod asynchronous;
pub mod sync_types;
pub mod test;
