// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Fallible memory allocation helpers.
//!
//! Buffers on IO paths are allocated through the helpers in here so that an
//! allocation failure surfaces as a [`TryNewError`] to the caller instead of
//! aborting.

extern crate alloc;
use alloc::{boxed::Box, vec::Vec};

#[cfg(feature = "zeroize")]
use zeroize;

/// Error returned by the fallible allocation helpers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryNewError {
    /// A memory allocation has failed.
    MemoryAllocationFailure,
}

impl From<alloc::collections::TryReserveError> for TryNewError {
    fn from(_value: alloc::collections::TryReserveError) -> Self {
        Self::MemoryAllocationFailure
    }
}

/// Allocate a [`Vec`] of specified length, filled with `T::default()`.
///
/// # Arguments:
///
/// * `len` - The length of the [`Vec`] to allocate.
pub fn try_alloc_vec<T: Clone + Default>(len: usize) -> Result<Vec<T>, TryNewError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, T::default());
    Ok(v)
}

/// Allocate a boxed slice of specified length, filled with `T::default()`.
///
/// # Arguments:
///
/// * `len` - The length of the slice to allocate.
pub fn try_alloc_boxed_slice<T: Clone + Default>(len: usize) -> Result<Box<[T]>, TryNewError> {
    Ok(try_alloc_vec(len)?.into_boxed_slice())
}

/// Allocate a zero-filled, page sized buffer.
///
/// # Arguments:
///
/// * `page_size` - Size of the page in bytes.
pub fn try_alloc_page(page_size: usize) -> Result<Box<[u8]>, TryNewError> {
    try_alloc_boxed_slice::<u8>(page_size)
}

/// Allocate a [`Vec`] of specified length wrapped in
/// [`Zeroizing`](zeroize::Zeroizing).
///
/// # Arguments:
///
/// * `len` - The length of the [`Vec`] to allocate.
#[cfg(feature = "zeroize")]
pub fn try_alloc_zeroizing_vec<T: Clone + Default + zeroize::Zeroize>(
    len: usize,
) -> Result<zeroize::Zeroizing<Vec<T>>, TryNewError> {
    Ok(zeroize::Zeroizing::new(try_alloc_vec(len)?))
}

/// Append an element to a [`Vec`], reserving capacity fallibly first.
///
/// # Arguments:
///
/// * `v` - The [`Vec`] to append to.
/// * `value` - The element to append.
pub fn try_vec_push<T>(v: &mut Vec<T>, value: T) -> Result<(), TryNewError> {
    if v.len() == v.capacity() {
        // Grow geometrically, as Vec::push() would.
        let additional = v.capacity().max(4);
        if v.try_reserve(additional).is_err() {
            v.try_reserve(1)?;
        }
    }
    v.push(value);
    Ok(())
}

#[test]
fn test_try_alloc_vec() {
    let v = try_alloc_vec::<u8>(17).unwrap();
    assert_eq!(v.len(), 17);
    assert!(v.iter().all(|b| *b == 0));

    let page = try_alloc_page(4096).unwrap();
    assert_eq!(page.len(), 4096);
}

#[test]
fn test_try_vec_push() {
    let mut v = Vec::new();
    for i in 0..100u32 {
        try_vec_push(&mut v, i).unwrap();
    }
    assert_eq!(v.len(), 100);
    assert_eq!(v[99], 99);
}
