// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC

//! Lock abstraction traits.
//!
//! # Execution environment agnostic sync type abstractions
//!
//! In `[no_std]` environments, the `std::sync::Mutex` or `std::sync::RwLock`
//! are unavailable and the exact semantics of a provided lock implementation
//! depend heavily on the target execution environment -- it could be anything
//! ranging from a simple spinlock up to a full blown mutex with scheduling
//! semantics. In order to facilitate integrations into any possible
//! environment, define abstraction traits for locks that the rest of the code
//! can be made generic over: [`ConstructibleLock`] and [`RwLock`]. For limiting
//! the amount of generic parameters to get specified all over the place, group
//! them together as associated types of the [`SyncTypes`] trait expected to get
//! implemented for a target execution environment.
//!
//! # Lock ordering
//!
//! Code generic over [`SyncTypes`] must assume the locks to be of the
//! spinlock kind. Consequently it must never call out to a user supplied
//! callback, submit IO or block on anything while holding one.

use core::{convert, marker, ops};

/// Execution environment agnostic lock abstraction.
///
/// Users of the `Lock` must assume that the implementation is of the spinlock
/// type and **must not** block while holding the lock or execute otherwise
/// long-running work. This includes IO in particular, but also memory
/// allocations.
pub trait Lock<T: ?Sized>: marker::Send + marker::Sync {
    /// Lock guard type returned by [`lock()`](Self::lock).
    type Guard<'a>: ops::Deref<Target = T> + ops::DerefMut
    where
        Self: 'a;

    /// Lock the lock.
    ///
    /// Users of the `Lock` **must not** block or execute otherwise long-running
    /// work while holding the lock.
    fn lock(&self) -> Self::Guard<'_>;
}

/// Constructible [`Lock`].
///
/// The [`ConstructibleLock`] trait is implemented by [`Lock`] types which are
/// constructible by wrapping a value.
pub trait ConstructibleLock<T>: Lock<T> + convert::From<T> {
    /// Access the wrapped value.
    ///
    /// Access the wrapped value through a mutable reference on `Self` without
    /// going through a locking operation. Note that the existence of the
    /// `mut` reference on `Self` implies that it cannot have been locked
    /// concurrently and that access is exclusive.
    fn get_mut(&mut self) -> &mut T;
}

/// Execution environment agnostic read-write lock abstraction.
///
/// Like for [`Lock`], users must assume a spinning implementation.
pub trait RwLock<T>: marker::Send + marker::Sync + convert::From<T> {
    /// Read lock guard type returned by [`read()`](Self::read).
    type ReadGuard<'a>: ops::Deref<Target = T>
    where
        Self: 'a;

    /// Write lock guard type returned by [`write()`](Self::write).
    type WriteGuard<'a>: ops::Deref<Target = T> + ops::DerefMut
    where
        Self: 'a;

    /// Lock the `RwLock` non-exclusively for reading.
    ///
    /// Users of the `RwLock` **must not** block or execute otherwise
    /// long-running work while holding the lock.
    fn read(&self) -> Self::ReadGuard<'_>;

    /// Lock the `RwLock` exclusively for writing.
    ///
    /// Users of the `RwLock` **must not** block or execute otherwise
    /// long-running work while holding the lock.
    fn write(&self) -> Self::WriteGuard<'_>;

    /// Access the wrapped value without locking.
    fn get_mut(&mut self) -> &mut T;
}

/// Collection of sync type implementations for a given execution environment.
pub trait SyncTypes: marker::Send + marker::Sync + marker::Unpin + 'static {
    /// The execution environment's implementation of the [`ConstructibleLock`]
    /// trait.
    type Lock<T: marker::Send>: ConstructibleLock<T>;
    /// The execution environment's implementation of the [`RwLock`] trait.
    type RwLock<T: marker::Send + marker::Sync>: RwLock<T>;
}
