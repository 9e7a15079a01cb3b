// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Region hash: dirty region tracking and recovery coordination for mirroring
//! targets.
//!
//! The address space of a virtual device is partitioned into power-of-two
//! sized regions. A [`RegionHash`] instantiates in-memory tracking state for
//! regions lazily, upon first reference, consulting a [`DirtyLog`] for the
//! initial state. In-flight writes are accounted for through
//! [`inc()`](RegionHash::inc) and [`dec()`](RegionHash::dec), and regions not
//! in sync get handed out for recovery in a bounded manner through
//! [`recovery_prepare()`](RegionHash::recovery_prepare) and
//! [`recovery_start()`](RegionHash::recovery_start).
//!
//! # Locking
//!
//! The hash table's bucket vector is protected by a
//! [`RwLock`](sync_types::RwLock). The four state lists (clean, quiesced,
//! recovered and failed) are protected by a separate
//! [`Lock`](sync_types::Lock), which must also be held for changing any
//! region's state or pending count. Each region additionally has its own
//! [`Lock`](sync_types::Lock) for its fields. The locking order is hash, then
//! lists, then region. Neither [`DirtyLog`] primitives nor the user supplied
//! callbacks get invoked with any of the locks held.

extern crate alloc;
use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};

use super::{DmError, DmInvalidArgument, dirty_log::DirtyLog};
use crate::blkdev::BlkDevIoError;
use crate::utils_async::{
    asynchronous::{AsyncSemaphore, AsyncSemaphoreAcquireFuture},
    sync_types::{self, Lock as _, RwLock as _},
};
use crate::utils_common::alloc::TryNewError;
use core::{future, marker, mem, pin, sync::atomic, task};


/// Multiplier for the region hash, an odd prime close to `2^32 / phi`.
const RH_HASH_MULT: u64 = 2654435387;
const RH_HASH_SHIFT: u32 = 12;
const RH_MIN_BUCKETS: usize = 128;

/// State of a tracked region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// In sync, no writes in flight.
    Clean,
    /// In sync, writes in flight.
    Dirty,
    /// Not known to be in sync.
    NoSync,
    /// Scheduled for or under recovery.
    Recovering,
}

/// Status returned by [`RegionHash::recovery_prepare()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionRecoveryPrepareStatus {
    /// `count` regions have been newly scheduled for recovery. Zero if the
    /// recovery capacity is exhausted.
    Scheduled { count: usize },
    /// The [`DirtyLog`] has no more resync work, but `in_flight` recoveries
    /// are still in progress.
    LogExhausted { in_flight: usize },
    /// No recoveries are in flight and none could get scheduled.
    Idle,
}

/// Static [`RegionHash`] configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHashConfig {
    /// Maximum number of regions allowed under recovery at a time.
    pub max_recovery: usize,
    /// Region size in units of [sectors](crate::blkdev::SECTOR_SIZE), must be a
    /// power of two.
    pub region_size: u64,
    /// Estimated total number of regions, for sizing the hash table.
    pub nr_regions: u64,
}

/// Callback for handing delayed IO back to the owner of a [`RegionHash`].
///
/// Invoked with the [`RegionHash`]'s context, the delayed IO and the
/// completion status to apply.
pub type RegionHashDispatchFn<B, C> = Box<dyn Fn(&C, Vec<B>, Result<(), BlkDevIoError>) + marker::Send + marker::Sync>;

/// Callback for waking the owner of a [`RegionHash`] to process state
/// changes.
pub type RegionHashWakeFn<C> = Box<dyn Fn(&C) + marker::Send + marker::Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionList {
    Clean,
    Quiesced,
    Recovered,
    Failed,
}

struct RegionInner<B: marker::Send> {
    state: RegionState,
    /// Number of IOs in flight.
    pending: usize,
    delayed: Vec<B>,
    on_list: Option<RegionList>,
    /// Handed out by `recovery_start()` and not ended yet.
    recovery_active: bool,
}

struct Region<ST: sync_types::SyncTypes, B: marker::Send> {
    key: u64,
    inner: ST::Lock<RegionInner<B>>,
}

type RegionRef<ST, B> = Arc<Region<ST, B>>;

struct RegionLists<ST: sync_types::SyncTypes, B: marker::Send> {
    clean: Vec<RegionRef<ST, B>>,
    quiesced: VecDeque<RegionRef<ST, B>>,
    recovered: Vec<RegionRef<ST, B>>,
    failed: Vec<RegionRef<ST, B>>,
}

impl<ST: sync_types::SyncTypes, B: marker::Send> RegionLists<ST, B> {
    fn remove(&mut self, region: &RegionRef<ST, B>, list: RegionList) {
        let matches = |r: &RegionRef<ST, B>| Arc::ptr_eq(r, region);
        match list {
            RegionList::Clean => {
                if let Some(pos) = self.clean.iter().position(matches) {
                    self.clean.swap_remove(pos);
                }
            }
            RegionList::Quiesced => {
                if let Some(pos) = self.quiesced.iter().position(matches) {
                    self.quiesced.remove(pos);
                }
            }
            RegionList::Recovered => {
                if let Some(pos) = self.recovered.iter().position(matches) {
                    self.recovered.swap_remove(pos);
                }
            }
            RegionList::Failed => {
                if let Some(pos) = self.failed.iter().position(matches) {
                    self.failed.swap_remove(pos);
                }
            }
        }
    }
}

/// Handle to a region handed out for recovery by
/// [`RegionHash::recovery_start()`].
///
/// Must get returned through [`RegionHash::recovery_end()`].
pub struct RegionRecovery<ST: sync_types::SyncTypes, B: marker::Send> {
    region: RegionRef<ST, B>,
}

impl<ST: sync_types::SyncTypes, B: marker::Send> RegionRecovery<ST, B> {
    /// The region under recovery.
    pub fn key(&self) -> u64 {
        self.region.key
    }
}

/// Dirty region tracker.
///
/// Generic over the execution environment's [`SyncTypes`](sync_types::SyncTypes)
/// `ST`, the type `B` of IO that may get [delayed](Self::delay) on regions
/// and the type `C` of the owner supplied context passed back to the
/// callbacks.
pub struct RegionHash<ST: sync_types::SyncTypes, B: marker::Send, C: marker::Send + marker::Sync> {
    context: C,
    dispatch: RegionHashDispatchFn<B, C>,
    wake: RegionHashWakeFn<C>,
    log: Arc<dyn DirtyLog>,

    max_recovery: usize,
    region_shift: u32,
    mask: usize,

    buckets: ST::RwLock<Vec<Vec<RegionRef<ST, B>>>>,
    lists: ST::Lock<RegionLists<ST, B>>,

    recovery_count: AsyncSemaphore<ST>,
    recovery_in_flight: atomic::AtomicUsize,
}

impl<ST: sync_types::SyncTypes, B: marker::Send, C: marker::Send + marker::Sync> RegionHash<ST, B, C> {
    /// Create a new `RegionHash`.
    ///
    /// Recovery is initially stopped, use
    /// [`start_recovery()`](Self::start_recovery) to enable it.
    ///
    /// # Arguments:
    ///
    /// * `config` - The static configuration.
    /// * `context` - Owner supplied context passed to `dispatch` and `wake`.
    /// * `dispatch` - Callback for submitting [delayed](Self::delay) IO.
    /// * `wake` - Callback for waking the owner to process state changes.
    /// * `log` - The [`DirtyLog`] backing the tracking state.
    pub fn new(
        config: &RegionHashConfig,
        context: C,
        dispatch: RegionHashDispatchFn<B, C>,
        wake: RegionHashWakeFn<C>,
        log: Arc<dyn DirtyLog>,
    ) -> Result<Self, DmError> {
        if !config.region_size.is_power_of_two() {
            return Err(DmError::InvalidArgument(DmInvalidArgument::RegionSize));
        }
        let region_shift = config.region_size.trailing_zeros();

        let max_buckets = config.nr_regions >> 6;
        let mut nr_buckets = RH_MIN_BUCKETS;
        while (nr_buckets as u64) < max_buckets {
            nr_buckets = nr_buckets.checked_mul(2).ok_or(DmError::MemoryAllocationFailure)?;
        }
        nr_buckets >>= 1;

        let mut buckets = Vec::new();
        buckets.try_reserve_exact(nr_buckets).map_err(TryNewError::from)?;
        buckets.resize_with(nr_buckets, Vec::new);

        Ok(Self {
            context,
            dispatch,
            wake,
            log,
            max_recovery: config.max_recovery,
            region_shift,
            mask: nr_buckets - 1,
            buckets: ST::RwLock::from(buckets),
            lists: ST::Lock::from(RegionLists {
                clean: Vec::new(),
                quiesced: VecDeque::new(),
                recovered: Vec::new(),
                failed: Vec::new(),
            }),
            recovery_count: AsyncSemaphore::new(0),
            recovery_in_flight: atomic::AtomicUsize::new(0),
        })
    }

    /// The owner supplied context.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// The [`DirtyLog`] backing the tracking state.
    pub fn log(&self) -> &Arc<dyn DirtyLog> {
        &self.log
    }

    /// Region size in units of [sectors](crate::blkdev::SECTOR_SIZE).
    pub fn region_size(&self) -> u64 {
        1u64 << self.region_shift
    }

    /// Map a sector to the region containing it.
    pub fn sector_to_region(&self, sector: u64) -> u64 {
        sector >> self.region_shift
    }

    /// Map a region to its first sector.
    pub fn region_to_sector(&self, region: u64) -> u64 {
        region << self.region_shift
    }

    /// Number of regions handed out for recovery and not
    /// [ended](Self::recovery_end) yet.
    pub fn recovery_in_flight(&self) -> usize {
        self.recovery_in_flight.load(atomic::Ordering::Acquire)
    }

    fn bucket_index(&self, key: u64) -> usize {
        (key.wrapping_mul(RH_HASH_MULT) >> RH_HASH_SHIFT) as usize & self.mask
    }

    fn find<'a>(&self, buckets: &'a [Vec<RegionRef<ST, B>>], key: u64) -> Option<&'a RegionRef<ST, B>> {
        buckets[self.bucket_index(key)].iter().find(|r| r.key == key)
    }

    fn alloc_region(&self, key: u64, may_block: bool) {
        let state = match self.log.in_sync(key, may_block) {
            Ok(true) => RegionState::Clean,
            _ => RegionState::NoSync,
        };
        let region = Arc::new(Region::<ST, B> {
            key,
            inner: ST::Lock::from(RegionInner {
                state,
                pending: 0,
                delayed: Vec::new(),
                on_list: None,
                recovery_active: false,
            }),
        });

        let mut buckets = self.buckets.write();
        let index = self.bucket_index(key);
        if buckets[index].iter().any(|r| r.key == key) {
            // Lost the race.
            return;
        }
        if state == RegionState::Clean {
            let mut lists = self.lists.lock();
            region.inner.lock().on_list = Some(RegionList::Clean);
            lists.clean.push(region.clone());
        }
        buckets[index].push(region);
    }

    /// Lookup a region, instantiating it if not present, and invoke `f` on it
    /// with the hash read-locked.
    fn with_region<R, F: FnOnce(&RegionRef<ST, B>) -> R>(&self, key: u64, may_block: bool, f: F) -> R {
        loop {
            {
                let buckets = self.buckets.read();
                if let Some(region) = self.find(&buckets, key) {
                    return f(region);
                }
            }
            self.alloc_region(key, may_block);
        }
    }

    /// Query a region's state.
    ///
    /// For regions not tracked in memory, the [`DirtyLog`] gets consulted.
    /// Failures to determine the sync status, including the log's inability
    /// to answer without blocking, are reported as [`RegionState::NoSync`].
    ///
    /// # Arguments:
    ///
    /// * `region` - The region to query.
    /// * `may_block` - Whether the [`DirtyLog`] query may block.
    pub fn get_state(&self, region: u64, may_block: bool) -> RegionState {
        let state = {
            let buckets = self.buckets.read();
            self.find(&buckets, region).map(|r| r.inner.lock().state)
        };
        match state {
            Some(state) => state,
            None => match self.log.in_sync(region, may_block) {
                Ok(true) => RegionState::Clean,
                _ => RegionState::NoSync,
            },
        }
    }

    /// Set a region's state.
    ///
    /// The [`DirtyLog`] gets updated accordingly: [`RegionState::Clean`]
    /// clears the region, [`RegionState::Dirty`] marks it and
    /// [`RegionState::NoSync`] sets it out of sync.
    ///
    /// # Arguments:
    ///
    /// * `region` - The region to update.
    /// * `state` - The new state.
    /// * `may_block` - Whether [`DirtyLog`] queries may block.
    pub fn set_state(&self, region: u64, state: RegionState, may_block: bool) {
        match state {
            RegionState::Clean => self.log.clear_region(region),
            RegionState::Dirty => self.log.mark_region(region),
            RegionState::NoSync => self.log.set_region_sync(region, false),
            RegionState::Recovering => (),
        }

        self.with_region(region, may_block, |r| {
            let mut lists = self.lists.lock();
            let mut inner = r.inner.lock();
            inner.state = state;
            match state {
                RegionState::Clean => {
                    if inner.pending == 0 && inner.on_list.is_none() {
                        inner.on_list = Some(RegionList::Clean);
                        lists.clean.push(r.clone());
                    }
                }
                _ => {
                    if inner.on_list == Some(RegionList::Clean) {
                        inner.on_list = None;
                        lists.remove(r, RegionList::Clean);
                    }
                }
            }
        });
    }

    /// Account for an IO in flight to a region.
    ///
    /// A [`RegionState::Clean`] region transitions to
    /// [`RegionState::Dirty`] and gets marked in the [`DirtyLog`].
    pub fn inc(&self, region: u64) {
        let mark = self.with_region(region, true, |r| {
            let mut lists = self.lists.lock();
            let mut inner = r.inner.lock();
            inner.pending += 1;
            let on_list = inner.on_list;
            if let Some(list @ (RegionList::Clean | RegionList::Quiesced)) = on_list {
                inner.on_list = None;
                lists.remove(r, list);
            }
            if inner.state == RegionState::Clean {
                inner.state = RegionState::Dirty;
                true
            } else {
                false
            }
        });

        if mark {
            self.log.mark_region(region);
        }
    }

    /// [Account](Self::inc) for an IO in flight to each of `regions`.
    pub fn inc_pending(&self, regions: &[u64]) {
        for region in regions {
            self.inc(*region);
        }
    }

    /// Account for the completion of an IO to a region.
    ///
    /// Once there are no more IOs in flight, the region becomes quiescent: it
    /// gets queued for recovery if in [`RegionState::Recovering`], or
    /// transitions to [`RegionState::Clean`] otherwise. Regions already
    /// listed or currently handed out for recovery are left alone. In either
    /// case, the owner gets woken. Returns `true` if the region has become
    /// quiescent.
    pub fn dec(&self, region: u64) -> bool {
        let quiescent = {
            let buckets = self.buckets.read();
            let r = match self.find(&buckets, region) {
                Some(r) => r,
                None => {
                    if cfg!(debug_assertions) {
                        panic!("Untracked region {} decremented", region);
                    }
                    return false;
                }
            };

            let mut lists = self.lists.lock();
            let mut inner = r.inner.lock();
            if inner.pending == 0 {
                if cfg!(debug_assertions) {
                    panic!("Region {} pending count underflow", region);
                }
                return false;
            }
            inner.pending -= 1;
            if inner.pending != 0 {
                false
            } else {
                if inner.on_list.is_none() && !inner.recovery_active {
                    if inner.state == RegionState::Recovering {
                        inner.on_list = Some(RegionList::Quiesced);
                        lists.quiesced.push_back(r.clone());
                    } else {
                        inner.state = RegionState::Clean;
                        inner.on_list = Some(RegionList::Clean);
                        lists.clean.push(r.clone());
                    }
                }
                true
            }
        };

        if quiescent {
            (self.wake)(&self.context);
        }
        quiescent
    }

    fn recovery_prepare_one(&self) -> bool {
        let region = match self.log.get_resync_work() {
            Some(region) => region,
            None => return false,
        };

        self.with_region(region, true, |r| {
            let mut lists = self.lists.lock();
            let mut inner = r.inner.lock();
            inner.state = RegionState::Recovering;
            if let Some(list) = inner.on_list.take() {
                lists.remove(r, list);
            }
            if inner.pending == 0 {
                inner.on_list = Some(RegionList::Quiesced);
                lists.quiesced.push_front(r.clone());
            }
        });
        log::debug!("Region {} scheduled for recovery", region);
        true
    }

    /// Schedule regions not in sync for recovery.
    ///
    /// As long as the recovery capacity permits, obtain resync work from the
    /// [`DirtyLog`] and transition the respective regions to
    /// [`RegionState::Recovering`]. Regions without IO in flight become
    /// available to [`recovery_start()`](Self::recovery_start) right away,
    /// the others once their last IO [completes](Self::dec).
    pub fn recovery_prepare(&self) -> RegionRecoveryPrepareStatus {
        let mut count = 0;
        let mut log_exhausted = false;
        while self.recovery_count.try_acquire(1) {
            self.recovery_in_flight.fetch_add(1, atomic::Ordering::AcqRel);
            if !self.recovery_prepare_one() {
                self.recovery_in_flight.fetch_sub(1, atomic::Ordering::AcqRel);
                self.recovery_count.release(1);
                log_exhausted = true;
                break;
            }
            count += 1;
        }

        let in_flight = self.recovery_in_flight();
        if in_flight == 0 {
            RegionRecoveryPrepareStatus::Idle
        } else if log_exhausted {
            RegionRecoveryPrepareStatus::LogExhausted { in_flight }
        } else {
            RegionRecoveryPrepareStatus::Scheduled { count }
        }
    }

    /// Obtain the next quiescent region to recover.
    pub fn recovery_start(&self) -> Option<RegionRecovery<ST, B>> {
        let mut lists = self.lists.lock();
        let region = lists.quiesced.pop_front()?;
        {
            let mut inner = region.inner.lock();
            inner.on_list = None;
            inner.recovery_active = true;
        }
        Some(RegionRecovery { region })
    }

    /// Conclude a region's recovery.
    ///
    /// The region gets queued for the final state update in
    /// [`update_states()`](Self::update_states) and the owner gets woken.
    ///
    /// # Arguments:
    ///
    /// * `recovery` - The region as obtained from
    ///   [`recovery_start()`](Self::recovery_start).
    /// * `success` - Whether the region has been resynchronized successfully.
    pub fn recovery_end(&self, recovery: RegionRecovery<ST, B>, success: bool) {
        let region = recovery.region;
        {
            let mut lists = self.lists.lock();
            let mut inner = region.inner.lock();
            inner.recovery_active = false;
            if success {
                inner.on_list = Some(RegionList::Recovered);
                lists.recovered.push(region.clone());
            } else {
                inner.state = RegionState::NoSync;
                inner.on_list = Some(RegionList::Failed);
                lists.failed.push(region.clone());
            }
        }
        log::debug!(
            "Region {} recovery {}",
            region.key,
            if success { "completed" } else { "failed" }
        );

        let prev = self.recovery_in_flight.fetch_sub(1, atomic::Ordering::AcqRel);
        debug_assert_ne!(prev, 0);
        (self.wake)(&self.context);
    }

    /// Process the regions that have become clean, recovered or failed to
    /// recover.
    ///
    /// The regions are removed from the hash first, except for recovered or
    /// failed ones which got new IO meanwhile: these stay tracked, a recovered
    /// one as [`RegionState::Dirty`]. Then, clean regions get cleared in the
    /// [`DirtyLog`], recovered ones also get set in sync and have their
    /// delayed IO dispatched for submission. Failed regions have
    /// their delayed IO dispatched with an error and are set in sync only if
    /// `errors_handled` is `false`. Each recovered or failed region returns
    /// its recovery capacity. Finally the [`DirtyLog`] gets flushed.
    pub fn update_states(&self, errors_handled: bool) {
        let (clean, recovered, failed) = {
            let mut buckets = self.buckets.write();
            let mut lists = self.lists.lock();
            let clean = mem::take(&mut lists.clean);
            let recovered = mem::take(&mut lists.recovered);
            let failed = mem::take(&mut lists.failed);
            for r in clean.iter().chain(recovered.iter()).chain(failed.iter()) {
                {
                    let mut inner = r.inner.lock();
                    let list = inner.on_list.take();
                    if inner.pending != 0 {
                        if list == Some(RegionList::Recovered) {
                            inner.state = RegionState::Dirty;
                        }
                        continue;
                    }
                }
                let bucket = &mut buckets[self.bucket_index(r.key)];
                if let Some(pos) = bucket.iter().position(|b| Arc::ptr_eq(b, r)) {
                    bucket.swap_remove(pos);
                }
            }
            (clean, recovered, failed)
        };

        if !recovered.is_empty() || !failed.is_empty() {
            log::debug!(
                "Updating region states: {} clean, {} recovered, {} failed",
                clean.len(),
                recovered.len(),
                failed.len()
            );
        }

        for r in recovered {
            let (delayed, in_flight) = {
                let mut inner = r.inner.lock();
                (mem::take(&mut inner.delayed), inner.state == RegionState::Dirty)
            };
            self.log.set_region_sync(r.key, true);
            if in_flight {
                self.log.mark_region(r.key);
            } else {
                self.log.clear_region(r.key);
            }
            (self.dispatch)(&self.context, delayed, Ok(()));
            self.recovery_count.release(1);
        }

        for r in failed {
            self.log.set_region_sync(r.key, !errors_handled);
            let delayed = mem::take(&mut r.inner.lock().delayed);
            (self.dispatch)(&self.context, delayed, Err(BlkDevIoError::IoFailure));
            self.recovery_count.release(1);
        }

        for r in clean {
            self.log.clear_region(r.key);
            let delayed = mem::take(&mut r.inner.lock().delayed);
            if !delayed.is_empty() {
                (self.dispatch)(&self.context, delayed, Ok(()));
            }
        }

        if let Err(e) = self.log.flush() {
            log::error!("Dirty log flush failed: {:?}", e);
        }
    }

    /// Delay an IO to the region containing `sector`.
    pub fn delay(&self, sector: u64, io: B) {
        self.delay_by_region(self.sector_to_region(sector), io)
    }

    /// Delay an IO to a region.
    ///
    /// The IO gets handed back through the dispatch callback once the
    /// region's recovery has concluded, or through
    /// [`dispatch_delayed()`](Self::dispatch_delayed).
    pub fn delay_by_region(&self, region: u64, io: B) {
        self.with_region(region, true, |r| r.inner.lock().delayed.push(io))
    }

    /// Dispatch a region's delayed IO and return one unit of recovery
    /// capacity.
    ///
    /// Nothing happens if the region is not tracked.
    pub fn dispatch_delayed(&self, region: u64, result: Result<(), BlkDevIoError>) {
        let delayed = {
            let buckets = self.buckets.read();
            self.find(&buckets, region)
                .map(|r| mem::take(&mut r.inner.lock().delayed))
        };
        if let Some(delayed) = delayed {
            (self.dispatch)(&self.context, delayed, result);
            self.recovery_count.release(1);
        }
    }

    /// Flush the [`DirtyLog`].
    pub fn flush(&self) -> Result<(), DmError> {
        self.log
            .flush()
            .map_err(|_| DmError::IoError(BlkDevIoError::IoFailure))
    }

    /// Stop recovery.
    ///
    /// Wake the owner and return a [`Future`](future::Future) completing once
    /// all recovery capacity has been drained, i.e. once all recoveries in
    /// flight have been [processed](Self::update_states). No new recoveries
    /// get scheduled while waiting.
    pub fn stop_recovery(&self) -> RegionHashStopRecoveryFuture<'_, ST> {
        (self.wake)(&self.context);
        RegionHashStopRecoveryFuture {
            acquire: self.recovery_count.acquire(self.max_recovery),
        }
    }

    /// (Re-)enable recovery.
    pub fn start_recovery(&self) {
        self.recovery_count.release(self.max_recovery);
        (self.wake)(&self.context);
    }
}

/// [`Future`](future::Future) returned by [`RegionHash::stop_recovery()`].
pub struct RegionHashStopRecoveryFuture<'a, ST: sync_types::SyncTypes> {
    acquire: AsyncSemaphoreAcquireFuture<'a, ST>,
}

impl<'a, ST: sync_types::SyncTypes> future::Future for RegionHashStopRecoveryFuture<'a, ST> {
    type Output = Result<(), DmError>;

    fn poll(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        match future::Future::poll(pin::Pin::new(&mut this.acquire), cx) {
            task::Poll::Ready(result) => task::Poll::Ready(result.map_err(DmError::from)),
            task::Poll::Pending => task::Poll::Pending,
        }
    }
}
