// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Transparent encryption target.
//!
//! A [`CryptTarget`] maps requests against its range of the virtual device
//! onto an underlying [`BlkDev`], encrypting written and decrypting read data
//! sector by sector on the way. It gets configured through a table line of
//! the form
//!
//! ```text
//! <cipher>[-<chainmode>] <key> <iv_offset> <device> <start>
//! ```
//!
//! * `<cipher>` - Cipher name as understood by the
//!   [`CryptCipherProvider`], e.g. `aes` or `cipher_null`.
//! * `<chainmode>` - Either of `plain` (CBC with the sector number as IV,
//!   the default) or `ecb`.
//! * `<key>` - The key as a hex string, or `-` for an empty key.
//! * `<iv_offset>` - Offset added to the target relative sector for IV
//!   derivation.
//! * `<device>` - Name of the underlying device, resolved through a
//!   [`BlkDevLookup`].
//! * `<start>` - First sector of the target's range on the underlying
//!   device.
//!
//! Writes get encrypted into freshly allocated buffer pages, possibly split
//! into multiple fragments either because of the underlying device's
//! [maximum request size](BlkDev::max_bio_bytes) or because of memory
//! pressure. Reads get submitted on the original request's pages and
//! decrypted in place from a [`CryptWorkQueue`] after completion, never from
//! within the completion context itself.

extern crate alloc;
use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};

use crate::blkdev::{
    self, BioDirection, BioSegment, BlkDev, BlkDevIoError, BlkDevLookup, PAGE_SIZE, SECTOR_SHIFT, SECTOR_SIZE,
};
use crate::dm::{DmError, DmInvalidArgument, DmStatusType, DmTarget, DmTargetGeometry};
use crate::utils_async::sync_types;
use crate::utils_common::{
    alloc::{TryNewError, try_alloc_zeroizing_vec, try_vec_push},
    hex,
};
use core::fmt::Write as _;
use zeroize::Zeroizing;

mod cipher;
mod convert;
mod io;
mod pool;
mod worker;

#[cfg(test)]
mod test;

pub use cipher::{CryptChainMode, CryptCipher, CryptCipherProvider, CryptNullCipher, SymCryptCipherProvider};
pub use convert::{CRYPT_MAX_IV_SIZE, crypt_iv_plain};
pub use pool::{CryptIoPool, CryptIoPoolLease, CryptPagePool};
pub use worker::{CryptWorkItem, CryptWorkQueue, CryptWorker};

use convert::{CryptConvertContext, CryptConvertParams};
use io::{CryptFragmentEndIo, CryptIo, CryptReadFragment};

/// Default capacity of a target's [`CryptIoPool`].
pub const CRYPT_MIN_IOS: usize = 256;

/// Default number of pages kept in reserve by a target's [`CryptPagePool`].
pub const CRYPT_MIN_POOL_PAGES: usize = 32;

/// Number of [congestion waits](BlkDev::congestion_wait) before a write
/// fragment allocation failing entirely gets reported as an error.
pub const CRYPT_ALLOC_RETRIES: usize = 16;

/// Resources provided to [`CryptTarget::ctr()`] by the hosting environment.
pub struct CryptTargetEnv<'a, ST: sync_types::SyncTypes> {
    /// Resolver for the table line's `<device>`.
    pub blkdev_lookup: &'a dyn BlkDevLookup,
    /// Source of cipher instances.
    pub cipher_provider: &'a dyn CryptCipherProvider,
    /// Decrypt queue, typically shared among all targets.
    pub work_queue: Arc<CryptWorkQueue<ST>>,
    /// Capacity of the target's [`CryptIoPool`].
    pub min_ios: usize,
    /// Number of pages kept in reserve by the target's [`CryptPagePool`].
    pub min_pool_pages: usize,
    /// Optional limit on the number of pages handed out by the target's
    /// [`CryptPagePool`] at a time.
    pub max_pool_pages: Option<usize>,
}

impl<'a, ST: sync_types::SyncTypes> CryptTargetEnv<'a, ST> {
    /// Create a `CryptTargetEnv` with default pool dimensions.
    pub fn new(
        blkdev_lookup: &'a dyn BlkDevLookup,
        cipher_provider: &'a dyn CryptCipherProvider,
        work_queue: Arc<CryptWorkQueue<ST>>,
    ) -> Self {
        Self {
            blkdev_lookup,
            cipher_provider,
            work_queue,
            min_ios: CRYPT_MIN_IOS,
            min_pool_pages: CRYPT_MIN_POOL_PAGES,
            max_pool_pages: None,
        }
    }
}

/// A [`CryptTarget`]'s configuration, shared with its requests in flight.
struct CryptConfig<ST: sync_types::SyncTypes> {
    geometry: DmTargetGeometry,
    dev: Arc<dyn BlkDev>,
    dev_name: String,
    /// First sector on `dev`.
    start: u64,
    iv_offset: u64,
    iv_size: usize,
    cipher_name: String,
    chain_mode: CryptChainMode,
    cipher: Box<dyn CryptCipher>,
    key: Zeroizing<Vec<u8>>,
    page_pool: CryptPagePool<ST>,
    io_pool: Arc<CryptIoPool>,
    work_queue: Arc<CryptWorkQueue<ST>>,
}

impl<ST: sync_types::SyncTypes> CryptConfig<ST> {
    fn convert_params(&self) -> CryptConvertParams<'_> {
        CryptConvertParams {
            cipher: &*self.cipher,
            iv_size: self.iv_size,
        }
    }

    /// Maximum fragment size in bytes, a multiple of the sector size.
    fn max_fragment_bytes(&self) -> usize {
        match self.dev.max_bio_bytes() {
            Some(max_bio_bytes) => max_bio_bytes & !(SECTOR_SIZE - 1),
            None => usize::MAX & !(SECTOR_SIZE - 1),
        }
    }
}

fn try_string_from(s: &str) -> Result<String, TryNewError> {
    let mut owned = String::new();
    owned.try_reserve_exact(s.len())?;
    owned.push_str(s);
    Ok(owned)
}

/// Transparent encryption [`DmTarget`].
pub struct CryptTarget<ST: sync_types::SyncTypes> {
    config: Arc<CryptConfig<ST>>,
}

impl<ST: sync_types::SyncTypes> CryptTarget<ST> {
    /// Construct a `CryptTarget` from its table line arguments.
    ///
    /// # Arguments:
    ///
    /// * `geometry` - The range of the virtual device covered by the target.
    /// * `argv` - The table line's five arguments, see the [module
    ///   level](self) documentation.
    /// * `env` - Resources provided by the hosting environment.
    pub fn ctr(geometry: DmTargetGeometry, argv: &[&str], env: &CryptTargetEnv<'_, ST>) -> Result<Self, DmError> {
        if argv.len() != 5 {
            return Err(DmError::InvalidArgument(DmInvalidArgument::ArgumentCount));
        }

        let mut cipher_spec = argv[0].split('-');
        let cipher_name = cipher_spec.next().unwrap_or("");
        let chain_mode = CryptChainMode::parse(cipher_spec.next())?;
        if cipher_spec.next().is_some() {
            log::warn!("Unexpected additional cipher options");
        }

        let mut cipher = env.cipher_provider.alloc_cipher(cipher_name, chain_mode)?;
        if !cipher.is_block_cipher() {
            return Err(DmError::InvalidArgument(DmInvalidArgument::NotBlockCipher));
        }

        let iv_size = if cipher.supports_iv() {
            cipher.iv_size().max(4)
        } else {
            if chain_mode == CryptChainMode::Plain {
                log::warn!("Selected cipher does not support IVs");
            }
            0
        };
        if iv_size > CRYPT_MAX_IV_SIZE {
            return Err(DmError::InvalidArgument(DmInvalidArgument::CipherUnavailable));
        }

        let io_pool = Arc::new(CryptIoPool::new(env.min_ios));
        let page_pool = CryptPagePool::new(env.min_pool_pages, env.max_pool_pages)?;

        let key = if argv[1] == "-" {
            try_alloc_zeroizing_vec(0)?
        } else {
            let key_len =
                hex::decoded_len(argv[1]).ok_or(DmError::InvalidArgument(DmInvalidArgument::KeyDecoding))?;
            let mut key = try_alloc_zeroizing_vec(key_len)?;
            hex::decode_into(argv[1], &mut key)
                .map_err(|_| DmError::InvalidArgument(DmInvalidArgument::KeyDecoding))?;
            key
        };
        cipher
            .set_key(&key)
            .map_err(|_| DmError::InvalidArgument(DmInvalidArgument::KeySetup))?;

        let iv_offset = argv[2]
            .parse::<u64>()
            .map_err(|_| DmError::InvalidArgument(DmInvalidArgument::IvOffset))?;
        let start = argv[4]
            .parse::<u64>()
            .map_err(|_| DmError::InvalidArgument(DmInvalidArgument::DeviceSector))?;
        let dev = env
            .blkdev_lookup
            .lookup(argv[3])
            .ok_or(DmError::InvalidArgument(DmInvalidArgument::DeviceLookup))?;

        let cipher_name = try_string_from(cipher_name)?;
        let dev_name = try_string_from(argv[3])?;
        env.work_queue.reserve(env.min_ios)?;

        Ok(Self {
            config: Arc::new(CryptConfig {
                geometry,
                dev,
                dev_name,
                start,
                iv_offset,
                iv_size,
                cipher_name,
                chain_mode,
                cipher,
                key,
                page_pool,
                io_pool,
                work_queue: env.work_queue.clone(),
            }),
        })
    }

    /// Construct a `CryptTarget` from a whitespace separated table line.
    pub fn ctr_from_table_line(
        geometry: DmTargetGeometry,
        line: &str,
        env: &CryptTargetEnv<'_, ST>,
    ) -> Result<Self, DmError> {
        let mut argv: [&str; 5] = [""; 5];
        let mut argc = 0;
        for arg in line.split_whitespace() {
            if argc == argv.len() {
                return Err(DmError::InvalidArgument(DmInvalidArgument::ArgumentCount));
            }
            argv[argc] = arg;
            argc += 1;
        }
        Self::ctr(geometry, &argv[..argc], env)
    }

    /// Tear the target down.
    ///
    /// Requests still in flight keep the configuration alive until they
    /// complete.
    pub fn dtr(self) {
        log::debug!(
            "Crypt target on {} destroyed, {} IOs in flight",
            self.config.dev_name,
            self.config.io_pool.in_use()
        );
    }

    pub fn geometry(&self) -> &DmTargetGeometry {
        &self.config.geometry
    }

    /// The IV size in bytes, zero if the cipher takes none.
    pub fn iv_size(&self) -> usize {
        self.config.iv_size
    }

    /// The requested chaining mode.
    pub fn chain_mode(&self) -> CryptChainMode {
        self.config.chain_mode
    }

    /// The decoded key.
    pub fn key(&self) -> &[u8] {
        &self.config.key
    }

    pub fn iv_offset(&self) -> u64 {
        self.config.iv_offset
    }

    pub fn start(&self) -> u64 {
        self.config.start
    }

    pub fn dev_name(&self) -> &str {
        &self.config.dev_name
    }

    pub fn cipher_name(&self) -> &str {
        &self.config.cipher_name
    }

    /// Number of buffer pages currently handed out for write fragments.
    pub fn pages_in_use(&self) -> usize {
        self.config.page_pool.outstanding()
    }

    /// Number of requests currently in flight.
    pub fn ios_in_flight(&self) -> usize {
        self.config.io_pool.in_use()
    }

    /// Allocate buffer pages for a write fragment of up to `want` bytes.
    ///
    /// May return fewer pages than requested, or none at all, if the
    /// [`CryptPagePool`] is exhausted.
    fn alloc_write_buffer(&self, want: usize) -> Result<Vec<BioSegment>, DmError> {
        let mut segments = Vec::new();
        segments
            .try_reserve_exact(want.div_ceil(PAGE_SIZE))
            .map_err(TryNewError::from)?;
        let mut allocated = 0;
        while allocated < want {
            let page = match self.config.page_pool.alloc() {
                Some(page) => page,
                None => break,
            };
            let len = (want - allocated).min(PAGE_SIZE);
            segments.push(BioSegment::new(page, 0, len));
            allocated += len;
        }
        Ok(segments)
    }

    fn free_write_buffer(&self, segments: Vec<BioSegment>) {
        for segment in segments {
            if let Some(page) = segment.into_page() {
                self.config.page_pool.free(page);
            }
        }
    }

    fn map_write(
        &self,
        io: Arc<CryptIo<ST>>,
        bio: blkdev::Bio,
        sector: u64,
    ) -> Result<(), (blkdev::Bio, DmError)> {
        let config = &self.config;
        let params = config.convert_params();
        let max_fragment_bytes = config.max_fragment_bytes();
        let mut ctx = CryptConvertContext::new(sector.wrapping_add(config.iv_offset), true);
        let mut remaining = bio.size();
        let mut fragment_sector = sector;
        let mut dispatched = false;
        let mut retries = 0;
        let mut failure = None;

        while remaining != 0 {
            let want = remaining.min(max_fragment_bytes);
            let segments = match self.alloc_write_buffer(want) {
                Ok(segments) => segments,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            let allocated: usize = segments.iter().map(|s| s.len()).sum();
            if allocated == 0 {
                if retries < CRYPT_ALLOC_RETRIES {
                    retries += 1;
                    config.dev.congestion_wait();
                    continue;
                }
                failure = Some(DmError::MemoryAllocationFailure);
                break;
            }
            retries = 0;

            let mut fragment = blkdev::Bio::new(BioDirection::Write, config.start + fragment_sector, segments);
            ctx.reset_out();
            if let Err(e) = ctx.convert(&params, bio.segments(), fragment.segments_mut()) {
                self.free_write_buffer(fragment.take_segments());
                failure = Some(DmError::from(e));
                break;
            }

            let first_clone = io.note_fragment();
            fragment.set_end_io(Box::new(CryptFragmentEndIo::new_write(
                io.clone(),
                first_clone,
                allocated,
            )));
            io.inc_pending();
            config.dev.submit_bio(fragment);
            dispatched = true;

            remaining -= allocated;
            fragment_sector += (allocated >> SECTOR_SHIFT) as u64;
            if remaining != 0 && allocated < want {
                config.dev.congestion_wait();
            }
        }

        if let Some(e) = failure {
            if !dispatched {
                return Err((bio, e));
            }
        }
        io.set_base_bio(bio);
        io.dec_pending(match failure {
            Some(e) => Err(BlkDevIoError::from(e)),
            None => Ok(()),
        });
        Ok(())
    }

    fn map_read(
        &self,
        io: Arc<CryptIo<ST>>,
        bio: blkdev::Bio,
        sector: u64,
    ) -> Result<(), (blkdev::Bio, DmError)> {
        let config = &self.config;
        let max_fragment_bytes = config.max_fragment_bytes();

        // Group whole segments into fragments: (first segment, count, bytes).
        let mut fragments: Vec<(usize, usize, usize)> = Vec::new();
        let mut first = 0;
        let mut bytes = 0;
        for (i, segment) in bio.segments().iter().enumerate() {
            if bytes != 0 && bytes + segment.len() > max_fragment_bytes {
                if let Err(e) = try_vec_push(&mut fragments, (first, i - first, bytes)) {
                    return Err((bio, DmError::from(e)));
                }
                first = i;
                bytes = 0;
            }
            bytes += segment.len();
        }
        if bytes != 0 {
            if let Err(e) = try_vec_push(&mut fragments, (first, bio.segments().len() - first, bytes)) {
                return Err((bio, DmError::from(e)));
            }
        }

        io.set_base_bio(bio);
        let mut fragment_sector = sector;
        let mut dispatched = false;
        let mut failure = None;
        for (first, count, bytes) in fragments {
            let read_work = Box::new(CryptReadFragment::new(
                io.clone(),
                first,
                fragment_sector.wrapping_add(config.iv_offset),
            ));
            let segments = match io.take_read_pages(first, count) {
                Ok(segments) => segments,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            let mut fragment = blkdev::Bio::new(BioDirection::Read, config.start + fragment_sector, segments);
            let first_clone = io.note_fragment();
            fragment.set_end_io(Box::new(CryptFragmentEndIo::new_read(
                io.clone(),
                first_clone,
                bytes,
                read_work,
            )));
            io.inc_pending();
            config.dev.submit_bio(fragment);
            dispatched = true;
            fragment_sector += (bytes >> SECTOR_SHIFT) as u64;
        }

        if let (Some(e), false) = (failure, dispatched) {
            if let Some(bio) = io.take_base_bio() {
                return Err((bio, e));
            }
        }
        io.dec_pending(match failure {
            Some(e) => Err(BlkDevIoError::from(e)),
            None => Ok(()),
        });
        Ok(())
    }
}

impl<ST: sync_types::SyncTypes> DmTarget for CryptTarget<ST> {
    fn map(&self, bio: blkdev::Bio) -> Result<(), (blkdev::Bio, DmError)> {
        let config = &self.config;
        let lease = match config.io_pool.try_get() {
            Some(lease) => lease,
            None => return Err((bio, DmError::MemoryAllocationFailure)),
        };

        let max_fragment_bytes = config.max_fragment_bytes();
        if bio
            .segments()
            .iter()
            .any(|s| {
                s.is_empty()
                    || s.len() % SECTOR_SIZE != 0
                    // Reads get fragmented on segment boundaries only.
                    || (bio.direction() == BioDirection::Read && s.len() > max_fragment_bytes)
            })
        {
            return Err((bio, DmError::IoError(BlkDevIoError::OperationNotSupported)));
        }
        // Bounds every sector computed from here on, both on the target and
        // on the underlying device.
        let sector = match bio.sector().checked_sub(config.geometry.begin) {
            Some(sector)
                if sector
                    .checked_add(bio.sectors())
                    .is_some_and(|end| end <= config.geometry.len && config.start.checked_add(end).is_some()) =>
            {
                sector
            }
            _ => return Err((bio, DmError::IoError(BlkDevIoError::SectorOutOfRange))),
        };

        let io = Arc::new(CryptIo::new(config.clone(), lease));
        match bio.direction() {
            BioDirection::Read => self.map_read(io, bio, sector),
            BioDirection::Write => self.map_write(io, bio, sector),
        }
    }

    fn status(&self, status_type: DmStatusType) -> Result<String, DmError> {
        let config = &self.config;
        let mut status = String::new();
        match status_type {
            DmStatusType::Info => (),
            DmStatusType::Table => {
                status
                    .try_reserve(config.cipher_name.len() + 2 * config.key.len() + config.dev_name.len() + 64)
                    .map_err(TryNewError::from)?;
                write!(status, "{}-{} ", config.cipher_name, config.chain_mode.name())
                    .map_err(|_| DmError::MemoryAllocationFailure)?;
                if config.key.is_empty() {
                    status.push('-');
                } else {
                    hex::encode(&config.key, &mut status).map_err(|_| DmError::MemoryAllocationFailure)?;
                }
                write!(status, " {} {} {}", config.iv_offset, config.dev_name, config.start)
                    .map_err(|_| DmError::MemoryAllocationFailure)?;
            }
        }
        Ok(status)
    }
}
