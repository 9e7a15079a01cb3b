// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

use dmtargets_storage as storage;
use dmtargets_utils_async as utils_async;
use dmtargets_utils_common as utils_common;

use storage::{
    blkdev::{self, BioDirection, BioEndIoStatus, BioSegment, BlkDev as _, BlkDevIoError},
    dm::{
        DmStatusType, DmTarget as _, DmTargetGeometry,
        crypt::{CryptTarget, CryptTargetEnv, CryptWorkQueue, SymCryptCipherProvider},
        dirty_log::{CoreDirtyLog, DirtyLog},
        region_hash::{RegionHash, RegionHashConfig, RegionRecoveryPrepareStatus},
    },
};
use utils_common::alloc::try_alloc_page;

mod std_sync_types;
use std_sync_types::StdSyncTypes;
mod std_file_blkdev;
use std_file_blkdev::{StdFileBlkDev, StdFileBlkDevLookup};

use clap::{self, Parser as _};
use pollster::FutureExt as _;
use std::{
    fs,
    io::{self, Read as _, Write as _},
    path::PathBuf,
    process,
    sync::{Arc, atomic, mpsc},
    thread,
};

#[derive(clap::Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Encrypt data through a crypt target onto its device.
    CryptWrite(CliCryptWriteArgs),

    /// Read and decrypt data through a crypt target.
    CryptRead(CliCryptReadArgs),

    /// Print a crypt target's table line status.
    CryptStatus(CliCryptStatusArgs),

    /// Resynchronize all regions of a mirror image from another one.
    MirrorResync(CliMirrorResyncArgs),
}

#[derive(clap::Args)]
struct CliCryptTable {
    /// Crypt target table line.
    ///
    /// Format: "<cipher>[-<chainmode>] <key> <iv_offset> <device> <start>",
    /// with <device> being the path to an image file.
    #[arg(name = "table", short, long, value_name = "TABLE")]
    table: String,

    /// Limit on the size of requests submitted to the device.
    #[arg(name = "max-bio-bytes", long, value_name = "BYTES")]
    max_bio_bytes: Option<usize>,
}

#[derive(clap::Args)]
struct CliCryptWriteArgs {
    #[command(flatten)]
    table: CliCryptTable,

    /// First target sector to write to.
    #[arg(name = "sector", short, long, value_name = "SECTOR")]
    sector: u64,

    /// Plaintext input, stdin if not specified.
    #[arg(name = "input", short, long, value_name = "FILE")]
    in_file_path: Option<PathBuf>,
}

#[derive(clap::Args)]
struct CliCryptReadArgs {
    #[command(flatten)]
    table: CliCryptTable,

    /// First target sector to read from.
    #[arg(name = "sector", short, long, value_name = "SECTOR")]
    sector: u64,

    /// Number of sectors to read.
    #[arg(name = "sectors", short = 'n', long, value_name = "COUNT", value_parser = clap::value_parser!(u64).range(1..))]
    sectors: u64,

    /// Plaintext output, stdout if not specified.
    #[arg(name = "output", short, long, value_name = "FILE")]
    out_file_path: Option<PathBuf>,
}

#[derive(clap::Args)]
struct CliCryptStatusArgs {
    #[command(flatten)]
    table: CliCryptTable,
}

#[derive(clap::Args)]
struct CliMirrorResyncArgs {
    /// In-sync mirror image.
    #[arg(name = "source", short, long, value_name = "FILE")]
    source_path: PathBuf,

    /// Mirror image to resynchronize.
    #[arg(name = "dest", short, long, value_name = "FILE")]
    dest_path: PathBuf,

    /// Region size in units of sectors, must be a power of two.
    #[arg(name = "region-size", short, long, value_name = "SECTORS", default_value_t = 1024)]
    region_size: u64,

    /// Maximum number of regions under recovery at a time.
    #[arg(
        name = "max-recovery",
        short,
        long,
        value_name = "COUNT",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    max_recovery: u64,
}

/// Crypt target instance along with the host resources it depends on.
struct CryptSetup {
    target: CryptTarget<StdSyncTypes>,
    work_queue: Arc<CryptWorkQueue<StdSyncTypes>>,
    worker: thread::JoinHandle<()>,
    lookup: StdFileBlkDevLookup,
    seg_len: usize,
}

impl CryptSetup {
    fn new(table: &CliCryptTable, writable: bool) -> Self {
        let seg_len = match table.max_bio_bytes {
            Some(max_bio_bytes) => (max_bio_bytes & !(blkdev::SECTOR_SIZE - 1)).min(blkdev::PAGE_SIZE),
            None => blkdev::PAGE_SIZE,
        };
        if seg_len == 0 {
            eprintln!("error: maximum request size smaller than a sector");
            process::exit(1);
        }

        let lookup = StdFileBlkDevLookup::new(writable, table.max_bio_bytes);
        let cipher_provider = SymCryptCipherProvider::new();
        let work_queue = Arc::new(CryptWorkQueue::<StdSyncTypes>::new());
        let env = CryptTargetEnv::new(&lookup, &cipher_provider, work_queue.clone());
        let geometry = DmTargetGeometry { begin: 0, len: u64::MAX };
        let target = match CryptTarget::ctr_from_table_line(geometry, &table.table, &env) {
            Ok(target) => target,
            Err(e) => {
                eprintln!("error: failed to construct crypt target: error={:?}", e);
                process::exit(2);
            }
        };

        let worker_queue = work_queue.clone();
        let worker = match thread::Builder::new()
            .name("crypt-worker".into())
            .spawn(move || worker_queue.worker().block_on())
        {
            Ok(worker) => worker,
            Err(e) => {
                eprintln!("error: failed to spawn crypt worker thread: {}", e);
                process::exit(1);
            }
        };

        Self {
            target,
            work_queue,
            worker,
            lookup,
            seg_len,
        }
    }

    /// Map a request through the target and wait for its completion.
    fn map_sync(&self, direction: BioDirection, sector: u64, segments: Vec<BioSegment>) -> Vec<BioSegment> {
        let mut bio = blkdev::Bio::new(direction, sector, segments);
        let (sender, receiver) = mpsc::channel();
        bio.set_end_io(Box::new(
            move |bio: &mut blkdev::Bio, _bytes_done: usize, result: Result<(), BlkDevIoError>| -> BioEndIoStatus {
                if bio.size() != 0 {
                    return BioEndIoStatus::InProgress;
                }
                let _ = sender.send((result, bio.take_segments()));
                BioEndIoStatus::Completed
            },
        ));

        if let Err((_bio, e)) = self.target.map(bio) {
            eprintln!("error: failed to map request: error={:?}", e);
            process::exit(3);
        }
        match receiver.recv() {
            Ok((Ok(()), segments)) => segments,
            Ok((Err(e), _)) => {
                eprintln!("error: request failed: error={:?}", e);
                process::exit(3);
            }
            Err(_) => {
                eprintln!("error: request got dropped without completion");
                process::exit(3);
            }
        }
    }

    fn teardown(self) {
        self.target.dtr();
        self.work_queue.shutdown();
        if self.worker.join().is_err() {
            eprintln!("error: crypt worker thread panicked");
            process::exit(1);
        }
        self.lookup.shutdown();
    }
}

/// Allocate page backed segments covering `len` bytes, each at most
/// `seg_len` long.
fn alloc_segments(len: usize, seg_len: usize) -> Vec<BioSegment> {
    let mut segments = Vec::with_capacity(len.div_ceil(seg_len));
    let mut remaining = len;
    while remaining != 0 {
        let page = match try_alloc_page(blkdev::PAGE_SIZE) {
            Ok(page) => page,
            Err(e) => {
                eprintln!("error: buffer allocation failed: error={:?}", e);
                process::exit(1);
            }
        };
        let len = remaining.min(seg_len);
        segments.push(BioSegment::new(page, 0, len));
        remaining -= len;
    }
    segments
}

fn crypt_write(args: &CliCryptWriteArgs) {
    let mut data = Vec::new();
    let result = match args.in_file_path.as_ref() {
        Some(in_file_path) => fs::File::open(in_file_path).and_then(|mut f| f.read_to_end(&mut data)),
        None => io::stdin().read_to_end(&mut data),
    };
    if let Err(e) = result {
        eprintln!("error: failed to read input: {}", e);
        process::exit(1);
    }
    if data.is_empty() {
        return;
    }
    if data.len() % blkdev::SECTOR_SIZE != 0 {
        log::warn!("Input not a multiple of the sector size, padding with zeroes");
        data.resize(data.len().next_multiple_of(blkdev::SECTOR_SIZE), 0);
    }

    let setup = CryptSetup::new(&args.table, true);
    let mut segments = alloc_segments(data.len(), setup.seg_len);
    for (segment, chunk) in segments.iter_mut().zip(data.chunks(setup.seg_len)) {
        segment.data_mut().copy_from_slice(chunk);
    }
    setup.map_sync(BioDirection::Write, args.sector, segments);
    setup.teardown();
}

fn crypt_read(args: &CliCryptReadArgs) {
    let len = match args
        .sectors
        .checked_mul(blkdev::SECTOR_SIZE as u64)
        .and_then(|len| usize::try_from(len).ok())
    {
        Some(len) => len,
        None => {
            eprintln!("error: sector count too large");
            process::exit(1);
        }
    };

    let setup = CryptSetup::new(&args.table, false);
    let segments = alloc_segments(len, setup.seg_len);
    let segments = setup.map_sync(BioDirection::Read, args.sector, segments);
    setup.teardown();

    let result = match args.out_file_path.as_ref() {
        Some(out_file_path) => fs::File::create(out_file_path)
            .and_then(|mut f| segments.iter().try_for_each(|segment| f.write_all(segment.data()))),
        None => {
            let mut stdout = io::stdout().lock();
            segments
                .iter()
                .try_for_each(|segment| stdout.write_all(segment.data()))
                .and_then(|_| stdout.flush())
        }
    };
    if let Err(e) = result {
        eprintln!("error: failed to write output: {}", e);
        process::exit(1);
    }
}

fn crypt_status(args: &CliCryptStatusArgs) {
    let setup = CryptSetup::new(&args.table, false);
    match setup.target.status(DmStatusType::Table) {
        Ok(status) => println!("{}", status),
        Err(e) => {
            eprintln!("error: failed to obtain crypt target status: error={:?}", e);
            process::exit(2);
        }
    }
    setup.teardown();
}

/// Submit a request to a device and wait for its completion.
fn blkdev_transfer(
    dev: &StdFileBlkDev,
    direction: BioDirection,
    sector: u64,
    segments: Vec<BioSegment>,
) -> Result<Vec<BioSegment>, BlkDevIoError> {
    let mut bio = blkdev::Bio::new(direction, sector, segments);
    let (sender, receiver) = mpsc::channel();
    bio.set_end_io(Box::new(
        move |bio: &mut blkdev::Bio, _bytes_done: usize, result: Result<(), BlkDevIoError>| -> BioEndIoStatus {
            if bio.size() != 0 {
                return BioEndIoStatus::InProgress;
            }
            let _ = sender.send((result, bio.take_segments()));
            BioEndIoStatus::Completed
        },
    ));
    dev.submit_bio(bio);
    let (result, segments) = receiver.recv().map_err(|_| BlkDevIoError::IoFailure)?;
    result.map(|_| segments)
}

/// Context passed back from the [`RegionHash`] to the resync loop.
struct ResyncContext {
    wakeups: atomic::AtomicU64,
    dispatched: atomic::AtomicU64,
}

fn mirror_resync(args: &CliMirrorResyncArgs) {
    let open = |path: &PathBuf, writable: bool| match StdFileBlkDev::open(path, writable, None) {
        Ok(dev) => dev,
        Err(e) => {
            eprintln!("error: failed to open image \"{}\": {}", path.display(), e);
            process::exit(1);
        }
    };
    let source = open(&args.source_path, false);
    let dest = open(&args.dest_path, true);
    let sectors = source.sectors();
    if dest.sectors() < sectors {
        eprintln!("error: destination image smaller than source image");
        process::exit(1);
    }
    if !args.region_size.is_power_of_two() {
        eprintln!("error: region size must be a power of two");
        process::exit(1);
    }

    let nr_regions = sectors.div_ceil(args.region_size);
    let dirty_log = match CoreDirtyLog::new(nr_regions, false) {
        Ok(dirty_log) => Arc::new(dirty_log),
        Err(e) => {
            eprintln!("error: failed to allocate dirty log: error={:?}", e);
            process::exit(1);
        }
    };
    let config = RegionHashConfig {
        max_recovery: usize::try_from(args.max_recovery).unwrap_or(usize::MAX),
        region_size: args.region_size,
        nr_regions,
    };
    let context = ResyncContext {
        wakeups: atomic::AtomicU64::new(0),
        dispatched: atomic::AtomicU64::new(0),
    };
    let rh = match RegionHash::<StdSyncTypes, (), ResyncContext>::new(
        &config,
        context,
        Box::new(|context: &ResyncContext, ios: Vec<()>, result: Result<(), BlkDevIoError>| {
            log::debug!("Dispatching {} delayed IOs: {:?}", ios.len(), result);
            context.dispatched.fetch_add(ios.len() as u64, atomic::Ordering::Relaxed);
        }),
        Box::new(|context: &ResyncContext| {
            context.wakeups.fetch_add(1, atomic::Ordering::Relaxed);
        }),
        dirty_log.clone() as Arc<dyn DirtyLog>,
    ) {
        Ok(rh) => rh,
        Err(e) => {
            eprintln!("error: failed to instantiate region hash: error={:?}", e);
            process::exit(1);
        }
    };

    let resync_region = |region: u64| -> Result<(), BlkDevIoError> {
        let first = rh.region_to_sector(region);
        let len = rh.region_size().min(sectors - first);
        let len = usize::try_from(len << blkdev::SECTOR_SHIFT).map_err(|_| BlkDevIoError::OperationNotSupported)?;
        let segments = alloc_segments(len, blkdev::PAGE_SIZE);
        let segments = blkdev_transfer(&source, BioDirection::Read, first, segments)?;
        blkdev_transfer(&dest, BioDirection::Write, first, segments)?;
        Ok(())
    };

    let mut recovered = 0u64;
    let mut failed = 0u64;
    rh.start_recovery();
    loop {
        let status = rh.recovery_prepare();
        while let Some(recovery) = rh.recovery_start() {
            let region = recovery.key();
            let success = match resync_region(region) {
                Ok(()) => {
                    recovered += 1;
                    true
                }
                Err(e) => {
                    log::error!("Region {} resync failed: {:?}", region, e);
                    failed += 1;
                    false
                }
            };
            rh.recovery_end(recovery, success);
        }
        rh.update_states(true);
        if status == RegionRecoveryPrepareStatus::Idle || failed != 0 {
            break;
        }
    }

    if let Err(e) = rh.stop_recovery().block_on() {
        eprintln!("error: failed to stop recovery: error={:?}", e);
        process::exit(1);
    }
    if let Err(e) = rh.flush() {
        eprintln!("error: dirty log flush failed: error={:?}", e);
        process::exit(1);
    }
    log::debug!(
        "Region hash woken {} times, {} delayed IOs dispatched",
        rh.context().wakeups.load(atomic::Ordering::Relaxed),
        rh.context().dispatched.load(atomic::Ordering::Relaxed)
    );

    println!(
        "{} regions recovered, {} failed, {} out of sync",
        recovered,
        failed,
        dirty_log.out_of_sync_count()
    );
    drop(rh);
    dest.shutdown();
    source.shutdown();
    if failed != 0 {
        process::exit(3);
    }
}

fn main() {
    env_logger::builder()
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        CliCommand::CryptWrite(args) => crypt_write(args),
        CliCommand::CryptRead(args) => crypt_read(args),
        CliCommand::CryptStatus(args) => crypt_status(args),
        CliCommand::MirrorResync(args) => mirror_resync(args),
    }
}
