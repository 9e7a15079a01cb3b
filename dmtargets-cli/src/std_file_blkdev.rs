// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Implementation of [`StdFileBlkDev`], a [`BlkDev`](blkdev::BlkDev) trait
//! implementation based on Rust `std` [`File`] IO primitives.

use super::std_sync_types::StdLock;
use crate::{
    storage::blkdev::{self, BioDirection, BlkDevIoError},
    utils_async::sync_types::Lock as _,
};
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, mpsc},
    thread, time,
};

/// Backoff applied by [`congestion_wait()`](blkdev::BlkDev::congestion_wait).
const STD_FILE_BLKDEV_CONGESTION_WAIT: time::Duration = time::Duration::from_millis(10);

/// State shared between a [`StdFileBlkDev`] and its IO thread.
struct StdFileBlkDevInner {
    /// The backing image [`File`].
    file: StdLock<File>,
    /// Size of [`file`](Self::file) in units of
    /// [sectors](blkdev::SECTOR_SIZE).
    sectors: u64,
}

impl StdFileBlkDevInner {
    fn transfer(&self, bio: &mut blkdev::Bio) -> Result<(), BlkDevIoError> {
        let end = bio
            .sector()
            .checked_add(bio.sectors())
            .ok_or(BlkDevIoError::SectorOutOfRange)?;
        if end > self.sectors {
            return Err(BlkDevIoError::SectorOutOfRange);
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(bio.sector() << blkdev::SECTOR_SHIFT))
            .map_err(std_io_error_to_blkdev_io_error)?;
        let direction = bio.direction();
        for segment in bio.segments_mut() {
            let result = match direction {
                BioDirection::Read => file.read_exact(segment.data_mut()),
                BioDirection::Write => file.write_all(segment.data()),
            };
            result.map_err(std_io_error_to_blkdev_io_error)?;
        }
        Ok(())
    }
}

/// [`BlkDev`](blkdev::BlkDev) trait implementation based on Rust `std`
/// [`File`] IO primitives.
///
/// Submitted [`Bio`](blkdev::Bio)s get processed in order and completed from
/// a dedicated IO thread.
pub struct StdFileBlkDev {
    inner: Arc<StdFileBlkDevInner>,
    max_bio_bytes: Option<usize>,
    submit_queue: StdLock<Option<mpsc::Sender<blkdev::Bio>>>,
    io_thread: StdLock<Option<thread::JoinHandle<()>>>,
}

impl StdFileBlkDev {
    /// Open an image file and spawn the IO thread.
    ///
    /// # Arguments:
    ///
    /// * `path` - Path to the image file.
    /// * `writable` - Whether to open the file for writing.
    /// * `max_bio_bytes` - Optional limit on [`Bio`](blkdev::Bio) sizes to
    ///   report.
    pub fn open(path: &Path, writable: bool, max_bio_bytes: Option<usize>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let sectors = file.metadata()?.len() >> blkdev::SECTOR_SHIFT;
        let inner = Arc::new(StdFileBlkDevInner {
            file: StdLock::from(file),
            sectors,
        });

        let (sender, receiver) = mpsc::channel::<blkdev::Bio>();
        let thread_inner = inner.clone();
        let io_thread = thread::Builder::new()
            .name("blkdev-io".into())
            .spawn(move || {
                for mut bio in receiver {
                    let result = thread_inner.transfer(&mut bio);
                    if let Err(e) = result {
                        log::error!("image IO at sector {} failed: {:?}", bio.sector(), e);
                    }
                    let size = bio.size();
                    bio.endio(size, result);
                }
            })?;

        Ok(Self {
            inner,
            max_bio_bytes,
            submit_queue: StdLock::from(Some(sender)),
            io_thread: StdLock::from(Some(io_thread)),
        })
    }

    /// Wait for all submitted IO to complete and stop the IO thread.
    pub fn shutdown(&self) {
        drop(self.submit_queue.lock().take());
        let io_thread = self.io_thread.lock().take();
        if let Some(io_thread) = io_thread {
            // The last reference may get dropped from a completion.
            if io_thread.thread().id() == thread::current().id() {
                return;
            }
            if io_thread.join().is_err() {
                log::error!("image IO thread panicked");
            }
        }
        if let Err(e) = self.inner.file.lock().sync_data() {
            log::warn!("image sync failed: {}", e);
        }
    }
}

impl Drop for StdFileBlkDev {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl blkdev::BlkDev for StdFileBlkDev {
    fn sectors(&self) -> u64 {
        self.inner.sectors
    }

    fn max_bio_bytes(&self) -> Option<usize> {
        self.max_bio_bytes
    }

    fn submit_bio(&self, bio: blkdev::Bio) {
        let mut bio = match self.submit_queue.lock().as_ref() {
            Some(submit_queue) => match submit_queue.send(bio) {
                Ok(()) => return,
                Err(mpsc::SendError(bio)) => bio,
            },
            None => bio,
        };
        let size = bio.size();
        bio.endio(size, Err(BlkDevIoError::IoFailure));
    }

    fn congestion_wait(&self) {
        thread::sleep(STD_FILE_BLKDEV_CONGESTION_WAIT);
    }
}

/// Resolves table line device names as image file paths.
///
/// Every device looked up is kept open until [`shutdown()`](Self::shutdown).
pub struct StdFileBlkDevLookup {
    writable: bool,
    max_bio_bytes: Option<usize>,
    devs: StdLock<Vec<Arc<StdFileBlkDev>>>,
}

impl StdFileBlkDevLookup {
    pub fn new(writable: bool, max_bio_bytes: Option<usize>) -> Self {
        Self {
            writable,
            max_bio_bytes,
            devs: StdLock::from(Vec::new()),
        }
    }

    /// [Shut down](StdFileBlkDev::shutdown) all devices opened so far.
    pub fn shutdown(&self) {
        let devs = std::mem::take(&mut *self.devs.lock());
        for dev in devs {
            dev.shutdown();
        }
    }
}

impl blkdev::BlkDevLookup for StdFileBlkDevLookup {
    fn lookup(&self, name: &str) -> Option<Arc<dyn blkdev::BlkDev>> {
        match StdFileBlkDev::open(Path::new(name), self.writable, self.max_bio_bytes) {
            Ok(dev) => {
                let dev = Arc::new(dev);
                self.devs.lock().push(dev.clone());
                Some(dev as Arc<dyn blkdev::BlkDev>)
            }
            Err(e) => {
                log::error!("failed to open image \"{}\": {}", name, e);
                None
            }
        }
    }
}

/// Convert a [`std::io::Error`] to a [`BlkDevIoError`].
fn std_io_error_to_blkdev_io_error(e: io::Error) -> BlkDevIoError {
    match e.kind() {
        io::ErrorKind::Unsupported | io::ErrorKind::NotSeekable => BlkDevIoError::OperationNotSupported,
        io::ErrorKind::FileTooLarge | io::ErrorKind::UnexpectedEof => BlkDevIoError::SectorOutOfRange,
        io::ErrorKind::OutOfMemory => BlkDevIoError::MemoryAllocationFailure,
        _ => BlkDevIoError::IoFailure,
    }
}
