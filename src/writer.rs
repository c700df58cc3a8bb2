//! Serialized disk writer
//!
//! Receivers only append to the queue; one worker thread drains it in order,
//! writes each file under the active volume, registers it with the metadata
//! store and notifies the downstream consumer. A failed write leaves the entry
//! at the front and is retried after a backoff; too many consecutive failures
//! stop the worker for good.

use crate::downstream::Downstream;
use crate::error::IngestError;
use crate::logger::Logger;
use crate::protocol_core::join_under_root;
use crate::registrar::{canonical_utc, MetadataStore, Registration};
use crate::storage::StoragePool;
use crate::transfer::FileTransfer;
use chrono::FixedOffset;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// What to do with a front entry that keeps failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadOfLine {
    /// Keep retrying the same entry; later entries wait behind it
    Retry,
    /// Drop the entry after this many consecutive attempts on it
    Skip { after_attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub max_failures: u32,
    pub backoff: Duration,
    pub head_of_line: HeadOfLine,
    /// Zone of `tmobs`; `None` means the host's local zone
    pub utc_offset: Option<FixedOffset>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            backoff: Duration::from_secs(60),
            head_of_line: HeadOfLine::Retry,
            utc_offset: None,
        }
    }
}

/// Final persistence step, a seam for tests
pub trait FileSink: Send {
    /// Write `transfer` below `root`, returning the file's path
    fn persist(&mut self, root: &Path, transfer: &FileTransfer) -> Result<PathBuf, IngestError>;
}

/// Plain files: `<root>/<subpath>/<filename>`, directories made on demand
pub struct DiskSink;

impl FileSink for DiskSink {
    fn persist(&mut self, root: &Path, transfer: &FileTransfer) -> Result<PathBuf, IngestError> {
        let dir = join_under_root(root, &transfer.subpath);
        if !dir.is_dir() {
            std::fs::create_dir_all(&dir).map_err(|e| IngestError::storage(&dir, e))?;
        }
        let path = dir.join(&transfer.filename);
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| IngestError::storage(&path, e))?;
        if let Err(e) = f.write_all(transfer.data()).and_then(|_| f.flush()) {
            drop(f);
            let _ = std::fs::remove_file(&path);
            return Err(IngestError::storage(&path, e));
        }
        Ok(path)
    }
}

struct Shared {
    queue: Mutex<VecDeque<FileTransfer>>,
    cv: Condvar,
    stop: AtomicBool,
    running: AtomicBool,
    failures: AtomicU32,
}

pub struct WritePipeline {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    logger: Arc<dyn Logger>,
}

impl WritePipeline {
    pub fn spawn(
        pool: Arc<StoragePool>,
        sink: Box<dyn FileSink>,
        store: Option<Box<dyn MetadataStore>>,
        downstream: Arc<Downstream>,
        cfg: WriterConfig,
        logger: Arc<dyn Logger>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(true),
            failures: AtomicU32::new(0),
        });
        let worker = Worker {
            shared: shared.clone(),
            pool,
            sink,
            store,
            downstream,
            cfg,
            logger: logger.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("file-writer".into())
            .spawn(move || worker.run())?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            logger,
        })
    }

    /// Append a completed file. Returns false if the worker has stopped.
    pub fn submit(&self, transfer: FileTransfer) -> bool {
        if !self.shared.running.load(Ordering::Acquire) {
            self.logger.warn(&format!(
                "rejects <{}> for FileWriter terminated",
                transfer.filename
            ));
            return false;
        }
        self.shared.queue.lock().push_back(transfer);
        self.shared.cv.notify_one();
        true
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.failures.load(Ordering::Acquire)
    }

    /// Stop the worker after its current item and drop whatever is queued
    pub fn shutdown(&self) {
        {
            let _q = self.shared.queue.lock();
            self.shared.stop.store(true, Ordering::Release);
        }
        self.shared.cv.notify_all();
        if let Some(h) = self.worker.lock().take() {
            let _ = h.join();
        }
        let lost = {
            let mut q = self.shared.queue.lock();
            let n = q.len();
            q.clear();
            n
        };
        if lost > 0 {
            self.logger
                .warn(&format!("{lost} unsaved files will be lost"));
        }
    }
}

impl Drop for WritePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    shared: Arc<Shared>,
    pool: Arc<StoragePool>,
    sink: Box<dyn FileSink>,
    store: Option<Box<dyn MetadataStore>>,
    downstream: Arc<Downstream>,
    cfg: WriterConfig,
    logger: Arc<dyn Logger>,
}

impl Worker {
    fn stopping(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Block until an entry is available; `None` on shutdown
    fn next(&self) -> Option<FileTransfer> {
        let mut q = self.shared.queue.lock();
        loop {
            if self.stopping() {
                return None;
            }
            if let Some(t) = q.pop_front() {
                return Some(t);
            }
            self.shared.cv.wait(&mut q);
        }
    }

    fn backoff(&self) {
        let deadline = Instant::now() + self.cfg.backoff;
        let mut q = self.shared.queue.lock();
        while !self.stopping() && Instant::now() < deadline {
            self.shared.cv.wait_until(&mut q, deadline);
        }
    }

    fn run(mut self) {
        let mut failures = 0u32;
        let mut front_attempts = 0u32;
        while let Some(transfer) = self.next() {
            let root = self.pool.current();
            match self.sink.persist(&root, &transfer) {
                Ok(path) => {
                    failures = 0;
                    front_attempts = 0;
                    self.shared.failures.store(0, Ordering::Release);
                    self.finish(transfer, &path);
                }
                Err(e) => {
                    failures += 1;
                    front_attempts += 1;
                    self.shared.failures.store(failures, Ordering::Release);
                    self.logger.fault("FileWriter", &e.to_string());

                    let skip = matches!(self.cfg.head_of_line,
                        HeadOfLine::Skip { after_attempts } if front_attempts >= after_attempts);
                    if skip {
                        self.logger.fault(
                            "FileWriter",
                            &format!(
                                "dropped <{}> after {front_attempts} failed attempts",
                                transfer.filename
                            ),
                        );
                        front_attempts = 0;
                    } else {
                        self.shared.queue.lock().push_front(transfer);
                    }

                    if failures >= self.cfg.max_failures {
                        self.logger
                            .fault("", "FileWriter terminated due to too much error");
                        break;
                    }
                    self.backoff();
                }
            }
        }
        self.shared.running.store(false, Ordering::Release);
    }

    /// Registration, logging and downstream notice for a persisted file
    fn finish(&self, transfer: FileTransfer, path: &Path) {
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        if let Some(store) = &self.store {
            let res = canonical_utc(&transfer.tmobs, self.cfg.utc_offset).and_then(|utc| {
                store.register(&Registration {
                    gid: transfer.gid.clone(),
                    uid: transfer.uid.clone(),
                    cid: transfer.cid.clone(),
                    filename: transfer.filename.clone(),
                    directory: dir.clone(),
                    utc,
                })
            });
            if let Err(e) = res {
                self.logger.fault("FileWriter", &e.to_string());
            }
        }
        self.logger.received(path, transfer.declared());

        let mut info = transfer.announcement();
        info.subpath = dir.to_string_lossy().to_string();
        self.downstream.notify(&info);
    }
}
