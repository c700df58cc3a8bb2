//! Storage volumes: free-capacity probing, round-robin rotation and the
//! notify file recording the active volume.

use crate::logger::Logger;
use anyhow::{bail, Result};
use chrono::Local;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const GB: u64 = 1 << 30;

/// Reports bytes available to unprivileged writers on the filesystem
/// holding `path`.
pub trait SpaceProbe: Send + Sync {
    fn available(&self, path: &Path) -> io::Result<u64>;
}

/// Probe backed by the system disk list; the disk whose mount point is the
/// longest prefix of the (canonical) path wins.
pub struct DiskProbe;

impl SpaceProbe for DiskProbe {
    fn available(&self, path: &Path) -> io::Result<u64> {
        use sysinfo::Disks;
        let target = std::fs::canonicalize(path)?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mounted disk holds {}", target.display()),
                )
            })
    }
}

/// Ordered candidate volumes plus the index of the one currently written.
/// Only the scheduled storage task moves the index; the writer just reads it.
pub struct StoragePool {
    volumes: Vec<PathBuf>,
    index: AtomicUsize,
    min_free: u64,
    probe: Arc<dyn SpaceProbe>,
    notify_path: Option<PathBuf>,
    logger: Arc<dyn Logger>,
}

impl StoragePool {
    pub fn new(
        volumes: Vec<PathBuf>,
        start_index: usize,
        min_free_gb: u64,
        probe: Arc<dyn SpaceProbe>,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        if volumes.is_empty() {
            bail!("no storage volume configured");
        }
        let start = if start_index < volumes.len() { start_index } else { 0 };
        Ok(Self {
            volumes,
            index: AtomicUsize::new(start),
            min_free: min_free_gb.saturating_mul(GB),
            probe,
            notify_path: None,
            logger,
        })
    }

    pub fn with_notify(mut self, path: Option<PathBuf>) -> Self {
        self.notify_path = path;
        self
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn volume(&self, i: usize) -> &Path {
        &self.volumes[i % self.volumes.len()]
    }

    pub fn current_index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    /// Root of the volume new files go to
    pub fn current(&self) -> PathBuf {
        self.volume(self.current_index()).to_path_buf()
    }

    pub fn available(&self, i: usize) -> io::Result<u64> {
        self.probe.available(self.volume(i))
    }

    fn eligible(&self, i: usize) -> bool {
        match self.available(i) {
            Ok(bytes) => bytes >= self.min_free,
            Err(e) => {
                self.logger.fault(
                    "StoragePool",
                    &format!("cannot query free capacity of <{}>: {e}", self.volume(i).display()),
                );
                false
            }
        }
    }

    /// Scan volumes round-robin from the current index and return the first
    /// one with at least the minimum free capacity. Does not move the index.
    pub fn find_storage(&self) -> Option<usize> {
        let n = self.volumes.len();
        let now = self.current_index();
        (0..n).map(|k| (now + k) % n).find(|&i| self.eligible(i))
    }

    /// Make volume `i` current. Writes the notify file and logs when the
    /// active volume actually changes; returns whether it changed.
    pub fn activate(&self, i: usize) -> bool {
        let i = i % self.volumes.len();
        let old = self.index.swap(i, Ordering::AcqRel);
        if old == i {
            return false;
        }
        self.announce();
        true
    }

    /// Log and record the active volume (also used once at startup)
    pub fn announce(&self) {
        let root = self.current();
        self.logger.storage_changed(&root);
        if let Some(p) = &self.notify_path {
            if let Err(e) = write_notify(p, &root) {
                self.logger.fault(
                    "StoragePool",
                    &format!("failed to write notify file <{}>: {e}", p.display()),
                );
            }
        }
    }

    /// Rotate to the first eligible volume. `None` means no volume clears the
    /// threshold and an eviction pass is needed.
    pub fn rotate(&self) -> Option<usize> {
        let found = self.find_storage()?;
        self.activate(found);
        Some(found)
    }
}

fn write_notify(path: &Path, root: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let now = Local::now().format("%Y-%m-%dT%H:%M:%S");
    std::fs::write(path, format!("{}     {}\n", root.display(), now))
}
