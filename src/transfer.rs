//! In-memory assembly of one announced file

use crate::protocol_core::Announcement;

/// One file being received. Owned by its receiver until complete, then
/// moved into the write pipeline.
#[derive(Debug)]
pub struct FileTransfer {
    pub gid: String,
    pub uid: String,
    pub cid: String,
    pub tmobs: String,
    pub subpath: String,
    pub filename: String,
    declared: u64,
    received: u64,
    data: Vec<u8>,
}

impl FileTransfer {
    pub fn new(info: &Announcement) -> Self {
        let mut t = FileTransfer {
            gid: String::new(),
            uid: String::new(),
            cid: String::new(),
            tmobs: String::new(),
            subpath: String::new(),
            filename: String::new(),
            declared: info.filesize,
            received: 0,
            data: Vec::with_capacity(info.filesize as usize),
        };
        t.assign(info);
        t
    }

    /// Reuse `previous` when its buffer was sized for exactly this length,
    /// otherwise allocate a fresh one.
    pub fn reuse_or_allocate(previous: Option<FileTransfer>, info: &Announcement) -> Self {
        match previous {
            Some(mut t) if t.declared == info.filesize => {
                t.data.clear();
                t.received = 0;
                t.assign(info);
                t
            }
            _ => FileTransfer::new(info),
        }
    }

    fn assign(&mut self, info: &Announcement) {
        self.gid.clone_from(&info.gid);
        self.uid.clone_from(&info.uid);
        self.cid.clone_from(&info.cid);
        self.tmobs.clone_from(&info.tmobs);
        self.subpath.clone_from(&info.subpath);
        self.filename.clone_from(&info.filename);
    }

    /// Store newly arrived bytes. Returns true once the declared size has been
    /// reached (or passed). Bytes beyond the declared size are counted but not
    /// stored.
    pub fn arrive(&mut self, bytes: &[u8]) -> bool {
        let room = self.remaining() as usize;
        let keep = bytes.len().min(room);
        self.data.extend_from_slice(&bytes[..keep]);
        self.received += bytes.len() as u64;
        self.is_done()
    }

    pub fn is_done(&self) -> bool {
        self.received >= self.declared
    }

    pub fn is_exact(&self) -> bool {
        self.received == self.declared
    }

    pub fn remaining(&self) -> u64 {
        self.declared.saturating_sub(self.received)
    }

    pub fn declared(&self) -> u64 {
        self.declared
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Announcement describing this file (used for downstream notices)
    pub fn announcement(&self) -> Announcement {
        Announcement {
            gid: self.gid.clone(),
            uid: self.uid.clone(),
            cid: self.cid.clone(),
            tmobs: self.tmobs.clone(),
            subpath: self.subpath.clone(),
            filename: self.filename.clone(),
            filesize: self.declared,
        }
    }
}
