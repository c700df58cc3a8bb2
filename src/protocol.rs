//! Shared protocol constants for the ftserver line protocol

// Every message is one ASCII line terminated by a single line feed
pub const DELIMITER: u8 = b'\n';

// A message line longer than this without a delimiter is garbage
pub const MAX_FRAME_LEN: usize = 4096;

// Largest raw-data read handed to the receiver in one event
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

// Upper bound for declared file sizes unless configured otherwise (2GB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

// Message kind keywords (first token of a line)
pub mod kind {
    /// Announcement: client declares a file, raw bytes follow
    pub const FILE_INFO: &str = "fileinfo";
    /// Status report from server; from a client it is a heartbeat and ignored
    pub const FILE_STAT: &str = "filestat";
}

// Status codes carried by `filestat` (numeric values are wire-stable)
pub mod status {
    pub const READY: u8 = 1;
    pub const COMPLETE: u8 = 2;
    pub const FAILED: u8 = 3;
}

// Field keys used in `key=value` pairs
pub mod field {
    pub const GID: &str = "gid";
    pub const UID: &str = "uid";
    pub const CID: &str = "cid";
    pub const TMOBS: &str = "tmobs";
    pub const SUBPATH: &str = "subpath";
    pub const FILENAME: &str = "filename";
    pub const FILESIZE: &str = "filesize";
    pub const STATUS: &str = "status";
}
