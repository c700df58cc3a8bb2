//! Message types and ASCII codec for the ingest protocol
//!
//! A message is a single line: a kind keyword followed by comma separated
//! `key=value` pairs, e.g.
//!
//! ```text
//! fileinfo gid=001, uid=002, cid=011, tmobs=2017-10-29T12:00:00.123, subpath=G011_171029, filename=G011_x.fit, filesize=1024
//! filestat status=2, gid=001, uid=002, cid=011, filename=G011_x.fit
//! ```
//!
//! Raw file bytes follow a `fileinfo` line unframed.

use crate::error::{IngestError, ProtocolError};
use crate::protocol::{field, kind, status, DELIMITER};
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// File announcement, client to server (and server to downstream consumer)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Announcement {
    pub gid: String,
    pub uid: String,
    pub cid: String,
    /// Observation time, `CCYY-MM-DDThh:mm:ss[.sss]` local time
    pub tmobs: String,
    pub subpath: String,
    pub filename: String,
    pub filesize: u64,
}

/// Session outcome reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    ReadyToReceive,
    Complete,
    Failed,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::ReadyToReceive => status::READY,
            Status::Complete => status::COMPLETE,
            Status::Failed => status::FAILED,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            status::READY => Some(Status::ReadyToReceive),
            status::COMPLETE => Some(Status::Complete),
            status::FAILED => Some(Status::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: Status,
    pub gid: String,
    pub uid: String,
    pub cid: String,
    pub filename: String,
}

impl StatusReport {
    pub fn bare(status: Status) -> Self {
        StatusReport {
            status,
            gid: String::new(),
            uid: String::new(),
            cid: String::new(),
            filename: String::new(),
        }
    }
}

/// A decoded line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Announcement(Announcement),
    /// `filestat` from a client: heartbeat, carries no obligations
    Heartbeat(Option<Status>),
}

/// Result of reading one delimited frame
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    /// Peer closed the stream cleanly between messages
    Closed,
}

/// Read up to and including the next delimiter, scanning only what is
/// already buffered before asking the transport for more.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Frame, IngestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let (found, used) = {
            let available = reader.fill_buf().await.map_err(IngestError::ConnectionLost)?;
            if available.is_empty() {
                if line.is_empty() {
                    return Ok(Frame::Closed);
                }
                return Err(ProtocolError::Unterminated.into());
            }
            match available.iter().position(|&b| b == DELIMITER) {
                Some(pos) => {
                    line.extend_from_slice(&available[..pos]);
                    (true, pos + 1)
                }
                None => {
                    line.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(used);
        if line.len() > max_len {
            return Err(ProtocolError::TooLong(max_len).into());
        }
        if found {
            break;
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    let text = String::from_utf8(line).map_err(|_| ProtocolError::Encoding)?;
    Ok(Frame::Line(text))
}

/// Decode one line (without delimiter) received from a producer. Paths in an
/// announcement must stay below the storage root.
pub fn decode(line: &str) -> Result<Message, ProtocolError> {
    let msg = parse_message(line)?;
    if let Message::Announcement(a) = &msg {
        check_subpath(&a.subpath)?;
        check_filename(&a.filename)?;
    }
    Ok(msg)
}

/// Structural decode only. Completion notices carry absolute directories, so
/// consumers of the downstream link read them with this.
pub fn parse_message(line: &str) -> Result<Message, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    let (kw, rest) = match line.split_once(char::is_whitespace) {
        Some((k, r)) => (k, r),
        None => (line, ""),
    };
    if kw != kind::FILE_INFO && kw != kind::FILE_STAT {
        return Err(ProtocolError::UnknownKind(kw.to_string()));
    }
    let pairs = parse_pairs(rest)?;
    let get = |key: &str| {
        pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
    };

    match kw {
        kind::FILE_INFO => {
            let filename = get(field::FILENAME).ok_or(ProtocolError::MissingField(field::FILENAME))?;
            let size_str = get(field::FILESIZE).ok_or(ProtocolError::MissingField(field::FILESIZE))?;
            let filesize = size_str.parse::<u64>().map_err(|_| ProtocolError::BadValue {
                field: field::FILESIZE,
                value: size_str.clone(),
            })?;
            let subpath = get(field::SUBPATH).unwrap_or_default();
            Ok(Message::Announcement(Announcement {
                gid: get(field::GID).unwrap_or_default(),
                uid: get(field::UID).unwrap_or_default(),
                cid: get(field::CID).unwrap_or_default(),
                tmobs: get(field::TMOBS).unwrap_or_default(),
                subpath,
                filename,
                filesize,
            }))
        }
        kind::FILE_STAT => {
            let st = get(field::STATUS)
                .and_then(|s| s.parse::<u8>().ok())
                .and_then(Status::from_code);
            Ok(Message::Heartbeat(st))
        }
        other => Err(ProtocolError::UnknownKind(other.to_string())),
    }
}

fn parse_pairs(rest: &str) -> Result<Vec<(&str, &str)>, ProtocolError> {
    let mut out = Vec::new();
    for part in rest.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (k, v) = part.split_once('=').ok_or_else(|| ProtocolError::BadValue {
            field: "pair",
            value: part.to_string(),
        })?;
        out.push((k.trim(), v.trim()));
    }
    Ok(out)
}

/// Encode an announcement, including the trailing delimiter
pub fn encode_announcement(a: &Announcement) -> String {
    let mut s = String::with_capacity(128 + a.subpath.len() + a.filename.len());
    let _ = write!(
        s,
        "{} {}={}, {}={}, {}={}, {}={}, {}={}, {}={}, {}={}",
        kind::FILE_INFO,
        field::GID,
        a.gid,
        field::UID,
        a.uid,
        field::CID,
        a.cid,
        field::TMOBS,
        a.tmobs,
        field::SUBPATH,
        a.subpath,
        field::FILENAME,
        a.filename,
        field::FILESIZE,
        a.filesize
    );
    s.push(DELIMITER as char);
    s
}

/// Encode a status report, including the trailing delimiter
pub fn encode_status(r: &StatusReport) -> String {
    let mut s = format!("{} {}={}", kind::FILE_STAT, field::STATUS, r.status.code());
    if !r.filename.is_empty() {
        let _ = write!(
            s,
            ", {}={}, {}={}, {}={}, {}={}",
            field::GID,
            r.gid,
            field::UID,
            r.uid,
            field::CID,
            r.cid,
            field::FILENAME,
            r.filename
        );
    }
    s.push(DELIMITER as char);
    s
}

/// Sub-paths are relative and may only descend: no `..`, root, prefix or NUL.
fn check_subpath(p: &str) -> Result<(), ProtocolError> {
    if p.contains('\0') {
        return Err(ProtocolError::UnsafePath(p.to_string()));
    }
    for component in Path::new(p).components() {
        match component {
            Component::CurDir | Component::Normal(_) => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ProtocolError::UnsafePath(p.to_string()));
            }
        }
    }
    Ok(())
}

fn check_filename(name: &str) -> Result<(), ProtocolError> {
    let mut comps = Path::new(name).components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(_)), None) if !name.contains('\0') && !name.contains('/') => Ok(()),
        _ => Err(ProtocolError::UnsafePath(name.to_string())),
    }
}

/// Join an already validated sub-path under a volume root, dropping `.` parts
pub fn join_under_root(root: &Path, subpath: &str) -> PathBuf {
    let mut joined = root.to_path_buf();
    for component in Path::new(subpath).components() {
        if let Component::Normal(s) = component {
            joined.push(s);
        }
    }
    joined
}
