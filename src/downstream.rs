//! The single downstream consumer told about every persisted file.
//!
//! Losing this link only disables notices; ingestion carries on.

use crate::logger::Logger;
use crate::protocol_core::{encode_announcement, Announcement};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Notices queued for a consumer that has stopped reading; more are dropped
pub const NOTICE_BACKLOG: usize = 1024;

struct Link {
    id: u64,
    peer: SocketAddr,
    tx: mpsc::Sender<String>,
}

pub struct Downstream {
    link: Mutex<Option<Link>>,
    next_id: AtomicU64,
    logger: Arc<dyn Logger>,
}

impl Downstream {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            link: Mutex::new(None),
            next_id: AtomicU64::new(1),
            logger,
        }
    }

    /// Install a new link, replacing any previous one. Returns its id.
    pub fn attach(&self, peer: SocketAddr, tx: mpsc::Sender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let old = self.link.lock().replace(Link { id, peer, tx });
        if let Some(old) = old {
            self.logger
                .warn(&format!("downstream <{}> replaced by <{peer}>", old.peer));
        }
        self.logger.info(&format!("downstream <{peer}> attached"));
        id
    }

    /// Remove link `id` if it is still the current one
    pub fn detach(&self, id: u64) {
        let mut guard = self.link.lock();
        if guard.as_ref().is_some_and(|l| l.id == id) {
            if let Some(l) = guard.take() {
                self.logger.info(&format!("downstream <{}> detached", l.peer));
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.link.lock().is_some()
    }

    /// Queue a completion notice. Returns false when no link is attached,
    /// the backlog is full (the notice is dropped) or the link has gone away
    /// (the link is dropped).
    pub fn notify(&self, info: &Announcement) -> bool {
        let mut guard = self.link.lock();
        let Some(link) = guard.as_ref() else {
            return false;
        };
        match link.tx.try_send(encode_announcement(info)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.logger.warn(&format!(
                    "downstream <{}> is not reading; notice for <{}> dropped",
                    link.peer, info.filename
                ));
                false
            }
            Err(TrySendError::Closed(_)) => {
                let peer = link.peer;
                *guard = None;
                self.logger
                    .warn(&format!("downstream <{peer}> lost; notifications disabled"));
                false
            }
        }
    }

    /// Drive one downstream connection: forward queued notices, watch the
    /// read side for EOF, and detach on any failure or on shutdown.
    pub async fn run_link<S>(self: Arc<Self>, stream: S, peer: SocketAddr, cancel: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::channel::<String>(NOTICE_BACKLOG);
        let id = self.attach(peer, tx);
        let (mut rd, mut wr) = tokio::io::split(stream);
        let mut scratch = [0u8; 512];
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(line) => {
                        if let Err(e) = wr.write_all(line.as_bytes()).await {
                            self.logger.fault("Downstream", &format!("write to <{peer}> failed: {e}"));
                            break;
                        }
                    }
                    // replaced by a newer link
                    None => break,
                },
                n = rd.read(&mut scratch) => match n {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                },
                _ = cancel.cancelled() => break,
            }
        }
        self.detach(id);
    }
}
