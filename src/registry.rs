//! Live-connection registry with periodic liveness sweep

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Shared flag a connection task clears when its transport is done
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Entry {
    id: u64,
    peer: SocketAddr,
    alive: Liveness,
    task: Option<JoinHandle<()>>,
}

impl Entry {
    fn is_dead(&self) -> bool {
        !self.alive.is_open() || self.task.as_ref().is_some_and(|t| t.is_finished())
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. The returned flag is handed to its task.
    pub fn register(&self, peer: SocketAddr) -> (u64, Liveness) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let alive = Liveness(Arc::new(AtomicBool::new(true)));
        self.entries.lock().push(Entry {
            id,
            peer,
            alive: alive.clone(),
            task: None,
        });
        (id, alive)
    }

    /// Attach the task serving connection `id`
    pub fn bind_task(&self, id: u64, task: JoinHandle<()>) {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.id == id) {
            Some(e) => e.task = Some(task),
            // already closed and removed itself
            None => drop(task),
        }
    }

    pub fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    /// Drop entries whose connection is no longer open; returns their peers
    pub fn sweep(&self) -> Vec<SocketAddr> {
        let mut entries = self.entries.lock();
        let mut reaped = Vec::new();
        entries.retain(|e| {
            if e.is_dead() {
                reaped.push(e.peer);
                false
            } else {
                true
            }
        });
        reaped
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.entries.lock().iter().map(|e| e.peer).collect()
    }

    /// Abort every connection task and clear the registry
    pub fn abort_all(&self) -> usize {
        let drained: Vec<Entry> = self.entries.lock().drain(..).collect();
        for e in &drained {
            e.alive.mark_closed();
            if let Some(t) = &e.task {
                t.abort();
            }
        }
        drained.len()
    }
}
