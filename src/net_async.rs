//! Tokio accept loops for producer and downstream connections

use crate::downstream::Downstream;
use crate::logger::Logger;
use crate::receiver::{run_connection, Handoff, Receiver};
use crate::registry::ConnectionRegistry;
use anyhow::{Context, Result};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Shared state every producer connection needs
#[derive(Clone)]
pub struct IngestContext {
    pub handoff: Arc<dyn Handoff>,
    pub registry: Arc<ConnectionRegistry>,
    pub max_file_size: u64,
    pub logger: Arc<dyn Logger>,
}

/// Pause after a failed `accept` (e.g. out of descriptors) so a persistent
/// error cannot spin the loop
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Log the failure and wait out the backoff. Returns false when cancelled.
async fn accept_failed(e: &io::Error, logger: &dyn Logger, cancel: &CancellationToken) -> bool {
    logger.fault("Accept", &e.to_string());
    tokio::select! {
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
        _ = cancel.cancelled() => false,
    }
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))
}

/// Accept producers until cancelled; one task and one registry entry per
/// connection.
pub async fn serve_ingest(listener: TcpListener, ctx: IngestContext, cancel: CancellationToken) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            r = listener.accept() => match r {
                Ok(pair) => pair,
                Err(e) => {
                    if accept_failed(&e, ctx.logger.as_ref(), &cancel).await {
                        continue;
                    }
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        };
        let _ = stream.set_nodelay(true);
        ctx.logger.connected(&peer);

        let (id, alive) = ctx.registry.register(peer);
        let conn = ctx.clone();
        let token = cancel.child_token();
        let task = tokio::spawn(async move {
            let (rd, wr) = stream.into_split();
            let mut receiver = Receiver::new(wr, conn.handoff.clone(), conn.max_file_size, peer, conn.logger.clone());
            if let Err(e) = run_connection(BufReader::new(rd), &mut receiver, token).await {
                conn.logger.fault("Receiver", &format!("<{peer}> {e}"));
            }
            alive.mark_closed();
            if conn.registry.remove(id) {
                conn.logger.disconnected(&peer);
            }
        });
        ctx.registry.bind_task(id, task);
    }
    Ok(())
}

/// Accept downstream consumers; the newest connection replaces the previous one.
pub async fn serve_downstream(
    listener: TcpListener,
    downstream: Arc<Downstream>,
    logger: Arc<dyn Logger>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            r = listener.accept() => match r {
                Ok(pair) => pair,
                Err(e) => {
                    if accept_failed(&e, logger.as_ref(), &cancel).await {
                        continue;
                    }
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        };
        let _ = stream.set_nodelay(true);
        tokio::spawn(downstream.clone().run_link(stream, peer, cancel.child_token()));
    }
    Ok(())
}
