//! Wiring of the ingest service: start every component, stop them in order

use crate::config::Config;
use crate::downstream::Downstream;
use crate::error::IngestError;
use crate::logger::{Logger, TextLogger};
use crate::net_async::{bind, serve_downstream, serve_ingest, IngestContext};
use crate::registrar::{HttpRegistrar, MetadataStore};
use crate::registry::ConnectionRegistry;
use crate::schedule::{housekeeping_loop, sweep_loop, Housekeeping, FIRST_HOUSEKEEPING_DELAY, SWEEP_PERIOD};
use crate::storage::{DiskProbe, SpaceProbe, StoragePool};
use crate::writer::{DiskSink, FileSink, WritePipeline};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Collaborators the service runs against; tests swap in fakes
pub struct Deps {
    pub logger: Arc<dyn Logger>,
    pub probe: Arc<dyn SpaceProbe>,
    pub sink: Box<dyn FileSink>,
    pub store: Option<Box<dyn MetadataStore>>,
}

impl Deps {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let logger: Arc<dyn Logger> = match &cfg.log.dir {
            Some(dir) => Arc::new(TextLogger::new(dir, "ftserver_")?),
            None => Arc::new(TextLogger::console()),
        };
        let store: Option<Box<dyn MetadataStore>> = if cfg.database.enabled {
            Some(Box::new(HttpRegistrar::new(&cfg.database.url)))
        } else {
            None
        };
        Ok(Self {
            logger,
            probe: Arc::new(DiskProbe),
            sink: Box::new(DiskSink),
            store,
        })
    }
}

/// Overrides used when embedding the service
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub bind_host: String,
    pub first_housekeeping: Duration,
    pub sweep_period: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            first_housekeeping: FIRST_HOUSEKEEPING_DELAY,
            sweep_period: SWEEP_PERIOD,
        }
    }
}

pub struct Service {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    pipeline: Arc<WritePipeline>,
    registry: Arc<ConnectionRegistry>,
    downstream: Arc<Downstream>,
    pool: Arc<StoragePool>,
    start_index: usize,
    ingest_addr: SocketAddr,
    downstream_addr: Option<SocketAddr>,
    logger: Arc<dyn Logger>,
}

impl Service {
    /// Bring the service up. Must be called from within a tokio runtime.
    pub async fn start(cfg: &Config, deps: Deps, opts: RunOptions) -> Result<Self> {
        let Deps {
            logger,
            probe,
            sink,
            store,
        } = deps;
        logger.info(&format!(
            "starting ftserver {} on port {}",
            env!("CARGO_PKG_VERSION"),
            cfg.server.port
        ));
        if cfg.ntp.enabled {
            logger.info(&format!(
                "clock sync expected from host; reference <{}> max difference {} ms",
                cfg.ntp.host, cfg.ntp.max_difference_ms
            ));
        }

        let pool = Arc::new(
            StoragePool::new(
                cfg.storage.volumes.clone(),
                cfg.storage.index,
                cfg.storage.min_free_gb,
                probe.clone(),
                logger.clone(),
            )?
            .with_notify(cfg.storage.notify()),
        );
        let start_index = pool.current_index();
        match pool.rotate() {
            Some(i) if i == start_index => pool.announce(),
            Some(_) => {}
            None => {
                logger.warn(&format!("{}; writing to the current one", IngestError::CapacityExhausted));
                pool.announce();
            }
        }

        let downstream = Arc::new(Downstream::new(logger.clone()));
        let pipeline = Arc::new(
            WritePipeline::spawn(
                pool.clone(),
                sink,
                store,
                downstream.clone(),
                cfg.writer_config(),
                logger.clone(),
            )
            .context("start file writer")?,
        );
        let registry = Arc::new(ConnectionRegistry::new());
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let listener = bind(&format!("{}:{}", opts.bind_host, cfg.server.port)).await?;
        let ingest_addr = listener.local_addr()?;
        let ctx = IngestContext {
            handoff: pipeline.clone(),
            registry: registry.clone(),
            max_file_size: cfg.server.max_file_size,
            logger: logger.clone(),
        };
        tasks.push(spawn_logged(
            "ingest listener",
            logger.clone(),
            serve_ingest(listener, ctx, cancel.clone()),
        ));

        let downstream_addr = match cfg.server.downstream_port {
            Some(port) => {
                let listener = bind(&format!("{}:{}", opts.bind_host, port)).await?;
                let addr = listener.local_addr()?;
                tasks.push(spawn_logged(
                    "downstream listener",
                    logger.clone(),
                    serve_downstream(listener, downstream.clone(), logger.clone(), cancel.clone()),
                ));
                Some(addr)
            }
            None => None,
        };

        let hk = Arc::new(Housekeeping {
            pool: pool.clone(),
            retention: cfg.storage.retention(),
            template: cfg.template.policy(&cfg.storage.prefix),
            probe,
            logger: logger.clone(),
        });
        tasks.push(tokio::spawn(housekeeping_loop(
            hk,
            opts.first_housekeeping,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(sweep_loop(
            registry.clone(),
            opts.sweep_period,
            logger.clone(),
            cancel.clone(),
        )));

        logger.info(&format!("accepting producers on {ingest_addr}"));
        Ok(Self {
            cancel,
            tasks,
            pipeline,
            registry,
            downstream,
            pool,
            start_index,
            ingest_addr,
            downstream_addr,
            logger,
        })
    }

    pub fn ingest_addr(&self) -> SocketAddr {
        self.ingest_addr
    }

    pub fn downstream_addr(&self) -> Option<SocketAddr> {
        self.downstream_addr
    }

    pub fn pool(&self) -> &StoragePool {
        &self.pool
    }

    pub fn pipeline(&self) -> &WritePipeline {
        &self.pipeline
    }

    pub fn downstream_attached(&self) -> bool {
        self.downstream.is_attached()
    }

    pub fn connections(&self) -> usize {
        self.registry.len()
    }

    /// Stop listeners and timers, drop live connections, then let the writer
    /// finish its current file. Returns the storage index when it moved.
    pub async fn stop(self) -> Option<usize> {
        self.cancel.cancel();
        for t in self.tasks {
            if let Err(e) = t.await {
                self.logger.fault("Service", &format!("task ended abnormally: {e}"));
            }
        }
        let dropped = self.registry.abort_all();
        if dropped > 0 {
            self.logger.info(&format!("closed {dropped} open connections"));
        }
        let pipeline = self.pipeline.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || pipeline.shutdown()).await {
            self.logger.fault("Service", &format!("writer shutdown failed: {e}"));
        }
        self.logger.info("ftserver stopped");
        let index = self.pool.current_index();
        (index != self.start_index).then_some(index)
    }
}

fn spawn_logged<F>(what: &'static str, logger: Arc<dyn Logger>, fut: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            logger.fault(what, &format!("{e:#}"));
        }
    })
}
