use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use ftserver::cli::DaemonOpts;
use ftserver::config;
use ftserver::service::{Deps, RunOptions, Service};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    if opts.init {
        config::write_default(&opts.config)?;
        println!("Wrote default configuration to {}", opts.config.display());
        return Ok(());
    }

    let (cfg, fallback) = config::load_or_init(&opts.config)?;
    let deps = Deps::from_config(&cfg)?;
    if let Some(reason) = fallback {
        deps.logger.warn(&format!("using default configuration: {reason}"));
    }
    let logger = deps.logger.clone();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    ctrlc::set_handler(move || trigger.cancel()).context("install signal handler")?;

    let moved = rt.block_on(async {
        let service = Service::start(&cfg, deps, RunOptions::default()).await?;
        shutdown.cancelled().await;
        logger.info("termination requested");
        Ok::<_, anyhow::Error>(service.stop().await)
    })?;

    if let Some(index) = moved {
        match config::persist_index(&opts.config, index) {
            Ok(()) => logger.info(&format!("storage index {index} saved")),
            Err(e) => logger.fault("Config", &format!("{}: {e:#}", opts.config.display())),
        }
    }
    Ok(())
}
