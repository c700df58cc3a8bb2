//! Timed background work: daily storage housekeeping and the liveness sweep

use crate::error::IngestError;
use crate::eviction::{free_storage, free_template, EvictionReport, RetentionPolicy, TemplatePolicy};
use crate::logger::Logger;
use crate::registry::ConnectionRegistry;
use crate::storage::{SpaceProbe, StoragePool};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DAY_SECS: i64 = 86_400;
/// Firings closer than this roll to the following noon
const MIN_LEAD_SECS: i64 = 10;

pub const FIRST_HOUSEKEEPING_DELAY: Duration = Duration::from_secs(5);
pub const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Seconds from `now` until the next local 12:00:00
pub fn seconds_until_next_noon(now: NaiveDateTime) -> i64 {
    let noon = now.date().and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap_or(NaiveTime::MIN));
    let mut secs = (noon - now).num_seconds();
    if secs < 0 {
        secs += DAY_SECS;
    }
    if secs < MIN_LEAD_SECS {
        secs += DAY_SECS;
    }
    secs
}

/// Space reclamation for storage volumes and template areas
pub struct Housekeeping {
    pub pool: Arc<StoragePool>,
    /// `None` when automatic freeing of storage is disabled
    pub retention: Option<RetentionPolicy>,
    /// Template areas and their policy; `None` when disabled
    pub template: Option<(Vec<PathBuf>, TemplatePolicy)>,
    pub probe: Arc<dyn SpaceProbe>,
    pub logger: Arc<dyn Logger>,
}

impl Housekeeping {
    pub fn run_once(&self, today: NaiveDate) -> EvictionReport {
        let mut report = EvictionReport::default();
        match &self.retention {
            Some(policy) => {
                let r = free_storage(&self.pool, policy, today, self.logger.as_ref());
                report.deleted.extend(r.deleted);
            }
            None => {
                if self.pool.rotate().is_none() {
                    self.logger.warn(&format!(
                        "{} and auto-free is disabled",
                        IngestError::CapacityExhausted
                    ));
                }
            }
        }
        if let Some((paths, policy)) = &self.template {
            let r = free_template(paths, policy, self.probe.as_ref(), today, self.logger.as_ref());
            report.deleted.extend(r.deleted);
            report.stripped.extend(r.stripped);
        }
        report
    }
}

/// First pass shortly after startup, then every day at local noon
pub async fn housekeeping_loop(hk: Arc<Housekeeping>, first_delay: Duration, cancel: CancellationToken) {
    let mut delay = first_delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
        let job = hk.clone();
        let run = tokio::task::spawn_blocking(move || job.run_once(Local::now().date_naive()));
        if let Err(e) = run.await {
            hk.logger.fault("housekeeping", &format!("task failed: {e}"));
        }
        let secs = seconds_until_next_noon(Local::now().naive_local());
        delay = Duration::from_secs(secs.max(0) as u64);
    }
}

/// Reap registry entries whose connections have gone away
pub async fn sweep_loop(
    registry: Arc<ConnectionRegistry>,
    period: Duration,
    logger: Arc<dyn Logger>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }
        for peer in registry.sweep() {
            logger.disconnected(&peer);
        }
    }
}
