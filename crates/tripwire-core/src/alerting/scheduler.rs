//! Periodic scanner
//!
//! Three independent timers: a scan that re-evaluates recent errors, a
//! read-only health check, and a retention cleanup. Each runs in its own
//! task so a slow scan never delays the other two.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{lookback, SchedulerConfig};
use crate::db::Database;
use crate::error::Result;
use crate::models::AlertStatistics;

use super::engine::AlertEngine;

/// More than this many errors in the last hour with no alerts in 24h is suspicious
const QUIET_ALERTING_ERROR_LIMIT: u64 = 10;

/// Outcome of one scan cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    /// Errors found inside the scan window
    pub processed: usize,
    /// Critical alerts delivered this cycle
    pub critical_sent: usize,
    /// High-frequency alerts delivered this cycle
    pub high_frequency_sent: usize,
    /// Evaluations that returned an error
    pub failed: usize,
}

/// Snapshot produced by the health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Every stored error
    pub total_errors: u64,
    /// Errors from the last hour
    pub recent_errors: u64,
    /// Delivered and failed alerts over the last 24 hours
    pub alerts_24h: AlertStatistics,
}

impl HealthReport {
    /// Many recent errors but nothing delivered usually means alerting is misconfigured
    pub fn alerting_looks_quiet(&self) -> bool {
        self.recent_errors > QUIET_ALERTING_ERROR_LIMIT && self.alerts_24h.total_count == 0
    }
}

/// Outcome of one retention cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    /// Rows strictly older than this were deleted
    pub cutoff: DateTime<Utc>,
    /// Error events removed
    pub errors_deleted: u64,
    /// Alert records removed
    pub alerts_deleted: u64,
}

/// Drives the alert engine and maintenance on fixed cadences
pub struct Scanner {
    engine: Arc<AlertEngine>,
    db: Database,
    config: SchedulerConfig,
}

impl Scanner {
    /// Create a new scanner
    pub fn new(engine: Arc<AlertEngine>, db: Database, config: SchedulerConfig) -> Self {
        Self { engine, db, config }
    }

    /// Spawn the three timers. Returns an empty handle when the scheduler is disabled.
    pub fn spawn(self: Arc<Self>) -> ScannerHandle {
        if !self.config.enabled {
            info!("Alert scheduler is disabled");
            return ScannerHandle { tasks: Vec::new() };
        }

        info!(
            scan_interval_secs = self.config.scan_interval_seconds,
            scan_window_minutes = self.config.scan_window_minutes,
            health_interval_secs = self.config.health_check_interval_seconds,
            retention_days = self.config.retention_days,
            "Starting alert scheduler"
        );

        let scan = {
            let scanner = self.clone();
            let period = Duration::from_secs(self.config.scan_interval_seconds);
            tokio::spawn(run_periodic("scan", period, move || {
                let scanner = scanner.clone();
                async move { scanner.scan().await.map(|_| ()) }
            }))
        };

        let health = {
            let scanner = self.clone();
            let period = Duration::from_secs(self.config.health_check_interval_seconds);
            tokio::spawn(run_periodic("health_check", period, move || {
                let scanner = scanner.clone();
                async move { scanner.health_check().await.map(|_| ()) }
            }))
        };

        let retention = {
            let scanner = self.clone();
            let period = Duration::from_secs(self.config.retention_interval_seconds);
            tokio::spawn(run_periodic("retention", period, move || {
                let scanner = scanner.clone();
                async move { scanner.cleanup().await.map(|_| ()) }
            }))
        };

        ScannerHandle {
            tasks: vec![scan, health, retention],
        }
    }

    /// Run one scan cycle as of now
    pub async fn scan(&self) -> Result<ScanSummary> {
        self.scan_at(Utc::now()).await
    }

    /// Re-evaluate every error newer than the scan window.
    ///
    /// A failing evaluation is logged and counted; the cycle moves on.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Result<ScanSummary> {
        debug!(
            window_minutes = self.config.scan_window_minutes,
            "Starting alert scan"
        );

        let recent = self
            .db
            .errors
            .find_since(lookback(now, self.config.scan_window())?)
            .await?;

        let mut summary = ScanSummary::default();
        for event in &recent {
            summary.processed += 1;
            match self.engine.evaluate_at(event, now).await {
                Ok(result) => {
                    summary.critical_sent += usize::from(result.critical_fired);
                    summary.high_frequency_sent += usize::from(result.high_frequency_fired);
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(error_id = %event.id(), error = %e, "Evaluation failed, will retry next cycle");
                }
            }
        }

        if summary.processed > 0 {
            info!(
                processed = summary.processed,
                critical_sent = summary.critical_sent,
                high_frequency_sent = summary.high_frequency_sent,
                failed = summary.failed,
                "Alert scan completed"
            );
        } else {
            debug!("Alert scan completed: no recent errors");
        }

        Ok(summary)
    }

    /// Run one health check as of now
    pub async fn health_check(&self) -> Result<HealthReport> {
        self.health_check_at(Utc::now()).await
    }

    /// Gather counts for observability; never writes
    pub async fn health_check_at(&self, now: DateTime<Utc>) -> Result<HealthReport> {
        let total_errors = self.db.errors.count_all().await?;
        let recent_errors = self
            .db
            .errors
            .find_since(now - chrono::Duration::hours(1))
            .await?
            .len() as u64;
        let day_ago = now - chrono::Duration::hours(24);
        let counts = self.db.alerts.count_by_kind_between(day_ago, now).await?;
        let failed = self.db.alerts.count_failed_between(day_ago, now).await?;

        let report = HealthReport {
            total_errors,
            recent_errors,
            alerts_24h: AlertStatistics::from(&counts).with_failed(failed),
        };

        info!(
            total_errors = report.total_errors,
            recent_errors = report.recent_errors,
            alerts_24h = report.alerts_24h.total_count,
            failed_24h = report.alerts_24h.failed_count,
            "Alerting health check"
        );
        if report.alerting_looks_quiet() {
            warn!(
                recent_errors = report.recent_errors,
                failed_24h = report.alerts_24h.failed_count,
                "Many errors but no alerts delivered in 24h, check alert configuration"
            );
        }

        Ok(report)
    }

    /// Run one retention cleanup as of now
    pub async fn cleanup(&self) -> Result<CleanupSummary> {
        self.cleanup_at(Utc::now()).await
    }

    /// Delete alert records and errors strictly older than the retention cutoff
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<CleanupSummary> {
        let cutoff = lookback(now, self.config.retention())?;
        info!(cutoff = %cutoff, "Starting retention cleanup");

        let alerts_deleted = self.db.alerts.delete_older_than(cutoff).await?;
        let errors_deleted = self.db.errors.delete_older_than(cutoff).await?;

        info!(
            cutoff = %cutoff,
            errors_deleted,
            alerts_deleted,
            "Retention cleanup completed"
        );

        Ok(CleanupSummary {
            cutoff,
            errors_deleted,
            alerts_deleted,
        })
    }
}

/// Handles to the running timer tasks
pub struct ScannerHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl ScannerHandle {
    /// Number of timers running
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop every timer
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        info!("Alert scheduler stopped");
    }
}

/// Tick forever, isolating each run so errors and panics never stop the timer
async fn run_periodic<F, Fut>(name: &'static str, period: Duration, mut task: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match AssertUnwindSafe(task()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task = name, error = %e, "Periodic task failed"),
            Err(_) => error!(task = name, "Periodic task panicked"),
        }
    }
}
