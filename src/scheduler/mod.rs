//! C6 — Scheduler. Registers the canonical job table with
//! `tokio-cron-scheduler` and gives every job single-writer-per-topic
//! overlap protection, a running/last-result status, and a shutdown path
//! with a grace period.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::analysis::SiarHistoricalAnalyzer;
use crate::backfill::BackfillEngine;
use crate::clients::AemetClient;
use crate::forecast::PriceForecaster;
use crate::ingestion::IngestionOrchestrator;
use crate::timeseries::TimeSeriesStore;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct JobStatus {
    pub run_count: u64,
    pub failure_count: u64,
    pub last_ok: bool,
    pub running: bool,
}

/// Snapshot produced by the `health_check` job: the store's own health
/// probe plus the last recorded outcome of the ingestion jobs, which are
/// the only things that actually talk to REE/AEMET/OpenWeatherMap.
/// Reusing their `JobStatus` avoids firing a second round of API calls
/// every 15 minutes purely to check reachability.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub store_ok: bool,
    pub ree_ok: bool,
    pub weather_ok: bool,
}

impl HealthReport {
    pub fn all_ok(&self) -> bool {
        self.store_ok && self.ree_ok && self.weather_ok
    }
}

/// A job that hasn't run yet is treated as healthy rather than failed;
/// there is simply nothing to report yet.
fn job_ok(status: Option<&JobStatus>) -> bool {
    status.map(|s| s.last_ok || s.run_count == 0).unwrap_or(true)
}

#[derive(Default)]
struct JobState {
    running: AtomicBool,
    run_count: AtomicU64,
    failure_count: AtomicU64,
    last_ok: AtomicBool,
}

impl JobState {
    fn snapshot(&self) -> JobStatus {
        JobStatus {
            run_count: self.run_count.load(Ordering::SeqCst),
            failure_count: self.failure_count.load(Ordering::SeqCst),
            last_ok: self.last_ok.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
        }
    }
}

/// Guards a job against overlap with itself: if the previous run of this
/// topic hasn't finished, the new tick is skipped rather than queued.
struct JobGuard {
    state: Arc<JobState>,
}

impl JobGuard {
    /// Returns `None` if the job is already running (caller should skip
    /// this tick).
    fn enter(state: Arc<JobState>) -> Option<Self> {
        if state
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        Some(Self { state })
    }

    fn finish(self, ok: bool) {
        self.state.run_count.fetch_add(1, Ordering::SeqCst);
        if !ok {
            self.state.failure_count.fetch_add(1, Ordering::SeqCst);
        }
        self.state.last_ok.store(ok, Ordering::SeqCst);
        self.state.running.store(false, Ordering::SeqCst);
    }
}

pub struct Scheduler {
    inner: JobScheduler,
    statuses: Arc<RwLock<BTreeMap<&'static str, Arc<JobState>>>>,
    last_health: Arc<RwLock<Option<HealthReport>>>,
}

impl Scheduler {
    pub async fn new() -> Result<Self, tokio_cron_scheduler::JobSchedulerError> {
        Ok(Self {
            inner: JobScheduler::new().await?,
            statuses: Arc::new(RwLock::new(BTreeMap::new())),
            last_health: Arc::new(RwLock::new(None)),
        })
    }

    /// Most recent `health_check` outcome, if the job has run at least once.
    pub async fn last_health(&self) -> Option<HealthReport> {
        self.last_health.read().await.clone()
    }

    async fn register(&self, name: &'static str) -> Arc<JobState> {
        let state = Arc::new(JobState::default());
        self.statuses.write().await.insert(name, state.clone());
        state
    }

    pub async fn statuses(&self) -> BTreeMap<&'static str, JobStatus> {
        self.statuses
            .read()
            .await
            .iter()
            .map(|(name, state)| (*name, state.snapshot()))
            .collect()
    }

    /// Wires the canonical job table: ingestion every 5 minutes, gap
    /// auto-backfill every 2 hours, forecast freshness check every 6
    /// hours, health check every 15 minutes, AEMET token refresh daily at
    /// 03:00, and a full daily backfill sweep at 01:00. All times are UTC.
    pub async fn register_jobs(
        &self,
        store: Arc<dyn TimeSeriesStore>,
        orchestrator: Arc<IngestionOrchestrator>,
        backfill: Arc<BackfillEngine>,
        forecaster: Arc<PriceForecaster>,
        analyzer: Arc<SiarHistoricalAnalyzer>,
        aemet: Arc<AemetClient>,
    ) -> Result<(), tokio_cron_scheduler::JobSchedulerError> {
        self.add_named_job("ree_ingest", "0 */5 * * * *", {
            let orchestrator = orchestrator.clone();
            move || {
                let orchestrator = orchestrator.clone();
                async move {
                    let stats = orchestrator.ingest_ree().await;
                    stats.success_rate > 0.0 || stats.records_written == 0
                }
            }
        })
        .await?;

        self.add_named_job("weather_ingest", "0 */5 * * * *", {
            let orchestrator = orchestrator.clone();
            move || {
                let orchestrator = orchestrator.clone();
                async move {
                    let stats = orchestrator.ingest_weather_hybrid().await;
                    stats.source_used.is_some()
                }
            }
        })
        .await?;

        self.add_named_job("auto_backfill_check", "0 0 */2 * * *", {
            let backfill = backfill.clone();
            move || {
                let backfill = backfill.clone();
                async move { backfill.run_auto(6.0).await.is_ok() }
            }
        })
        .await?;

        self.add_named_job("ensure_forecast_model", "0 0 */6 * * *", {
            let forecaster = forecaster.clone();
            move || {
                let forecaster = forecaster.clone();
                async move { forecaster.ensure_fresh().await.is_ok() }
            }
        })
        .await?;

        self.add_named_job("health_check", "0 */15 * * * *", {
            let store = store.clone();
            let statuses = self.statuses.clone();
            let last_health = self.last_health.clone();
            move || {
                let store = store.clone();
                let statuses = statuses.clone();
                let last_health = last_health.clone();
                async move {
                    let store_ok = store.health().await.is_ok();
                    let snapshot = statuses
                        .read()
                        .await
                        .iter()
                        .map(|(name, state)| (*name, state.snapshot()))
                        .collect::<BTreeMap<_, _>>();
                    let ree_ok = job_ok(snapshot.get("ree_ingest"));
                    let weather_ok = job_ok(snapshot.get("weather_ingest"));
                    let report = HealthReport {
                        checked_at: Utc::now(),
                        store_ok,
                        ree_ok,
                        weather_ok,
                    };
                    let all_ok = report.all_ok();
                    if !all_ok {
                        warn!(
                            store_ok,
                            ree_ok, weather_ok, "health check found a degraded component"
                        );
                    }
                    *last_health.write().await = Some(report);
                    all_ok
                }
            }
        })
        .await?;

        self.add_named_job("token_refresh", "0 0 3 * * *", {
            let aemet = aemet.clone();
            move || {
                let aemet = aemet.clone();
                async move { aemet.renew_token_if_needed().await.is_ok() }
            }
        })
        .await?;

        self.add_named_job("daily_backfill", "0 0 1 * * *", {
            let backfill = backfill.clone();
            move || {
                let backfill = backfill.clone();
                async move { backfill.run_auto(3.0).await.is_ok() }
            }
        })
        .await?;

        let _ = analyzer;
        Ok(())
    }

    async fn add_named_job<F, Fut>(
        &self,
        name: &'static str,
        cron_expr: &str,
        make_future: F,
    ) -> Result<(), tokio_cron_scheduler::JobSchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        let state = self.register(name).await;
        let job = Job::new_async(cron_expr, move |_uuid, _l| {
            let state = state.clone();
            let fut = make_future();
            Box::pin(async move {
                let Some(guard) = JobGuard::enter(state) else {
                    warn!(job = name, "skipping tick: previous run still in progress");
                    return;
                };
                let ok = fut.await;
                if !ok {
                    error!(job = name, "scheduled job reported failure");
                }
                guard.finish(ok);
                info!(job = name, "scheduled job tick completed");
            })
        })?;
        self.inner.add(job).await?;
        Ok(())
    }

    pub async fn start(&self) -> Result<(), tokio_cron_scheduler::JobSchedulerError> {
        self.inner.start().await
    }

    /// Stops accepting new ticks and waits up to 30s for in-flight jobs to
    /// finish before returning.
    pub async fn shutdown(mut self) -> Result<(), tokio_cron_scheduler::JobSchedulerError> {
        self.inner.shutdown().await?;
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        loop {
            let any_running = self
                .statuses
                .read()
                .await
                .values()
                .any(|s| s.running.load(Ordering::SeqCst));
            if !any_running || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_guard_skips_overlapping_ticks() {
        let state = Arc::new(JobState::default());
        let first = JobGuard::enter(state.clone()).expect("first enter succeeds");
        assert!(JobGuard::enter(state.clone()).is_none());
        first.finish(true);
        assert!(JobGuard::enter(state.clone()).is_some());
    }

    #[tokio::test]
    async fn job_status_tracks_failures() {
        let state = Arc::new(JobState::default());
        let guard = JobGuard::enter(state.clone()).unwrap();
        guard.finish(false);
        let status = state.snapshot();
        assert_eq!(status.run_count, 1);
        assert_eq!(status.failure_count, 1);
        assert!(!status.last_ok);
        assert!(!status.running);
    }

    #[test]
    fn job_ok_treats_never_run_as_healthy() {
        assert!(job_ok(None));
        assert!(job_ok(Some(&JobStatus::default())));
    }

    #[test]
    fn job_ok_reflects_last_failure() {
        let failed = JobStatus {
            run_count: 1,
            failure_count: 1,
            last_ok: false,
            running: false,
        };
        assert!(!job_ok(Some(&failed)));
    }

    #[test]
    fn health_report_all_ok_requires_every_component() {
        let degraded = HealthReport {
            checked_at: Utc::now(),
            store_ok: true,
            ree_ok: false,
            weather_ok: true,
        };
        assert!(!degraded.all_ok());
    }

    #[tokio::test]
    async fn scheduler_registers_statuses_for_every_job() {
        let scheduler = Scheduler::new().await.unwrap();
        scheduler.register("ree_ingest").await;
        scheduler.register("weather_ingest").await;
        let statuses = scheduler.statuses().await;
        assert!(statuses.contains_key("ree_ingest"));
        assert!(statuses.contains_key("weather_ingest"));
    }
}
