//! Scheduled jobs: OHLCV backfill, feature enrichment, health monitoring.
//!
//! The `Scheduler` value is owned by the process entry point: `start()` at
//! boot spawns the timing loops, `stop()` on shutdown raises the cooperative
//! stop flag and joins every in-flight worker. Nothing in here is a global;
//! collaborators arrive by injection.

pub mod backfill;
pub mod enrichment;
pub mod monitor;

pub use backfill::{run_ohlcv_backfill, BackfillRequest};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::observability::{AlertManager, MetricsCollector};
use crate::storage::WarehouseDb;
use crate::upstream::MultiSourceOrchestrator;

const ENRICHMENT_HOUR: u32 = 1;
const ENRICHMENT_MINUTE: u32 = 30;
const MONITOR_INTERVAL_HOURS: u64 = 6;
/// Candle window fetched per pair during enrichment.
pub const ENRICHMENT_WINDOW: usize = 100;

/// Everything a scheduled job needs, shared across workers.
pub struct JobContext {
    pub db: WarehouseDb,
    pub orchestrator: Arc<MultiSourceOrchestrator>,
    pub alerts: Arc<AlertManager>,
    pub metrics: Arc<MetricsCollector>,
    pub max_concurrent_symbols: usize,
    pub parallel_backfill: bool,
    pub stop: watch::Receiver<bool>,
}

impl JobContext {
    pub fn stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

pub struct Scheduler {
    ctx: Arc<JobContext>,
    schedule_hour: u32,
    schedule_minute: u32,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        db: WarehouseDb,
        orchestrator: Arc<MultiSourceOrchestrator>,
        alerts: Arc<AlertManager>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = Arc::new(JobContext {
            db,
            orchestrator,
            alerts,
            metrics,
            max_concurrent_symbols: config.max_concurrent_symbols,
            parallel_backfill: config.parallel_backfill,
            stop: stop_rx,
        });

        Self {
            ctx,
            schedule_hour: config.backfill_schedule_hour,
            schedule_minute: config.backfill_schedule_minute,
            stop_tx,
            handles: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn context(&self) -> Arc<JobContext> {
        self.ctx.clone()
    }

    /// Spawn the three timing loops.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already started");
            return;
        }

        info!(
            backfill_hour = self.schedule_hour,
            backfill_minute = self.schedule_minute,
            "scheduler starting"
        );

        let mut handles = self.handles.lock();

        // Daily OHLCV backfill.
        {
            let ctx = self.ctx.clone();
            let hour = self.schedule_hour;
            let minute = self.schedule_minute;
            handles.push(tokio::spawn(async move {
                daily_loop(ctx.clone(), hour, minute, "ohlcv_backfill", |ctx| async move {
                    let request = BackfillRequest::scheduled();
                    let summary = run_ohlcv_backfill(&ctx, request).await;
                    info!(
                        trace_id = %summary.trace_id,
                        succeeded = summary.pairs_succeeded,
                        failed = summary.pairs_failed,
                        records = summary.records_inserted,
                        "scheduled backfill run finished"
                    );
                })
                .await;
            }));
        }

        // Daily feature enrichment, ahead of the backfill slot.
        {
            let ctx = self.ctx.clone();
            handles.push(tokio::spawn(async move {
                daily_loop(
                    ctx.clone(),
                    ENRICHMENT_HOUR,
                    ENRICHMENT_MINUTE,
                    "feature_enrichment",
                    |ctx| async move {
                        enrichment::run_feature_enrichment(&ctx).await;
                    },
                )
                .await;
            }));
        }

        // Health monitor on a fixed interval.
        {
            let ctx = self.ctx.clone();
            handles.push(tokio::spawn(async move {
                let mut stop = ctx.stop.clone();
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    MONITOR_INTERVAL_HOURS * 3600,
                ));
                // The immediate first tick runs a sweep at boot.
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            monitor::run_health_sweep(&ctx).await;
                        }
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }
    }

    /// Submit an ad-hoc backfill run. Returns the run's job id immediately;
    /// the work happens on a spawned task.
    pub fn submit_adhoc(&self, request: BackfillRequest) -> String {
        let job_id = request.trace_id.clone();
        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move {
            let summary = run_ohlcv_backfill(&ctx, request).await;
            info!(
                trace_id = %summary.trace_id,
                succeeded = summary.pairs_succeeded,
                failed = summary.pairs_failed,
                "ad-hoc backfill run finished"
            );
        });
        self.handles.lock().push(handle);
        job_id
    }

    /// Raise the stop flag and join every spawned task. In-flight workers
    /// finish their current batch and mark their state cancelled.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("scheduler stopping, joining workers");
        let _ = self.stop_tx.send(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "scheduler task join failed");
                }
            }
        }
        info!("scheduler stopped");
    }
}

/// Run `job` every day at hour:minute UTC until the stop flag flips.
async fn daily_loop<F, Fut>(
    ctx: Arc<JobContext>,
    hour: u32,
    minute: u32,
    job_name: &'static str,
    job: F,
) where
    F: Fn(Arc<JobContext>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut stop = ctx.stop.clone();
    loop {
        let wait = duration_until_next(hour, minute);
        info!(
            job = job_name,
            next_in_secs = wait.as_secs(),
            "job scheduled"
        );
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                job(ctx.clone()).await;
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    info!(job = job_name, "job loop stopping");
                    break;
                }
            }
        }
    }
}

/// Time until the next hour:minute UTC, always in the future.
fn duration_until_next(hour: u32, minute: u32) -> Duration {
    let now = Utc::now();
    let today = match now.date_naive().and_hms_opt(hour.min(23), minute.min(59), 0) {
        Some(t) => t,
        None => now.naive_utc(),
    };
    let mut next = Utc.from_utc_datetime(&today);
    if next <= now {
        next += chrono::Duration::days(1);
    }
    (next - now)
        .to_std()
        .unwrap_or(Duration::from_secs(60))
}
