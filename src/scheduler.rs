//! C8: background cron jobs. Two jobs only — session auto-end and guest
//! anonymisation — scheduled with `tokio-cron-scheduler` the same way the
//! teacher's `workers::WorkerManager` schedules its periodic jobs: one
//! `JobScheduler`, a `broadcast` shutdown signal raced against each job body
//! via `tokio::select!`, schedule strings read from config rather than
//! hardcoded.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::quiz::QuizEngine;
use crate::store::Store;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
    #[error("invalid cron expression {expression:?}: {source}")]
    InvalidSchedule {
        expression: String,
        #[source]
        source: tokio_cron_scheduler::JobSchedulerError,
    },
}

/// Owns the cron scheduler and the jobs it runs. Constructed once at
/// startup and held alive for the process lifetime; `stop` is idempotent
/// and safe to call during graceful shutdown even if `start` was never
/// called.
pub struct Scheduler {
    scheduler: Mutex<JobScheduler>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub async fn new() -> Result<Self, SchedulerError> {
        let scheduler = JobScheduler::new().await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self { scheduler: Mutex::new(scheduler), shutdown_tx })
    }

    /// Registers both jobs and starts the scheduler. Validates each cron
    /// expression as it is added, so a malformed `Config` schedule string
    /// surfaces as a startup error rather than a job that silently never
    /// fires.
    pub async fn start(&self, engine: Arc<QuizEngine>, store: Arc<dyn Store>, config: &Config) -> Result<(), SchedulerError> {
        let scheduler = self.scheduler.lock().await;

        {
            let engine = Arc::clone(&engine);
            let store = Arc::clone(&store);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let schedule = config.session_auto_end_schedule.clone();
            let threshold_hours = config.session_timeout_hours;
            let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
                let engine = Arc::clone(&engine);
                let store = Arc::clone(&store);
                let mut rx = shutdown_rx.resubscribe();
                Box::pin(async move {
                    tokio::select! {
                        _ = rx.recv() => {},
                        () = auto_end_timed_out_sessions(&engine, &store, threshold_hours) => {},
                    }
                })
            })
            .map_err(|source| SchedulerError::InvalidSchedule { expression: schedule.clone(), source })?;
            scheduler.add(job).await?;
            info!(schedule = %config.session_auto_end_schedule, "session auto-end job scheduled");
        }

        {
            let store = Arc::clone(&store);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let schedule = config.guest_anonymise_schedule.clone();
            let retention_days = config.guest_data_retention_days;
            let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
                let store = Arc::clone(&store);
                let mut rx = shutdown_rx.resubscribe();
                Box::pin(async move {
                    tokio::select! {
                        _ = rx.recv() => {},
                        () = anonymise_old_guests(&store, retention_days) => {},
                    }
                })
            })
            .map_err(|source| SchedulerError::InvalidSchedule { expression: schedule.clone(), source })?;
            scheduler.add(job).await?;
            info!(schedule = %config.guest_anonymise_schedule, "guest anonymisation job scheduled");
        }

        scheduler.start().await?;
        info!("scheduler started");
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let mut scheduler = self.scheduler.lock().await;
        if let Err(err) = scheduler.shutdown().await {
            warn!(error = %err, "error shutting down scheduler");
        }
    }
}

async fn auto_end_timed_out_sessions(engine: &Arc<QuizEngine>, store: &Arc<dyn Store>, threshold_hours: i64) {
    let now = chrono::Utc::now();
    let sessions = match store.get_timed_out_sessions(now, threshold_hours).await {
        Ok(sessions) => sessions,
        Err(err) => {
            error!(error = %err, "failed to list timed-out sessions");
            return;
        }
    };

    if sessions.is_empty() {
        return;
    }
    info!(count = sessions.len(), "auto-ending timed-out sessions");
    for session in sessions {
        if let Err(err) = engine.auto_end(&session.id).await {
            warn!(session_id = %session.id, error = %err, "failed to auto-end session");
        }
    }
}

async fn anonymise_old_guests(store: &Arc<dyn Store>, retention_days: i64) {
    let now = chrono::Utc::now();
    match store.anonymise_old_guests(now, retention_days).await {
        Ok(count) if count > 0 => info!(count, "anonymised stale guest participants"),
        Ok(_) => {}
        Err(err) => error!(error = %err, "guest anonymisation cycle failed"),
    }
}
