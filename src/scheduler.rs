use std::sync::Arc;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::governor::Governor;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

/// Periodic driver for the auto-adjuster.
pub struct ReconsiderScheduler {
    scheduler: JobScheduler,
}

impl ReconsiderScheduler {
    pub async fn new() -> Result<Self, SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;
        Ok(Self { scheduler })
    }

    /// Register the reconsider job on `cron` (six-field syntax).
    pub async fn schedule(
        &self,
        cron: &str,
        governor: Arc<Governor>,
    ) -> Result<(), SchedulerError> {
        tracing::info!(cron = %cron, "Scheduling mode reconsideration");

        let job = Job::new_async(cron, move |_uuid, _lock| {
            let governor = Arc::clone(&governor);
            Box::pin(async move {
                run_reconsider(&governor).await;
            })
        })
        .map_err(|e| SchedulerError::InvalidCron(format!("{cron}: {e}")))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;
        Ok(())
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        tracing::info!("Starting scheduler");
        self.scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))
    }

    pub async fn shutdown(&mut self) -> Result<(), SchedulerError> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))
    }
}

/// One scheduled pass. Failures are logged; the next tick retries.
pub async fn run_reconsider(governor: &Governor) {
    match governor.reconsider().await {
        Ok(Some(transition)) if transition.applied => tracing::info!(
            from = %transition.from,
            to = %transition.to,
            "Scheduled reconsider changed mode"
        ),
        Ok(Some(transition)) => tracing::debug!(
            to = %transition.to,
            "Scheduled reconsider recommended a change, auto-adjust is off"
        ),
        Ok(None) => tracing::debug!("Scheduled reconsider kept the current mode"),
        Err(e) => tracing::error!(error = %e, "Scheduled reconsider failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_invalid_cron() {
        let scheduler = ReconsiderScheduler::new().await.unwrap();
        let governor = Arc::new(crate::routes::tests::test_governor().await);

        let result = scheduler.schedule("every fortnight", governor).await;
        assert!(matches!(result, Err(SchedulerError::InvalidCron(_))));
    }

    #[tokio::test]
    async fn test_accepts_default_cron() {
        let scheduler = ReconsiderScheduler::new().await.unwrap();
        let governor = Arc::new(crate::routes::tests::test_governor().await);

        scheduler
            .schedule(&crate::config::SchedulerConfig::default().cron, governor)
            .await
            .unwrap();
    }
}
