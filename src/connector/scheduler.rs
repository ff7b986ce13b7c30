//! Cron scheduler connector
//!
//! Wraps tokio-cron-scheduler. Jobs are grouped by owner (`flow_id/node_id`)
//! so a node can drop all of its schedules when its flow stops.

use async_trait::async_trait;
use std::{any::Any, collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::connector::Connector;
use crate::error::{FlowError, Result};

/// Invoked on every tick of a job
pub type JobCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct CronScheduler {
    scheduler: RwLock<Option<JobScheduler>>,
    /// owner -> job ids, for removal
    jobs: Mutex<HashMap<String, Vec<Uuid>>>,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `callback` with a 6-field cron expression (seconds first)
    pub async fn add_job(&self, owner: &str, schedule: &str, callback: JobCallback) -> Result<Uuid> {
        let job_owner = owner.to_string();
        let job = Job::new_async(schedule, move |_uuid, _l| {
            let callback = Arc::clone(&callback);
            let owner = job_owner.clone();
            Box::pin(async move {
                tracing::debug!("Cron job fired for {}", owner);
                callback();
            })
        })
        .map_err(|e| FlowError::Validation(format!("invalid cron expression '{}': {}", schedule, e)))?;

        let job_uuid = {
            let scheduler = self.scheduler.read().await;
            let scheduler = scheduler
                .as_ref()
                .ok_or_else(|| FlowError::connector("scheduler", "not running"))?;
            scheduler
                .add(job)
                .await
                .map_err(|e| FlowError::connector("scheduler", e))?
        };

        self.jobs
            .lock()
            .await
            .entry(owner.to_string())
            .or_default()
            .push(job_uuid);
        tracing::debug!("Cron job {} added for {} ({})", job_uuid, owner, schedule);
        Ok(job_uuid)
    }

    /// Remove every job registered by `owner`
    pub async fn remove_jobs(&self, owner: &str) {
        let Some(job_ids) = self.jobs.lock().await.remove(owner) else {
            return;
        };
        let scheduler = self.scheduler.read().await;
        let Some(scheduler) = scheduler.as_ref() else {
            return;
        };
        for job_id in job_ids {
            if let Err(e) = scheduler.remove(&job_id).await {
                tracing::warn!("Failed to remove cron job {} of {}: {}", job_id, owner, e);
            }
        }
        tracing::debug!("Removed cron jobs of {}", owner);
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl Connector for CronScheduler {
    fn plugin(&self) -> &'static str {
        "scheduler"
    }

    async fn init(&self) -> Result<()> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| FlowError::connector("scheduler", e))?;
        scheduler
            .start()
            .await
            .map_err(|e| FlowError::connector("scheduler", e))?;
        *self.scheduler.write().await = Some(scheduler);
        Ok(())
    }

    async fn stop(&self) {
        self.jobs.lock().await.clear();
        if let Some(mut scheduler) = self.scheduler.write().await.take() {
            if let Err(e) = scheduler.shutdown().await {
                tracing::warn!("Cron scheduler shutdown failed: {}", e);
            }
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
