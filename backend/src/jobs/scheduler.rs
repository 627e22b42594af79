// Job Scheduler - Central scheduler for the periodic sweeps

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};

use crate::automations::AutomationEngine;
use crate::distribution::LeadDistributor;
use crate::outbox::DeliveryWorker;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Job execution error: {0}")]
    ExecutionError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Delay-node resumption sweep (minutes)
    pub automation_sweep_interval_minutes: u32,
    /// Pool redistribution + check-in timeout sweep (minutes)
    pub distribution_sweep_interval_minutes: u32,
    /// Outbox delivery pass (seconds)
    pub outbox_interval_seconds: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            automation_sweep_interval_minutes: 1,
            distribution_sweep_interval_minutes: 1,
            outbox_interval_seconds: 30,
        }
    }
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    engine: Arc<AutomationEngine>,
    distributor: Arc<LeadDistributor>,
    delivery: Arc<DeliveryWorker>,
    config: JobConfig,
}

impl JobScheduler {
    pub async fn new(
        engine: Arc<AutomationEngine>,
        distributor: Arc<LeadDistributor>,
        delivery: Arc<DeliveryWorker>,
        config: JobConfig,
    ) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            engine,
            distributor,
            delivery,
            config,
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_automation_sweep().await?;
        self.schedule_distribution_sweep().await?;
        self.schedule_outbox_delivery().await?;

        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_automation_sweep(&self) -> JobResult<()> {
        let interval = self.config.automation_sweep_interval_minutes;
        let cron_expr = format!("0 */{} * * * *", interval);

        let engine = self.engine.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();

            Box::pin(async move {
                match engine.resume_due_executions(Utc::now()).await {
                    Ok(resumed) if resumed > 0 => {
                        info!("Automation sweep resumed {} executions", resumed)
                    }
                    Ok(_) => {}
                    Err(e) => error!("Automation sweep failed: {}", e),
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled automation delay sweep every {} minute(s)", interval);

        Ok(())
    }

    async fn schedule_distribution_sweep(&self) -> JobResult<()> {
        let interval = self.config.distribution_sweep_interval_minutes;
        let cron_expr = format!("0 */{} * * * *", interval);

        let distributor = self.distributor.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let distributor = distributor.clone();

            Box::pin(async move {
                let now = Utc::now();

                match distributor.redistribute_due(now).await {
                    Ok(stats) if stats.reattempted > 0 => info!(
                        "Redistribution sweep: {} reattempted, {} assigned, {} exhausted",
                        stats.reattempted, stats.assigned, stats.exhausted
                    ),
                    Ok(_) => {}
                    Err(e) => error!("Redistribution sweep failed: {}", e),
                }

                match distributor.expire_unacknowledged(now).await {
                    Ok(expired) if expired > 0 => {
                        info!("Check-in sweep expired {} assignments", expired)
                    }
                    Ok(_) => {}
                    Err(e) => error!("Check-in sweep failed: {}", e),
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled distribution sweep every {} minute(s)", interval);

        Ok(())
    }

    async fn schedule_outbox_delivery(&self) -> JobResult<()> {
        let interval = self.config.outbox_interval_seconds;
        let cron_expr = format!("*/{} * * * * *", interval);

        let delivery = self.delivery.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let delivery = delivery.clone();

            Box::pin(async move {
                if let Err(e) = delivery.run_once(Utc::now()).await {
                    error!("Outbox delivery pass failed: {}", e);
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled outbox delivery every {} second(s)", interval);

        Ok(())
    }

    /// Manual escape hatch for operators and tests.
    pub async fn run_job_now(&self, job_name: &str) -> JobResult<()> {
        match job_name {
            "automation_sweep" => {
                self.engine
                    .resume_due_executions(Utc::now())
                    .await
                    .map_err(|e| JobError::ExecutionError(e.to_string()))?;
            }
            "distribution_sweep" => {
                let now = Utc::now();
                self.distributor
                    .redistribute_due(now)
                    .await
                    .map_err(|e| JobError::ExecutionError(e.to_string()))?;
                self.distributor
                    .expire_unacknowledged(now)
                    .await
                    .map_err(|e| JobError::ExecutionError(e.to_string()))?;
            }
            "outbox_delivery" => {
                self.delivery
                    .run_once(Utc::now())
                    .await
                    .map_err(|e| JobError::ExecutionError(e.to_string()))?;
            }
            _ => return Err(JobError::ConfigError(format!("Unknown job: {}", job_name))),
        }

        Ok(())
    }
}
