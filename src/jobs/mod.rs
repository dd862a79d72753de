//! Background job workers
//!
//! Each worker loops over the job registry, claiming one pending run at a
//! time (single-winner via the skip-locked pop) and dispatching it to the
//! matching executor. A periodic recovery sweep resets running jobs whose
//! heartbeat has expired, so a crashed worker's jobs are reclaimed and
//! resumed from their checkpoints.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::database::JobRepository;
use crate::error::DomainError;
use crate::events::{event_types, DomainEvent, EventBus};
use crate::import::{ImportOutcome, ImportPipeline};
use crate::models::{AnalysisRun, RunType};
use crate::services::exploration_service::ExplorationService;
use crate::services::sampling_service::SamplingService;

pub struct JobWorker {
    pool: PgPool,
    bus: EventBus,
    config: AppConfig,
    import: ImportPipeline,
    sampling: SamplingService,
    exploration: ExplorationService,
}

impl JobWorker {
    pub fn new(pool: PgPool, config: AppConfig, bus: EventBus) -> Self {
        Self {
            import: ImportPipeline::new(pool.clone(), config.import.clone(), bus.clone()),
            sampling: SamplingService::new(pool.clone(), bus.clone()),
            exploration: ExplorationService::new(pool.clone()),
            pool,
            bus,
            config,
        }
    }

    /// Spawn `worker_count` worker loops plus one recovery sweeper.
    pub fn spawn_all(pool: PgPool, config: &AppConfig, bus: &EventBus) {
        for n in 0..config.worker.worker_count {
            let worker = Arc::new(JobWorker::new(pool.clone(), config.clone(), bus.clone()));
            tokio::spawn(async move {
                tracing::info!(worker = n, "job worker started");
                worker.run().await;
            });
        }
    }

    /// Main worker loop: recover, claim, execute, idle.
    pub async fn run(&self) {
        let mut last_sweep = Instant::now();
        let sweep_every = self.config.worker.heartbeat_timeout / 2;

        loop {
            if last_sweep.elapsed() >= sweep_every {
                last_sweep = Instant::now();
                match JobRepository::recover_stalled(&self.pool, self.config.worker.heartbeat_timeout)
                    .await
                {
                    Ok(recovered) if !recovered.is_empty() => {
                        tracing::warn!(count = recovered.len(), "reset stalled jobs to pending");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "stalled-job recovery sweep failed"),
                }
            }

            match self.claim_one().await {
                Ok(Some(job)) => self.execute(job).await,
                Ok(None) => tokio::time::sleep(self.config.worker.poll_interval).await,
                Err(e) => {
                    tracing::warn!(error = %e, "job claim failed");
                    tokio::time::sleep(self.config.worker.poll_interval).await;
                }
            }
        }
    }

    async fn claim_one(&self) -> Result<Option<AnalysisRun>, sqlx::Error> {
        for run_type in RunType::ALL {
            if let Some(job) = JobRepository::claim_next(&self.pool, run_type).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn execute(&self, job: AnalysisRun) {
        tracing::info!(
            job_id = %job.id,
            run_type = job.run_type.as_str(),
            dataset_id = %job.dataset_id,
            "executing job"
        );

        let outcome = match job.run_type {
            RunType::Import => self.import.run(&job).await.map(|o| match o {
                ImportOutcome::Completed(summary) => Some(summary),
                ImportOutcome::Cancelled => None,
            }),
            RunType::Sampling => self.sampling.run_job(&job).await.map(Some),
            RunType::Exploration => self.exploration.run_job(&job, false).await.map(Some),
            RunType::Profiling => self.exploration.run_job(&job, true).await.map(Some),
        };

        match outcome {
            Ok(Some(summary)) => {
                match JobRepository::complete(&self.pool, job.id, &summary).await {
                    Ok(true) => {
                        self.bus.publish(DomainEvent::new(
                            event_types::JOB_COMPLETED,
                            "analysis_run",
                            job.id,
                            Some(job.user_id),
                            summary,
                        ));
                    }
                    Ok(false) => {
                        // Cancelled between the last batch and completion;
                        // terminal states absorb the transition.
                        tracing::info!(job_id = %job.id, "job finished but was no longer running");
                    }
                    Err(e) => tracing::error!(job_id = %job.id, error = %e, "failed to complete job"),
                }
            }
            Ok(None) => {
                tracing::info!(job_id = %job.id, "job cancelled");
            }
            Err(err) => self.handle_failure(&job, err).await,
        }
    }

    /// Transient infrastructure errors leave the job in `running`: once its
    /// heartbeat expires the recovery sweep resets it to pending and a
    /// worker resumes from the persisted checkpoint. Domain failures are
    /// terminal.
    async fn handle_failure(&self, job: &AnalysisRun, err: DomainError) {
        let has_checkpoint = job.run_parameters.get("checkpoint").is_some();

        match &err {
            DomainError::Transient(_) | DomainError::Database(_) if has_checkpoint => {
                tracing::warn!(
                    job_id = %job.id,
                    error = %err,
                    "transient failure; leaving job for checkpoint recovery"
                );
                return;
            }
            _ => {}
        }

        let message = match &err {
            DomainError::RefMovedUnderImport => "RefMovedUnderImport: ref moved under import; re-queue the job".to_string(),
            other => other.to_string(),
        };

        tracing::warn!(job_id = %job.id, error = %message, "job failed");

        match JobRepository::fail(&self.pool, job.id, &message).await {
            Ok(true) => {
                self.bus.publish(DomainEvent::new(
                    event_types::JOB_FAILED,
                    "analysis_run",
                    job.id,
                    Some(job.user_id),
                    json!({"error": message, "kind": err.kind()}),
                ));
            }
            Ok(false) => {
                tracing::info!(job_id = %job.id, "job already terminal; failure absorbed");
            }
            Err(e) => tracing::error!(job_id = %job.id, error = %e, "failed to mark job failed"),
        }
    }
}
