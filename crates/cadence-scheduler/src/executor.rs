//! Runs fired jobs: resolves the handler, enforces the execution budget,
//! writes exactly one log entry per fire and applies the failure policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_core::types::{JobId, LogId};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    engine::FireEvent,
    error::SchedulerError,
    registry::{HandlerRegistry, JobContext, JobHandler},
    store::{JobStore, LogStore},
    types::{ExecutionLogEntry, Outcome},
};

/// What happened on one fire, and whether the job should now be paused.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub entry: ExecutionLogEntry,
    pub pause_requested: bool,
}

pub struct JobExecutor {
    registry: Arc<HandlerRegistry>,
    jobs: Arc<dyn JobStore>,
    logs: Arc<dyn LogStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    failure_threshold: u32,
    /// Consecutive failures per job since its last success.
    failures: DashMap<JobId, u32>,
}

impl JobExecutor {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        jobs: Arc<dyn JobStore>,
        logs: Arc<dyn LogStore>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            registry,
            jobs,
            logs,
            clock,
            timeout,
            failure_threshold: failure_threshold.max(1),
            failures: DashMap::new(),
        }
    }

    /// Execute one fire. Never returns an error: every problem ends up in the
    /// log entry.
    pub async fn execute(&self, fire: &FireEvent) -> ExecutionReport {
        let job = &fire.job;
        let key = job.handler_key();
        let start_time = self.clock.now();
        let started = Instant::now();

        let (outcome, error_detail) = match self.registry.resolve(&key) {
            Some(handler) => {
                let ctx = JobContext {
                    job_id: job.id.clone(),
                    job_name: job.name.clone(),
                    job_group: job.group.clone(),
                    run_params: job.run_params.clone(),
                    fired_at: fire.fired_at,
                    cancel: CancellationToken::new(),
                };
                self.run_handler(handler, ctx).await
            }
            None => {
                let err = SchedulerError::HandlerNotFound {
                    key: key.to_string(),
                };
                warn!(job_id = %job.id, handler = %key, "no handler registered");
                (Outcome::Failure, Some(err.to_string()))
            }
        };

        let entry = ExecutionLogEntry {
            id: LogId::new(),
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            job_group: job.group.clone(),
            handler: key.to_string(),
            run_params: job.run_params.clone(),
            start_time,
            duration_ms: started.elapsed().as_millis() as u64,
            outcome,
            error_detail,
        };

        if let Err(e) = self.logs.append(&entry) {
            error!(job_id = %job.id, "failed to write execution log: {e}");
        }
        if let Err(e) = self.jobs.increment_run_count(&job.id) {
            warn!(job_id = %job.id, "failed to bump run count: {e}");
        }

        match outcome {
            Outcome::Success => {
                info!(job_id = %job.id, name = %job.name, duration_ms = entry.duration_ms, "job succeeded")
            }
            _ => {
                warn!(
                    job_id = %job.id,
                    name = %job.name,
                    %outcome,
                    error = entry.error_detail.as_deref().unwrap_or(""),
                    "job run did not succeed"
                );
                if let Some(alert) = job.alert_email.as_deref() {
                    warn!(job_id = %job.id, alert_email = %alert, "failure alert recipient configured");
                }
            }
        }

        let pause_requested = self.record_outcome(&job.id, outcome, job.pause_after_failure);
        ExecutionReport {
            entry,
            pause_requested,
        }
    }

    /// Current consecutive-failure count for `id`.
    pub fn consecutive_failures(&self, id: &JobId) -> u32 {
        self.failures.get(id).map(|n| *n).unwrap_or(0)
    }

    /// Forget the failure streak of a job (e.g. after it was deleted).
    pub fn forget(&self, id: &JobId) {
        self.failures.remove(id);
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn JobHandler>,
        ctx: JobContext,
    ) -> (Outcome, Option<String>) {
        let cancel = ctx.cancel.clone();
        let job_id = ctx.job_id.clone();
        // Own task so a hung handler never blocks the caller past its budget.
        let mut task = tokio::spawn(async move { handler.run(ctx).await });

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(Ok(()))) => (Outcome::Success, None),
            Ok(Ok(Err(e))) => (
                Outcome::Failure,
                Some(SchedulerError::HandlerFailure(format!("{e:#}")).to_string()),
            ),
            Ok(Err(join_err)) => (
                Outcome::Failure,
                Some(SchedulerError::HandlerFailure(join_err.to_string()).to_string()),
            ),
            Err(_) => {
                // Cooperative: signal and walk away, the task is detached.
                cancel.cancel();
                debug!(%job_id, "handler abandoned after timeout");
                let ms = self.timeout.as_millis() as u64;
                (Outcome::Timeout, Some(SchedulerError::Timeout { ms }.to_string()))
            }
        }
    }

    /// Update the failure streak; returns whether the pause policy tripped.
    fn record_outcome(&self, id: &JobId, outcome: Outcome, pause_after_failure: bool) -> bool {
        if outcome == Outcome::Success {
            self.failures.remove(id);
            return false;
        }

        let streak = {
            let mut count = self.failures.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if pause_after_failure && streak >= self.failure_threshold {
            self.failures.remove(id);
            info!(job_id = %id, streak, "failure threshold reached, requesting pause");
            return true;
        }
        false
    }
}
