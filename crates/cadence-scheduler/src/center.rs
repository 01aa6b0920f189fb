//! Scheduler center: the single entry point for job lifecycle commands.
//!
//! The center keeps the durable job store and the in-memory engine
//! consistent. Every mutating operation takes a per-job async lock, so two
//! commands on the same job are serialised while commands on different jobs
//! proceed independently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_core::config::SchedulerConfig;
use cadence_core::types::JobId;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    engine::{EngineEvent, FireEvent, SchedulerEngine},
    error::{Result, SchedulerError, ValidationError},
    executor::{ExecutionReport, JobExecutor},
    planner::{plan, TriggerPlan},
    registry::{HandlerKey, HandlerRegistry},
    store::{JobStore, LogStore},
    types::{
        ExecutionLogEntry, JobDefinition, JobQuery, JobView, LogQuery, Page, Pagination,
        TriggerState,
    },
};

/// Outcome of re-arming enabled jobs at startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub armed: Vec<JobId>,
    /// Already live when reconciliation reached them.
    pub skipped: Vec<JobId>,
    /// Jobs that could not be armed, with the reason.
    pub failed: Vec<(JobId, String)>,
}

pub struct SchedulerCenter {
    jobs: Arc<dyn JobStore>,
    logs: Arc<dyn LogStore>,
    engine: Arc<SchedulerEngine>,
    executor: Arc<JobExecutor>,
    clock: Arc<dyn Clock>,
    registry: Arc<HandlerRegistry>,
    config: SchedulerConfig,
    locks: LockTable,
    tracker: TaskTracker,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerCenter {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        logs: Arc<dyn LogStore>,
        registry: HandlerRegistry,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let engine = Arc::new(SchedulerEngine::new(
            Arc::clone(&clock),
            Duration::from_millis(config.tick_interval_ms.max(1)),
        ));
        let registry = Arc::new(registry);
        let executor = Arc::new(JobExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&jobs),
            Arc::clone(&logs),
            Arc::clone(&clock),
            Duration::from_millis(config.execution_timeout_ms),
            config.failure_threshold,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            jobs,
            logs,
            engine,
            executor,
            clock,
            registry,
            config,
            locks: DashMap::new(),
            tracker: TaskTracker::new(),
            shutdown_tx,
            started: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Direct access to the engine, mainly for driving ticks in tests.
    pub fn engine(&self) -> &Arc<SchedulerEngine> {
        &self.engine
    }

    pub fn executor(&self) -> &Arc<JobExecutor> {
        &self.executor
    }

    // ── commands ─────────────────────────────────────────────────────────────

    /// Persist a new definition and arm it when enabled.
    ///
    /// If arming fails the record is kept but its `is_enabled` flag is forced
    /// back to `false` before the error is returned.
    pub async fn create_job(&self, mut def: JobDefinition) -> Result<JobDefinition> {
        let plan = validate(&def)?;
        let _guard = self.lock_job(&def.id).await;

        if self.jobs.find_by_key(&def.name, &def.group)?.is_some() {
            return Err(SchedulerError::DuplicateJob {
                name: def.name,
                group: def.group,
            });
        }
        self.warn_if_unregistered(&def);

        let now = self.clock.now();
        def.created_at = now;
        def.updated_at = now;
        def.run_count = 0;
        self.jobs.save(&def)?;
        info!(job_id = %def.id, name = %def.name, group = %def.group, enabled = def.is_enabled, "job created");

        if def.is_enabled {
            if let Err(e) = self.engine.arm(&def, plan) {
                def.is_enabled = false;
                self.force_disabled(&def.id);
                return Err(e);
            }
        }
        Ok(def)
    }

    /// Replace a definition and re-arm it according to the new trigger.
    ///
    /// The old trigger is detached first; if the store write fails it is put
    /// back untouched, so one id never has two live triggers.
    pub async fn update_job(&self, mut def: JobDefinition) -> Result<JobDefinition> {
        let plan = validate(&def)?;
        let _guard = self.lock_job(&def.id).await;

        let existing = self
            .jobs
            .find(&def.id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: def.id.clone() })?;
        if let Some(other) = self.jobs.find_by_key(&def.name, &def.group)? {
            if other.id != def.id {
                return Err(SchedulerError::DuplicateJob {
                    name: def.name,
                    group: def.group,
                });
            }
        }
        self.warn_if_unregistered(&def);
        def.created_at = existing.created_at;
        def.run_count = existing.run_count;
        def.updated_at = self.clock.now();

        let previous = self.engine.detach(&def.id);
        let persisted = match self.jobs.update(&def) {
            Ok(true) => Ok(()),
            Ok(false) => Err(SchedulerError::JobNotFound { id: def.id.clone() }),
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            if let Some(detached) = previous {
                if let Err(re) = self.engine.reattach(detached) {
                    error!(job_id = %def.id, "failed to restore trigger after store error: {re}");
                }
            }
            return Err(e);
        }

        if def.is_enabled {
            if let Err(e) = self.engine.arm(&def, plan) {
                def.is_enabled = false;
                self.force_disabled(&def.id);
                return Err(e);
            }
        }
        info!(job_id = %def.id, enabled = def.is_enabled, "job updated");
        Ok(def)
    }

    /// Disarm and delete `ids`. Returns how many records were actually removed.
    ///
    /// If the store delete fails, the triggers are restored.
    pub async fn delete_jobs(&self, ids: &[JobId]) -> Result<usize> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            guards.push(self.lock_job(id).await);
        }

        let detached: Vec<_> = ids.iter().filter_map(|id| self.engine.detach(id)).collect();
        match self.jobs.delete(&ids) {
            Ok(n) => {
                for id in &ids {
                    self.executor.forget(id);
                }
                info!(requested = ids.len(), deleted = n, "jobs deleted");
                Ok(n)
            }
            Err(e) => {
                for trigger in detached {
                    let id = trigger.job_id().clone();
                    if let Err(re) = self.engine.reattach(trigger) {
                        error!(job_id = %id, "failed to restore trigger after store error: {re}");
                    }
                }
                Err(e)
            }
        }
    }

    /// Enable a job and arm it now.
    ///
    /// Fails with `AlreadyRunning` when a live trigger exists. If arming
    /// fails, the previous `is_enabled` value is restored.
    pub async fn execute(&self, id: &JobId) -> Result<()> {
        let _guard = self.lock_job(id).await;

        let mut def = self
            .jobs
            .find(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.clone() })?;
        let plan = validate(&def)?;

        let was_enabled = def.is_enabled;
        if !was_enabled {
            self.jobs.set_enabled(id, true)?;
            def.is_enabled = true;
        }
        if self.engine.exists(id) {
            return Err(SchedulerError::AlreadyRunning { id: id.clone() });
        }

        match self.engine.arm(&def, plan) {
            Ok(generation) => {
                info!(job_id = %id, generation, "job started");
                Ok(())
            }
            Err(e) => {
                if !was_enabled {
                    self.force_disabled(id);
                }
                Err(match e {
                    SchedulerError::AlreadyArmed { id } => SchedulerError::AlreadyRunning { id },
                    other => other,
                })
            }
        }
    }

    pub async fn pause_job(&self, id: &JobId) -> Result<()> {
        let _guard = self.lock_job(id).await;
        self.ensure_known(id)?;
        self.engine.pause(id).map_err(wrong_state)
    }

    pub async fn resume_job(&self, id: &JobId) -> Result<()> {
        let _guard = self.lock_job(id).await;
        self.ensure_known(id)?;
        self.engine.resume(id).map_err(wrong_state)
    }

    // ── queries ──────────────────────────────────────────────────────────────

    /// Live trigger state of `id`; unknown jobs report `NotArmed`.
    pub fn status(&self, id: &JobId) -> TriggerState {
        self.engine.status(id)
    }

    pub fn trigger_status(&self, def: &JobDefinition) -> TriggerState {
        self.engine.status(&def.id)
    }

    pub fn get_job(&self, id: &JobId) -> Result<JobView> {
        let def = self
            .jobs
            .find(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.clone() })?;
        Ok(self.view(def))
    }

    /// One page of definitions, each decorated with its live status.
    pub fn list_jobs(&self, criteria: &JobQuery, pagination: &Pagination) -> Result<Page<JobView>> {
        Ok(self
            .jobs
            .query(criteria, pagination)?
            .map(|def| self.view(def)))
    }

    pub fn query_logs(
        &self,
        criteria: &LogQuery,
        pagination: &Pagination,
    ) -> Result<Page<ExecutionLogEntry>> {
        self.logs.query(criteria, pagination)
    }

    // ── reconciliation & events ──────────────────────────────────────────────

    /// Arm every enabled job that is not live yet.
    ///
    /// A job that cannot be planned or armed is logged and reported; it never
    /// prevents the rest from being armed.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let enabled = self.jobs.find_all_enabled()?;
        let mut report = ReconcileReport::default();

        for def in enabled {
            let _guard = self.lock_job(&def.id).await;
            if self.engine.exists(&def.id) {
                report.skipped.push(def.id.clone());
                continue;
            }
            let armed = plan(&def)
                .map_err(SchedulerError::from)
                .and_then(|p| self.engine.arm(&def, p));
            match armed {
                Ok(_) => report.armed.push(def.id.clone()),
                Err(e) => {
                    warn!(job_id = %def.id, name = %def.name, code = e.code(), "job not armed during reconciliation: {e}");
                    report.failed.push((def.id.clone(), e.to_string()));
                }
            }
        }

        info!(
            armed = report.armed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    /// Apply one engine event. Fires run through the executor; exhausted
    /// triggers converge `is_enabled` to `false`.
    pub async fn handle_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Fired(fire) => {
                let report = self.executor.execute(&fire).await;
                if report.pause_requested {
                    self.apply_pause(&fire, &report).await;
                }
            }
            EngineEvent::Exhausted { job_id, generation } => {
                let _guard = self.lock_job(&job_id).await;
                if self.engine.exists(&job_id) {
                    // re-armed since this trigger retired
                    debug!(%job_id, generation, "ignoring stale exhaustion");
                    return;
                }
                match self.jobs.set_enabled(&job_id, false) {
                    Ok(_) => info!(%job_id, generation, "trigger finished, job disabled"),
                    Err(e) => error!(%job_id, "failed to disable exhausted job: {e}"),
                }
            }
        }
    }

    // ── lifecycle ────────────────────────────────────────────────────────────

    /// Reconcile, then spawn the engine loop and the event dispatcher.
    pub async fn start(self: &Arc<Self>) -> Result<ReconcileReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("scheduler center already started");
            return Ok(ReconcileReport::default());
        }
        let report = self.reconcile().await?;

        let (tx, mut rx) = mpsc::channel(self.config.event_channel_capacity.max(1));
        let engine = Arc::clone(&self.engine);
        let engine_task = tokio::spawn(engine.run(tx, self.shutdown_tx.subscribe()));

        let center = Arc::clone(self);
        let dispatcher = tokio::spawn(async move {
            // Ends once the engine loop exits and drops its sender.
            while let Some(event) = rx.recv().await {
                let c = Arc::clone(&center);
                center.tracker.spawn(async move { c.handle_event(event).await });
            }
            debug!("event dispatcher stopped");
        });

        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        background.push(engine_task);
        background.push(dispatcher);
        info!("scheduler center started");
        Ok(report)
    }

    /// Stop the engine loop and wait (bounded) for in-flight executions.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
            background.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("scheduler background task ended abnormally: {e}");
            }
        }

        self.tracker.close();
        let drain = Duration::from_millis(self.config.drain_timeout_ms);
        match tokio::time::timeout(drain, self.tracker.wait()).await {
            Ok(()) => info!("scheduler center stopped"),
            Err(_) => warn!(
                in_flight = self.tracker.len(),
                "drain timeout elapsed, abandoning running executions"
            ),
        }
    }

    // ── internals ────────────────────────────────────────────────────────────

    async fn lock_job(&self, id: &JobId) -> JobGuard<'_> {
        let lock = Arc::clone(self.locks.entry(id.clone()).or_default().value());
        JobGuard {
            locks: &self.locks,
            id: id.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn warn_if_unregistered(&self, def: &JobDefinition) {
        let key: HandlerKey = def.handler_key();
        if !self.registry.contains(&key) {
            warn!(job_id = %def.id, handler = %key, "no handler registered yet, fires will fail until one is");
        }
    }

    fn ensure_known(&self, id: &JobId) -> Result<()> {
        if self.engine.exists(id) || self.jobs.find(id)?.is_some() {
            Ok(())
        } else {
            Err(SchedulerError::JobNotFound { id: id.clone() })
        }
    }

    fn force_disabled(&self, id: &JobId) {
        if let Err(e) = self.jobs.set_enabled(id, false) {
            error!(job_id = %id, "failed to reset is_enabled after arm failure: {e}");
        }
    }

    /// Pause the trigger that produced `fire`, unless it was replaced or
    /// removed in the meantime.
    async fn apply_pause(&self, fire: &FireEvent, report: &ExecutionReport) {
        let id = &fire.job.id;
        let _guard = self.lock_job(id).await;
        match self.engine.snapshot(id) {
            Some(snap) if snap.generation == fire.generation => match self.engine.pause(id) {
                Ok(()) => warn!(
                    job_id = %id,
                    name = %fire.job.name,
                    outcome = %report.entry.outcome,
                    "job paused after repeated failures"
                ),
                Err(e) => debug!(job_id = %id, "pause after failure skipped: {e}"),
            },
            _ => debug!(job_id = %id, "trigger replaced or gone, pause request dropped"),
        }
    }

    fn view(&self, definition: JobDefinition) -> JobView {
        let snapshot = self.engine.snapshot(&definition.id);
        JobView {
            trigger_status: snapshot
                .as_ref()
                .map(|s| s.state)
                .unwrap_or(TriggerState::NotArmed),
            next_fire_at: snapshot.and_then(|s| s.next_fire),
            definition,
        }
    }
}

type LockTable = DashMap<JobId, Arc<tokio::sync::Mutex<()>>>;

/// Holds a job's lock. On drop the table entry is removed once nobody else
/// holds or awaits it, so the table only tracks jobs with work in flight.
struct JobGuard<'a> {
    locks: &'a LockTable,
    id: JobId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Check required fields and derive the trigger plan.
pub fn validate(def: &JobDefinition) -> std::result::Result<TriggerPlan, ValidationError> {
    let required = [
        ("name", &def.name),
        ("group", &def.group),
        ("handler_assembly", &def.handler_assembly),
        ("handler_class", &def.handler_class),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(ValidationError::MissingField(field));
        }
    }
    plan(def)
}

fn wrong_state(e: SchedulerError) -> SchedulerError {
    match e {
        SchedulerError::InvalidStateTransition { id, from, action } => SchedulerError::WrongState {
            id,
            current: from,
            action,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sqlite::{SqliteJobStore, SqliteLogStore};
    use chrono::{TimeZone, Utc};
    use rusqlite::Connection;

    fn center() -> Arc<SchedulerCenter> {
        let jobs = Arc::new(SqliteJobStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let logs = Arc::new(SqliteLogStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        SchedulerCenter::new(
            jobs,
            logs,
            HandlerRegistry::new(),
            SchedulerConfig::default(),
            clock,
        )
    }

    fn job(name: &str) -> JobDefinition {
        JobDefinition::new(name, "default", "Tests", "Noop").with_interval(60, -1)
    }

    #[test]
    fn validate_requires_handler_and_trigger() {
        let mut def = job("report");
        def.handler_class = "  ".into();
        assert_eq!(
            validate(&def).unwrap_err(),
            ValidationError::MissingField("handler_class")
        );
        assert_eq!(
            validate(&JobDefinition::new("report", "default", "Tests", "Noop")).unwrap_err(),
            ValidationError::MissingTriggerSpec
        );
    }

    #[tokio::test]
    async fn invalid_definition_is_never_persisted() {
        let c = center();
        let def = JobDefinition::new("broken", "default", "Tests", "Noop").with_cron("nope");
        let err = c.create_job(def.clone()).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(c.get_job(&def.id).is_err());
    }

    #[tokio::test]
    async fn disabled_job_is_persisted_but_not_armed() {
        let c = center();
        let def = c.create_job(job("idle")).await.unwrap();
        assert_eq!(c.status(&def.id), TriggerState::NotArmed);
        let view = c.get_job(&def.id).unwrap();
        assert!(!view.definition.is_enabled);
        assert_eq!(view.trigger_status, TriggerState::NotArmed);
    }

    #[tokio::test]
    async fn pause_and_resume_report_wrong_state() {
        let c = center();
        let def = c.create_job(job("idle")).await.unwrap();

        let err = c.pause_job(&def.id).await.unwrap_err();
        assert_eq!(err.code(), "WRONG_STATE");

        c.execute(&def.id).await.unwrap();
        let err = c.resume_job(&def.id).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::WrongState {
                current: TriggerState::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let c = center();
        let id = JobId::new();
        assert_eq!(c.execute(&id).await.unwrap_err().code(), "JOB_NOT_FOUND");
        assert_eq!(c.pause_job(&id).await.unwrap_err().code(), "JOB_NOT_FOUND");
        assert_eq!(c.status(&id), TriggerState::NotArmed);
    }

    #[tokio::test]
    async fn lock_table_does_not_grow_with_unknown_or_deleted_ids() {
        let c = center();
        for _ in 0..1000 {
            let err = c.pause_job(&JobId::new()).await.unwrap_err();
            assert_eq!(err.code(), "JOB_NOT_FOUND");
        }
        assert_eq!(c.locks.len(), 0);

        let def = c.create_job(job("short-lived").enabled(true)).await.unwrap();
        assert_eq!(c.locks.len(), 0);
        assert_eq!(c.delete_jobs(&[def.id.clone()]).await.unwrap(), 1);
        assert_eq!(c.locks.len(), 0);
    }

    #[tokio::test]
    async fn waiting_holder_keeps_the_lock_entry() {
        let c = center();
        let id = JobId::new();
        let first = c.lock_job(&id).await;
        let waiter = {
            let c = Arc::clone(&c);
            let id = id.clone();
            tokio::spawn(async move {
                let _second = c.lock_job(&id).await;
            })
        };
        tokio::task::yield_now().await;
        drop(first);
        assert!(c.locks.len() <= 1);
        waiter.await.unwrap();
        assert_eq!(c.locks.len(), 0);
    }

    #[tokio::test]
    async fn trigger_status_follows_the_live_trigger() {
        let c = center();
        let def = c.create_job(job("status")).await.unwrap();
        assert_eq!(c.trigger_status(&def), TriggerState::NotArmed);
        c.execute(&def.id).await.unwrap();
        assert_eq!(c.trigger_status(&def), TriggerState::Running);
        c.pause_job(&def.id).await.unwrap();
        assert_eq!(c.trigger_status(&def), TriggerState::Paused);
    }

    #[tokio::test]
    async fn duplicate_name_in_group_is_rejected() {
        let c = center();
        let first = c.create_job(job("nightly").enabled(true)).await.unwrap();
        let err = c.create_job(job("nightly")).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_JOB");

        let other = c.create_job(job("hourly")).await.unwrap();
        let mut renamed = other.clone();
        renamed.name = "nightly".into();
        let err = c.update_job(renamed).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_JOB");
        assert_eq!(c.status(&first.id), TriggerState::Running);
        assert_eq!(c.get_job(&other.id).unwrap().definition.name, "hourly");
    }

    #[tokio::test]
    async fn exhaustion_disables_unless_rearmed() {
        let c = center();
        let def = c
            .create_job(
                JobDefinition::new("once", "default", "Tests", "Noop")
                    .with_interval(60, 0)
                    .enabled(true),
            )
            .await
            .unwrap();

        // stale event while the job is still live is ignored
        c.handle_event(EngineEvent::Exhausted {
            job_id: def.id.clone(),
            generation: 0,
        })
        .await;
        assert!(c.get_job(&def.id).unwrap().definition.is_enabled);

        c.engine().disarm(&def.id);
        c.handle_event(EngineEvent::Exhausted {
            job_id: def.id.clone(),
            generation: 1,
        })
        .await;
        assert!(!c.get_job(&def.id).unwrap().definition.is_enabled);
    }
}
