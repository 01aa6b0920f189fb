use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_core::types::JobId;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    planner::TriggerPlan,
    types::{JobDefinition, TriggerState},
};

/// Something the engine wants the center to act on.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A trigger came due; the job should be executed.
    Fired(FireEvent),
    /// A trigger ran out of fires (repeat count reached or end time passed)
    /// and removed itself.
    Exhausted { job_id: JobId, generation: u64 },
}

#[derive(Debug, Clone)]
pub struct FireEvent {
    /// Snapshot of the definition the trigger was armed with.
    pub job: Arc<JobDefinition>,
    pub scheduled_at: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    /// Identifies the arm this fire belongs to.
    pub generation: u64,
    /// 1-based fire number within that arm.
    pub sequence: u64,
}

/// Read-only view of a live trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSnapshot {
    pub state: TriggerState,
    pub next_fire: Option<DateTime<Utc>>,
    pub fire_count: u64,
    pub generation: u64,
}

/// A trigger removed from the engine with its position intact, so it can be
/// put back if the surrounding operation has to roll back.
#[derive(Debug)]
pub struct DetachedTrigger {
    id: JobId,
    trigger: ArmedTrigger,
}

impl DetachedTrigger {
    pub fn job_id(&self) -> &JobId {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiveState {
    Running,
    Paused,
}

#[derive(Debug)]
struct ArmedTrigger {
    job: Arc<JobDefinition>,
    plan: TriggerPlan,
    state: LiveState,
    next_fire: Option<DateTime<Utc>>,
    fire_count: u64,
    generation: u64,
}

impl ArmedTrigger {
    fn trigger_state(&self) -> TriggerState {
        match self.state {
            LiveState::Running => TriggerState::Running,
            LiveState::Paused => TriggerState::Paused,
        }
    }
}

/// In-memory runtime holding the live triggers.
///
/// Owns the authoritative job → live state mapping. Starts empty; nothing
/// here is persisted.
pub struct SchedulerEngine {
    triggers: DashMap<JobId, ArmedTrigger>,
    clock: Arc<dyn Clock>,
    next_generation: AtomicU64,
    tick_interval: Duration,
}

impl SchedulerEngine {
    pub fn new(clock: Arc<dyn Clock>, tick_interval: Duration) -> Self {
        Self {
            triggers: DashMap::new(),
            clock,
            next_generation: AtomicU64::new(1),
            tick_interval,
        }
    }

    /// Install a live trigger for `job`. Returns the arm's generation.
    pub fn arm(&self, job: &JobDefinition, plan: TriggerPlan) -> Result<u64> {
        match self.triggers.entry(job.id.clone()) {
            Entry::Occupied(_) => Err(SchedulerError::AlreadyArmed { id: job.id.clone() }),
            Entry::Vacant(slot) => {
                let now = self.clock.now();
                let next_fire = plan.first_fire(now);
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                slot.insert(ArmedTrigger {
                    job: Arc::new(job.clone()),
                    plan,
                    state: LiveState::Running,
                    next_fire,
                    fire_count: 0,
                    generation,
                });
                info!(job_id = %job.id, name = %job.name, generation, next_fire = ?next_fire, "trigger armed");
                Ok(generation)
            }
        }
    }

    /// Remove the live trigger, if any. Returns whether one was removed.
    pub fn disarm(&self, id: &JobId) -> bool {
        self.detach(id).is_some()
    }

    /// Remove the live trigger and hand it back for a possible [`reattach`].
    ///
    /// [`reattach`]: SchedulerEngine::reattach
    pub fn detach(&self, id: &JobId) -> Option<DetachedTrigger> {
        let (id, trigger) = self.triggers.remove(id)?;
        info!(job_id = %id, generation = trigger.generation, "trigger disarmed");
        Some(DetachedTrigger { id, trigger })
    }

    /// Put a detached trigger back exactly as it was.
    pub fn reattach(&self, detached: DetachedTrigger) -> Result<()> {
        match self.triggers.entry(detached.id) {
            Entry::Occupied(slot) => Err(SchedulerError::AlreadyArmed {
                id: slot.key().clone(),
            }),
            Entry::Vacant(slot) => {
                debug!(job_id = %slot.key(), "trigger reattached");
                slot.insert(detached.trigger);
                Ok(())
            }
        }
    }

    pub fn pause(&self, id: &JobId) -> Result<()> {
        let mut trigger = self.triggers.get_mut(id).ok_or_else(|| {
            SchedulerError::InvalidStateTransition {
                id: id.clone(),
                from: TriggerState::NotArmed,
                action: "pause",
            }
        })?;
        if trigger.state != LiveState::Running {
            return Err(SchedulerError::InvalidStateTransition {
                id: id.clone(),
                from: trigger.trigger_state(),
                action: "pause",
            });
        }
        trigger.state = LiveState::Paused;
        info!(job_id = %id, "trigger paused");
        Ok(())
    }

    /// Resume a paused trigger. Instants missed while paused are skipped:
    /// the next fire is the first valid instant after now.
    pub fn resume(&self, id: &JobId) -> Result<()> {
        let mut entry = self.triggers.get_mut(id).ok_or_else(|| {
            SchedulerError::InvalidStateTransition {
                id: id.clone(),
                from: TriggerState::NotArmed,
                action: "resume",
            }
        })?;
        let trigger = &mut *entry;
        if trigger.state != LiveState::Paused {
            return Err(SchedulerError::InvalidStateTransition {
                id: id.clone(),
                from: trigger.trigger_state(),
                action: "resume",
            });
        }
        let now = self.clock.now();
        trigger.next_fire = trigger
            .next_fire
            .and_then(|scheduled| trigger.plan.catch_up(scheduled, now));
        trigger.state = LiveState::Running;
        info!(job_id = %id, next_fire = ?trigger.next_fire, "trigger resumed");
        Ok(())
    }

    /// True live state. Unknown jobs are `NotArmed`.
    pub fn status(&self, id: &JobId) -> TriggerState {
        self.triggers
            .get(id)
            .map(|t| t.trigger_state())
            .unwrap_or(TriggerState::NotArmed)
    }

    pub fn exists(&self, id: &JobId) -> bool {
        self.triggers.contains_key(id)
    }

    pub fn snapshot(&self, id: &JobId) -> Option<TriggerSnapshot> {
        self.triggers.get(id).map(|t| TriggerSnapshot {
            state: t.trigger_state(),
            next_fire: t.next_fire,
            fire_count: t.fire_count,
            generation: t.generation,
        })
    }

    /// Number of live triggers (running or paused).
    pub fn armed_count(&self) -> usize {
        self.triggers.len()
    }

    /// Evaluate every running trigger against the clock.
    ///
    /// Due triggers fire once and advance; if the engine fell behind, missed
    /// instants are coalesced into that single fire. Exhausted triggers are
    /// removed and reported.
    pub fn tick(&self) -> Vec<EngineEvent> {
        let now = self.clock.now();
        let mut events = Vec::new();
        let mut retired = Vec::new();

        for mut entry in self.triggers.iter_mut() {
            let (job_id, trigger) = entry.pair_mut();
            if trigger.state == LiveState::Paused {
                continue;
            }
            match trigger.next_fire {
                None => retired.push((job_id.clone(), trigger.generation)),
                Some(at) if at <= now => {
                    trigger.fire_count += 1;
                    events.push(EngineEvent::Fired(FireEvent {
                        job: Arc::clone(&trigger.job),
                        scheduled_at: at,
                        fired_at: now,
                        generation: trigger.generation,
                        sequence: trigger.fire_count,
                    }));
                    trigger.next_fire = trigger
                        .plan
                        .next_fire(at, trigger.fire_count)
                        .and_then(|next| trigger.plan.catch_up(next, now));
                    if trigger.next_fire.is_none() {
                        retired.push((job_id.clone(), trigger.generation));
                    }
                }
                Some(_) => {}
            }
        }

        // Removal happens outside the iteration: DashMap shards are locked
        // while iterating.
        for (job_id, generation) in retired {
            if self
                .triggers
                .remove_if(&job_id, |_, t| t.generation == generation)
                .is_some()
            {
                info!(%job_id, generation, "trigger exhausted");
                events.push(EngineEvent::Exhausted { job_id, generation });
            }
        }

        events
    }

    /// Background loop: ticks every `tick_interval` until `shutdown` flips to
    /// `true`.
    ///
    /// `tick()` has already consumed the fires it reports, so every event is
    /// delivered: a full channel makes the loop wait for the receiver. The
    /// loop only stops early if the receiver is gone.
    pub async fn run(
        self: Arc<Self>,
        events: mpsc::Sender<EngineEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(tick_ms = self.tick_interval.as_millis() as u64, "scheduler engine started");
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let batch = self.tick();
                    let pending = batch.len();
                    for (sent, event) in batch.into_iter().enumerate() {
                        if events.send(event).await.is_err() {
                            warn!(lost = pending - sent, "event receiver closed, scheduler engine stopping");
                            return;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }
}
