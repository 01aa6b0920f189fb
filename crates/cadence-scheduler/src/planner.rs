//! Trigger planning: turns a [`JobDefinition`] into a validated [`TriggerPlan`]
//! and computes fire instants from it.
//!
//! Planning is pure. The center calls [`plan`] before every store write and
//! before every arm, so a definition that cannot be planned is never persisted
//! through the center.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use crate::error::ValidationError;
use crate::types::JobDefinition;

/// How many times a simple trigger repeats after its first fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Times(u32),
    Forever,
}

/// A parsed cron schedule. Equality is defined on the normalised expression.
#[derive(Debug, Clone)]
pub struct CronSpec {
    expression: String,
    schedule: Schedule,
}

impl CronSpec {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let expression = normalize_cron(raw);
        let schedule = Schedule::from_str(&expression).map_err(|e| {
            ValidationError::InvalidTriggerSpec(format!("cron expression '{raw}': {e}"))
        })?;
        Ok(Self {
            expression,
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First cron instant strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&t).next()
    }
}

impl PartialEq for CronSpec {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for CronSpec {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerKind {
    Cron(CronSpec),
    Simple { interval: Duration, repeat: Repeat },
}

/// A validated schedule plus its optional active window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerPlan {
    pub kind: TriggerKind,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Validate `def` and derive its trigger plan.
pub fn plan(def: &JobDefinition) -> Result<TriggerPlan, ValidationError> {
    if let (Some(start), Some(end)) = (def.start_time, def.end_time) {
        if end < start {
            return Err(ValidationError::InvalidTimeWindow { start, end });
        }
    }

    let cron = def
        .cron_expression
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());
    let interval = def.interval_seconds.filter(|s| *s > 0);

    let kind = match (cron, interval) {
        (Some(_), Some(_)) => {
            return Err(ValidationError::InvalidTriggerSpec(
                "both a cron expression and an interval are set".to_string(),
            ))
        }
        (Some(expr), None) => TriggerKind::Cron(CronSpec::parse(expr)?),
        (None, Some(secs)) => {
            let interval = Duration::try_seconds(secs).ok_or_else(|| {
                ValidationError::InvalidTriggerSpec(format!("interval of {secs}s is out of range"))
            })?;
            let repeat = match def.repeat_count.unwrap_or(0) {
                n if n < 0 => Repeat::Forever,
                n => Repeat::Times(n as u32),
            };
            TriggerKind::Simple { interval, repeat }
        }
        (None, None) => return Err(ValidationError::MissingTriggerSpec),
    };

    Ok(TriggerPlan {
        kind,
        start: def.start_time,
        end: def.end_time,
    })
}

impl TriggerPlan {
    /// Instant of the first fire for a trigger armed at `now`.
    ///
    /// Simple triggers fire immediately (or at `start`), cron triggers at the
    /// first cron instant after that point.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let from = match self.start {
            Some(start) if start > now => start,
            _ => now,
        };
        let first = match &self.kind {
            TriggerKind::Cron(spec) => spec.next_after(from),
            TriggerKind::Simple { .. } => Some(from),
        };
        self.within_window(first)
    }

    /// Instant following a fire at `previous`, given `fired` fires so far.
    ///
    /// Returns `None` once the plan is exhausted.
    pub fn next_fire(&self, previous: DateTime<Utc>, fired: u64) -> Option<DateTime<Utc>> {
        let next = match &self.kind {
            TriggerKind::Cron(spec) => spec.next_after(previous),
            TriggerKind::Simple { interval, repeat } => {
                if let Repeat::Times(n) = repeat {
                    if fired > u64::from(*n) {
                        return None;
                    }
                }
                previous.checked_add_signed(*interval)
            }
        };
        self.within_window(next)
    }

    /// Skip a stale `scheduled` instant forward to the first valid instant
    /// strictly after `now`. Skipped instants are not counted as fires.
    pub fn catch_up(&self, scheduled: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if scheduled > now {
            return self.within_window(Some(scheduled));
        }
        let next = match &self.kind {
            TriggerKind::Cron(spec) => spec.next_after(now),
            TriggerKind::Simple { interval, .. } => {
                let step = interval.num_milliseconds().max(1);
                let behind = (now - scheduled).num_milliseconds();
                let steps = behind / step + 1;
                scheduled.checked_add_signed(Duration::milliseconds(step.saturating_mul(steps)))
            }
        };
        self.within_window(next)
    }

    /// Total number of fires, `None` when unbounded.
    pub fn max_fires(&self) -> Option<u64> {
        match self.kind {
            TriggerKind::Simple {
                repeat: Repeat::Times(n),
                ..
            } => Some(u64::from(n) + 1),
            _ => None,
        }
    }

    fn within_window(&self, t: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        t.filter(|t| self.end.map_or(true, |end| *t <= end))
    }
}

/// Accept Quartz-style `?` placeholders and classic five-field expressions.
fn normalize_cron(raw: &str) -> String {
    let mut fields: Vec<&str> = raw
        .split_whitespace()
        .map(|f| if f == "?" { "*" } else { f })
        .collect();
    if fields.len() == 5 {
        fields.insert(0, "0");
    }
    fields.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job() -> JobDefinition {
        JobDefinition::new("report", "default", "Cadence.Jobs", "ConsoleWriteJob")
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn cron_expression_yields_cron_plan() {
        let p = plan(&job().with_cron("0 0 * * * ?")).unwrap();
        match p.kind {
            TriggerKind::Cron(spec) => assert_eq!(spec.expression(), "0 0 * * * *"),
            other => panic!("expected cron plan, got {other:?}"),
        }
    }

    #[test]
    fn five_field_cron_gets_seconds_column() {
        let p = plan(&job().with_cron("*/5 * * * *")).unwrap();
        let TriggerKind::Cron(spec) = p.kind else {
            panic!("expected cron plan");
        };
        assert_eq!(spec.expression(), "0 */5 * * * *");
    }

    #[test]
    fn unparsable_cron_is_rejected() {
        let err = plan(&job().with_cron("every tuesday")).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidTriggerSpec(_)));
    }

    #[test]
    fn interval_yields_simple_plan() {
        let p = plan(&job().with_interval(60, -1)).unwrap();
        assert_eq!(
            p.kind,
            TriggerKind::Simple {
                interval: Duration::seconds(60),
                repeat: Repeat::Forever
            }
        );
        assert_eq!(p.max_fires(), None);

        let once = plan(&job().with_interval(60, 0)).unwrap();
        assert_eq!(once.max_fires(), Some(1));
    }

    #[test]
    fn missing_repeat_count_runs_once() {
        let mut def = job();
        def.interval_seconds = Some(30);
        assert_eq!(plan(&def).unwrap().max_fires(), Some(1));
    }

    #[test]
    fn neither_trigger_mode_is_rejected() {
        assert_eq!(plan(&job()), Err(ValidationError::MissingTriggerSpec));

        let mut def = job();
        def.cron_expression = Some("   ".into());
        def.interval_seconds = Some(0);
        assert_eq!(plan(&def), Err(ValidationError::MissingTriggerSpec));
    }

    #[test]
    fn both_trigger_modes_are_rejected() {
        let def = job().with_cron("0 0 * * * *").with_interval(60, -1);
        assert!(matches!(
            plan(&def),
            Err(ValidationError::InvalidTriggerSpec(_))
        ));
    }

    #[test]
    fn inverted_window_is_rejected() {
        let def = job()
            .with_interval(60, -1)
            .with_window(Some(at(12, 0, 0)), Some(at(11, 0, 0)));
        assert!(matches!(
            plan(&def),
            Err(ValidationError::InvalidTimeWindow { .. })
        ));
    }

    #[test]
    fn planning_is_deterministic() {
        let defs = [
            job().with_cron("0 30 9 * * MON-FRI"),
            job().with_interval(15, 3),
            job()
                .with_interval(60, -1)
                .with_window(Some(at(8, 0, 0)), Some(at(18, 0, 0))),
        ];
        for def in &defs {
            assert_eq!(plan(def).unwrap(), plan(def).unwrap());
        }
    }

    #[test]
    fn simple_plan_fires_repeat_plus_one_times() {
        let p = plan(&job().with_interval(10, 2)).unwrap();
        let first = p.first_fire(at(12, 0, 0)).unwrap();
        assert_eq!(first, at(12, 0, 0));
        let second = p.next_fire(first, 1).unwrap();
        assert_eq!(second, at(12, 0, 10));
        let third = p.next_fire(second, 2).unwrap();
        assert_eq!(third, at(12, 0, 20));
        assert_eq!(p.next_fire(third, 3), None);
    }

    #[test]
    fn start_time_delays_first_fire() {
        let p = plan(&job().with_interval(10, -1).with_window(Some(at(13, 0, 0)), None)).unwrap();
        assert_eq!(p.first_fire(at(12, 0, 0)), Some(at(13, 0, 0)));
    }

    #[test]
    fn end_time_exhausts_plan() {
        let p = plan(&job().with_interval(60, -1).with_window(None, Some(at(12, 1, 30)))).unwrap();
        let first = p.first_fire(at(12, 0, 0)).unwrap();
        let second = p.next_fire(first, 1).unwrap();
        assert_eq!(second, at(12, 1, 0));
        assert_eq!(p.next_fire(second, 2), None);
    }

    #[test]
    fn cron_first_fire_is_next_instant() {
        let p = plan(&job().with_cron("0 0 * * * *")).unwrap();
        assert_eq!(p.first_fire(at(12, 15, 0)), Some(at(13, 0, 0)));
    }

    #[test]
    fn catch_up_skips_to_next_instant_after_now() {
        let cron = plan(&job().with_cron("0 0 * * * *")).unwrap();
        assert_eq!(cron.catch_up(at(13, 0, 0), at(15, 30, 0)), Some(at(16, 0, 0)));

        let simple = plan(&job().with_interval(60, -1)).unwrap();
        assert_eq!(
            simple.catch_up(at(12, 0, 0), at(12, 3, 30)),
            Some(at(12, 4, 0))
        );
        // a boundary equal to now is not fired immediately
        assert_eq!(
            simple.catch_up(at(12, 0, 0), at(12, 3, 0)),
            Some(at(12, 4, 0))
        );
        // instants still in the future are kept
        assert_eq!(
            simple.catch_up(at(12, 5, 0), at(12, 3, 0)),
            Some(at(12, 5, 0))
        );
    }
}
