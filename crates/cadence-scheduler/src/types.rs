use cadence_core::types::{JobId, LogId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::HandlerKey;

/// A persisted job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// UUIDv7 string, primary key. Never changes after creation.
    pub id: JobId,
    pub name: String,
    pub group: String,
    /// Cron expression. Mutually exclusive with `interval_seconds`.
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// Simple-trigger interval in seconds.
    #[serde(default)]
    pub interval_seconds: Option<i64>,
    /// Extra fires after the first one; `0`/absent runs once, negative repeats forever.
    #[serde(default)]
    pub repeat_count: Option<i32>,
    pub handler_assembly: String,
    pub handler_class: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Desired state. Independent of the engine's live trigger state.
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub pause_after_failure: bool,
    /// Opaque payload handed to the handler on every run.
    #[serde(default)]
    pub run_params: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Person responsible for the job.
    #[serde(default)]
    pub principal: Option<String>,
    #[serde(default)]
    pub alert_email: Option<String>,
    /// Number of times the job has been fired.
    #[serde(default)]
    pub run_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobDefinition {
    /// A disabled definition with a fresh id and no trigger spec.
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        handler_assembly: impl Into<String>,
        handler_class: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            name: name.into(),
            group: group.into(),
            cron_expression: None,
            interval_seconds: None,
            repeat_count: None,
            handler_assembly: handler_assembly.into(),
            handler_class: handler_class.into(),
            start_time: None,
            end_time: None,
            is_enabled: false,
            pause_after_failure: false,
            run_params: String::new(),
            description: None,
            principal: None,
            alert_email: None,
            run_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron_expression = Some(expression.into());
        self
    }

    pub fn with_interval(mut self, seconds: i64, repeat_count: i32) -> Self {
        self.interval_seconds = Some(seconds);
        self.repeat_count = Some(repeat_count);
        self
    }

    pub fn with_window(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.is_enabled = enabled;
        self
    }

    pub fn pause_after_failure(mut self, pause: bool) -> Self {
        self.pause_after_failure = pause;
        self
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.run_params = params.into();
        self
    }

    pub fn handler_key(&self) -> HandlerKey {
        HandlerKey::new(&self.handler_assembly, &self.handler_class)
    }
}

/// Live trigger state as seen by the engine. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    NotArmed,
    Running,
    Paused,
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerState::NotArmed => "not armed",
            TriggerState::Running => "running",
            TriggerState::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

/// Result of a single fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "failure" => Ok(Outcome::Failure),
            "timeout" => Ok(Outcome::Timeout),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// One append-only record per fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: LogId,
    pub job_id: JobId,
    pub job_name: String,
    pub job_group: String,
    /// `assembly/class` of the handler that was (or should have been) run.
    pub handler: String,
    pub run_params: String,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: Outcome,
    pub error_detail: Option<String>,
}

/// Filters for listing job definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobQuery {
    /// Substring match on the job name.
    pub name: Option<String>,
    pub group: Option<String>,
    pub enabled: Option<bool>,
}

/// Filters for the execution log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogQuery {
    pub job_id: Option<JobId>,
    pub outcome: Option<Outcome>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub size: u32,
}

impl Pagination {
    pub const MAX_SIZE: u32 = 500;

    pub fn new(page: u32, size: u32) -> Self {
        Self { page, size }
    }

    pub fn limit(&self) -> i64 {
        self.size.clamp(1, Self::MAX_SIZE) as i64
    }

    pub fn offset(&self) -> i64 {
        (self.page.max(1) as i64 - 1) * self.limit()
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: default_page(),
            size: default_page_size(),
        }
    }
}

fn default_page() -> u32 {
    1
}
fn default_page_size() -> u32 {
    10
}

/// One page of results plus the total number of matching rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
        }
    }
}

/// A definition decorated with its live trigger status, for list views.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub definition: JobDefinition,
    pub trigger_status: TriggerState,
    pub next_fire_at: Option<DateTime<Utc>>,
}
