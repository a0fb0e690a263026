//! Discovery job model

use super::retry::RetryPolicy;
use crate::device::{DiscoveryParams, DiscoveryResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub type JobId = Uuid;

/// Higher priorities are picked first when workers are scarce
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl JobPriority {
    /// Map a protocol priority (0-100 style) onto job priority
    pub fn from_protocol_priority(priority: u32) -> Self {
        match priority {
            p if p >= 95 => JobPriority::Critical,
            p if p >= 80 => JobPriority::High,
            p if p >= 40 => JobPriority::Normal,
            _ => JobPriority::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulePolicy {
    Once,
    Recurring {
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
}

/// A scheduled unit of work invoking one plugin's `discover()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryJob {
    pub id: JobId,
    /// Target plugin name
    pub protocol: String,
    pub priority: JobPriority,
    pub policy: SchedulePolicy,
    pub retry: RetryPolicy,
    pub params: DiscoveryParams,
    /// Per-attempt deadline; the scheduler default applies when unset
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    pub status: JobStatus,
    /// Attempts in the current run, reset after each completed run
    pub attempts: u32,
    pub total_attempts: u32,
    pub completed_runs: u64,
    pub created_at: DateTime<Utc>,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Interval in effect after adaptation (recurring jobs)
    #[serde(default, with = "humantime_serde::option")]
    pub current_interval: Option<Duration>,
}

impl DiscoveryJob {
    fn new(protocol: &str, policy: SchedulePolicy) -> Self {
        let now = Utc::now();
        let current_interval = match &policy {
            SchedulePolicy::Recurring { interval } => Some(*interval),
            SchedulePolicy::Once => None,
        };
        Self {
            id: Uuid::new_v4(),
            protocol: protocol.to_string(),
            priority: JobPriority::Normal,
            policy,
            retry: RetryPolicy::default(),
            params: DiscoveryParams::new(),
            timeout: None,
            status: JobStatus::Pending,
            attempts: 0,
            total_attempts: 0,
            completed_runs: 0,
            created_at: now,
            next_run: now,
            last_run: None,
            last_error: None,
            current_interval,
        }
    }

    pub fn once(protocol: &str) -> Self {
        Self::new(protocol, SchedulePolicy::Once)
    }

    pub fn recurring(protocol: &str, interval: Duration) -> Self {
        Self::new(protocol, SchedulePolicy::Recurring { interval })
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_params(mut self, params: DiscoveryParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// First run happens `delay` from now
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.next_run = Utc::now() + delay;
        self
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self.policy, SchedulePolicy::Recurring { .. })
    }

    /// No further runs will happen
    pub fn is_finished(&self) -> bool {
        self.status == JobStatus::Cancelled || (!self.is_recurring() && self.status.is_terminal())
    }
}

/// Result of one completed run of a job
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub protocol: String,
    pub status: JobStatus,
    /// Attempts this run took
    pub attempts: u32,
    pub result: Option<DiscoveryResult>,
    pub error: Option<String>,
}
