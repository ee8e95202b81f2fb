//! Job record types and the queue state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use std::fmt;
use uuid::Uuid;

/// Unique job identifier
pub type JobId = Uuid;

/// Priority classes, ordered by integer weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum JobPriority {
    /// Background work, drained last
    Low = 5,

    /// Default class
    Normal = 10,

    /// Ahead of normal load
    High = 15,

    /// Preempts everything else at batch boundaries
    Critical = 20,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPriority::Low => write!(f, "low"),
            JobPriority::Normal => write!(f, "normal"),
            JobPriority::High => write!(f, "high"),
            JobPriority::Critical => write!(f, "critical"),
        }
    }
}

impl JobPriority {
    /// Integer weight as persisted
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    /// Parse a persisted weight
    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            5 => Some(JobPriority::Low),
            10 => Some(JobPriority::Normal),
            15 => Some(JobPriority::High),
            20 => Some(JobPriority::Critical),
            _ => None,
        }
    }

    /// All classes, highest first: the batch loader's scan order
    pub fn descending() -> [JobPriority; 4] {
        [
            JobPriority::Critical,
            JobPriority::High,
            JobPriority::Normal,
            JobPriority::Low,
        ]
    }

    /// Create from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(JobPriority::Low),
            "normal" => Some(JobPriority::Normal),
            "high" => Some(JobPriority::High),
            "critical" => Some(JobPriority::Critical),
            _ => None,
        }
    }
}

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to become due
    Pending,

    /// Exclusively locked by a worker
    Processing,

    /// Terminal success
    Completed,

    /// Terminal failure, archived in the DLQ
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl JobStatus {
    /// Check if status is terminal. Terminal jobs never transition again,
    /// except failed jobs re-entering through DLQ reprocessing (which
    /// creates a fresh job rather than mutating the old record).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One entry in a job's failure trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Attempt number the failure belongs to (1-indexed)
    pub attempt: i32,

    /// Error message
    pub error: String,

    /// Optional stack or context captured from the handler
    pub stack: Option<String>,

    /// When the attempt failed
    pub failed_at: DateTime<Utc>,
}

impl ErrorEntry {
    /// Create a new entry stamped now
    pub fn new(attempt: i32, error: impl Into<String>, stack: Option<String>) -> Self {
        Self {
            attempt,
            error: error.into(),
            stack,
            failed_at: Utc::now(),
        }
    }
}

/// A persisted job record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Handler discriminator
    pub job_type: String,

    /// Opaque handler input
    pub payload: Value,

    /// Priority class
    pub priority: JobPriority,

    /// Current status
    pub status: JobStatus,

    /// Completed attempts; increments when a worker takes the lock
    pub attempts: i32,

    /// Attempt budget, 1..=10
    pub max_attempts: i32,

    /// Earliest instant the job is due
    pub scheduled_for: DateTime<Utc>,

    /// Worker holding the exclusive lock
    pub locked_by: Option<Uuid>,

    /// Lock expiry
    pub locked_until: Option<DateTime<Utc>>,

    /// Message of the most recent failure
    pub last_error: Option<String>,

    /// Ordered failure trail
    pub error_history: Json<Vec<ErrorEntry>>,

    /// Value returned on success
    pub result: Option<Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Check if the job is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }

    /// Check if the lock has expired at `now`
    pub fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        match self.locked_until {
            Some(until) => until <= now,
            None => true,
        }
    }

    /// Attempts remaining in the budget
    pub fn attempts_remaining(&self) -> i32 {
        (self.max_attempts - self.attempts).max(0)
    }

    /// Validate the record against the state-machine invariants.
    ///
    /// A record failing this check is corrupted: workers skip it and the
    /// supervisor archives it with reason `system_error`.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        match self.status {
            JobStatus::Pending => {
                if self.locked_by.is_some() || self.locked_until.is_some() {
                    return Err("pending job holds a lock".to_string());
                }
            }
            JobStatus::Processing => {
                // An expired lock is not corruption; reclamation handles it
                if self.locked_by.is_none() {
                    return Err("processing job has no owner".to_string());
                }
            }
            JobStatus::Completed | JobStatus::Failed => {}
        }

        if self.attempts > self.max_attempts {
            return Err(format!(
                "attempts {} exceed budget {}",
                self.attempts, self.max_attempts
            ));
        }

        if !(1..=10).contains(&self.max_attempts) {
            return Err(format!("max_attempts {} out of bounds", self.max_attempts));
        }

        Ok(())
    }
}

/// Parameters for inserting a fresh job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Value,
    pub priority: JobPriority,
    pub max_attempts: i32,
    pub scheduled_for: DateTime<Utc>,
}

impl NewJob {
    /// Create a new job due immediately with default priority and budget
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: JobPriority::default(),
            max_attempts: 3,
            scheduled_for: Utc::now(),
        }
    }

    /// Set the priority class
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the attempt budget
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay execution until the given instant
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = at;
        self
    }
}
