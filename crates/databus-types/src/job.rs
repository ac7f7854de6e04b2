//! Asynchronous administrative job records (move and replay).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two kinds of administrative job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Move,
    Replay,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Move => "MOVE",
            Self::Replay => "REPLAY",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Submitted, not yet picked up by a runner.
    Accepted,
    /// At least one batch has started.
    Running,
    /// Finished successfully.
    Complete,
    /// Stopped on an unrecoverable error.
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "ACCEPTED",
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }

    /// Returns `true` for `COMPLETE` and `FAILED`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPTED" => Ok(Self::Accepted),
            "RUNNING" => Ok(Self::Running),
            "COMPLETE" => Ok(Self::Complete),
            "FAILED" => Ok(Self::Failed),
            _ => Err(ParseJobStatusError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown job status string.
#[derive(Debug, Clone)]
pub struct ParseJobStatusError(pub String);

impl std::fmt::Display for ParseJobStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown job status: {}", self.0)
    }
}

impl std::error::Error for ParseJobStatusError {}

/// What a job does. Persisted as JSON alongside the job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobSpec {
    /// Re-point every event of `from` to `to`.
    Move { from: String, to: String },
    /// Re-evaluate retained mutations against `subscription`'s current
    /// filter. Only mutations with `id <= until_mutation_id` are considered,
    /// so the job stays finite while the change feed keeps writing.
    Replay {
        subscription: String,
        since: Option<DateTime<Utc>>,
        until_mutation_id: i64,
    },
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Move { .. } => JobKind::Move,
            Self::Replay { .. } => JobKind::Replay,
        }
    }
}

/// A job as tracked by the job service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub spec: JobSpec,
    pub status: JobStatus,
    /// Resumption point: the last storage row id committed by a batch.
    pub cursor: Option<i64>,
    /// Events moved or injected so far.
    pub processed: u64,
    /// Failure description, set only when `status` is `FAILED`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Status document returned by `getMoveStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveStatus {
    pub id: String,
    pub from: String,
    pub to: String,
    pub status: JobStatus,
    pub processed: u64,
    pub cursor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Status document returned by `getReplayStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStatus {
    pub id: String,
    pub subscription: String,
    pub since: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub processed: u64,
    pub cursor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Projects a move job into its status document.
    ///
    /// Returns `None` if the record is not a move job.
    pub fn move_status(&self) -> Option<MoveStatus> {
        match &self.spec {
            JobSpec::Move { from, to } => Some(MoveStatus {
                id: self.id.clone(),
                from: from.clone(),
                to: to.clone(),
                status: self.status,
                processed: self.processed,
                cursor: self.cursor,
                error: self.error.clone(),
                created_at: self.created_at,
                completed_at: self.completed_at,
            }),
            JobSpec::Replay { .. } => None,
        }
    }

    /// Projects a replay job into its status document.
    ///
    /// Returns `None` if the record is not a replay job.
    pub fn replay_status(&self) -> Option<ReplayStatus> {
        match &self.spec {
            JobSpec::Replay {
                subscription,
                since,
                ..
            } => Some(ReplayStatus {
                id: self.id.clone(),
                subscription: subscription.clone(),
                since: *since,
                status: self.status,
                processed: self.processed,
                cursor: self.cursor,
                error: self.error.clone(),
                created_at: self.created_at,
                completed_at: self.completed_at,
            }),
            JobSpec::Move { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datetime_from_ms;

    #[test]
    fn job_status_parses_its_own_labels() {
        for status in [
            JobStatus::Accepted,
            JobStatus::Running,
            JobStatus::Complete,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().ok(), Some(status));
        }
        assert!("DONE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn spec_json_is_tagged_by_kind() {
        let spec = JobSpec::Move {
            from: "a".to_string(),
            to: "b".to_string(),
        };
        let json = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(json["kind"], "MOVE");
        assert_eq!(json["from"], "a");
        assert_eq!(spec.kind(), JobKind::Move);
    }

    #[test]
    fn status_projection_matches_kind() {
        let record = JobRecord {
            id: "j1".to_string(),
            spec: JobSpec::Replay {
                subscription: "s1".to_string(),
                since: None,
                until_mutation_id: 7,
            },
            status: JobStatus::Running,
            cursor: Some(3),
            processed: 2,
            error: None,
            created_at: datetime_from_ms(0),
            updated_at: datetime_from_ms(0),
            completed_at: None,
        };

        assert!(record.move_status().is_none());
        let status = record.replay_status().expect("replay status");
        assert_eq!(status.subscription, "s1");
        assert_eq!(status.cursor, Some(3));
        assert_eq!(status.processed, 2);
    }
}
