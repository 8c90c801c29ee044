use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// High-level lifecycle state for one agent session.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Returns whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns whether a transition to `next` is valid.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (
                SessionStatus::Pending,
                SessionStatus::Running | SessionStatus::Failed | SessionStatus::Cancelled
            ) | (
                SessionStatus::Running,
                SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
            )
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            _ => Err(format!("Unknown session status: {s}")),
        }
    }
}

/// Outcome of integrating one session branch into the mainline.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeResult {
    /// The session has not been through the merge phase yet.
    #[default]
    Unset,
    /// Merged cleanly.
    Merged,
    /// Merged after agent-assisted conflict resolution.
    MergedResolved,
    /// Skipped on operator rejection or after a failed merge attempt.
    Skipped,
    /// The merge attempt itself failed.
    Failed,
}

impl fmt::Display for MergeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeResult::Unset => write!(f, "unset"),
            MergeResult::Merged => write!(f, "merged"),
            MergeResult::MergedResolved => write!(f, "merged_resolved"),
            MergeResult::Skipped => write!(f, "skipped"),
            MergeResult::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for MergeResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unset" => Ok(MergeResult::Unset),
            "merged" => Ok(MergeResult::Merged),
            "merged_resolved" => Ok(MergeResult::MergedResolved),
            "skipped" => Ok(MergeResult::Skipped),
            "failed" => Ok(MergeResult::Failed),
            _ => Err(format!("Unknown merge result: {s}")),
        }
    }
}

/// In-memory snapshot of one persisted agent session row.
///
/// `files_changed` is authoritative only once `status` is terminal; until
/// then it is the empty sequence.
#[derive(Clone, Debug)]
pub struct AgentSession {
    /// Branch created for this session (`<prefix>/<session_id>`).
    pub branch: String,
    /// Completion timestamp (Unix seconds), set on terminal status.
    pub completed_at: Option<i64>,
    /// Failure reason recorded when the session ends unsuccessfully.
    pub fail_reason: Option<String>,
    /// Repository-relative paths changed by the session.
    pub files_changed: Vec<String>,
    /// Stable session identifier.
    pub id: String,
    /// Merge outcome recorded by the pipeline's merging phase.
    pub merge_result: MergeResult,
    /// Captured output transcript (bounded ring, flushed on termination).
    pub output: String,
    /// Owning pipeline project.
    pub project_id: String,
    /// Session creation timestamp (Unix seconds).
    pub started_at: i64,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Task prompt given to the agent.
    pub task: String,
    /// Team template the session was launched from.
    pub team_name: String,
    /// Worktree folder path for this session.
    pub worktree_path: PathBuf,
}

/// Lifecycle state for one teammate task inside a session.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TeammateStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for TeammateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeammateStatus::Pending => write!(f, "pending"),
            TeammateStatus::Running => write!(f, "running"),
            TeammateStatus::Completed => write!(f, "completed"),
            TeammateStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TeammateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TeammateStatus::Pending),
            "running" => Ok(TeammateStatus::Running),
            "completed" => Ok(TeammateStatus::Completed),
            "failed" => Ok(TeammateStatus::Failed),
            _ => Err(format!("Unknown teammate status: {s}")),
        }
    }
}

/// One unit of work inside a session, owned by exactly one [`AgentSession`].
#[derive(Clone, Debug)]
pub struct TeammateTask {
    pub completed_at: Option<i64>,
    pub error: Option<String>,
    pub id: i64,
    pub output: String,
    pub role: String,
    pub session_id: String,
    pub started_at: Option<i64>,
    pub status: TeammateStatus,
    pub teammate: String,
}
