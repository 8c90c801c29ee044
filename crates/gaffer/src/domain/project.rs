use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Pipeline phase for one project.
///
/// `Building` and `Testing` are the only phases that may be re-entered
/// (bounded repair retries); every other phase is visited at most once.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Launching,
    Waiting,
    Analyzing,
    Merging,
    Building,
    Testing,
    Completed,
    Failed,
}

impl Phase {
    /// Returns whether this phase is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns whether a transition to `next` is valid.
    ///
    /// Any non-terminal phase may transition to `Failed` (cancellation and
    /// unrecoverable errors). `Building` and `Testing` may re-enter
    /// themselves for repair retries.
    pub fn can_transition_to(self, next: Phase) -> bool {
        if !self.is_terminal() && next == Phase::Failed {
            return true;
        }

        matches!(
            (self, next),
            (Phase::Launching, Phase::Waiting)
                | (Phase::Waiting, Phase::Analyzing)
                | (Phase::Analyzing, Phase::Merging)
                | (
                    Phase::Merging,
                    Phase::Building | Phase::Testing | Phase::Completed
                )
                | (
                    Phase::Building,
                    Phase::Building | Phase::Testing | Phase::Completed
                )
                | (Phase::Testing, Phase::Testing | Phase::Completed)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Launching => write!(f, "launching"),
            Phase::Waiting => write!(f, "waiting"),
            Phase::Analyzing => write!(f, "analyzing"),
            Phase::Merging => write!(f, "merging"),
            Phase::Building => write!(f, "building"),
            Phase::Testing => write!(f, "testing"),
            Phase::Completed => write!(f, "completed"),
            Phase::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "launching" => Ok(Phase::Launching),
            "waiting" => Ok(Phase::Waiting),
            "analyzing" => Ok(Phase::Analyzing),
            "merging" => Ok(Phase::Merging),
            "building" => Ok(Phase::Building),
            "testing" => Ok(Phase::Testing),
            "completed" => Ok(Phase::Completed),
            "failed" => Ok(Phase::Failed),
            _ => Err(format!("Unknown phase: {s}")),
        }
    }
}

/// In-memory snapshot of one persisted pipeline project row.
#[derive(Clone, Debug)]
pub struct GmProject {
    /// Number of agents requested at launch.
    pub agent_count: u32,
    /// Number of build-command runs so far.
    pub build_attempts: u32,
    /// Optional build shell command, run from the repo root.
    pub build_command: Option<String>,
    /// Completion timestamp (Unix seconds), set on terminal phase.
    pub completed_at: Option<i64>,
    /// Failure reason when `phase` is `Failed`.
    pub error_message: Option<String>,
    /// Stable project identifier.
    pub id: String,
    /// Session ids merged (or merged after resolution) so far.
    pub merged_count: u32,
    /// Persisted merge order over successful session ids.
    pub merge_order: Vec<String>,
    /// Human-readable project name.
    pub name: String,
    /// Current pipeline phase.
    pub phase: Phase,
    /// Target repository root.
    pub repo_path: PathBuf,
    /// Launch timestamp (Unix seconds).
    pub started_at: i64,
    /// Number of test-command runs so far.
    pub test_attempts: u32,
    /// Optional test shell command, run from the repo root.
    pub test_command: Option<String>,
}
