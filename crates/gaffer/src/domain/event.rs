//! Typed payloads for the event hub channels.
//!
//! Every payload is a tagged sum type with a `type` discriminator so wire
//! consumers can dispatch without knowing the Rust enum layout.

use serde::{Deserialize, Serialize};

use super::decision::{DecisionAction, DecisionKind};
use super::project::Phase;
use super::session::{MergeResult, SessionStatus};

/// Channel carrying pipeline lifecycle events.
pub const CHANNEL_GM: &str = "gm";
/// Channel carrying per-session agent output and terminal notices.
pub const CHANNEL_TEAMS: &str = "teams";
/// Channel mirroring structured log rows.
pub const CHANNEL_LOGS: &str = "logs";

/// Event published on the `gm` channel after each pipeline transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GmEvent {
    ProjectStarted {
        project_id: String,
        project_name: String,
    },
    PhaseChange {
        project_id: String,
        phase: Phase,
    },
    AgentLaunched {
        project_id: String,
        session_id: String,
        team_name: String,
    },
    AgentCompleted {
        project_id: String,
        session_id: String,
        status: SessionStatus,
    },
    MergeOrderDetermined {
        project_id: String,
        merge_order: Vec<String>,
    },
    MergeStarted {
        project_id: String,
        session_id: String,
        index: usize,
    },
    MergeConflict {
        project_id: String,
        session_id: String,
        conflicted_files: Vec<String>,
        error: String,
    },
    MergeCompleted {
        project_id: String,
        session_id: String,
        skipped: bool,
        result: MergeResult,
    },
    ConflictResolved {
        project_id: String,
        session_id: String,
    },
    BuildStarted {
        project_id: String,
    },
    BuildResult {
        project_id: String,
        success: bool,
        output_tail: String,
    },
    BuildFixAttempt {
        project_id: String,
        attempt: u32,
    },
    TestStarted {
        project_id: String,
    },
    TestResult {
        project_id: String,
        success: bool,
        output_tail: String,
    },
    TestFixAttempt {
        project_id: String,
        attempt: u32,
    },
    DecisionRequired {
        project_id: String,
        decision_id: String,
        decision_type: DecisionKind,
        description: String,
        proposed_action: String,
        context: String,
    },
    DecisionResolved {
        project_id: String,
        decision_id: String,
        action: DecisionAction,
    },
    ProjectCompleted {
        project_id: String,
    },
    ProjectFailed {
        project_id: String,
        reason: String,
    },
}

impl GmEvent {
    /// Returns the wire discriminator for this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ProjectStarted { .. } => "project_started",
            Self::PhaseChange { .. } => "phase_change",
            Self::AgentLaunched { .. } => "agent_launched",
            Self::AgentCompleted { .. } => "agent_completed",
            Self::MergeOrderDetermined { .. } => "merge_order_determined",
            Self::MergeStarted { .. } => "merge_started",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::MergeCompleted { .. } => "merge_completed",
            Self::ConflictResolved { .. } => "conflict_resolved",
            Self::BuildStarted { .. } => "build_started",
            Self::BuildResult { .. } => "build_result",
            Self::BuildFixAttempt { .. } => "build_fix_attempt",
            Self::TestStarted { .. } => "test_started",
            Self::TestResult { .. } => "test_result",
            Self::TestFixAttempt { .. } => "test_fix_attempt",
            Self::DecisionRequired { .. } => "decision_required",
            Self::DecisionResolved { .. } => "decision_resolved",
            Self::ProjectCompleted { .. } => "project_completed",
            Self::ProjectFailed { .. } => "project_failed",
        }
    }

    /// Returns the project id this event belongs to.
    pub fn project_id(&self) -> &str {
        match self {
            Self::ProjectStarted { project_id, .. }
            | Self::PhaseChange { project_id, .. }
            | Self::AgentLaunched { project_id, .. }
            | Self::AgentCompleted { project_id, .. }
            | Self::MergeOrderDetermined { project_id, .. }
            | Self::MergeStarted { project_id, .. }
            | Self::MergeConflict { project_id, .. }
            | Self::MergeCompleted { project_id, .. }
            | Self::ConflictResolved { project_id, .. }
            | Self::BuildStarted { project_id }
            | Self::BuildResult { project_id, .. }
            | Self::BuildFixAttempt { project_id, .. }
            | Self::TestStarted { project_id }
            | Self::TestResult { project_id, .. }
            | Self::TestFixAttempt { project_id, .. }
            | Self::DecisionRequired { project_id, .. }
            | Self::DecisionResolved { project_id, .. }
            | Self::ProjectCompleted { project_id }
            | Self::ProjectFailed { project_id, .. } => project_id,
        }
    }
}

/// Stream or terminal notice carried by one `team_progress` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamStream {
    Stdout,
    Stderr,
    Completed,
    Cancelled,
}

/// Event published on the `teams` channel while sessions run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TeamEvent {
    TeamProgress {
        session_id: String,
        event: TeamStream,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<SessionStatus>,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    /// Distinct terminal notice when the resource watchdog killed a session.
    ResourceError {
        session_id: String,
        pattern: String,
    },
}

impl TeamEvent {
    /// Builds one output-line progress event.
    pub fn line(session_id: &str, stream: TeamStream, data: &str) -> Self {
        Self::TeamProgress {
            session_id: session_id.to_string(),
            event: stream,
            data: Some(data.to_string()),
            status: None,
            exit_code: None,
        }
    }

    /// Builds the terminal completion event for a session.
    pub fn completed(session_id: &str, status: SessionStatus, exit_code: Option<i32>) -> Self {
        Self::TeamProgress {
            session_id: session_id.to_string(),
            event: TeamStream::Completed,
            data: None,
            status: Some(status),
            exit_code,
        }
    }

    /// Builds the terminal cancellation event for a session.
    pub fn cancelled(session_id: &str) -> Self {
        Self::TeamProgress {
            session_id: session_id.to_string(),
            event: TeamStream::Cancelled,
            data: None,
            status: Some(SessionStatus::Cancelled),
            exit_code: None,
        }
    }

    /// Returns the session id this event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::TeamProgress { session_id, .. } | Self::ResourceError { session_id, .. } => {
                session_id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gm_event_carries_type_discriminator() {
        // Arrange
        let event = GmEvent::PhaseChange {
            project_id: "p1".to_string(),
            phase: Phase::Merging,
        };

        // Act
        let value = serde_json::to_value(&event).expect("failed to serialize");

        // Assert
        assert_eq!(value["type"], "phase_change");
        assert_eq!(value["phase"], "merging");
        assert_eq!(value["project_id"], "p1");
    }

    #[test]
    fn test_gm_event_type_matches_serialized_tag() {
        // Arrange
        let events = [
            GmEvent::ProjectStarted {
                project_id: "p1".to_string(),
                project_name: "demo".to_string(),
            },
            GmEvent::MergeOrderDetermined {
                project_id: "p1".to_string(),
                merge_order: vec!["a".to_string(), "b".to_string()],
            },
            GmEvent::DecisionResolved {
                project_id: "p1".to_string(),
                decision_id: "d1".to_string(),
                action: DecisionAction::Approve,
            },
            GmEvent::ProjectFailed {
                project_id: "p1".to_string(),
                reason: "cancelled".to_string(),
            },
        ];

        // Act & Assert
        for event in events {
            let value = serde_json::to_value(&event).expect("failed to serialize");
            assert_eq!(value["type"], event.event_type());
        }
    }

    #[test]
    fn test_gm_event_round_trips_through_json() {
        // Arrange
        let event = GmEvent::MergeConflict {
            project_id: "p1".to_string(),
            session_id: "s1".to_string(),
            conflicted_files: vec!["src/lib.rs".to_string()],
            error: "conflict".to_string(),
        };

        // Act
        let raw = serde_json::to_string(&event).expect("failed to serialize");
        let parsed: GmEvent = serde_json::from_str(&raw).expect("failed to deserialize");

        // Assert
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_team_progress_line_omits_absent_fields() {
        // Arrange
        let event = TeamEvent::line("s1", TeamStream::Stderr, "warning: unused");

        // Act
        let value = serde_json::to_value(&event).expect("failed to serialize");

        // Assert
        assert_eq!(value["type"], "team_progress");
        assert_eq!(value["event"], "stderr");
        assert_eq!(value["data"], "warning: unused");
        assert!(value.get("status").is_none());
        assert!(value.get("exit_code").is_none());
    }

    #[test]
    fn test_team_completed_event_carries_status_and_exit_code() {
        // Arrange
        let event = TeamEvent::completed("s1", SessionStatus::Failed, Some(2));

        // Act
        let value = serde_json::to_value(&event).expect("failed to serialize");

        // Assert
        assert_eq!(value["event"], "completed");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["exit_code"], 2);
    }
}
