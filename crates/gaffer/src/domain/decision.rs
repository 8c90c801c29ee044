use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Condition class that triggered a pending decision.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    MergeConflict,
    BuildFailure,
    TestFailure,
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionKind::MergeConflict => write!(f, "merge_conflict"),
            DecisionKind::BuildFailure => write!(f, "build_failure"),
            DecisionKind::TestFailure => write!(f, "test_failure"),
        }
    }
}

impl FromStr for DecisionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge_conflict" => Ok(DecisionKind::MergeConflict),
            "build_failure" => Ok(DecisionKind::BuildFailure),
            "test_failure" => Ok(DecisionKind::TestFailure),
            _ => Err(format!("Unknown decision kind: {s}")),
        }
    }
}

/// Resolution state of a decision row.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionStatus::Pending => write!(f, "pending"),
            DecisionStatus::Approved => write!(f, "approved"),
            DecisionStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl FromStr for DecisionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DecisionStatus::Pending),
            "approved" => Ok(DecisionStatus::Approved),
            "rejected" => Ok(DecisionStatus::Rejected),
            _ => Err(format!("Unknown decision status: {s}")),
        }
    }
}

/// Operator action resolving a pending decision.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approve,
    Reject,
}

impl DecisionAction {
    /// Returns the terminal decision status for this action.
    pub fn into_status(self) -> DecisionStatus {
        match self {
            DecisionAction::Approve => DecisionStatus::Approved,
            DecisionAction::Reject => DecisionStatus::Rejected,
        }
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionAction::Approve => write!(f, "approve"),
            DecisionAction::Reject => write!(f, "reject"),
        }
    }
}

/// One approval gate, persisted past resolution for audit.
#[derive(Clone, Debug)]
pub struct Decision {
    /// Truncated error text giving the operator context.
    pub context: String,
    pub created_at: i64,
    /// Human-readable summary of what went wrong.
    pub description: String,
    pub id: String,
    pub kind: DecisionKind,
    pub project_id: String,
    /// What the pipeline will do if the decision is approved.
    pub proposed_action: String,
    pub resolved_at: Option<i64>,
    pub status: DecisionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_kind_round_trips_through_strings() {
        // Arrange
        let kinds = [
            DecisionKind::MergeConflict,
            DecisionKind::BuildFailure,
            DecisionKind::TestFailure,
        ];

        // Act & Assert
        for kind in kinds {
            let parsed = kind
                .to_string()
                .parse::<DecisionKind>()
                .expect("failed to parse decision kind");
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_action_maps_to_terminal_status() {
        // Act & Assert
        assert_eq!(
            DecisionAction::Approve.into_status(),
            DecisionStatus::Approved
        );
        assert_eq!(
            DecisionAction::Reject.into_status(),
            DecisionStatus::Rejected
        );
    }

    #[test]
    fn test_decision_status_round_trips_through_strings() {
        // Arrange
        let statuses = [
            DecisionStatus::Pending,
            DecisionStatus::Approved,
            DecisionStatus::Rejected,
        ];

        // Act & Assert
        for status in statuses {
            let parsed = status
                .to_string()
                .parse::<DecisionStatus>()
                .expect("failed to parse decision status");
            assert_eq!(parsed, status);
        }
    }
}
