//! Human approval gates.
//!
//! A decision is a durable row plus exactly one in-memory waiter. The row
//! survives the waiter (audit trail, crash recovery); the waiter is woken
//! at most once, by whichever resolve call wins the atomic store
//! transition.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::domain::decision::{DecisionAction, DecisionKind, DecisionStatus};
use crate::domain::event::{CHANNEL_GM, GmEvent};
use crate::infra::db::{Database, DecisionRow};
use crate::infra::hub::EventHub;

/// Wait handle for one pending decision.
pub struct DecisionWaiter {
    receiver: oneshot::Receiver<DecisionAction>,
}

impl DecisionWaiter {
    /// Blocks until the decision resolves.
    ///
    /// A torn-down gate (process shutdown, cancellation teardown) resolves
    /// as a rejection rather than hanging the pipeline.
    pub async fn wait(self) -> DecisionAction {
        self.receiver.await.unwrap_or(DecisionAction::Reject)
    }
}

/// Registers pending decisions and wakes the pipeline when they resolve.
#[derive(Clone)]
pub struct DecisionGate {
    db: Database,
    hub: EventHub,
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<DecisionAction>>>>,
}

impl DecisionGate {
    /// Creates a gate over the shared store and hub.
    pub fn new(db: Database, hub: EventHub) -> Self {
        Self {
            db,
            hub,
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a pending decision and returns its id plus a wait handle.
    ///
    /// Publishes `decision_required` on the `gm` channel after the row is
    /// durable.
    ///
    /// # Errors
    /// Returns an error if the decision row cannot be inserted.
    pub async fn request(
        &self,
        project_id: &str,
        kind: DecisionKind,
        description: &str,
        proposed_action: &str,
        context: &str,
    ) -> Result<(String, DecisionWaiter), String> {
        let decision_id = Uuid::new_v4().to_string();
        self.db
            .insert_decision(
                &decision_id,
                project_id,
                &kind.to_string(),
                description,
                proposed_action,
                context,
            )
            .await?;

        let (sender, receiver) = oneshot::channel();
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.insert(decision_id.clone(), sender);
        }

        let _ = self.hub.publish_event(
            CHANNEL_GM,
            &GmEvent::DecisionRequired {
                project_id: project_id.to_string(),
                decision_id: decision_id.clone(),
                decision_type: kind,
                description: description.to_string(),
                proposed_action: proposed_action.to_string(),
                context: context.to_string(),
            },
        );
        debug!(decision_id = decision_id.as_str(), kind = %kind, "decision requested");

        Ok((decision_id, DecisionWaiter { receiver }))
    }

    /// Resolves a pending decision and wakes its waiter exactly once.
    ///
    /// Idempotent after resolution: later calls return the recorded outcome
    /// without side effects.
    ///
    /// # Errors
    /// Returns an error if the store update fails or the decision does not
    /// exist.
    pub async fn resolve(
        &self,
        decision_id: &str,
        action: DecisionAction,
    ) -> Result<DecisionAction, String> {
        let won = self
            .db
            .resolve_decision(decision_id, action.into_status())
            .await?;

        if !won {
            return self.recorded_outcome(decision_id).await;
        }

        let waiter = self
            .waiters
            .lock()
            .ok()
            .and_then(|mut waiters| waiters.remove(decision_id));
        if let Some(sender) = waiter {
            let _ = sender.send(action);
        }

        let row = self
            .db
            .get_decision(decision_id)
            .await?
            .ok_or_else(|| format!("Decision {decision_id} vanished after resolution"))?;
        let _ = self.hub.publish_event(
            CHANNEL_GM,
            &GmEvent::DecisionResolved {
                project_id: row.project_id,
                decision_id: decision_id.to_string(),
                action,
            },
        );

        Ok(action)
    }

    /// Lists still-pending decisions for one project.
    ///
    /// # Errors
    /// Returns an error if decision rows cannot be read.
    pub async fn pending_for(&self, project_id: &str) -> Result<Vec<DecisionRow>, String> {
        self.db.load_pending_decisions(project_id).await
    }

    /// Rejects every pending decision for a project (cancellation
    /// teardown).
    ///
    /// # Errors
    /// Returns an error if pending rows cannot be listed; individual
    /// resolution races are tolerated.
    pub async fn reject_all_pending(&self, project_id: &str) -> Result<(), String> {
        for row in self.db.load_pending_decisions(project_id).await? {
            let _ = self.resolve(&row.id, DecisionAction::Reject).await;
        }

        Ok(())
    }

    async fn recorded_outcome(&self, decision_id: &str) -> Result<DecisionAction, String> {
        let row = self
            .db
            .get_decision(decision_id)
            .await?
            .ok_or_else(|| format!("Decision {decision_id} not found"))?;

        match DecisionStatus::from_str(&row.status)? {
            DecisionStatus::Approved => Ok(DecisionAction::Approve),
            DecisionStatus::Rejected => Ok(DecisionAction::Reject),
            DecisionStatus::Pending => {
                Err(format!("Decision {decision_id} is unexpectedly pending"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::domain::project::Phase;

    async fn gate_with_project(project_id: &str) -> DecisionGate {
        let db = Database::open_in_memory().await.expect("failed to open db");
        db.insert_project(project_id, "demo", "/tmp/repo", None, None, 1, Phase::Merging)
            .await
            .expect("failed to insert project");

        DecisionGate::new(db, EventHub::new())
    }

    #[tokio::test]
    async fn test_resolve_wakes_the_waiter_with_the_action() {
        // Arrange
        let gate = gate_with_project("p1").await;
        let (decision_id, waiter) = gate
            .request("p1", DecisionKind::MergeConflict, "conflict", "resolve", "ctx")
            .await
            .expect("failed to request");

        // Act
        let resolver = {
            let gate = gate.clone();
            let decision_id = decision_id.clone();
            tokio::spawn(async move { gate.resolve(&decision_id, DecisionAction::Approve).await })
        };
        let action = timeout(Duration::from_secs(1), waiter.wait())
            .await
            .expect("wait timed out");

        // Assert
        assert_eq!(action, DecisionAction::Approve);
        let resolved = resolver
            .await
            .expect("resolver panicked")
            .expect("resolve failed");
        assert_eq!(resolved, DecisionAction::Approve);
    }

    #[tokio::test]
    async fn test_second_resolve_returns_first_outcome_without_side_effect() {
        // Arrange
        let gate = gate_with_project("p1").await;
        let (decision_id, waiter) = gate
            .request("p1", DecisionKind::BuildFailure, "build failed", "repair", "ctx")
            .await
            .expect("failed to request");

        // Act
        let first = gate
            .resolve(&decision_id, DecisionAction::Reject)
            .await
            .expect("first resolve failed");
        let second = gate
            .resolve(&decision_id, DecisionAction::Approve)
            .await
            .expect("second resolve failed");
        let action = timeout(Duration::from_secs(1), waiter.wait())
            .await
            .expect("wait timed out");

        // Assert: the losing approve call observes the recorded rejection.
        assert_eq!(first, DecisionAction::Reject);
        assert_eq!(second, DecisionAction::Reject);
        assert_eq!(action, DecisionAction::Reject);
    }

    #[tokio::test]
    async fn test_pending_for_lists_only_unresolved_decisions() {
        // Arrange
        let gate = gate_with_project("p1").await;
        let (first_id, _first_waiter) = gate
            .request("p1", DecisionKind::MergeConflict, "one", "resolve", "")
            .await
            .expect("failed to request");
        let (_second_id, _second_waiter) = gate
            .request("p1", DecisionKind::TestFailure, "two", "repair", "")
            .await
            .expect("failed to request");
        gate.resolve(&first_id, DecisionAction::Approve)
            .await
            .expect("failed to resolve");

        // Act
        let pending = gate.pending_for("p1").await.expect("failed to list");

        // Assert
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].description, "two");
    }

    #[tokio::test]
    async fn test_reject_all_pending_resolves_every_waiter() {
        // Arrange
        let gate = gate_with_project("p1").await;
        let (_id_a, waiter_a) = gate
            .request("p1", DecisionKind::MergeConflict, "a", "resolve", "")
            .await
            .expect("failed to request");
        let (_id_b, waiter_b) = gate
            .request("p1", DecisionKind::BuildFailure, "b", "repair", "")
            .await
            .expect("failed to request");

        // Act
        gate.reject_all_pending("p1")
            .await
            .expect("failed to reject all");

        // Assert
        assert_eq!(waiter_a.wait().await, DecisionAction::Reject);
        assert_eq!(waiter_b.wait().await, DecisionAction::Reject);
        assert!(
            gate.pending_for("p1")
                .await
                .expect("failed to list")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_dropped_gate_resolves_waiter_as_rejection() {
        // Arrange
        let gate = gate_with_project("p1").await;
        let (_decision_id, waiter) = gate
            .request("p1", DecisionKind::MergeConflict, "orphaned", "resolve", "")
            .await
            .expect("failed to request");

        // Act: dropping the gate drops the sender.
        drop(gate);
        let action = timeout(Duration::from_secs(1), waiter.wait())
            .await
            .expect("wait timed out");

        // Assert
        assert_eq!(action, DecisionAction::Reject);
    }
}
