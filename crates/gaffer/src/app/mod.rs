//! Application services: team launcher, decision gate, and the pipeline.

pub mod decision;
pub mod launcher;
pub mod locks;
pub mod order;
pub mod pipeline;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::domain::team::TeamRegistry;
use crate::infra::agent::AgentBackend;
use crate::infra::db::Database;
use crate::infra::git;
use crate::infra::hub::EventHub;
use decision::DecisionGate;
use launcher::TeamLauncher;
use locks::RepoLockTable;

/// Runtime configuration shared by the launcher and the pipeline.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Branch name prefix; sessions get `<prefix>/<session_id>`.
    pub branch_prefix: String,
    /// Worktree build-output directory deleted after session termination.
    pub build_output_dir: Option<String>,
    /// Maximum automatic repair cycles per build/test phase.
    pub max_fix_attempts: u32,
    /// Lines retained in the per-session output ring.
    pub output_ring_capacity: usize,
    /// Wall-clock limit for one repair-agent run.
    pub repair_timeout: Duration,
    /// Shared build-artifact directory exported to agent environments.
    pub shared_artifact_dir: Option<PathBuf>,
    /// Delay between graceful stop and hard kill.
    pub stop_grace_period: Duration,
    /// Subdirectory of the repo holding session worktrees.
    pub worktrees_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            branch_prefix: "gaffer".to_string(),
            build_output_dir: None,
            max_fix_attempts: 3,
            output_ring_capacity: 2000,
            repair_timeout: Duration::from_secs(300),
            shared_artifact_dir: None,
            stop_grace_period: Duration::from_secs(10),
            worktrees_dir: ".worktrees".to_string(),
        }
    }
}

/// The general manager: one long-lived service that launches agent crews,
/// merges their branches, and drives the build/test repair loop.
pub struct GeneralManager {
    backend: Arc<dyn AgentBackend>,
    cancellations: Arc<Mutex<HashMap<String, CancellationToken>>>,
    config: Arc<AppConfig>,
    db: Database,
    gate: DecisionGate,
    hub: EventHub,
    launcher: TeamLauncher,
    locks: RepoLockTable,
    registry: TeamRegistry,
}

impl GeneralManager {
    /// Wires the manager over the shared services.
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        config: AppConfig,
        db: Database,
        hub: EventHub,
        registry: TeamRegistry,
    ) -> Self {
        let config = Arc::new(config);
        let launcher = TeamLauncher::new(
            Arc::clone(&backend),
            Arc::clone(&config),
            db.clone(),
            hub.clone(),
        );
        let gate = DecisionGate::new(db.clone(), hub.clone());

        Self {
            backend,
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            config,
            db,
            gate,
            hub,
            launcher,
            locks: RepoLockTable::new(),
            registry,
        }
    }

    /// Returns a handle to the decision gate for external resolvers.
    pub fn decision_gate(&self) -> DecisionGate {
        self.gate.clone()
    }

    /// Returns the backing store handle.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Returns the team launcher.
    pub fn launcher(&self) -> &TeamLauncher {
        &self.launcher
    }

    /// Cancels a running project: sessions stop, any pending decision is
    /// auto-rejected, and the pipeline terminates as failed with
    /// `error_message = "cancelled"`.
    ///
    /// # Errors
    /// Returns an error if pending decisions cannot be listed.
    pub async fn cancel_project(&self, project_id: &str) -> Result<(), String> {
        {
            if let Ok(cancellations) = self.cancellations.lock()
                && let Some(token) = cancellations.get(project_id)
            {
                token.cancel();
            }
        }

        self.gate.reject_all_pending(project_id).await
    }

    /// Removes a session's worktree and branch after the fact.
    ///
    /// Worktrees survive pipeline completion for inspection; this is the
    /// explicit cleanup path.
    ///
    /// # Errors
    /// Returns an error if the session is unknown or removal fails.
    pub async fn discard_session(&self, session_id: &str) -> Result<(), String> {
        let session = self
            .db
            .get_session(session_id)
            .await?
            .ok_or_else(|| format!("Unknown session: {session_id}"))?;
        let project = self
            .db
            .get_project(&session.project_id)
            .await?
            .ok_or_else(|| format!("Unknown project: {}", session.project_id))?;

        git::remove_worktree(
            PathBuf::from(project.repo_path),
            PathBuf::from(session.worktree_path),
            session.branch,
        )
        .await
    }
}
