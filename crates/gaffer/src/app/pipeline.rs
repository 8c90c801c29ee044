//! The pipeline state machine.
//!
//! One coroutine drives a project from `launching` to a terminal phase.
//! Every transition is written to the store before the matching event is
//! published, so an observer sees each transition at most once after it is
//! durable. Merging, building, and testing run under the per-repo lock.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::os::unix::process::CommandExt as _;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use askama::Template;
use serde_json::json;
use tokio::io::AsyncBufReadExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::GeneralManager;
use super::launcher::{LaunchedSession, stop_process_group};
use super::order::{SessionFiles, compute_merge_order};
use crate::domain::decision::{DecisionAction, DecisionKind};
use crate::domain::event::{CHANNEL_GM, CHANNEL_LOGS, CHANNEL_TEAMS, GmEvent, TeamEvent, TeamStream};
use crate::domain::project::Phase;
use crate::domain::session::{MergeResult, SessionStatus};
use crate::domain::team::{LaunchRequest, TeamTemplate};
use crate::infra::agent::SESSION_ID_ENV;
use crate::infra::db::SessionRow;
use crate::infra::git;

/// Character budget for captured build/test output.
const OUTPUT_TAIL_LIMIT: usize = 8 * 1024;

/// Character budget for the error context stored on a decision row.
const DECISION_CONTEXT_LIMIT: usize = 2 * 1024;

/// Commit message used when the pipeline completes an assisted resolution
/// the repair agent left staged but uncommitted.
const RESOLVE_COMMIT_MESSAGE: &str = "gaffer: resolve merge conflicts";

/// Failure reason recorded for cancelled projects.
const CANCELLED_REASON: &str = "cancelled";

/// Terminal summary of one pipeline run.
#[derive(Clone, Debug)]
pub struct ProjectRun {
    pub project_id: String,
    pub phase: Phase,
}

/// Askama view model for the merge-conflict repair prompt.
#[derive(Template)]
#[template(path = "conflict_resolution_prompt.md", escape = "none")]
struct ConflictResolutionPrompt<'a> {
    branch: &'a str,
    conflicted_files: &'a str,
}

/// Askama view model for the build-repair prompt.
#[derive(Template)]
#[template(path = "build_fix_prompt.md", escape = "none")]
struct BuildFixPrompt<'a> {
    command: &'a str,
    output_tail: &'a str,
}

/// Askama view model for the test-repair prompt.
#[derive(Template)]
#[template(path = "test_fix_prompt.md", escape = "none")]
struct TestFixPrompt<'a> {
    command: &'a str,
    output_tail: &'a str,
}

/// Which verification phase a command run belongs to.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CheckKind {
    Build,
    Test,
}

impl CheckKind {
    fn phase(self) -> Phase {
        match self {
            Self::Build => Phase::Building,
            Self::Test => Phase::Testing,
        }
    }

    fn decision_kind(self) -> DecisionKind {
        match self {
            Self::Build => DecisionKind::BuildFailure,
            Self::Test => DecisionKind::TestFailure,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Test => "test",
        }
    }

    fn render_prompt(self, command: &str, output_tail: &str) -> Result<String, String> {
        let rendered = match self {
            Self::Build => BuildFixPrompt {
                command,
                output_tail,
            }
            .render(),
            Self::Test => TestFixPrompt {
                command,
                output_tail,
            }
            .render(),
        };

        rendered.map_err(|error| format!("Failed to render repair prompt: {error}"))
    }
}

impl GeneralManager {
    /// Runs one project through the whole pipeline.
    ///
    /// Returns once the project reaches a terminal phase. Failures inside
    /// the pipeline (including cancellation) terminate the project as
    /// `failed` and still return `Ok`; `Err` is reserved for request
    /// validation and store failures before the project row exists.
    ///
    /// # Errors
    /// Returns an error when the request names an unknown team template,
    /// the repo path is not an absolute git repository root, no agents are
    /// configured, or the project row cannot be written.
    pub async fn run_project(&self, request: &LaunchRequest) -> Result<ProjectRun, String> {
        if request.agents.is_empty() {
            return Err("Launch request has no agents".to_string());
        }
        if !request.repo_path.is_absolute() {
            return Err(format!(
                "Repo path must be absolute: {}",
                request.repo_path.display()
            ));
        }
        let repo_root = git::repository_root(request.repo_path.clone()).await?;

        let templates: Vec<TeamTemplate> = request
            .agents
            .iter()
            .map(|assignment| self.registry.resolve(&assignment.team).cloned())
            .collect::<Result<_, _>>()?;

        let project_id = Uuid::new_v4().to_string();
        self.db
            .insert_project(
                &project_id,
                &request.project_name,
                &repo_root.to_string_lossy(),
                request.build_command.as_deref(),
                request.test_command.as_deref(),
                u32::try_from(request.agents.len()).unwrap_or(u32::MAX),
                Phase::Launching,
            )
            .await?;

        let _ = self.hub.publish_event(
            CHANNEL_GM,
            &GmEvent::ProjectStarted {
                project_id: project_id.clone(),
                project_name: request.project_name.clone(),
            },
        );
        self.log_info(&project_id, "project started").await;

        let token = CancellationToken::new();
        if let Ok(mut cancellations) = self.cancellations.lock() {
            cancellations.insert(project_id.clone(), token.clone());
        }

        let result = self
            .drive(&project_id, request, &templates, &repo_root, &token)
            .await;

        if let Ok(mut cancellations) = self.cancellations.lock() {
            cancellations.remove(&project_id);
        }

        match result {
            Ok(phase) => Ok(ProjectRun { project_id, phase }),
            Err(reason) => {
                self.fail_project(&project_id, &reason, &token).await;

                Ok(ProjectRun {
                    project_id,
                    phase: Phase::Failed,
                })
            }
        }
    }

    async fn drive(
        &self,
        project_id: &str,
        request: &LaunchRequest,
        templates: &[TeamTemplate],
        repo: &Path,
        token: &CancellationToken,
    ) -> Result<Phase, String> {
        // Launching: the insert already persisted the phase.
        let _ = self.hub.publish_event(
            CHANNEL_GM,
            &GmEvent::PhaseChange {
                project_id: project_id.to_string(),
                phase: Phase::Launching,
            },
        );

        let mut handles: Vec<LaunchedSession> = Vec::new();
        for (assignment, template) in request.agents.iter().zip(templates) {
            let launched = self
                .launcher
                .launch(project_id, template, &assignment.task, repo, token)
                .await?;
            let _ = self.hub.publish_event(
                CHANNEL_GM,
                &GmEvent::AgentLaunched {
                    project_id: project_id.to_string(),
                    session_id: launched.session_id.clone(),
                    team_name: template.name.clone(),
                },
            );
            handles.push(launched);
        }

        // Waiting: every session supervisor runs to a terminal status; a
        // cancelled project cancels them through the child tokens, so the
        // joins still complete promptly.
        self.set_phase(project_id, Phase::Launching, Phase::Waiting)
            .await?;
        for launched in handles {
            let _ = launched.handle.await;
        }
        let sessions = self.db.load_project_sessions(project_id).await?;
        for session in &sessions {
            let _ = self.hub.publish_event(
                CHANNEL_GM,
                &GmEvent::AgentCompleted {
                    project_id: project_id.to_string(),
                    session_id: session.id.clone(),
                    status: session.status_parsed().unwrap_or(SessionStatus::Failed),
                },
            );
        }
        self.ensure_not_cancelled(token)?;

        // Analyzing
        self.set_phase(project_id, Phase::Waiting, Phase::Analyzing)
            .await?;
        let inputs: Vec<SessionFiles> = sessions
            .iter()
            .filter(|session| session.status == SessionStatus::Completed.to_string())
            .map(|session| SessionFiles {
                session_id: session.id.clone(),
                started_at: session.started_at,
                files: session.files_changed_list(),
            })
            .collect();
        let merge_order = compute_merge_order(&inputs);
        self.db
            .set_project_merge_order(project_id, &merge_order)
            .await?;
        let _ = self.hub.publish_event(
            CHANNEL_GM,
            &GmEvent::MergeOrderDetermined {
                project_id: project_id.to_string(),
                merge_order: merge_order.clone(),
            },
        );
        self.ensure_not_cancelled(token)?;

        // Merging, building, and testing mutate the host checkout; hold the
        // repo lock across all three so projects on the same repo serialize.
        let _repo_lock = self.locks.acquire(repo).await;

        self.set_phase(project_id, Phase::Analyzing, Phase::Merging)
            .await?;
        let by_id: HashMap<&str, &SessionRow> = sessions
            .iter()
            .map(|session| (session.id.as_str(), session))
            .collect();
        let mut merged_count = 0u32;
        for (index, session_id) in merge_order.iter().enumerate() {
            self.ensure_not_cancelled(token)?;
            let Some(session) = by_id.get(session_id.as_str()) else {
                continue;
            };
            merged_count = self
                .merge_one_session(project_id, repo, session, index, merged_count, token)
                .await?;
        }
        self.ensure_not_cancelled(token)?;

        let mut current = Phase::Merging;
        if let Some(command) = &request.build_command {
            self.run_check_phase(project_id, repo, &mut current, CheckKind::Build, command, token)
                .await?;
        }
        if let Some(command) = &request.test_command {
            self.run_check_phase(project_id, repo, &mut current, CheckKind::Test, command, token)
                .await?;
        }

        self.db
            .finish_project(project_id, Phase::Completed, None)
            .await?;
        let _ = self.hub.publish_event(
            CHANNEL_GM,
            &GmEvent::PhaseChange {
                project_id: project_id.to_string(),
                phase: Phase::Completed,
            },
        );
        let _ = self.hub.publish_event(
            CHANNEL_GM,
            &GmEvent::ProjectCompleted {
                project_id: project_id.to_string(),
            },
        );
        self.log_info(project_id, "project completed").await;
        info!(project_id, "pipeline completed");

        Ok(Phase::Completed)
    }

    /// Merges one session branch, routing conflicts through the decision
    /// gate and the repair agent. Returns the updated merged count.
    async fn merge_one_session(
        &self,
        project_id: &str,
        repo: &Path,
        session: &SessionRow,
        index: usize,
        merged_count: u32,
        token: &CancellationToken,
    ) -> Result<u32, String> {
        let _ = self.hub.publish_event(
            CHANNEL_GM,
            &GmEvent::MergeStarted {
                project_id: project_id.to_string(),
                session_id: session.id.clone(),
                index,
            },
        );

        let message = format!("gaffer: merge session {}", session.id);
        let outcome =
            git::merge_no_ff(repo.to_path_buf(), session.branch.clone(), message).await?;

        if outcome.success {
            return self
                .record_merge(project_id, session, MergeResult::Merged, merged_count + 1)
                .await;
        }

        if outcome.conflicted_files.is_empty() {
            // Failed for a reason other than conflicts; restore and skip.
            warn!(
                session_id = session.id.as_str(),
                stderr = outcome.stderr.as_str(),
                "merge failed without conflicts, skipping session"
            );
            git::abort_merge(repo.to_path_buf()).await?;

            return self
                .record_skipped(project_id, session, MergeResult::Failed, merged_count)
                .await;
        }

        let _ = self.hub.publish_event(
            CHANNEL_GM,
            &GmEvent::MergeConflict {
                project_id: project_id.to_string(),
                session_id: session.id.clone(),
                conflicted_files: outcome.conflicted_files.clone(),
                error: outcome.stderr.clone(),
            },
        );

        let description = format!(
            "Merging session {} conflicts in {} file(s)",
            session.id,
            outcome.conflicted_files.len()
        );
        let context = truncate_tail(
            &format!(
                "conflicted files:\n{}\n\n{}",
                outcome.conflicted_files.join("\n"),
                outcome.stderr
            ),
            DECISION_CONTEXT_LIMIT,
        );
        let (_decision_id, waiter) = self
            .gate
            .request(
                project_id,
                DecisionKind::MergeConflict,
                &description,
                "Run a repair agent to resolve the conflicts and commit",
                &context,
            )
            .await?;
        let action = tokio::select! {
            action = waiter.wait() => action,
            () = token.cancelled() => DecisionAction::Reject,
        };

        if action == DecisionAction::Reject {
            git::abort_merge(repo.to_path_buf()).await?;

            return self
                .record_skipped(project_id, session, MergeResult::Skipped, merged_count)
                .await;
        }

        let files = outcome.conflicted_files.join("\n");
        let prompt = ConflictResolutionPrompt {
            branch: &session.branch,
            conflicted_files: &files,
        }
        .render()
        .map_err(|error| format!("Failed to render conflict prompt: {error}"))?;

        let repair = self.run_repair_agent(project_id, repo, &prompt).await;
        let resolved = match repair {
            Ok(()) => self.complete_assisted_resolution(repo).await,
            Err(ref error) => {
                warn!(
                    session_id = session.id.as_str(),
                    error = error.as_str(),
                    "conflict repair agent failed"
                );
                false
            }
        };

        if resolved {
            let _ = self.hub.publish_event(
                CHANNEL_GM,
                &GmEvent::ConflictResolved {
                    project_id: project_id.to_string(),
                    session_id: session.id.clone(),
                },
            );

            return self
                .record_merge(
                    project_id,
                    session,
                    MergeResult::MergedResolved,
                    merged_count + 1,
                )
                .await;
        }

        git::abort_merge(repo.to_path_buf()).await?;

        self.record_skipped(project_id, session, MergeResult::Failed, merged_count)
            .await
    }

    /// Verifies the checkout is conflict-free after an assisted resolution
    /// and commits anything the agent left staged.
    async fn complete_assisted_resolution(&self, repo: &Path) -> bool {
        match git::conflicted_files(repo.to_path_buf()).await {
            Ok(remaining) if remaining.is_empty() => {}
            _ => return false,
        }

        match git::has_uncommitted_changes(repo.to_path_buf()).await {
            Ok(false) => true,
            Ok(true) => {
                git::auto_commit(repo.to_path_buf(), RESOLVE_COMMIT_MESSAGE.to_string())
                    .await
                    .is_ok()
            }
            Err(_) => false,
        }
    }

    async fn record_merge(
        &self,
        project_id: &str,
        session: &SessionRow,
        result: MergeResult,
        merged_count: u32,
    ) -> Result<u32, String> {
        self.db.set_session_merge_result(&session.id, result).await?;
        self.db
            .set_project_merged_count(project_id, merged_count)
            .await?;
        let _ = self.hub.publish_event(
            CHANNEL_GM,
            &GmEvent::MergeCompleted {
                project_id: project_id.to_string(),
                session_id: session.id.clone(),
                skipped: false,
                result,
            },
        );
        debug!(session_id = session.id.as_str(), result = %result, "session merged");

        Ok(merged_count)
    }

    async fn record_skipped(
        &self,
        project_id: &str,
        session: &SessionRow,
        result: MergeResult,
        merged_count: u32,
    ) -> Result<u32, String> {
        self.db.set_session_merge_result(&session.id, result).await?;
        let _ = self.hub.publish_event(
            CHANNEL_GM,
            &GmEvent::MergeCompleted {
                project_id: project_id.to_string(),
                session_id: session.id.clone(),
                skipped: true,
                result,
            },
        );

        Ok(merged_count)
    }

    /// Runs one verification phase (build or test) with bounded repair
    /// retries.
    async fn run_check_phase(
        &self,
        project_id: &str,
        repo: &Path,
        current: &mut Phase,
        kind: CheckKind,
        command: &str,
        token: &CancellationToken,
    ) -> Result<(), String> {
        let mut attempts = 0u32;
        let mut fix_cycles = 0u32;

        loop {
            self.ensure_not_cancelled(token)?;

            attempts += 1;
            self.set_phase(project_id, *current, kind.phase()).await?;
            *current = kind.phase();
            match kind {
                CheckKind::Build => {
                    self.db
                        .set_project_build_attempts(project_id, attempts)
                        .await?;
                    let _ = self.hub.publish_event(
                        CHANNEL_GM,
                        &GmEvent::BuildStarted {
                            project_id: project_id.to_string(),
                        },
                    );
                }
                CheckKind::Test => {
                    self.db
                        .set_project_test_attempts(project_id, attempts)
                        .await?;
                    let _ = self.hub.publish_event(
                        CHANNEL_GM,
                        &GmEvent::TestStarted {
                            project_id: project_id.to_string(),
                        },
                    );
                }
            }

            let (success, output_tail) = self.run_shell_command(repo, command).await?;
            let result_event = match kind {
                CheckKind::Build => GmEvent::BuildResult {
                    project_id: project_id.to_string(),
                    success,
                    output_tail: output_tail.clone(),
                },
                CheckKind::Test => GmEvent::TestResult {
                    project_id: project_id.to_string(),
                    success,
                    output_tail: output_tail.clone(),
                },
            };
            let _ = self.hub.publish_event(CHANNEL_GM, &result_event);

            if success {
                return Ok(());
            }

            if fix_cycles >= self.config.max_fix_attempts {
                return Err(format!(
                    "{} failed after {} repair attempts",
                    kind.label(),
                    fix_cycles
                ));
            }

            let context = truncate_tail(&output_tail, DECISION_CONTEXT_LIMIT);
            let description = format!(
                "{} command failed (run {})",
                kind.label(),
                attempts
            );
            let (_decision_id, waiter) = self
                .gate
                .request(
                    project_id,
                    kind.decision_kind(),
                    &description,
                    "Run a repair agent on the failure log and retry",
                    &context,
                )
                .await?;
            let action = tokio::select! {
                action = waiter.wait() => action,
                () = token.cancelled() => DecisionAction::Reject,
            };
            if action == DecisionAction::Reject {
                self.ensure_not_cancelled(token)?;

                return Err(format!("{} failure rejected by operator", kind.label()));
            }

            fix_cycles += 1;
            let fix_event = match kind {
                CheckKind::Build => GmEvent::BuildFixAttempt {
                    project_id: project_id.to_string(),
                    attempt: fix_cycles,
                },
                CheckKind::Test => GmEvent::TestFixAttempt {
                    project_id: project_id.to_string(),
                    attempt: fix_cycles,
                },
            };
            let _ = self.hub.publish_event(CHANNEL_GM, &fix_event);

            let prompt = kind.render_prompt(command, &context)?;
            if let Err(error) = self.run_repair_agent(project_id, repo, &prompt).await {
                // A failed repair still consumed a cycle; the re-run decides.
                warn!(project_id, error = error.as_str(), "repair agent failed");
            }
        }
    }

    /// Runs the operator-supplied shell command with combined output
    /// captured to a bounded tail.
    async fn run_shell_command(
        &self,
        repo: &Path,
        command: &str,
    ) -> Result<(bool, String), String> {
        let mut shell = tokio::process::Command::new("sh");
        shell
            .arg("-c")
            .arg(command)
            .current_dir(repo)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = shell
            .spawn()
            .map_err(|error| format!("Failed to spawn command: {error}"))?;

        let tail: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_tail_drain(stdout, Arc::clone(&tail)));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_tail_drain(stderr, Arc::clone(&tail)));
        }

        let status = child
            .wait()
            .await
            .map_err(|error| format!("Failed to wait for command: {error}"))?;
        for drain in drains {
            let _ = drain.await;
        }

        let output_tail = tail
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default();

        Ok((status.success(), output_tail))
    }

    /// Runs the repair agent on the host checkout. Its output streams on
    /// the `teams` channel under a repair pseudo-session id.
    async fn run_repair_agent(
        &self,
        project_id: &str,
        repo: &Path,
        prompt: &str,
    ) -> Result<(), String> {
        let repair_session_id = format!("repair-{project_id}");

        let mut std_command = self.backend.build_command(repo, prompt);
        std_command
            .current_dir(repo)
            .env(SESSION_ID_ENV, &repair_session_id)
            .process_group(0);
        let mut command = tokio::process::Command::from(std_command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|error| format!("Failed to spawn repair agent: {error}"))?;
        let pgid = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .unwrap_or(0);

        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_repair_drain(
                stdout,
                TeamStream::Stdout,
                self.hub.clone(),
                repair_session_id.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_repair_drain(
                stderr,
                TeamStream::Stderr,
                self.hub.clone(),
                repair_session_id.clone(),
            ));
        }

        let waited = tokio::time::timeout(self.config.repair_timeout, child.wait()).await;
        let status = match waited {
            Ok(result) => {
                result.map_err(|error| format!("Failed to wait for repair agent: {error}"))?
            }
            Err(_) => {
                let _ = stop_process_group(&mut child, pgid, self.config.stop_grace_period).await;
                for drain in drains {
                    let _ = drain.await;
                }

                return Err("repair agent timed out".to_string());
            }
        };
        for drain in drains {
            let _ = drain.await;
        }

        if status.success() {
            Ok(())
        } else {
            Err(format!(
                "repair agent exited with {}",
                status
                    .code()
                    .map_or_else(|| "signal".to_string(), |code| format!("code {code}"))
            ))
        }
    }

    /// Persists a phase transition, then publishes it.
    async fn set_phase(&self, project_id: &str, from: Phase, to: Phase) -> Result<(), String> {
        if !from.can_transition_to(to) {
            warn!(project_id, %from, %to, "unexpected phase transition");
        }

        self.db.update_project_phase(project_id, to).await?;
        let _ = self.hub.publish_event(
            CHANNEL_GM,
            &GmEvent::PhaseChange {
                project_id: project_id.to_string(),
                phase: to,
            },
        );
        self.log_info(project_id, &format!("phase change: {to}")).await;

        Ok(())
    }

    /// Terminal failure path: cancel sessions, auto-reject pending
    /// decisions, persist, publish.
    async fn fail_project(&self, project_id: &str, reason: &str, token: &CancellationToken) {
        token.cancel();
        let _ = self.gate.reject_all_pending(project_id).await;
        let _ = self
            .db
            .finish_project(project_id, Phase::Failed, Some(reason))
            .await;
        let _ = self.hub.publish_event(
            CHANNEL_GM,
            &GmEvent::PhaseChange {
                project_id: project_id.to_string(),
                phase: Phase::Failed,
            },
        );
        let _ = self.hub.publish_event(
            CHANNEL_GM,
            &GmEvent::ProjectFailed {
                project_id: project_id.to_string(),
                reason: reason.to_string(),
            },
        );
        let _ = self
            .db
            .append_log("warn", "gm", &format!("project {project_id} failed: {reason}"))
            .await;
        warn!(project_id, reason, "pipeline failed");
    }

    fn ensure_not_cancelled(&self, token: &CancellationToken) -> Result<(), String> {
        if token.is_cancelled() {
            return Err(CANCELLED_REASON.to_string());
        }

        Ok(())
    }

    async fn log_info(&self, project_id: &str, message: &str) {
        let _ = self
            .db
            .append_log("info", "gm", &format!("project {project_id}: {message}"))
            .await;
        self.hub.publish(
            CHANNEL_LOGS,
            json!({
                "type": "log",
                "level": "info",
                "source": "gm",
                "project_id": project_id,
                "message": message,
            }),
        );
    }
}

fn spawn_tail_drain<R>(
    source: R,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(source).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            push_bounded_line(&tail, &line, OUTPUT_TAIL_LIMIT);
        }
    })
}

fn spawn_repair_drain<R>(
    source: R,
    stream: TeamStream,
    hub: crate::infra::hub::EventHub,
    session_id: String,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(source).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            let _ = hub.publish_event(CHANNEL_TEAMS, &TeamEvent::line(&session_id, stream, &line));
        }
    })
}

fn push_bounded_line(tail: &Arc<Mutex<VecDeque<String>>>, line: &str, max_chars: usize) {
    let Ok(mut lines) = tail.lock() else {
        return;
    };

    lines.push_back(line.to_string());
    let mut used: usize = lines.iter().map(|entry| entry.len() + 1).sum();
    while used > max_chars && lines.len() > 1 {
        if let Some(dropped) = lines.pop_front() {
            used -= dropped.len() + 1;
        }
    }
}

fn truncate_tail(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }

    let mut start = text.len() - max_chars;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }

    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_tail_keeps_the_end() {
        // Arrange
        let text = "abcdefghij";

        // Act
        let tail = truncate_tail(text, 4);

        // Assert
        assert_eq!(tail, "ghij");
    }

    #[test]
    fn test_truncate_tail_respects_char_boundaries() {
        // Arrange
        let text = "héllo wörld";

        // Act
        let tail = truncate_tail(text, 5);

        // Assert
        assert!(tail.len() <= 5);
        assert!(text.ends_with(&tail));
    }

    #[test]
    fn test_push_bounded_line_drops_oldest_lines() {
        // Arrange
        let tail = Arc::new(Mutex::new(VecDeque::new()));

        // Act
        for n in 0..100 {
            push_bounded_line(&tail, &format!("line {n} {}", "x".repeat(50)), 200);
        }

        // Assert
        let lines = tail.lock().expect("failed to lock tail");
        assert!(lines.len() < 100);
        assert!(lines.back().expect("tail should be non-empty").contains("line 99"));
    }

    #[test]
    fn test_check_kind_maps_to_phase_and_decision() {
        // Act & Assert
        assert_eq!(CheckKind::Build.phase(), Phase::Building);
        assert_eq!(CheckKind::Test.phase(), Phase::Testing);
        assert_eq!(
            CheckKind::Build.decision_kind(),
            DecisionKind::BuildFailure
        );
        assert_eq!(CheckKind::Test.decision_kind(), DecisionKind::TestFailure);
    }

    #[test]
    fn test_repair_prompts_render_with_context() {
        // Arrange
        let command = "cargo test";
        let output_tail = "error: assertion failed";

        // Act
        let build_prompt = CheckKind::Build
            .render_prompt(command, output_tail)
            .expect("failed to render build prompt");
        let test_prompt = CheckKind::Test
            .render_prompt(command, output_tail)
            .expect("failed to render test prompt");

        // Assert
        assert!(build_prompt.contains("cargo test"));
        assert!(build_prompt.contains("assertion failed"));
        assert!(test_prompt.contains("Make the tests pass"));
    }
}
