//! Per-session subprocess supervision.
//!
//! Each launched session gets an isolated worktree branch, one supervisor
//! task, and two stream-drain tasks. The supervisor runs the template's
//! teammates sequentially, enforces wall-clock timeouts with a
//! graceful-stop → hard-kill escalation against the whole process group,
//! watches output for host resource exhaustion, auto-commits leftovers,
//! and finalises the session row.

use std::collections::{HashMap, VecDeque};
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt as _, AsyncRead};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app::AppConfig;
use crate::domain::event::{CHANNEL_TEAMS, TeamEvent, TeamStream};
use crate::domain::session::{SessionStatus, TeammateStatus};
use crate::domain::team::{TeamTemplate, TeammateSpec};
use crate::infra::agent::{AgentBackend, SESSION_ID_ENV, SHARED_ARTIFACT_DIR_ENV};
use crate::infra::db::Database;
use crate::infra::git;
use crate::infra::hub::EventHub;

/// Commit message used when a session leaves uncommitted changes behind.
pub const AUTO_COMMIT_MESSAGE: &str = "gaffer: session changes";

/// Failure reason recorded when the resource watchdog killed the session.
pub const RESOURCE_EXHAUSTION_REASON: &str = "resource_exhaustion";

/// Failure reason recorded when the wall-clock timeout expired.
pub const SESSION_TIMEOUT_REASON: &str = "session_timeout";

/// Lowercase substrings indicating host resource exhaustion.
const RESOURCE_EXHAUSTION_PATTERNS: &[&str] = &[
    "no space left on device",
    "cannot allocate memory",
    "enospc",
    "disk quota exceeded",
    "out of memory",
];

/// Pattern hits within one session before the watchdog escalates.
const RESOURCE_EXHAUSTION_THRESHOLD: usize = 2;

/// Character budget for the output tail stored on a teammate task row.
const TEAMMATE_OUTPUT_TAIL: usize = 2048;

/// One launched session: its id plus the supervisor join handle.
pub struct LaunchedSession {
    pub session_id: String,
    pub handle: JoinHandle<()>,
}

/// Terminal classification of one supervised session.
#[derive(Clone, Debug)]
struct SessionOutcome {
    exit_code: Option<i32>,
    fail_reason: Option<String>,
    status: SessionStatus,
}

impl SessionOutcome {
    fn completed(exit_code: Option<i32>) -> Self {
        Self {
            exit_code,
            fail_reason: None,
            status: SessionStatus::Completed,
        }
    }

    fn failed(exit_code: Option<i32>, reason: String) -> Self {
        Self {
            exit_code,
            fail_reason: Some(reason),
            status: SessionStatus::Failed,
        }
    }

    fn cancelled() -> Self {
        Self {
            exit_code: None,
            fail_reason: Some("cancelled".to_string()),
            status: SessionStatus::Cancelled,
        }
    }
}

/// Everything one supervisor task needs, owned.
struct SessionContext {
    backend: Arc<dyn AgentBackend>,
    branch: String,
    cancel: CancellationToken,
    config: Arc<AppConfig>,
    db: Database,
    hub: EventHub,
    repo_path: PathBuf,
    session_id: String,
    task: String,
    teammates: Vec<TeammateSpec>,
    worktree_path: PathBuf,
}

/// Matches output lines against resource-exhaustion patterns and escalates
/// to a hard kill after repeated hits.
struct ResourceWatchdog {
    fired: AtomicBool,
    hits: AtomicUsize,
    hub: EventHub,
    pgid: i32,
    session_id: String,
}

impl ResourceWatchdog {
    fn observe(&self, line: &str) {
        let lower = line.to_ascii_lowercase();
        let Some(pattern) = RESOURCE_EXHAUSTION_PATTERNS
            .iter()
            .find(|pattern| lower.contains(*pattern))
        else {
            return;
        };

        let hits = self.hits.fetch_add(1, Ordering::AcqRel) + 1;
        if hits < RESOURCE_EXHAUSTION_THRESHOLD {
            warn!(
                session_id = self.session_id.as_str(),
                pattern = *pattern,
                "resource exhaustion pattern observed"
            );
            return;
        }

        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.hub.publish_event(
            CHANNEL_TEAMS,
            &TeamEvent::ResourceError {
                session_id: self.session_id.clone(),
                pattern: (*pattern).to_string(),
            },
        );
        warn!(
            session_id = self.session_id.as_str(),
            pattern = *pattern,
            "resource exhaustion threshold reached, killing session"
        );
        send_signal_to_group(self.pgid, Signal::SIGKILL);
    }

    fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Shared state for one stream-drain task.
#[derive(Clone)]
struct StreamContext {
    hub: EventHub,
    ring: Arc<Mutex<VecDeque<String>>>,
    ring_capacity: usize,
    session_id: String,
    watchdog: Arc<ResourceWatchdog>,
}

impl StreamContext {
    fn push_line(&self, stream: TeamStream, line: &str) {
        if let Ok(mut ring) = self.ring.lock() {
            if ring.len() >= self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(line.to_string());
        }

        let _ = self
            .hub
            .publish_event(CHANNEL_TEAMS, &TeamEvent::line(&self.session_id, stream, line));
        self.watchdog.observe(line);
    }
}

/// Supervises one agent subprocess per session.
#[derive(Clone)]
pub struct TeamLauncher {
    backend: Arc<dyn AgentBackend>,
    config: Arc<AppConfig>,
    db: Database,
    hub: EventHub,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl TeamLauncher {
    /// Creates a launcher over the shared services.
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        config: Arc<AppConfig>,
        db: Database,
        hub: EventHub,
    ) -> Self {
        Self {
            backend,
            config,
            db,
            hub,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Launches one agent session on its own worktree branch.
    ///
    /// Always returns a session id: setup failures (worktree creation) are
    /// recorded as a failed session with an already-finished handle, so the
    /// caller's waiting phase treats every launch uniformly.
    ///
    /// # Errors
    /// Returns an error only when the session row itself cannot be written.
    pub async fn launch(
        &self,
        project_id: &str,
        template: &TeamTemplate,
        task: &str,
        repo_path: &Path,
        parent_cancel: &CancellationToken,
    ) -> Result<LaunchedSession, String> {
        let session_id = Uuid::new_v4().to_string();
        let branch = format!("{}/{}", self.config.branch_prefix, session_id);
        let worktree_path = repo_path
            .join(&self.config.worktrees_dir)
            .join(&session_id);

        self.ensure_worktrees_root(repo_path)?;

        if let Err(error) = git::create_worktree(
            repo_path.to_path_buf(),
            worktree_path.clone(),
            branch.clone(),
        )
        .await
        {
            self.db
                .insert_session(
                    &session_id,
                    project_id,
                    &template.name,
                    task,
                    &branch,
                    &worktree_path.to_string_lossy(),
                    SessionStatus::Failed,
                )
                .await?;
            self.db
                .finish_session(&session_id, SessionStatus::Failed, Some(error.as_str()))
                .await?;
            let _ = self.hub.publish_event(
                CHANNEL_TEAMS,
                &TeamEvent::completed(&session_id, SessionStatus::Failed, None),
            );
            warn!(
                session_id = session_id.as_str(),
                error = error.as_str(),
                "worktree creation failed"
            );

            return Ok(LaunchedSession {
                session_id,
                handle: tokio::spawn(async {}),
            });
        }

        self.db
            .insert_session(
                &session_id,
                project_id,
                &template.name,
                task,
                &branch,
                &worktree_path.to_string_lossy(),
                SessionStatus::Running,
            )
            .await?;

        let cancel = parent_cancel.child_token();
        if let Ok(mut running) = self.running.lock() {
            running.insert(session_id.clone(), cancel.clone());
        }

        let context = SessionContext {
            backend: Arc::clone(&self.backend),
            branch,
            cancel,
            config: Arc::clone(&self.config),
            db: self.db.clone(),
            hub: self.hub.clone(),
            repo_path: repo_path.to_path_buf(),
            session_id: session_id.clone(),
            task: task.to_string(),
            teammates: template.teammates.clone(),
            worktree_path,
        };
        let running = Arc::clone(&self.running);
        let handle = tokio::spawn(async move {
            let session_id = context.session_id.clone();
            Self::supervise(context).await;
            if let Ok(mut running) = running.lock() {
                running.remove(&session_id);
            }
        });

        debug!(session_id = session_id.as_str(), "session launched");

        Ok(LaunchedSession { session_id, handle })
    }

    /// Requests cancellation of one running session. Idempotent.
    pub fn cancel(&self, session_id: &str) {
        if let Ok(running) = self.running.lock()
            && let Some(token) = running.get(session_id)
        {
            token.cancel();
        }
    }

    /// Requests cancellation of every running session (shutdown path).
    pub fn cancel_all(&self) {
        if let Ok(running) = self.running.lock() {
            for token in running.values() {
                token.cancel();
            }
        }
    }

    /// Returns the number of sessions with a live supervisor.
    pub fn running_count(&self) -> usize {
        self.running.lock().map(|running| running.len()).unwrap_or(0)
    }

    /// Creates the worktrees root with a self-ignoring `.gitignore`, so
    /// staging everything in the host checkout never swallows worktrees.
    fn ensure_worktrees_root(&self, repo_path: &Path) -> Result<(), String> {
        let root = repo_path.join(&self.config.worktrees_dir);
        std::fs::create_dir_all(&root)
            .map_err(|error| format!("Failed to create worktrees root: {error}"))?;

        let gitignore = root.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, "*\n")
                .map_err(|error| format!("Failed to write worktrees .gitignore: {error}"))?;
        }

        Ok(())
    }

    async fn supervise(context: SessionContext) {
        let ring: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        let outcome = Self::run_teammates(&context, &ring).await;
        Self::finalize(&context, &ring, outcome).await;
    }

    async fn run_teammates(
        context: &SessionContext,
        ring: &Arc<Mutex<VecDeque<String>>>,
    ) -> SessionOutcome {
        let mut last_exit_code = None;

        for spec in &context.teammates {
            let task_row_id = match context
                .db
                .insert_teammate_task(&context.session_id, &spec.name, &spec.role)
                .await
            {
                Ok(id) => id,
                Err(error) => {
                    return SessionOutcome::failed(None, format!("store_io_error: {error}"));
                }
            };
            let _ = context.db.mark_teammate_running(task_row_id).await;

            let outcome = Self::run_one_teammate(context, ring, spec).await;
            let tail = ring_tail(ring, TEAMMATE_OUTPUT_TAIL);

            match outcome {
                Ok(exit_code) => {
                    last_exit_code = exit_code;
                    let _ = context
                        .db
                        .finish_teammate_task(task_row_id, TeammateStatus::Completed, &tail, None)
                        .await;
                }
                Err(session_outcome) => {
                    let _ = context
                        .db
                        .finish_teammate_task(
                            task_row_id,
                            TeammateStatus::Failed,
                            &tail,
                            session_outcome.fail_reason.as_deref(),
                        )
                        .await;

                    return session_outcome;
                }
            }
        }

        SessionOutcome::completed(last_exit_code)
    }

    /// Runs one teammate subprocess to completion.
    ///
    /// Returns the exit code on success, or the terminal session outcome on
    /// any failure (which aborts the remaining teammates).
    async fn run_one_teammate(
        context: &SessionContext,
        ring: &Arc<Mutex<VecDeque<String>>>,
        spec: &TeammateSpec,
    ) -> Result<Option<i32>, SessionOutcome> {
        let prompt = compose_prompt(&spec.role, &context.task);

        let mut std_command = context.backend.build_command(&context.worktree_path, &prompt);
        std_command
            .current_dir(&context.worktree_path)
            .env(SESSION_ID_ENV, &context.session_id)
            .process_group(0);
        if let Some(dir) = &context.config.shared_artifact_dir {
            std_command.env(SHARED_ARTIFACT_DIR_ENV, dir);
        }

        let mut command = tokio::process::Command::from(std_command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                return Err(SessionOutcome::failed(
                    None,
                    format!("subprocess_spawn_failed: {error}"),
                ));
            }
        };

        let pgid = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .unwrap_or(0);
        let watchdog = Arc::new(ResourceWatchdog {
            fired: AtomicBool::new(false),
            hits: AtomicUsize::new(0),
            hub: context.hub.clone(),
            pgid,
            session_id: context.session_id.clone(),
        });
        let stream_context = StreamContext {
            hub: context.hub.clone(),
            ring: Arc::clone(ring),
            ring_capacity: context.config.output_ring_capacity,
            session_id: context.session_id.clone(),
            watchdog: Arc::clone(&watchdog),
        };

        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_stream_drain(
                stdout,
                TeamStream::Stdout,
                stream_context.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_stream_drain(
                stderr,
                TeamStream::Stderr,
                stream_context,
            ));
        }

        enum Wait {
            Exited(std::io::Result<ExitStatus>),
            Cancelled,
            TimedOut,
        }

        let timeout = Duration::from_secs(spec.timeout_seconds.max(1));
        let waited = tokio::select! {
            status = child.wait() => Wait::Exited(status),
            () = context.cancel.cancelled() => Wait::Cancelled,
            () = tokio::time::sleep(timeout) => Wait::TimedOut,
        };

        let grace = context.config.stop_grace_period;
        let (exit_status, cancelled, timed_out) = match waited {
            Wait::Exited(result) => (result.ok(), false, false),
            Wait::Cancelled => {
                let status = stop_process_group(&mut child, pgid, grace).await;
                (status, true, false)
            }
            Wait::TimedOut => {
                let status = stop_process_group(&mut child, pgid, grace).await;
                (status, false, true)
            }
        };

        // Drains finish at stream EOF; join them before classifying so a
        // late watchdog hit is not missed.
        for drain in drains {
            let _ = drain.await;
        }

        if cancelled {
            return Err(SessionOutcome::cancelled());
        }
        if watchdog.fired() {
            return Err(SessionOutcome::failed(
                exit_status.and_then(|status| status.code()),
                RESOURCE_EXHAUSTION_REASON.to_string(),
            ));
        }
        if timed_out {
            return Err(SessionOutcome::failed(
                None,
                SESSION_TIMEOUT_REASON.to_string(),
            ));
        }

        match exit_status {
            Some(status) if status.success() => Ok(status.code()),
            Some(status) => Err(SessionOutcome::failed(
                status.code(),
                format!(
                    "agent exited with {}",
                    status
                        .code()
                        .map_or_else(|| "signal".to_string(), |code| format!("code {code}"))
                ),
            )),
            None => Err(SessionOutcome::failed(
                None,
                "failed to await agent process".to_string(),
            )),
        }
    }

    /// Termination path: auto-commit, cleanup, finalise the row, publish
    /// the terminal event.
    async fn finalize(
        context: &SessionContext,
        ring: &Arc<Mutex<VecDeque<String>>>,
        outcome: SessionOutcome,
    ) {
        match git::auto_commit(context.worktree_path.clone(), AUTO_COMMIT_MESSAGE.to_string())
            .await
        {
            Ok(committed) => {
                if committed {
                    debug!(
                        session_id = context.session_id.as_str(),
                        "auto-committed leftover changes"
                    );
                }
            }
            Err(error) => {
                warn!(
                    session_id = context.session_id.as_str(),
                    error = error.as_str(),
                    "auto-commit failed"
                );
            }
        }

        if let Some(build_output_dir) = &context.config.build_output_dir {
            let target = context.worktree_path.join(build_output_dir);
            if target.exists() {
                let _ = std::fs::remove_dir_all(&target);
            }
        }

        match git::changed_files(
            context.repo_path.clone(),
            context.worktree_path.clone(),
            context.branch.clone(),
        )
        .await
        {
            Ok(files) => {
                let _ = context
                    .db
                    .set_session_files_changed(&context.session_id, &files)
                    .await;
            }
            Err(error) => {
                warn!(
                    session_id = context.session_id.as_str(),
                    error = error.as_str(),
                    "failed to finalise changed files"
                );
            }
        }

        let transcript = ring
            .lock()
            .map(|ring| ring.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default();
        let _ = context
            .db
            .set_session_output(&context.session_id, &transcript)
            .await;

        let _ = context
            .db
            .finish_session(
                &context.session_id,
                outcome.status,
                outcome.fail_reason.as_deref(),
            )
            .await;

        let terminal_event = if outcome.status == SessionStatus::Cancelled {
            TeamEvent::cancelled(&context.session_id)
        } else {
            TeamEvent::completed(&context.session_id, outcome.status, outcome.exit_code)
        };
        let _ = context.hub.publish_event(CHANNEL_TEAMS, &terminal_event);
    }
}

/// Composes the prompt for one teammate from its role and the session task.
fn compose_prompt(role: &str, task: &str) -> String {
    if role.trim().is_empty() {
        return task.to_string();
    }

    format!("{role}\n\nTask: {task}")
}

fn spawn_stream_drain<R>(source: R, stream: TeamStream, context: StreamContext) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(source).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            context.push_line(stream, &line);
        }
    })
}

fn ring_tail(ring: &Arc<Mutex<VecDeque<String>>>, max_chars: usize) -> String {
    let Ok(ring) = ring.lock() else {
        return String::new();
    };

    let mut tail: Vec<&str> = Vec::new();
    let mut used = 0usize;
    for line in ring.iter().rev() {
        used += line.len() + 1;
        if used > max_chars && !tail.is_empty() {
            break;
        }
        tail.push(line);
        if used > max_chars {
            break;
        }
    }
    tail.reverse();

    tail.join("\n")
}

/// Sends a graceful stop to the process group, then a hard kill after the
/// grace period.
pub(crate) async fn stop_process_group(
    child: &mut tokio::process::Child,
    pgid: i32,
    grace: Duration,
) -> Option<ExitStatus> {
    send_signal_to_group(pgid, Signal::SIGTERM);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(result) => result.ok(),
        Err(_) => {
            send_signal_to_group(pgid, Signal::SIGKILL);
            child.wait().await.ok()
        }
    }
}

fn send_signal_to_group(pgid: i32, signal: Signal) {
    if pgid <= 0 {
        return;
    }

    if let Err(error) = killpg(Pid::from_raw(pgid), signal) {
        debug!(pgid, %signal, %error, "failed to signal process group");
    }
}
