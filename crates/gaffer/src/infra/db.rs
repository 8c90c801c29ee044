//! Database layer persisting pipeline state using `SQLite` via `SQLx`.
//!
//! One relational store backs every component: agent sessions, teammate
//! tasks, pipeline projects, pending decisions, and structured log rows.
//! Writes within a single method are atomic; reads see the latest committed
//! write.

use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::domain::decision::DecisionStatus;
use crate::domain::project::Phase;
use crate::domain::session::{MergeResult, SessionStatus, TeammateStatus};

/// Subdirectory under the gaffer home where the database file is stored.
pub const DB_DIR: &str = ".gaffer";

/// Default database filename.
pub const DB_FILE: &str = "gaffer.db";

/// Maximum number of pooled `SQLite` connections for the on-disk database.
///
/// A value greater than `1` allows observers to read while session
/// supervisors write output and status rows.
pub const DB_POOL_MAX_CONNECTIONS: u32 = 10;

/// Returns the current Unix timestamp in seconds.
pub fn unix_timestamp_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Thin wrapper around a `SQLite` connection pool providing query methods.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Row returned when loading a session from the `agent_sessions` table.
#[derive(Clone, Debug)]
pub struct SessionRow {
    pub branch: String,
    pub completed_at: Option<i64>,
    pub fail_reason: Option<String>,
    pub files_changed: String,
    pub id: String,
    pub merge_result: String,
    pub output: String,
    pub project_id: String,
    pub started_at: i64,
    pub status: String,
    pub task: String,
    pub team_name: String,
    pub worktree_path: String,
}

impl SessionRow {
    /// Parses the persisted status string.
    ///
    /// # Errors
    /// Returns an error when the stored value is not a known status.
    pub fn status_parsed(&self) -> Result<SessionStatus, String> {
        SessionStatus::from_str(&self.status)
    }

    /// Parses the persisted merge result string.
    ///
    /// # Errors
    /// Returns an error when the stored value is not a known merge result.
    pub fn merge_result_parsed(&self) -> Result<MergeResult, String> {
        MergeResult::from_str(&self.merge_result)
    }

    /// Parses the JSON-encoded changed-file list.
    pub fn files_changed_list(&self) -> Vec<String> {
        serde_json::from_str(&self.files_changed).unwrap_or_default()
    }

    /// Converts the raw row into the domain snapshot.
    ///
    /// # Errors
    /// Returns an error when a persisted enum value does not parse.
    pub fn into_session(self) -> Result<crate::domain::session::AgentSession, String> {
        Ok(crate::domain::session::AgentSession {
            branch: self.branch.clone(),
            completed_at: self.completed_at,
            fail_reason: self.fail_reason.clone(),
            files_changed: self.files_changed_list(),
            id: self.id.clone(),
            merge_result: self.merge_result_parsed()?,
            output: self.output.clone(),
            project_id: self.project_id.clone(),
            started_at: self.started_at,
            status: self.status_parsed()?,
            task: self.task.clone(),
            team_name: self.team_name.clone(),
            worktree_path: std::path::PathBuf::from(self.worktree_path),
        })
    }
}

/// Row returned when loading a teammate task.
#[derive(Clone, Debug)]
pub struct TeammateTaskRow {
    pub completed_at: Option<i64>,
    pub error: Option<String>,
    pub id: i64,
    pub output: String,
    pub role: String,
    pub session_id: String,
    pub started_at: Option<i64>,
    pub status: String,
    pub teammate: String,
}

impl TeammateTaskRow {
    /// Converts the raw row into the domain snapshot.
    ///
    /// # Errors
    /// Returns an error when the persisted status does not parse.
    pub fn into_teammate_task(self) -> Result<crate::domain::session::TeammateTask, String> {
        Ok(crate::domain::session::TeammateTask {
            completed_at: self.completed_at,
            error: self.error.clone(),
            id: self.id,
            output: self.output.clone(),
            role: self.role.clone(),
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            status: TeammateStatus::from_str(&self.status)?,
            teammate: self.teammate.clone(),
        })
    }
}

/// Row returned when loading a project from the `gm_projects` table.
#[derive(Clone, Debug)]
pub struct ProjectRow {
    pub agent_count: i64,
    pub build_attempts: i64,
    pub build_command: Option<String>,
    pub completed_at: Option<i64>,
    pub error_message: Option<String>,
    pub id: String,
    pub merge_order: String,
    pub merged_count: i64,
    pub name: String,
    pub phase: String,
    pub repo_path: String,
    pub started_at: i64,
    pub test_attempts: i64,
    pub test_command: Option<String>,
}

impl ProjectRow {
    /// Parses the persisted phase string.
    ///
    /// # Errors
    /// Returns an error when the stored value is not a known phase.
    pub fn phase_parsed(&self) -> Result<Phase, String> {
        Phase::from_str(&self.phase)
    }

    /// Parses the JSON-encoded merge order.
    pub fn merge_order_list(&self) -> Vec<String> {
        serde_json::from_str(&self.merge_order).unwrap_or_default()
    }

    /// Converts the raw row into the domain snapshot.
    ///
    /// # Errors
    /// Returns an error when a persisted enum value does not parse.
    pub fn into_project(self) -> Result<crate::domain::project::GmProject, String> {
        Ok(crate::domain::project::GmProject {
            agent_count: u32::try_from(self.agent_count).unwrap_or(0),
            build_attempts: u32::try_from(self.build_attempts).unwrap_or(0),
            build_command: self.build_command.clone(),
            completed_at: self.completed_at,
            error_message: self.error_message.clone(),
            id: self.id.clone(),
            merged_count: u32::try_from(self.merged_count).unwrap_or(0),
            merge_order: self.merge_order_list(),
            name: self.name.clone(),
            phase: self.phase_parsed()?,
            repo_path: std::path::PathBuf::from(self.repo_path),
            started_at: self.started_at,
            test_attempts: u32::try_from(self.test_attempts).unwrap_or(0),
            test_command: self.test_command.clone(),
        })
    }
}

/// Row returned when loading a decision from the `gm_decisions` table.
#[derive(Clone, Debug)]
pub struct DecisionRow {
    pub context: String,
    pub created_at: i64,
    pub description: String,
    pub id: String,
    pub kind: String,
    pub project_id: String,
    pub proposed_action: String,
    pub resolved_at: Option<i64>,
    pub status: String,
}

impl DecisionRow {
    /// Converts the raw row into the domain snapshot.
    ///
    /// # Errors
    /// Returns an error when a persisted enum value does not parse.
    pub fn into_decision(self) -> Result<crate::domain::decision::Decision, String> {
        Ok(crate::domain::decision::Decision {
            context: self.context.clone(),
            created_at: self.created_at,
            description: self.description.clone(),
            id: self.id.clone(),
            kind: crate::domain::decision::DecisionKind::from_str(&self.kind)?,
            project_id: self.project_id.clone(),
            proposed_action: self.proposed_action.clone(),
            resolved_at: self.resolved_at,
            status: DecisionStatus::from_str(&self.status)?,
        })
    }
}

/// Row returned when loading one structured log entry.
#[derive(Clone, Debug)]
pub struct LogRow {
    pub created_at: i64,
    pub id: i64,
    pub level: String,
    pub message: String,
    pub source: String,
}

impl Database {
    /// Opens the `SQLite` database and runs embedded migrations.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created, the database
    /// cannot be opened, or migrations fail.
    pub async fn open(db_path: &Path) -> Result<Self, String> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("Failed to create database directory: {err}"))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(DB_POOL_MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|err| format!("Failed to connect to database: {err}"))?;

        Self::from_pool(pool).await
    }

    /// Opens an in-memory database for tests.
    ///
    /// Limited to a single pooled connection so every handle sees the same
    /// in-memory database.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrations fail.
    pub async fn open_in_memory() -> Result<Self, String> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(options)
            .await
            .map_err(|err| format!("Failed to connect to in-memory database: {err}"))?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, String> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| format!("Failed to run migrations: {err}"))?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- agent_sessions -------------------------------------------------

    /// Inserts a newly created session row.
    ///
    /// # Errors
    /// Returns an error if the session row cannot be inserted.
    pub async fn insert_session(
        &self,
        id: &str,
        project_id: &str,
        team_name: &str,
        task: &str,
        branch: &str,
        worktree_path: &str,
        status: SessionStatus,
    ) -> Result<(), String> {
        sqlx::query(
            r"
INSERT INTO agent_sessions (id, project_id, team_name, task, branch, worktree_path, status, started_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?)
",
        )
        .bind(id)
        .bind(project_id)
        .bind(team_name)
        .bind(task)
        .bind(branch)
        .bind(worktree_path)
        .bind(status.to_string())
        .bind(unix_timestamp_now())
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to insert session: {err}"))?;

        Ok(())
    }

    /// Updates the lifecycle status of one session.
    ///
    /// # Errors
    /// Returns an error if the session row cannot be updated.
    pub async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> Result<(), String> {
        sqlx::query(
            r"
UPDATE agent_sessions
SET status = ?
WHERE id = ?
",
        )
        .bind(status.to_string())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to update session status: {err}"))?;

        Ok(())
    }

    /// Writes the terminal status, completion timestamp, and optional
    /// failure reason for one session.
    ///
    /// # Errors
    /// Returns an error if the session row cannot be updated.
    pub async fn finish_session(
        &self,
        id: &str,
        status: SessionStatus,
        fail_reason: Option<&str>,
    ) -> Result<(), String> {
        sqlx::query(
            r"
UPDATE agent_sessions
SET status = ?,
    fail_reason = ?,
    completed_at = ?
WHERE id = ?
",
        )
        .bind(status.to_string())
        .bind(fail_reason)
        .bind(unix_timestamp_now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to finish session: {err}"))?;

        Ok(())
    }

    /// Persists the finalised changed-file list for one session.
    ///
    /// # Errors
    /// Returns an error if serialization or the update fails.
    pub async fn set_session_files_changed(
        &self,
        id: &str,
        files_changed: &[String],
    ) -> Result<(), String> {
        let encoded = serde_json::to_string(files_changed)
            .map_err(|err| format!("Failed to encode files_changed: {err}"))?;

        sqlx::query(
            r"
UPDATE agent_sessions
SET files_changed = ?
WHERE id = ?
",
        )
        .bind(encoded)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to update session files_changed: {err}"))?;

        Ok(())
    }

    /// Records the merge outcome for one session.
    ///
    /// # Errors
    /// Returns an error if the session row cannot be updated.
    pub async fn set_session_merge_result(
        &self,
        id: &str,
        merge_result: MergeResult,
    ) -> Result<(), String> {
        sqlx::query(
            r"
UPDATE agent_sessions
SET merge_result = ?
WHERE id = ?
",
        )
        .bind(merge_result.to_string())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to update session merge result: {err}"))?;

        Ok(())
    }

    /// Replaces the persisted output transcript for one session.
    ///
    /// # Errors
    /// Returns an error if the session row cannot be updated.
    pub async fn set_session_output(&self, id: &str, output: &str) -> Result<(), String> {
        sqlx::query(
            r"
UPDATE agent_sessions
SET output = ?
WHERE id = ?
",
        )
        .bind(output)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to update session output: {err}"))?;

        Ok(())
    }

    /// Looks up a session by identifier.
    ///
    /// # Errors
    /// Returns an error if the lookup query fails.
    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRow>, String> {
        let row = sqlx::query(
            r"
SELECT branch,
       completed_at,
       fail_reason,
       files_changed,
       id,
       merge_result,
       output,
       project_id,
       started_at,
       status,
       task,
       team_name,
       worktree_path
FROM agent_sessions
WHERE id = ?
",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| format!("Failed to get session: {err}"))?;

        Ok(row.as_ref().map(Self::session_from_row))
    }

    /// Loads all sessions for one project ordered by start time.
    ///
    /// # Errors
    /// Returns an error if session rows cannot be read.
    pub async fn load_project_sessions(
        &self,
        project_id: &str,
    ) -> Result<Vec<SessionRow>, String> {
        let rows = sqlx::query(
            r"
SELECT branch,
       completed_at,
       fail_reason,
       files_changed,
       id,
       merge_result,
       output,
       project_id,
       started_at,
       status,
       task,
       team_name,
       worktree_path
FROM agent_sessions
WHERE project_id = ?
ORDER BY started_at, id
",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| format!("Failed to load project sessions: {err}"))?;

        Ok(rows.iter().map(Self::session_from_row).collect())
    }

    fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> SessionRow {
        SessionRow {
            branch: row.get("branch"),
            completed_at: row.get("completed_at"),
            fail_reason: row.get("fail_reason"),
            files_changed: row.get("files_changed"),
            id: row.get("id"),
            merge_result: row.get("merge_result"),
            output: row.get("output"),
            project_id: row.get("project_id"),
            started_at: row.get("started_at"),
            status: row.get("status"),
            task: row.get("task"),
            team_name: row.get("team_name"),
            worktree_path: row.get("worktree_path"),
        }
    }

    // ---- teammate_tasks -------------------------------------------------

    /// Inserts a pending teammate task and returns its row id.
    ///
    /// # Errors
    /// Returns an error if the task row cannot be inserted.
    pub async fn insert_teammate_task(
        &self,
        session_id: &str,
        teammate: &str,
        role: &str,
    ) -> Result<i64, String> {
        let result = sqlx::query(
            r"
INSERT INTO teammate_tasks (session_id, teammate, role, status)
VALUES (?, ?, ?, ?)
",
        )
        .bind(session_id)
        .bind(teammate)
        .bind(role)
        .bind(TeammateStatus::Pending.to_string())
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to insert teammate task: {err}"))?;

        Ok(result.last_insert_rowid())
    }

    /// Marks a teammate task as running.
    ///
    /// # Errors
    /// Returns an error if the task row cannot be updated.
    pub async fn mark_teammate_running(&self, task_id: i64) -> Result<(), String> {
        sqlx::query(
            r"
UPDATE teammate_tasks
SET status = ?,
    started_at = ?
WHERE id = ?
",
        )
        .bind(TeammateStatus::Running.to_string())
        .bind(unix_timestamp_now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to mark teammate task running: {err}"))?;

        Ok(())
    }

    /// Writes the terminal state for one teammate task.
    ///
    /// # Errors
    /// Returns an error if the task row cannot be updated.
    pub async fn finish_teammate_task(
        &self,
        task_id: i64,
        status: TeammateStatus,
        output: &str,
        error: Option<&str>,
    ) -> Result<(), String> {
        sqlx::query(
            r"
UPDATE teammate_tasks
SET status = ?,
    output = ?,
    error = ?,
    completed_at = ?
WHERE id = ?
",
        )
        .bind(status.to_string())
        .bind(output)
        .bind(error)
        .bind(unix_timestamp_now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to finish teammate task: {err}"))?;

        Ok(())
    }

    /// Loads all teammate tasks for one session in insertion order.
    ///
    /// # Errors
    /// Returns an error if task rows cannot be read.
    pub async fn load_teammate_tasks(
        &self,
        session_id: &str,
    ) -> Result<Vec<TeammateTaskRow>, String> {
        let rows = sqlx::query(
            r"
SELECT completed_at,
       error,
       id,
       output,
       role,
       session_id,
       started_at,
       status,
       teammate
FROM teammate_tasks
WHERE session_id = ?
ORDER BY id
",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| format!("Failed to load teammate tasks: {err}"))?;

        Ok(rows
            .iter()
            .map(|row| TeammateTaskRow {
                completed_at: row.get("completed_at"),
                error: row.get("error"),
                id: row.get("id"),
                output: row.get("output"),
                role: row.get("role"),
                session_id: row.get("session_id"),
                started_at: row.get("started_at"),
                status: row.get("status"),
                teammate: row.get("teammate"),
            })
            .collect())
    }

    // ---- gm_projects ----------------------------------------------------

    /// Inserts a newly launched project row.
    ///
    /// # Errors
    /// Returns an error if the project row cannot be inserted.
    pub async fn insert_project(
        &self,
        id: &str,
        name: &str,
        repo_path: &str,
        build_command: Option<&str>,
        test_command: Option<&str>,
        agent_count: u32,
        phase: Phase,
    ) -> Result<(), String> {
        sqlx::query(
            r"
INSERT INTO gm_projects (id, name, repo_path, build_command, test_command, agent_count, phase, started_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?)
",
        )
        .bind(id)
        .bind(name)
        .bind(repo_path)
        .bind(build_command)
        .bind(test_command)
        .bind(i64::from(agent_count))
        .bind(phase.to_string())
        .bind(unix_timestamp_now())
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to insert project: {err}"))?;

        Ok(())
    }

    /// Writes the current phase of one project.
    ///
    /// # Errors
    /// Returns an error if the project row cannot be updated.
    pub async fn update_project_phase(&self, id: &str, phase: Phase) -> Result<(), String> {
        sqlx::query(
            r"
UPDATE gm_projects
SET phase = ?
WHERE id = ?
",
        )
        .bind(phase.to_string())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to update project phase: {err}"))?;

        Ok(())
    }

    /// Persists the computed merge order verbatim.
    ///
    /// # Errors
    /// Returns an error if serialization or the update fails.
    pub async fn set_project_merge_order(
        &self,
        id: &str,
        merge_order: &[String],
    ) -> Result<(), String> {
        let encoded = serde_json::to_string(merge_order)
            .map_err(|err| format!("Failed to encode merge order: {err}"))?;

        sqlx::query(
            r"
UPDATE gm_projects
SET merge_order = ?
WHERE id = ?
",
        )
        .bind(encoded)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to update project merge order: {err}"))?;

        Ok(())
    }

    /// Writes the number of sessions merged so far.
    ///
    /// # Errors
    /// Returns an error if the project row cannot be updated.
    pub async fn set_project_merged_count(&self, id: &str, merged_count: u32) -> Result<(), String> {
        sqlx::query(
            r"
UPDATE gm_projects
SET merged_count = ?
WHERE id = ?
",
        )
        .bind(i64::from(merged_count))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to update project merged count: {err}"))?;

        Ok(())
    }

    /// Writes the number of build-command runs so far.
    ///
    /// # Errors
    /// Returns an error if the project row cannot be updated.
    pub async fn set_project_build_attempts(&self, id: &str, attempts: u32) -> Result<(), String> {
        sqlx::query(
            r"
UPDATE gm_projects
SET build_attempts = ?
WHERE id = ?
",
        )
        .bind(i64::from(attempts))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to update project build attempts: {err}"))?;

        Ok(())
    }

    /// Writes the number of test-command runs so far.
    ///
    /// # Errors
    /// Returns an error if the project row cannot be updated.
    pub async fn set_project_test_attempts(&self, id: &str, attempts: u32) -> Result<(), String> {
        sqlx::query(
            r"
UPDATE gm_projects
SET test_attempts = ?
WHERE id = ?
",
        )
        .bind(i64::from(attempts))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to update project test attempts: {err}"))?;

        Ok(())
    }

    /// Writes the terminal phase, completion timestamp, and optional error
    /// message for one project.
    ///
    /// # Errors
    /// Returns an error if the project row cannot be updated.
    pub async fn finish_project(
        &self,
        id: &str,
        phase: Phase,
        error_message: Option<&str>,
    ) -> Result<(), String> {
        sqlx::query(
            r"
UPDATE gm_projects
SET phase = ?,
    error_message = ?,
    completed_at = ?
WHERE id = ?
",
        )
        .bind(phase.to_string())
        .bind(error_message)
        .bind(unix_timestamp_now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to finish project: {err}"))?;

        Ok(())
    }

    /// Looks up a project by identifier.
    ///
    /// # Errors
    /// Returns an error if the lookup query fails.
    pub async fn get_project(&self, id: &str) -> Result<Option<ProjectRow>, String> {
        let row = sqlx::query(
            r"
SELECT agent_count,
       build_attempts,
       build_command,
       completed_at,
       error_message,
       id,
       merge_order,
       merged_count,
       name,
       phase,
       repo_path,
       started_at,
       test_attempts,
       test_command
FROM gm_projects
WHERE id = ?
",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| format!("Failed to get project: {err}"))?;

        Ok(row.as_ref().map(Self::project_from_row))
    }

    /// Loads projects newest-first with pagination.
    ///
    /// # Errors
    /// Returns an error if project rows cannot be read.
    pub async fn load_projects(&self, limit: u32, offset: u32) -> Result<Vec<ProjectRow>, String> {
        let rows = sqlx::query(
            r"
SELECT agent_count,
       build_attempts,
       build_command,
       completed_at,
       error_message,
       id,
       merge_order,
       merged_count,
       name,
       phase,
       repo_path,
       started_at,
       test_attempts,
       test_command
FROM gm_projects
ORDER BY started_at DESC, id DESC
LIMIT ? OFFSET ?
",
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(|err| format!("Failed to load projects: {err}"))?;

        Ok(rows.iter().map(Self::project_from_row).collect())
    }

    fn project_from_row(row: &sqlx::sqlite::SqliteRow) -> ProjectRow {
        ProjectRow {
            agent_count: row.get("agent_count"),
            build_attempts: row.get("build_attempts"),
            build_command: row.get("build_command"),
            completed_at: row.get("completed_at"),
            error_message: row.get("error_message"),
            id: row.get("id"),
            merge_order: row.get("merge_order"),
            merged_count: row.get("merged_count"),
            name: row.get("name"),
            phase: row.get("phase"),
            repo_path: row.get("repo_path"),
            started_at: row.get("started_at"),
            test_attempts: row.get("test_attempts"),
            test_command: row.get("test_command"),
        }
    }

    // ---- gm_decisions ---------------------------------------------------

    /// Inserts a pending decision row.
    ///
    /// # Errors
    /// Returns an error if the decision row cannot be inserted.
    pub async fn insert_decision(
        &self,
        id: &str,
        project_id: &str,
        kind: &str,
        description: &str,
        proposed_action: &str,
        context: &str,
    ) -> Result<(), String> {
        sqlx::query(
            r"
INSERT INTO gm_decisions (id, project_id, kind, description, proposed_action, context, status, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?)
",
        )
        .bind(id)
        .bind(project_id)
        .bind(kind)
        .bind(description)
        .bind(proposed_action)
        .bind(context)
        .bind(DecisionStatus::Pending.to_string())
        .bind(unix_timestamp_now())
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to insert decision: {err}"))?;

        Ok(())
    }

    /// Atomically transitions a decision out of `pending`.
    ///
    /// Returns `true` only for the call that won the transition; later calls
    /// leave the row untouched and return `false`.
    ///
    /// # Errors
    /// Returns an error if the update query fails.
    pub async fn resolve_decision(
        &self,
        id: &str,
        status: DecisionStatus,
    ) -> Result<bool, String> {
        let result = sqlx::query(
            r"
UPDATE gm_decisions
SET status = ?,
    resolved_at = ?
WHERE id = ? AND status = 'pending'
",
        )
        .bind(status.to_string())
        .bind(unix_timestamp_now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to resolve decision: {err}"))?;

        Ok(result.rows_affected() == 1)
    }

    /// Looks up a decision by identifier.
    ///
    /// # Errors
    /// Returns an error if the lookup query fails.
    pub async fn get_decision(&self, id: &str) -> Result<Option<DecisionRow>, String> {
        let row = sqlx::query(
            r"
SELECT context,
       created_at,
       description,
       id,
       kind,
       project_id,
       proposed_action,
       resolved_at,
       status
FROM gm_decisions
WHERE id = ?
",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| format!("Failed to get decision: {err}"))?;

        Ok(row.as_ref().map(Self::decision_from_row))
    }

    /// Loads still-pending decisions for one project oldest-first.
    ///
    /// # Errors
    /// Returns an error if decision rows cannot be read.
    pub async fn load_pending_decisions(
        &self,
        project_id: &str,
    ) -> Result<Vec<DecisionRow>, String> {
        let rows = sqlx::query(
            r"
SELECT context,
       created_at,
       description,
       id,
       kind,
       project_id,
       proposed_action,
       resolved_at,
       status
FROM gm_decisions
WHERE project_id = ? AND status = 'pending'
ORDER BY created_at, id
",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| format!("Failed to load pending decisions: {err}"))?;

        Ok(rows.iter().map(Self::decision_from_row).collect())
    }

    fn decision_from_row(row: &sqlx::sqlite::SqliteRow) -> DecisionRow {
        DecisionRow {
            context: row.get("context"),
            created_at: row.get("created_at"),
            description: row.get("description"),
            id: row.get("id"),
            kind: row.get("kind"),
            project_id: row.get("project_id"),
            proposed_action: row.get("proposed_action"),
            resolved_at: row.get("resolved_at"),
            status: row.get("status"),
        }
    }

    // ---- logs -----------------------------------------------------------

    /// Appends one structured log entry.
    ///
    /// # Errors
    /// Returns an error if the log row cannot be inserted.
    pub async fn append_log(&self, level: &str, source: &str, message: &str) -> Result<(), String> {
        sqlx::query(
            r"
INSERT INTO logs (created_at, level, source, message)
VALUES (?, ?, ?, ?)
",
        )
        .bind(unix_timestamp_now())
        .bind(level)
        .bind(source)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to append log: {err}"))?;

        Ok(())
    }

    /// Loads the most recent log entries, newest first.
    ///
    /// # Errors
    /// Returns an error if log rows cannot be read.
    pub async fn load_recent_logs(&self, limit: u32) -> Result<Vec<LogRow>, String> {
        let rows = sqlx::query(
            r"
SELECT created_at,
       id,
       level,
       message,
       source
FROM logs
ORDER BY id DESC
LIMIT ?
",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|err| format!("Failed to load logs: {err}"))?;

        Ok(rows
            .iter()
            .map(|row| LogRow {
                created_at: row.get("created_at"),
                id: row.get("id"),
                level: row.get("level"),
                message: row.get("message"),
                source: row.get("source"),
            })
            .collect())
    }

    // ---- startup recovery -----------------------------------------------

    /// Marks projects, sessions, and decisions left non-terminal by a
    /// previous process run as interrupted.
    ///
    /// # Errors
    /// Returns an error if any of the sweep updates fail.
    pub async fn fail_interrupted_projects(&self) -> Result<(), String> {
        let now = unix_timestamp_now();

        sqlx::query(
            r"
UPDATE agent_sessions
SET status = 'failed',
    fail_reason = 'interrupted',
    completed_at = ?
WHERE status IN ('pending', 'running')
",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to fail interrupted sessions: {err}"))?;

        sqlx::query(
            r"
UPDATE gm_decisions
SET status = 'rejected',
    resolved_at = ?
WHERE status = 'pending'
",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to reject interrupted decisions: {err}"))?;

        sqlx::query(
            r"
UPDATE gm_projects
SET phase = 'failed',
    error_message = 'interrupted',
    completed_at = ?
WHERE phase NOT IN ('completed', 'failed')
",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|err| format!("Failed to fail interrupted projects: {err}"))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn insert_test_project(db: &Database, id: &str) {
        db.insert_project(id, "demo", "/tmp/repo", None, None, 2, Phase::Launching)
            .await
            .expect("failed to insert project");
    }

    #[tokio::test]
    async fn test_insert_and_get_session() {
        // Arrange
        let db = Database::open_in_memory().await.expect("failed to open db");
        insert_test_project(&db, "p1").await;

        // Act
        db.insert_session(
            "s1",
            "p1",
            "solo",
            "refactor the parser",
            "gaffer/s1",
            "/tmp/repo/.worktrees/s1",
            SessionStatus::Pending,
        )
        .await
        .expect("failed to insert session");
        let session = db
            .get_session("s1")
            .await
            .expect("failed to get session")
            .expect("session should exist");

        // Assert
        assert_eq!(session.project_id, "p1");
        assert_eq!(session.branch, "gaffer/s1");
        assert_eq!(
            session.status_parsed().expect("failed to parse status"),
            SessionStatus::Pending
        );
        assert!(session.files_changed_list().is_empty());
        assert_eq!(
            session
                .merge_result_parsed()
                .expect("failed to parse merge result"),
            MergeResult::Unset
        );
    }

    #[tokio::test]
    async fn test_finish_session_records_reason_and_timestamp() {
        // Arrange
        let db = Database::open_in_memory().await.expect("failed to open db");
        insert_test_project(&db, "p1").await;
        db.insert_session("s1", "p1", "solo", "task", "gaffer/s1", "/wt", SessionStatus::Running)
            .await
            .expect("failed to insert session");

        // Act
        db.finish_session("s1", SessionStatus::Failed, Some("resource_exhaustion"))
            .await
            .expect("failed to finish session");
        let session = db
            .get_session("s1")
            .await
            .expect("failed to get session")
            .expect("session should exist");

        // Assert
        assert_eq!(session.status, "failed");
        assert_eq!(session.fail_reason.as_deref(), Some("resource_exhaustion"));
        assert!(session.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_load_project_sessions_orders_by_started_at() {
        // Arrange
        let db = Database::open_in_memory().await.expect("failed to open db");
        insert_test_project(&db, "p1").await;
        for id in ["s-b", "s-a", "s-c"] {
            db.insert_session(id, "p1", "solo", "task", "branch", "/wt", SessionStatus::Running)
                .await
                .expect("failed to insert session");
        }

        // Act
        let sessions = db
            .load_project_sessions("p1")
            .await
            .expect("failed to load sessions");

        // Assert: identical timestamps fall back to id order.
        let ids: Vec<&str> = sessions.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, vec!["s-a", "s-b", "s-c"]);
    }

    #[tokio::test]
    async fn test_files_changed_round_trips_as_json() {
        // Arrange
        let db = Database::open_in_memory().await.expect("failed to open db");
        insert_test_project(&db, "p1").await;
        db.insert_session("s1", "p1", "solo", "task", "branch", "/wt", SessionStatus::Running)
            .await
            .expect("failed to insert session");
        let files = vec!["src/lib.rs".to_string(), "src/main.rs".to_string()];

        // Act
        db.set_session_files_changed("s1", &files)
            .await
            .expect("failed to set files changed");
        let session = db
            .get_session("s1")
            .await
            .expect("failed to get session")
            .expect("session should exist");

        // Assert
        assert_eq!(session.files_changed_list(), files);
    }

    #[tokio::test]
    async fn test_teammate_task_lifecycle() {
        // Arrange
        let db = Database::open_in_memory().await.expect("failed to open db");
        insert_test_project(&db, "p1").await;
        db.insert_session("s1", "p1", "solo", "task", "branch", "/wt", SessionStatus::Running)
            .await
            .expect("failed to insert session");

        // Act
        let task_id = db
            .insert_teammate_task("s1", "worker", "implement")
            .await
            .expect("failed to insert task");
        db.mark_teammate_running(task_id)
            .await
            .expect("failed to mark running");
        db.finish_teammate_task(task_id, TeammateStatus::Completed, "done", None)
            .await
            .expect("failed to finish task");
        let tasks = db
            .load_teammate_tasks("s1")
            .await
            .expect("failed to load tasks");

        // Assert
        assert_eq!(tasks.len(), 1);
        let task = tasks[0]
            .clone()
            .into_teammate_task()
            .expect("failed to convert task");
        assert_eq!(task.status, TeammateStatus::Completed);
        assert_eq!(task.output, "done");
        assert_eq!(task.teammate, "worker");
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_project_merge_order_round_trips() {
        // Arrange
        let db = Database::open_in_memory().await.expect("failed to open db");
        insert_test_project(&db, "p1").await;
        let order = vec!["s2".to_string(), "s1".to_string()];

        // Act
        db.set_project_merge_order("p1", &order)
            .await
            .expect("failed to set merge order");
        let project = db
            .get_project("p1")
            .await
            .expect("failed to get project")
            .expect("project should exist");

        // Assert
        assert_eq!(project.merge_order_list(), order);
    }

    #[tokio::test]
    async fn test_load_projects_paginates_newest_first() {
        // Arrange
        let db = Database::open_in_memory().await.expect("failed to open db");
        for id in ["p1", "p2", "p3"] {
            insert_test_project(&db, id).await;
        }

        // Act
        let first_page = db.load_projects(2, 0).await.expect("failed to load");
        let second_page = db.load_projects(2, 2).await.expect("failed to load");

        // Assert: identical timestamps fall back to id descending.
        let first_ids: Vec<&str> = first_page.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(first_ids, vec!["p3", "p2"]);
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].id, "p1");
    }

    #[tokio::test]
    async fn test_resolve_decision_is_atomic_and_idempotent() {
        // Arrange
        let db = Database::open_in_memory().await.expect("failed to open db");
        insert_test_project(&db, "p1").await;
        db.insert_decision("d1", "p1", "merge_conflict", "desc", "resolve", "ctx")
            .await
            .expect("failed to insert decision");

        // Act
        let first = db
            .resolve_decision("d1", DecisionStatus::Approved)
            .await
            .expect("failed to resolve");
        let second = db
            .resolve_decision("d1", DecisionStatus::Rejected)
            .await
            .expect("failed to resolve twice");
        let decision = db
            .get_decision("d1")
            .await
            .expect("failed to get decision")
            .expect("decision should exist");

        // Assert: the losing call must not overwrite the outcome.
        assert!(first);
        assert!(!second);
        assert_eq!(decision.status, "approved");
        assert!(decision.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_load_pending_decisions_excludes_resolved() {
        // Arrange
        let db = Database::open_in_memory().await.expect("failed to open db");
        insert_test_project(&db, "p1").await;
        db.insert_decision("d1", "p1", "build_failure", "desc", "retry", "ctx")
            .await
            .expect("failed to insert decision");
        db.insert_decision("d2", "p1", "test_failure", "desc", "retry", "ctx")
            .await
            .expect("failed to insert decision");
        db.resolve_decision("d1", DecisionStatus::Rejected)
            .await
            .expect("failed to resolve");

        // Act
        let pending = db
            .load_pending_decisions("p1")
            .await
            .expect("failed to load pending");

        // Assert
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "d2");
    }

    #[tokio::test]
    async fn test_fail_interrupted_projects_sweeps_non_terminal_rows() {
        // Arrange
        let db = Database::open_in_memory().await.expect("failed to open db");
        insert_test_project(&db, "p1").await;
        db.insert_session("s1", "p1", "solo", "task", "branch", "/wt", SessionStatus::Running)
            .await
            .expect("failed to insert session");
        db.insert_decision("d1", "p1", "merge_conflict", "desc", "resolve", "ctx")
            .await
            .expect("failed to insert decision");

        // Act
        db.fail_interrupted_projects()
            .await
            .expect("failed to sweep");
        let project = db
            .get_project("p1")
            .await
            .expect("failed to get project")
            .expect("project should exist");
        let session = db
            .get_session("s1")
            .await
            .expect("failed to get session")
            .expect("session should exist");
        let decision = db
            .get_decision("d1")
            .await
            .expect("failed to get decision")
            .expect("decision should exist");

        // Assert
        assert_eq!(project.phase, "failed");
        assert_eq!(project.error_message.as_deref(), Some("interrupted"));
        assert_eq!(session.status, "failed");
        assert_eq!(session.fail_reason.as_deref(), Some("interrupted"));
        assert_eq!(decision.status, "rejected");
    }

    #[tokio::test]
    async fn test_rows_convert_into_domain_snapshots() {
        // Arrange
        let db = Database::open_in_memory().await.expect("failed to open db");
        insert_test_project(&db, "p1").await;
        db.insert_session("s1", "p1", "solo", "task", "gaffer/s1", "/wt", SessionStatus::Running)
            .await
            .expect("failed to insert session");
        db.insert_teammate_task("s1", "worker", "implement")
            .await
            .expect("failed to insert teammate task");
        db.insert_decision("d1", "p1", "test_failure", "desc", "repair", "ctx")
            .await
            .expect("failed to insert decision");

        // Act
        let session = db
            .get_session("s1")
            .await
            .expect("failed to get session")
            .expect("session should exist")
            .into_session()
            .expect("failed to convert session");
        let project = db
            .get_project("p1")
            .await
            .expect("failed to get project")
            .expect("project should exist")
            .into_project()
            .expect("failed to convert project");
        let decision = db
            .get_decision("d1")
            .await
            .expect("failed to get decision")
            .expect("decision should exist")
            .into_decision()
            .expect("failed to convert decision");
        let tasks = db
            .load_teammate_tasks("s1")
            .await
            .expect("failed to load teammate tasks");
        let task = tasks
            .first()
            .expect("teammate task should exist")
            .clone()
            .into_teammate_task()
            .expect("failed to convert teammate task");

        // Assert
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.merge_result, MergeResult::Unset);
        assert_eq!(project.phase, Phase::Launching);
        assert_eq!(project.agent_count, 2);
        assert_eq!(
            decision.kind,
            crate::domain::decision::DecisionKind::TestFailure
        );
        assert_eq!(decision.status, DecisionStatus::Pending);
        assert_eq!(task.status, TeammateStatus::Pending);
        assert_eq!(task.session_id, "s1");
    }

    #[tokio::test]
    async fn test_append_and_load_logs() {
        // Arrange
        let db = Database::open_in_memory().await.expect("failed to open db");

        // Act
        db.append_log("info", "pipeline", "phase change: merging")
            .await
            .expect("failed to append log");
        db.append_log("warn", "launcher", "session timeout")
            .await
            .expect("failed to append log");
        let logs = db.load_recent_logs(10).await.expect("failed to load logs");

        // Assert: newest first.
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].source, "launcher");
        assert_eq!(logs[1].message, "phase change: merging");
    }
}
