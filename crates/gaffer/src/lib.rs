//! Gaffer orchestrates multiple AI coding agents against one repository,
//! each confined to its own git worktree branch, then integrates their work
//! under human approval gates.

pub mod app;
pub mod domain;
pub mod infra;

pub use app::pipeline::ProjectRun;
pub use app::{AppConfig, GeneralManager};
pub use domain::team::{AgentAssignment, LaunchRequest, TeamRegistry, TeamTemplate};
pub use infra::db::Database;
pub use infra::hub::EventHub;
