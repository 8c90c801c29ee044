use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default wall-clock timeout for one teammate subprocess.
pub const DEFAULT_TEAMMATE_TIMEOUT_SECONDS: u64 = 300;

/// One named role inside a team template.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeammateSpec {
    /// Teammate name (unique within the template).
    pub name: String,
    /// Role description prepended to the session task prompt.
    pub role: String,
    /// Wall-clock timeout for this teammate's subprocess.
    #[serde(default = "default_teammate_timeout")]
    pub timeout_seconds: u64,
}

fn default_teammate_timeout() -> u64 {
    DEFAULT_TEAMMATE_TIMEOUT_SECONDS
}

/// A reusable description of how one agent session is staffed.
///
/// A single-teammate template is an atomic session; multiple teammates run
/// as a scripted sequence inside the same worktree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamTemplate {
    pub name: String,
    pub description: String,
    pub teammates: Vec<TeammateSpec>,
}

impl TeamTemplate {
    /// Builds the built-in single-worker template.
    pub fn solo() -> Self {
        Self {
            name: "solo".to_string(),
            description: "One worker executing the task directly".to_string(),
            teammates: vec![TeammateSpec {
                name: "worker".to_string(),
                role: "You are a software engineer. Complete the task below in this \
                       repository checkout and commit your changes."
                    .to_string(),
                timeout_seconds: DEFAULT_TEAMMATE_TIMEOUT_SECONDS,
            }],
        }
    }
}

/// Registry of team templates known to the launcher.
#[derive(Clone, Debug)]
pub struct TeamRegistry {
    templates: BTreeMap<String, TeamTemplate>,
}

impl TeamRegistry {
    /// Creates a registry pre-populated with the built-in templates.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            templates: BTreeMap::new(),
        };
        registry.register(TeamTemplate::solo());

        registry
    }

    /// Registers (or replaces) a template under its own name.
    pub fn register(&mut self, template: TeamTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    /// Looks up a template by name.
    ///
    /// # Errors
    /// Returns a `template_not_found` error when the name is unknown.
    pub fn resolve(&self, name: &str) -> Result<&TeamTemplate, String> {
        self.templates
            .get(name)
            .ok_or_else(|| format!("template_not_found: no team template named '{name}'"))
    }

    /// Returns all registered templates in name order.
    pub fn all(&self) -> impl Iterator<Item = &TeamTemplate> {
        self.templates.values()
    }
}

impl Default for TeamRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// One requested agent: a team template name plus the task it should run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAssignment {
    pub team: String,
    pub task: String,
}

/// External request to launch one pipeline project.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub project_name: String,
    /// Absolute path to the target repository root.
    pub repo_path: PathBuf,
    pub build_command: Option<String>,
    pub test_command: Option<String>,
    pub agents: Vec<AgentAssignment>,
}
