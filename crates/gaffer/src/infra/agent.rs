//! Agent backend seam.
//!
//! A backend is an opaque capability: given a working directory and a
//! prompt, build a subprocess command that runs an AI coding agent there.
//! Gaffer never parses backend output beyond line streaming, so any CLI
//! that accepts a trailing prompt argument works.

use std::path::Path;
use std::process::Command;

/// Environment variable naming the backend command line.
pub const AGENT_CMD_ENV: &str = "GAFFER_AGENT_CMD";

/// Environment variable carrying the session id into the agent subprocess.
pub const SESSION_ID_ENV: &str = "GAFFER_SESSION_ID";

/// Environment variable pointing agents at a shared build-artifact
/// directory so worktrees do not each reproduce it.
pub const SHARED_ARTIFACT_DIR_ENV: &str = "GAFFER_SHARED_TARGET_DIR";

/// Builds agent subprocess commands.
#[cfg_attr(test, mockall::automock)]
pub trait AgentBackend: Send + Sync {
    /// Builds one agent invocation for `folder` with the given prompt.
    fn build_command(&self, folder: &Path, prompt: &str) -> Command;
}

/// Backend that runs a fixed program with the prompt appended as the final
/// argument.
#[derive(Clone, Debug)]
pub struct CommandTemplateBackend {
    program: String,
    args: Vec<String>,
}

impl CommandTemplateBackend {
    /// Builds a backend from a whitespace-separated command line.
    ///
    /// # Errors
    /// Returns an error when the command line is empty.
    pub fn parse(command_line: &str) -> Result<Self, String> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| "Agent command line is empty".to_string())?;

        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Builds a backend from the `GAFFER_AGENT_CMD` environment variable.
    ///
    /// # Errors
    /// Returns an error when the variable is unset or empty.
    pub fn from_env() -> Result<Self, String> {
        let command_line = std::env::var(AGENT_CMD_ENV)
            .map_err(|_| format!("{AGENT_CMD_ENV} is not set; cannot spawn agent backends"))?;

        Self::parse(&command_line)
    }
}

impl AgentBackend for CommandTemplateBackend {
    fn build_command(&self, folder: &Path, prompt: &str) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(prompt).current_dir(folder);

        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_program_and_arguments() {
        // Arrange
        let command_line = "claude -p --output-format text";

        // Act
        let backend = CommandTemplateBackend::parse(command_line).expect("failed to parse");
        let command = backend.build_command(Path::new("/tmp"), "do the task");

        // Assert
        assert_eq!(command.get_program(), "claude");
        let args: Vec<&std::ffi::OsStr> = command.get_args().collect();
        assert_eq!(
            args,
            vec!["-p", "--output-format", "text", "do the task"]
        );
        assert_eq!(command.get_current_dir(), Some(Path::new("/tmp")));
    }

    #[test]
    fn test_parse_rejects_empty_command_line() {
        // Arrange
        let command_line = "   ";

        // Act
        let result = CommandTemplateBackend::parse(command_line);

        // Assert
        assert!(result.is_err());
    }
}
