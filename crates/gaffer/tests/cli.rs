//! Smoke tests for the CLI surface.

use assert_cmd::Command;

#[test]
fn test_cli_requires_a_subcommand() {
    // Arrange
    let mut command = Command::cargo_bin("gaffer").expect("failed to find binary");

    // Act
    let output = command.output().expect("failed to run binary");

    // Assert
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage"));
}

#[test]
fn test_cli_lists_builtin_teams() {
    // Arrange
    let mut command = Command::cargo_bin("gaffer").expect("failed to find binary");

    // Act
    let output = command.arg("teams").output().expect("failed to run binary");

    // Assert
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("solo"));
}

#[test]
fn test_cli_launch_requires_agent_assignments() {
    // Arrange
    let mut command = Command::cargo_bin("gaffer").expect("failed to find binary");

    // Act
    let output = command
        .args(["launch", "--repo", "/tmp", "--name", "demo"])
        .output()
        .expect("failed to run binary");

    // Assert
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--agent"));
}
