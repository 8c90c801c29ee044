//! Headless CLI driver: launch a project, run the pipeline to completion,
//! print the project id, and exit 0 on success.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use gaffer::app::{AppConfig, GeneralManager};
use gaffer::domain::decision::DecisionAction;
use gaffer::domain::event::CHANNEL_GM;
use gaffer::domain::project::Phase;
use gaffer::domain::team::{AgentAssignment, LaunchRequest, TeamRegistry};
use gaffer::infra::agent::CommandTemplateBackend;
use gaffer::infra::db::{DB_DIR, DB_FILE, Database};
use gaffer::infra::hub::EventHub;

#[derive(Parser)]
#[command(name = "gaffer", version, about = "Run a crew of AI coding agents and merge their work")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a project and run the pipeline to completion.
    Launch(LaunchArgs),
    /// List registered team templates.
    Teams,
}

#[derive(Args)]
struct LaunchArgs {
    /// Target repository root.
    #[arg(long)]
    repo: PathBuf,

    /// Project name.
    #[arg(long)]
    name: String,

    /// Shell command that must build the merged result.
    #[arg(long = "build-cmd")]
    build_cmd: Option<String>,

    /// Shell command that must pass on the merged result.
    #[arg(long = "test-cmd")]
    test_cmd: Option<String>,

    /// Agent assignment as TEAM=TASK; repeatable.
    #[arg(long = "agent", value_parser = parse_assignment, required = true)]
    agents: Vec<AgentAssignment>,

    /// Automatic resolution policy for approval gates (headless runs).
    #[arg(long = "on-decision", value_enum, default_value = "approve")]
    on_decision: DecisionPolicy,

    /// Database path (defaults to .gaffer/gaffer.db).
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DecisionPolicy {
    Approve,
    Reject,
}

impl DecisionPolicy {
    fn action(self) -> DecisionAction {
        match self {
            Self::Approve => DecisionAction::Approve,
            Self::Reject => DecisionAction::Reject,
        }
    }
}

fn parse_assignment(raw: &str) -> Result<AgentAssignment, String> {
    let (team, task) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TEAM=TASK, got '{raw}'"))?;
    if team.trim().is_empty() || task.trim().is_empty() {
        return Err(format!("expected TEAM=TASK, got '{raw}'"));
    }

    Ok(AgentAssignment {
        team: team.trim().to_string(),
        task: task.trim().to_string(),
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env("GAFFER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            #[allow(clippy::print_stderr)]
            {
                let _ = writeln!(std::io::stderr(), "Error: {error}");
            }

            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, String> {
    match cli.command {
        Commands::Teams => {
            let registry = TeamRegistry::with_builtins();
            let mut stdout = std::io::stdout();
            for template in registry.all() {
                let _ = writeln!(
                    stdout,
                    "{}\t{} teammate(s)\t{}",
                    template.name,
                    template.teammates.len(),
                    template.description
                );
            }

            Ok(ExitCode::SUCCESS)
        }
        Commands::Launch(args) => launch(args).await,
    }
}

async fn launch(args: LaunchArgs) -> Result<ExitCode, String> {
    let repo_path = std::fs::canonicalize(&args.repo)
        .map_err(|error| format!("Cannot resolve repo path {}: {error}", args.repo.display()))?;

    let db_path = args
        .db
        .unwrap_or_else(|| PathBuf::from(DB_DIR).join(DB_FILE));
    let db = Database::open(&db_path).await?;
    db.fail_interrupted_projects().await?;

    let hub = EventHub::new();
    let _heartbeat = hub.spawn_heartbeat();

    let backend = Arc::new(CommandTemplateBackend::from_env()?);
    let manager = GeneralManager::new(
        backend,
        AppConfig::default(),
        db,
        hub.clone(),
        TeamRegistry::with_builtins(),
    );

    spawn_decision_policy(&manager, &hub, args.on_decision.action());

    let request = LaunchRequest {
        project_name: args.name,
        repo_path,
        build_command: args.build_cmd,
        test_command: args.test_cmd,
        agents: args.agents,
    };
    let run = manager.run_project(&request).await?;

    let mut stdout = std::io::stdout();
    let _ = writeln!(stdout, "{}", run.project_id);

    if run.phase == Phase::Completed {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Resolves every approval gate automatically with the configured action.
///
/// The interactive surfaces (HTTP/WebSocket, web UI) live outside this
/// binary; headless runs need a policy so the pipeline never hangs.
fn spawn_decision_policy(manager: &GeneralManager, hub: &EventHub, action: DecisionAction) {
    let gate = manager.decision_gate();
    let mut subscription = hub.subscribe(CHANNEL_GM);

    tokio::spawn(async move {
        while let Ok(event) = subscription.recv().await {
            if event.get("type").and_then(Value::as_str) != Some("decision_required") {
                continue;
            }
            let Some(decision_id) = event.get("decision_id").and_then(Value::as_str) else {
                continue;
            };
            let _ = gate.resolve(decision_id, action).await;
        }
    });
}
