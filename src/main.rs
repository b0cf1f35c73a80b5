use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde_json::json;

use dockhand::config::AppConfig;
use dockhand::{Capability, Error, Orchestrator, PipelineAction};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "dockhand")]
#[command(version = VERSION)]
#[command(about = "Build, gate, and deploy container services to a remote host")]
struct Cli {
    /// Path to the dockhand config file
    #[arg(long, global = true, default_value = "dockhand.json")]
    config: PathBuf,

    /// Drop the mutate capability; only status checks will be authorized
    #[arg(long, global = true)]
    read_only: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full fetch, gate, build, and deploy pipeline
    Deploy(DeployArgs),
    /// Inspect containers on the target host
    Status,
    /// Reclaim unused resources on the target host
    Clean,
}

#[derive(Args)]
struct DeployArgs {
    /// Source repository URL (falls back to the config's repository)
    #[arg(long)]
    repo_url: Option<String>,
    /// Checkout directory name under the workspace
    #[arg(long)]
    repo_name: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    ExitCode::from(exit_code_to_u8(run(cli)))
}

fn run(cli: Cli) -> i32 {
    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            print_failure(&err, &[]);
            return 2;
        }
    };

    let capability = Capability {
        can_mutate: !cli.read_only,
    };

    let (action, repo_url, repo_name) = match &cli.command {
        Commands::Deploy(args) => {
            let (url, name) = match resolve_repository(args, &config) {
                Ok(repo) => repo,
                Err(err) => {
                    print_failure(&err, &[]);
                    return 2;
                }
            };
            (PipelineAction::FullDeploy, url, name)
        }
        Commands::Status => (PipelineAction::CheckStatus, String::new(), String::new()),
        Commands::Clean => (PipelineAction::CleanTarget, String::new(), String::new()),
    };

    let orchestrator = Orchestrator::new(config);
    match orchestrator.invoke(action, &repo_url, &repo_name, &capability) {
        Ok(report) => {
            let envelope = json!({
                "success": true,
                "result": report,
                "logs": orchestrator.read_logs(),
            });
            print_envelope(&envelope);
            0
        }
        Err(err) => {
            print_failure(&err, &orchestrator.read_logs());
            1
        }
    }
}

fn resolve_repository(args: &DeployArgs, config: &AppConfig) -> Result<(String, String), Error> {
    let url = args
        .repo_url
        .clone()
        .or_else(|| config.repository.as_ref().map(|r| r.url.clone()));
    let name = args
        .repo_name
        .clone()
        .or_else(|| config.repository.as_ref().map(|r| r.name.clone()));
    match (url, name) {
        (Some(url), Some(name)) => Ok((url, name)),
        _ => Err(Error::config_invalid_value(
            "repository",
            "pass --repo-url/--repo-name or configure a repository in dockhand.json",
        )),
    }
}

fn print_failure(err: &Error, logs: &[String]) {
    let envelope = json!({
        "success": false,
        "error": err,
        "logs": logs,
    });
    print_envelope(&envelope);
}

fn print_envelope(envelope: &serde_json::Value) {
    match serde_json::to_string_pretty(envelope) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", envelope),
    }
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
