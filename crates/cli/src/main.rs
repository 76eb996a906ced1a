//! edharness CLI - Main Entry Point
//!
//! Drives one worker's project copy and editor instance from the shell:
//! provisioning, executable lookup, launching, status and state resync.

use anyhow::Context;
use clap::{Parser, Subcommand};
use edharness_common::{
    CleanupLevel, EditorTools, ExclusiveStateLock, RpcClient, StatusClient, WorkerId,
};
use edharness_runner::{
    bridge_rpc_config, ExecutableResolver, HarnessConfig, ProjectProvisioner, SessionMode,
    StateResyncManager, WorkerSession,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod output;

use output::{print_error, print_item, print_message, print_success, print_warning, OutputFormat};

/// edharness - parallel test orchestration for batch-mode editors
#[derive(Parser)]
#[command(name = "edharness")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "edharness.toml", global = true)]
    config: PathBuf,

    /// Canonical project path
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// Worker id (`master`, `gw0`, `gw1`, ...)
    #[arg(short, long, env = "EDHARNESS_WORKER", default_value = "master", global = true)]
    worker: String,

    /// Editor executable, bypassing version resolution
    #[arg(long, global = true)]
    editor_exe: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or sync the worker's project copy and write its config
    Provision,

    /// Print the editor executable matching the project's version
    Resolve,

    /// Launch the worker's editor and keep it running until Ctrl-C
    Launch {
        /// Own a dedicated instance with port registration
        #[arg(long)]
        parallel: bool,

        /// Remove the worker copy on shutdown
        #[arg(long)]
        remove_copy: bool,
    },

    /// Query the editor's status endpoints
    Status,

    /// Bring a running editor back to a clean state
    Resync {
        /// Cleanup level: noop, minimal or full
        #[arg(short, long, default_value = "full")]
        level: String,
    },

    /// Remove the worker's project copy
    Cleanup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let config = load_config(&cli)?;
    let worker: WorkerId = cli
        .worker
        .parse()
        .with_context(|| format!("invalid worker id '{}'", cli.worker))?;
    let format = cli.format;

    match cli.command {
        Commands::Provision => {
            let provisioner = provisioner(&config, &worker);
            let report = provisioner.provision()?;
            let port = provisioner.port()?;
            if provisioner.write_worker_config(port)? {
                print_success(&format!("Worker {} configured on port {}", worker, port));
            }
            print_item(&report, format);
        }
        Commands::Resolve => {
            let version = ExecutableResolver::required_version(&config.project_path)?;
            let exe = ExecutableResolver::from_config(&config.editor)
                .resolve(&config.project_path)?;
            info!("Project requires editor {}", version);
            print_message(&exe.display().to_string(), format);
        }
        Commands::Launch {
            parallel,
            remove_copy,
        } => {
            let mode = if parallel {
                SessionMode::Parallel
            } else {
                SessionMode::Serial
            };
            let session = WorkerSession::setup(config, worker, mode).await?;
            if let Some(outcome) = session.registration() {
                info!("Port registration: {:?}", outcome);
            }
            if let Some(handle) = session.instance() {
                print_item(handle, format);
            }
            print_success(&format!(
                "Editor for {} ready at {} (Ctrl-C to stop)",
                session.worker(),
                session.project_path().display()
            ));

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            session.teardown(remove_copy).await?;
        }
        Commands::Status => {
            let port = provisioner(&config, &worker).port()?;
            let status = StatusClient::new(port, config.health_request_timeout())?;
            let compile = match status.compile_status().await {
                Ok(compile) => compile,
                Err(e) => {
                    print_error(&format!("Editor is not responding on port {}: {}", port, e));
                    std::process::exit(1);
                }
            };
            let tests = status.test_run_status().await.unwrap_or_else(|e| {
                print_warning(&format!("Test runner status unavailable: {}", e));
                Default::default()
            });
            print_item(
                &output::EditorStatusView {
                    port,
                    compile,
                    tests,
                },
                format,
            );
        }
        Commands::Resync { level } => {
            let level: CleanupLevel = level.parse()?;
            let project = provisioner(&config, &worker).project_path().to_path_buf();
            let client = Arc::new(RpcClient::start(bridge_rpc_config(&config, &project)).await?);
            let tools = EditorTools::new(client.clone()).with_retry(config.retry_policy());
            let lock = ExclusiveStateLock::for_project(&config.locks_dir, &project)?;

            let outcome = StateResyncManager::new(tools, lock, config.resync.clone())
                .resync(level)
                .await;
            client.stop().await?;

            if outcome.is_best_effort() {
                print_warning("Editor state could only be restored on a best-effort basis");
            }
            print_item(&outcome, format);
        }
        Commands::Cleanup => {
            let provisioner = provisioner(&config, &worker);
            if provisioner.cleanup()? {
                print_success(&format!("Removed {}", provisioner.project_path().display()));
            } else {
                print_message("Nothing to remove", format);
            }
        }
    }

    Ok(())
}

/// File values, then the environment, then command-line flags.
fn load_config(cli: &Cli) -> anyhow::Result<HarnessConfig> {
    let mut config = HarnessConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    config.apply_env();
    if let Some(project) = &cli.project {
        config.project_path = project.clone();
    }
    if let Some(exe) = &cli.editor_exe {
        config.editor.executable = Some(exe.clone());
    }
    Ok(config)
}

fn provisioner(config: &HarnessConfig, worker: &WorkerId) -> ProjectProvisioner {
    ProjectProvisioner::new(
        config.project_path.clone(),
        worker.clone(),
        config.workers.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edharness.toml");
        std::fs::write(
            &path,
            "project_path = \"/from/file\"\n[workers]\nbase_port = 18000\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "edharness",
            "--config",
            path.to_str().unwrap(),
            "--project",
            "/from/flag",
            "--editor-exe",
            "/opt/editor",
            "status",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.project_path, PathBuf::from("/from/flag"));
        assert_eq!(config.editor.executable, Some(PathBuf::from("/opt/editor")));
        assert_eq!(config.workers.base_port, 18000);
    }

    #[test]
    fn test_resync_level_argument() {
        let cli = Cli::parse_from(["edharness", "--worker", "gw2", "resync", "--level", "minimal"]);
        assert_eq!(cli.worker, "gw2");
        match cli.command {
            Commands::Resync { level } => {
                assert_eq!(level.parse::<CleanupLevel>().unwrap(), CleanupLevel::Minimal)
            }
            _ => panic!("expected resync"),
        }
    }
}
