//! devroom - collaborative project rooms with a sandboxed preview runtime.
//!
//! Usage:
//!   devroom serve [--port 3001]                       # Start the presence service
//!   devroom run --dir <project> [--presence <ws-url> --project <id>]

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use devroom::client::PresenceClient;
use devroom::config::{
    CommandSpec, InstallPolicy, LocalEngineConfig, ServerConfig, TerminalConfig, WorkspaceConfig,
    DEFAULT_PORT, REAP_INTERVAL_SECS,
};
use devroom::engine::local::LocalEngine;
use devroom::files::ProjectFileSet;
use devroom::state::AppState;
use devroom::sync::{OfflineLink, PresenceLink};
use devroom::workspace::Workspace;
use devroom::ws_server;

#[derive(Parser, Debug)]
#[command(name = "devroom")]
#[command(about = "Collaborative project rooms with a sandboxed preview runtime")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the presence service
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Seconds between sweeps for dead connections
        #[arg(long, default_value_t = REAP_INTERVAL_SECS)]
        reap_interval: u64,
    },
    /// Open a project directory in a local sandbox
    Run {
        /// Project directory to load
        #[arg(long)]
        dir: PathBuf,

        /// Presence service WebSocket URL, e.g. ws://localhost:3001/ws
        #[arg(long, env = "DEVROOM_PRESENCE", requires = "project")]
        presence: Option<String>,

        /// Project room to join
        #[arg(long, env = "DEVROOM_PROJECT")]
        project: Option<String>,

        /// Dependency install command
        #[arg(long, default_value = "npm install")]
        install: String,

        /// Preview server command
        #[arg(long, default_value = "npm run dev")]
        serve: String,

        /// Stop instead of serving when the install fails
        #[arg(long)]
        halt_on_install_failure: bool,

        /// Seconds to wait for the preview server
        #[arg(long, default_value = "120")]
        ready_timeout: u64,

        /// Directory holding sandbox roots
        #[arg(long, env = "DEVROOM_SANDBOX_DIR")]
        sandbox_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            port,
            reap_interval,
        } => {
            let state = AppState::new(ServerConfig {
                port,
                reap_interval: Duration::from_secs(reap_interval),
            });
            if let Err(e) = ws_server::run_server(state).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Run {
            dir,
            presence,
            project,
            install,
            serve,
            halt_on_install_failure,
            ready_timeout,
            sandbox_dir,
        } => {
            let (Some(install), Some(serve)) =
                (CommandSpec::parse(&install), CommandSpec::parse(&serve))
            else {
                eprintln!("Error: install and serve commands must not be empty");
                exit(1);
            };
            let mut config = WorkspaceConfig::default();
            config.pipeline.install = install;
            config.pipeline.serve = serve;
            config.pipeline.ready_timeout = Duration::from_secs(ready_timeout);
            if halt_on_install_failure {
                config.pipeline.install_policy = InstallPolicy::Halt;
            }
            config.terminal = TerminalConfig {
                shell: CommandSpec::new("sh", ["-i"]),
                ..TerminalConfig::default()
            };

            let mut engine_config = LocalEngineConfig::default();
            if let Some(base_dir) = sandbox_dir {
                engine_config.base_dir = base_dir;
            }

            let options = RunOptions {
                dir,
                presence,
                project,
                config,
                engine_config,
            };
            if let Err(e) = run_project(options).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
    }
}

struct RunOptions {
    dir: PathBuf,
    presence: Option<String>,
    project: Option<String>,
    config: WorkspaceConfig,
    engine_config: LocalEngineConfig,
}

async fn run_project(options: RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    let files = ProjectFileSet::load_dir(&options.dir)?;
    info!(dir = ?options.dir, files = files.len(), "Loaded project");

    let project_id = options.project.unwrap_or_else(|| {
        options
            .dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local".to_string())
    });

    let (link, events) = match options.presence {
        Some(url) => {
            let (client, events) = PresenceClient::connect(&url).await?;
            info!(session_id = %client.session_id(), "Connected to presence service");
            (Arc::new(client) as Arc<dyn PresenceLink>, Some(events))
        }
        None => (Arc::new(OfflineLink) as Arc<dyn PresenceLink>, None),
    };

    let engine = Arc::new(LocalEngine::new(options.engine_config));
    let workspace = Workspace::open(engine, project_id, files, link, options.config).await?;
    if let Some(events) = events {
        workspace.spawn_event_pump(events);
    }

    tokio::select! {
        ready = workspace.wait_ready() => match ready {
            Ok(signal) => println!("Preview ready at {}", signal.url),
            Err(e) => warn!(error = %e, "preview is not available"),
        },
        _ = tokio::signal::ctrl_c() => {
            workspace.teardown().await;
            return Ok(());
        }
    }

    let result = bridge_terminal(&workspace).await;
    workspace.teardown().await;
    result
}

/// Copy stdin into the active terminal and its output to stdout until
/// Ctrl-C or end of input.
async fn bridge_terminal(workspace: &Workspace) -> Result<(), Box<dyn std::error::Error>> {
    let Some(id) = workspace.terminals().active() else {
        tokio::signal::ctrl_c().await?;
        return Ok(());
    };
    let attach = workspace.terminals().attach(id).await?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&attach.scrollback).await?;
    stdout.flush().await?;

    let mut live = attach.live;
    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        loop {
            match live.recv().await {
                Ok(bytes) => {
                    if stdout.write_all(&bytes).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "terminal output dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            read = stdin.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                if let Err(e) = workspace.terminals().write(id, buf[..n].to_vec()).await {
                    warn!(error = %e, "terminal closed");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    printer.abort();
    Ok(())
}
