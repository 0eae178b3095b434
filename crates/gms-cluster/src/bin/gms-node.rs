use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gms_cluster::{MemberRole, MembershipConfig, MembershipService};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gms-node", about = "Run a group membership node", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Suppress log output
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a member and stay in the cluster until interrupted
    Run {
        /// Configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Member name
        #[arg(short, long)]
        name: Option<String>,

        /// Address to bind
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Locator to join through; repeat for several
        #[arg(short, long = "locator")]
        locators: Vec<SocketAddr>,

        /// Found a new cluster
        #[arg(long)]
        initial: bool,

        /// locator, server or observer
        #[arg(long)]
        role: Option<MemberRole>,
    },
    /// Write a configuration file with default values
    InitConfig {
        #[arg(short, long, default_value = "membership.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::InitConfig { output } => {
            MembershipConfig::default()
                .to_file(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Wrote {}", output.display());
            Ok(())
        }
        Commands::Run {
            config,
            name,
            bind,
            locators,
            initial,
            role,
        } => {
            let mut config = match config {
                Some(path) => MembershipConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => MembershipConfig::default(),
            };
            if let Some(name) = name {
                config.member_name = name;
            }
            if let Some(bind) = bind {
                config.bind_address = bind;
            }
            if !locators.is_empty() {
                config.locators = locators;
            }
            if let Some(role) = role {
                config.role = role;
            }
            config.is_initial_member |= initial;

            run(config).await
        }
    }
}

async fn run(config: MembershipConfig) -> Result<()> {
    let service = MembershipService::bind_udp(config).await?;
    let mut events = service.events();

    let view = service.start().await.context("starting membership service")?;
    tracing::info!("Member {} in view {}", service.local_member(), view);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {} membership events", skipped);
                }
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, leaving cluster");
                break;
            }
        }
        if service.status().is_terminal() {
            break;
        }
    }

    if service.is_running() {
        service.leave().await?;
    }
    Ok(())
}

fn setup_logging(verbose: bool, quiet: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    if quiet {
        return;
    }

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt().with_env_filter(filter).with_target(false).init();
}
