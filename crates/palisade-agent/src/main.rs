use std::path::PathBuf;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use palisade_agent::Agent;
use palisade_types::AgentConfig;

/// Palisade -- endpoint security agent.
#[derive(Parser, Debug)]
#[command(name = "palisade-agent", version, about)]
struct Cli {
    /// Path to the agent configuration file
    #[arg(long, default_value = "/etc/palisade/agent.yml")]
    config: PathBuf,

    /// Directory for the identity database and event spool
    #[arg(long, default_value = "/var/lib/palisade")]
    data_dir: PathBuf,

    /// Enrollment key, only needed on first run
    #[arg(long, default_value = "")]
    enroll_key: String,

    /// Increase logging verbosity (RUST_LOG=debug)
    #[arg(long, short)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(long, short)]
    quiet: bool,
}

/// Resolve when the process receives SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = term.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else if cli.quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::from_default_env()
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // A missing or broken configuration file is survivable: the agent
    // starts on defaults and keeps retrying the manager.
    let config = match AgentConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "using default configuration");
            AgentConfig::default()
        }
    };

    let agent = Agent::new(config, &cli.data_dir, &cli.enroll_key)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    agent.run(shutdown_rx).await?;
    Ok(())
}
