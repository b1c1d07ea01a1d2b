//! Warden Agent - certificate lifecycle daemon
//!
//! Runs one independent lifecycle loop per configured agent:
//! - server: ACME certificate for the web server, reload after install
//! - client: EST device certificate, mTLS re-enrollment
//!
//! Optionally serves /healthz, /readyz and /metrics over HTTP.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use warden_config::{AgentConfig, DEFAULT_CONFIG_PATH};
use warden_lifecycle::{client_agent, server_agent};

mod health;
mod telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AgentSelection {
    All,
    Server,
    Client,
}

#[derive(Debug, Parser)]
#[command(name = "warden-agent", version, about = "Certificate lifecycle agent")]
struct Cli {
    /// Agent configuration file
    #[arg(long, env = "WARDEN_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Which configured agents to run
    #[arg(long, value_enum, default_value_t = AgentSelection::All)]
    agent: AgentSelection,

    /// Run a single iteration per agent and exit
    #[arg(long)]
    once: bool,
}

impl AgentSelection {
    fn includes(self, other: Self) -> bool {
        self == Self::All || self == other
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AgentConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    telemetry::init_logging(&config.logging)?;
    info!(config = %cli.config.display(), "Configuration loaded");

    let max_iterations = u64::from(cli.once);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut agents = JoinSet::new();
    let mut handles = Vec::new();

    if let Some(server) = config.server.clone().filter(|_| cli.agent.includes(AgentSelection::Server)) {
        let agent = server_agent(server).context("failed to set up server agent")?;
        handles.push((agent.name().to_string(), agent.metrics_handle()));
        let rx = shutdown_rx.clone();
        agents.spawn(async move {
            agent.run(max_iterations, rx).await;
        });
    }

    if let Some(client) = config.client.clone().filter(|_| cli.agent.includes(AgentSelection::Client)) {
        let agent = client_agent(client).context("failed to set up client agent")?;
        handles.push((agent.name().to_string(), agent.metrics_handle()));
        let rx = shutdown_rx.clone();
        agents.spawn(async move {
            agent.run(max_iterations, rx).await;
        });
    }

    if agents.is_empty() {
        anyhow::bail!("no agent selected by --agent {:?} is configured", cli.agent);
    }

    if let Some(addr) = config.health.listen_addr {
        let router = health::create_health_router(Arc::new(health::HealthState { agents: handles }));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind health server on {addr}"))?;
        info!(addr = %addr, "Starting health/metrics HTTP server");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "Health server error");
            }
        });
    }

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, stopping after the current iteration");
        let _ = shutdown_tx.send(true);
    });

    while let Some(result) = agents.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Agent task failed");
        }
    }

    info!("All agents stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["warden-agent"]);
        assert_eq!(cli.agent, AgentSelection::All);
        assert!(!cli.once);
    }

    #[test]
    fn test_cli_selects_one_agent() {
        let cli = Cli::parse_from(["warden-agent", "--config", "/tmp/a.yaml", "--agent", "client", "--once"]);

        assert_eq!(cli.config, PathBuf::from("/tmp/a.yaml"));
        assert!(cli.agent.includes(AgentSelection::Client));
        assert!(!cli.agent.includes(AgentSelection::Server));
        assert!(cli.once);
    }
}
