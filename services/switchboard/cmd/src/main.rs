//! Switchboard server binary.
//!
//! Runs the session engine behind a TCP frontend: each accepted socket is a
//! persistent transport, `/chat` echoes events, and sessions fan out across
//! nodes through the configured pub/sub backend.

use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use switchboard_session::SessionManager;
use switchboard_storage::{NodeId, Storage};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod chat;
mod config;
mod logging;
mod tcp;

use chat::{ChatListener, CHAT_NAMESPACE};
use config::ServerConfig;
use logging::SwitchboardLogFormatter;

// Component logging macros are defined in logging.rs and available via #[macro_export]

/// Real-time multiplexed messaging server
#[derive(Parser, Debug)]
#[command(name = "switchboard", version, about = "Real-time multiplexed messaging server")]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, default_value = "switchboard.yaml")]
    config: PathBuf,

    /// Listen address, e.g. 0.0.0.0:3000 (overrides the config file)
    #[arg(long)]
    listen: Option<String>,

    /// Node ID used on the cluster bus; random when unset
    #[arg(long)]
    node_id: Option<u64>,

    /// Ping interval, e.g. 25s
    #[arg(long)]
    ping_interval: Option<humantime::Duration>,

    /// Ping timeout, e.g. 60s
    #[arg(long)]
    ping_timeout: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command-line values win over file and environment
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(node_id) = self.node_id {
            config.node_id = Some(node_id);
        }
        if let Some(interval) = self.ping_interval {
            config.ping_interval = interval.into();
        }
        if let Some(timeout) = self.ping_timeout {
            config.ping_timeout = timeout.into();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("switchboard={}", args.log_level).parse()?)
        .add_directive(format!("switchboard_session={}", args.log_level).parse()?)
        .add_directive(format!("switchboard_storage={}", args.log_level).parse()?)
        .add_directive(format!("switchboard_scheduler={}", args.log_level).parse()?)
        .add_directive(format!("switchboard_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(SwitchboardLogFormatter::new("switchboard"))
        .init();

    info!("Starting switchboard v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load_from_file(&args.config)?;
    args.apply(&mut config);

    let node_id = NodeId(config.node_id.unwrap_or_else(|| Uuid::new_v4().as_u128() as u64));
    let storage = Storage::from_mode(config.pubsub.clone(), node_id).await?;

    let manager = SessionManager::builder(config.engine_config(), node_id)
        .storage(storage)
        .build();
    manager.start().await?;
    manager.register_namespace(CHAT_NAMESPACE, Some(Arc::new(ChatListener)));

    let listener = TcpListener::bind(&config.listen).await?;
    component_info!("tcp", "Listening on {} as node {}", listener.local_addr()?, node_id);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    let result = tokio::select! {
        result = tcp::serve(listener, manager.clone()) => result,
        _ = sigterm.recv() => {
            info!("Received SIGTERM signal, shutting down");
            Ok(())
        }
        _ = sigint.recv() => {
            info!("Received SIGINT signal, shutting down");
            Ok(())
        }
    };

    manager.shutdown().await;
    if let Err(e) = &result {
        warn!("Frontend stopped with error: {:#}", e);
    }
    info!("Switchboard stopped");
    result
}
