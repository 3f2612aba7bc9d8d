// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # ticknet Node
//!
//! Entry point for the `ticknet-node` binary. Parses CLI arguments,
//! initializes logging and metrics, joins the overlay and serves the status
//! API.
//!
//! The binary supports three subcommands:
//!
//! - `run`      — join the overlay
//! - `identity` — print the identity for a seed and index
//! - `version`  — print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;

use ticknet_protocol::crypto::Keypair;
use ticknet_protocol::network::TcpConnector;
use ticknet_protocol::Node;

use cli::{Commands, TicknetCli};
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TicknetCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Identity(args) => print_identity(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Joins the overlay, then serves the API and metrics until a shutdown
/// signal arrives.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        "ticknet_node=info,ticknet_protocol=info,tower_http=info",
        args.log_format(),
    );

    let config = args.node_config()?;
    tracing::info!(
        protocol = config.protocol,
        channels = config.gossip.number_of_channels,
        signaling_servers = config.signaling_servers.len(),
        upstream_connections = config.upstream.connections,
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        "starting ticknet-node"
    );
    if config.signaling_servers.is_empty() {
        tracing::warn!("no signaling servers configured; channels will keep redialing");
    }

    // --- Node ---
    let connector = Arc::new(TcpConnector::new(
        config.signaling_servers.clone(),
        config.ice_servers.clone(),
    ));
    let node = Node::new(config, connector).context("failed to create node")?;
    node.start().context("failed to start node")?;

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    let recorder = metrics::spawn_recorder(node.clone(), Arc::clone(&node_metrics));

    // --- API server ---
    let api_router = api::create_router(api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        node: node.clone(),
    });
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    recorder.abort();
    node.stop();
    tracing::info!("ticknet-node stopped");
    Ok(())
}

/// Derives the entity key for a seed and index and prints its identity.
fn print_identity(args: cli::IdentityArgs) -> Result<()> {
    let keypair =
        Keypair::from_seed_index(&args.seed, args.index).context("cannot derive identity")?;
    println!("{}", keypair.public_key());
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("ticknet-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {}", ticknet_protocol::config::DEFAULT_PROTOCOL);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed, that signal is never observed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
