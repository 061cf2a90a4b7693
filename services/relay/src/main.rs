//! tapline relay
//!
//! Transparent TCP relay in front of a single upstream.
//!
//! This service:
//! - Accepts TCP connections on one listener
//! - Relays every connection to the fixed upstream target
//! - Counts client-to-upstream bytes per client IP in a counter store
//! - Persists every relayed chunk, in order, to a durable log

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use tapline_pipeline::{DurableLog, Pipeline, PipelineConfig};
use tapline_relay::accounting::{build_store, Accounting, DEFAULT_QUEUE_CAPACITY};
use tapline_relay::config::Config;
use tapline_relay::proxy::{Listener, ListenerConfig, SessionContext, Upstream};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RELAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tapline relay");
    info!(
        listen_addr = %config.listen_addr,
        target = %config.target,
        counter = %config.counter,
        log_layout = ?config.log_layout,
        ring_capacity = config.ring_capacity,
        ack_mode = ?config.ack_mode,
        "Configuration loaded"
    );

    let upstream = Upstream::resolve(&config.target, config.connect_timeout)
        .await
        .with_context(|| format!("failed to resolve upstream {}", config.target))?;

    let log = DurableLog::open(&config.log_layout)
        .with_context(|| format!("failed to open log {:?}", config.log_layout))?;
    let pipeline = Pipeline::start(
        PipelineConfig {
            capacity: config.ring_capacity,
            wait_timeout: Some(config.ack_timeout),
        },
        log,
    )
    .context("failed to start log pipeline")?;

    let store = build_store(
        config.counter,
        &config.redis_addr,
        config.connect_timeout,
        config.counter_timeout,
    );
    let accounting = Accounting::start(store, DEFAULT_QUEUE_CAPACITY);

    let context = SessionContext {
        publisher: pipeline.publisher(),
        accountant: accounting.accountant(),
        chunk_size: config.chunk_size,
        ack_mode: config.ack_mode,
    };

    let mut listener_config = ListenerConfig::new(config.listen_addr);
    listener_config.max_connections = config.max_connections;

    let listener = match Listener::bind(listener_config, upstream, context).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(
                bind_addr = %config.listen_addr,
                error = %e,
                "Failed to bind listener"
            );
            return Err(e).context("failed to bind listener");
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut listener_task = tokio::spawn(Arc::clone(&listener).run(shutdown_rx));

    tokio::select! {
        result = &mut listener_task => {
            match result {
                Ok(Ok(())) => info!("Listener exited"),
                Ok(Err(e)) => error!(error = %e, "Listener error"),
                Err(e) => error!(error = %e, "Listener task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    if !listener_task.is_finished() {
        let _ = listener_task.await;
    }

    let pipeline_stats = pipeline.shutdown().await;
    let accounting_stats = accounting.shutdown().await;

    let stats = listener.stats();
    info!(
        connections_accepted = stats.connections_accepted.load(Ordering::Relaxed),
        upstream_failed = stats.upstream_failed.load(Ordering::Relaxed),
        events_consumed = pipeline_stats.consumed,
        write_failures = pipeline_stats.write_failures,
        ack_timeouts = pipeline_stats.ack_timeouts,
        counters_applied = accounting_stats.applied,
        counters_dropped = accounting_stats.dropped,
        "tapline relay stopped"
    );

    Ok(())
}
