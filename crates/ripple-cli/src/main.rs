//! # Ripple CLI
//!
//! Command line client for the Ripple realtime service.
//!
//! ## Usage
//!
//! ```bash
//! # Run with ripple.toml from the default paths
//! ripple
//!
//! # Run with a custom config
//! ripple --config /path/to/ripple.toml
//!
//! # Run with environment variables
//! RIPPLE__CLIENT__KEY=app.key:secret RIPPLE__CHANNELS=chat:lobby ripple
//! ```
//!
//! Messages and presence events on the configured channels are printed as
//! JSON lines. Lines read from stdin are published on the first channel.

mod config;
mod metrics;

use anyhow::{bail, Context, Result};
use ripple_core::{ConnectionState, Realtime, RealtimeChannel};
use ripple_protocol::Message;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

fn config_path() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    match (args.next().as_deref(), args.next()) {
        (None, _) => Ok(None),
        (Some("--config"), Some(path)) => Ok(Some(PathBuf::from(path))),
        (Some(arg), _) => bail!("Unexpected argument: {arg}. Usage: ripple [--config <path>]"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ripple=info,ripple_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    let path = config_path()?;
    let config = config::Config::load(path.as_deref())?;
    if config.channels.is_empty() {
        bail!("No channels configured");
    }

    if config.metrics.enabled {
        metrics::init_metrics();
        metrics::start_metrics_server(config.metrics_addr()?)?;
    }

    info!("Connecting to {}:{}", config.client.host, config.client.port);
    let client = Realtime::new(config.client.clone()).context("Failed to create client")?;
    spawn_state_logger(&client);

    let mut channels = Vec::with_capacity(config.channels.len());
    for name in &config.channels {
        let channel = client
            .channels()
            .get(name)
            .with_context(|| format!("Invalid channel name: {name}"))?;
        spawn_printer(&channel);
        channel
            .attach()
            .await
            .with_context(|| format!("Failed to attach {name}"))?;
        info!(channel = %name, "Attached");

        if let Some(data) = &config.presence {
            channel
                .presence()
                .enter(Some(data.clone()))
                .await
                .with_context(|| format!("Failed to enter presence on {name}"))?;
        }
        channels.push(channel);
    }

    let target = channels[0].clone();
    let event = config.event.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => publish(&target, &event, line),
                None => {
                    debug!("Stdin closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    client.close();
    if tokio::time::timeout(
        CLOSE_TIMEOUT,
        client.connection().wait_for_state(ConnectionState::Closed),
    )
    .await
    .is_err()
    {
        warn!("Connection did not close within {:?}", CLOSE_TIMEOUT);
    }
    Ok(())
}

fn publish(channel: &RealtimeChannel, event: &str, line: String) {
    let data = serde_json::from_str(&line).unwrap_or(serde_json::Value::String(line));
    let name = channel.name().to_string();
    channel.publish_with(
        vec![Message::new(event, data)],
        Some(Box::new(move |result| match result {
            Ok(()) => metrics::record_published(&name),
            Err(e) => {
                warn!(channel = %name, code = e.code, "Publish failed: {}", e.message);
                metrics::record_publish_failure(e.code);
            }
        })),
    );
}

fn spawn_state_logger(client: &Realtime) {
    let mut changes = client.connection().on_state_change();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => match &change.reason {
                    Some(reason) => warn!(
                        from = %change.previous,
                        to = %change.current,
                        code = reason.code,
                        "Connection {}: {}",
                        change.current,
                        reason.message
                    ),
                    None => info!(from = %change.previous, to = %change.current, "Connection {}", change.current),
                },
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "State logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_printer(channel: &RealtimeChannel) {
    let name = channel.name().to_string();
    let mut messages = channel.subscribe();
    let mut presence = channel.presence().subscribe();

    tokio::spawn(async move {
        loop {
            let line = tokio::select! {
                message = messages.recv() => match message {
                    Ok(message) => serde_json::json!({ "channel": name, "message": message }),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(channel = %name, skipped, "Dropped messages");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                event = presence.recv() => match event {
                    Ok(event) => serde_json::json!({ "channel": name, "presence": event }),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(channel = %name, skipped, "Dropped presence events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            println!("{line}");
        }
    });
}
