//! A small device-style client: connects to a hub with automatic
//! reconnection, handles commands pushed by the server, and reports a
//! reading once a minute.
//!
//! Run with a hub URL:
//!
//! ```text
//! cargo run --example device_client -- wss://your-hub.example.com/devicehub
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use hubwire_client::{HubConnectionBuilder, StdoutLogWriter, TraceLevel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:5000/devicehub".to_owned());

    let hub = HubConnectionBuilder::new()
        .with_url(&url)
        .skip_negotiation()
        .with_automatic_reconnect(None)
        .with_server_timeout(Duration::from_secs(60))
        .with_logging(TraceLevel::Info, Arc::new(StdoutLogWriter))
        .build()?;

    hub.on("UpdateStatus", |args| {
        tracing::info!(?args, "status update from server");
    })?;

    hub.on("DeviceCommand", |args| {
        match args.first().and_then(|v| v.as_str()) {
            Some("reboot") => tracing::warn!("reboot command received"),
            Some(other) => tracing::info!(command = %other, "command received"),
            None => tracing::warn!("command without a name"),
        }
    })?;

    hub.set_disconnected(|error| match error {
        Some(e) => tracing::error!(error = %e, "connection lost, auto-reconnect will retry"),
        None => tracing::info!("connection closed"),
    });

    tracing::info!(url = %url, "starting hub connection");
    hub.start().await?;
    tracing::info!(connection_id = ?hub.connection_id(), "connected");

    hub.send("DeviceOnline", vec![json!("rust-device-01")])
        .await?;

    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
        match hub
            .invoke("ReportReading", vec![json!({ "temperature": 21.5 })])
            .await
        {
            Ok(ack) => tracing::info!(?ack, "reading acknowledged"),
            Err(e) => tracing::warn!(error = %e, "failed to report reading"),
        }
    }
}
