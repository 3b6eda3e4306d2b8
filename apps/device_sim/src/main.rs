use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::Parser;
use futures::{future, SinkExt, StreamExt};
use shared::{
    domain::DeviceId,
    protocol::{CommandFrame, NotificationFrame, ResponseFrame},
};
use tokio::time::Interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

/// Plays a field device against the control server.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server_url: String,
    #[arg(long)]
    device_id: String,
    /// Answer every command with a failure carrying this message.
    #[arg(long)]
    reject_with: Option<String>,
    /// Wait this long before answering each command.
    #[arg(long, default_value_t = 0)]
    reply_delay_ms: u64,
    /// Seconds between synthetic notifications; 0 disables them.
    #[arg(long, default_value_t = 0)]
    notify_every_secs: u64,
    #[arg(long, default_value = "drowsiness_service")]
    notify_category: String,
    #[arg(long, default_value = "Driver drowsiness detected")]
    notify_description: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let device_id = DeviceId::new(cli.device_id.trim());
    let ws_url = device_ws_url(&cli.server_url, &device_id)?;

    let (socket, _) = connect_async(ws_url.as_str())
        .await
        .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
    info!(%device_id, %ws_url, "device connected");
    let (mut writer, mut reader) = socket.split();

    let mut ticker = (cli.notify_every_secs > 0)
        .then(|| tokio::time::interval(Duration::from_secs(cli.notify_every_secs)));
    let reply_delay = Duration::from_millis(cli.reply_delay_ms);

    loop {
        tokio::select! {
            frame = reader.next() => {
                let Some(frame) = frame else {
                    info!("server ended the connection");
                    break;
                };
                match frame.context("websocket read failed")? {
                    Message::Text(text) => {
                        let Some(reply) = reply_for(&device_id, &text, cli.reject_with.as_deref()) else {
                            continue;
                        };
                        if !reply_delay.is_zero() {
                            tokio::time::sleep(reply_delay).await;
                        }
                        writer.send(Message::Text(serde_json::to_string(&reply)?)).await?;
                    }
                    Message::Close(close) => {
                        info!(?close, "server closed the connection");
                        break;
                    }
                    _ => {}
                }
            }
            _ = next_tick(&mut ticker) => {
                let notification = notification(&device_id, &cli.notify_category, &cli.notify_description);
                writer.send(Message::Text(serde_json::to_string(&notification)?)).await?;
                info!(category = %notification.category, "notification sent");
            }
        }
    }

    Ok(())
}

/// `ws(s)://<host>/ws/<device_id>` for an `http(s)` or `ws(s)` base URL.
fn device_ws_url(server_url: &str, device_id: &DeviceId) -> Result<Url> {
    if device_id.as_str().is_empty() {
        bail!("device_id cannot be empty");
    }
    let mut url = Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("unsupported server url scheme '{other}'"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot switch '{server_url}' to {scheme}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("server url cannot carry a path: {server_url}"))?
        .pop_if_empty()
        .push("ws")
        .push(device_id.as_str());
    Ok(url)
}

/// The response to send for an inbound text frame, or `None` for frames
/// that are not commands.
fn reply_for(device_id: &DeviceId, text: &str, reject_with: Option<&str>) -> Option<ResponseFrame> {
    let command = match serde_json::from_str::<CommandFrame>(text) {
        Ok(command) => command,
        Err(_) => {
            warn!(frame = text, "ignoring non-command frame");
            return None;
        }
    };
    info!(
        command_id = %command.command_id,
        capability = %command.command.target,
        value = %command.command.value,
        "command received"
    );
    Some(match reject_with {
        Some(message) => ResponseFrame::failure(device_id.clone(), command.command_id, message),
        None => ResponseFrame::success(device_id.clone(), command.command_id),
    })
}

fn notification(device_id: &DeviceId, category: &str, description: &str) -> NotificationFrame {
    NotificationFrame {
        device_id: device_id.clone(),
        category: category.to_string(),
        description: description.to_string(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
