//! Startup notification
//!
//! When `startup.notification.address` is configured, the daemon opens one TCP
//! connection after its listeners are bound and writes a single JSON blob so
//! a supervising process can discover the actual addresses. A failure here is
//! fatal at boot.

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[derive(Debug, Serialize)]
pub struct StartupNotification {
    #[serde(rename = "HttpAddr")]
    pub http_addr: String,
    #[serde(rename = "HrpcAddr")]
    pub hrpc_addr: String,
    #[serde(rename = "ProcessId")]
    pub process_id: u32,
}

pub async fn send_startup_notification(
    address: &str,
    notification: &StartupNotification,
) -> Result<()> {
    let mut stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("Failed to connect to notification address {}", address))?;
    let body = serde_json::to_vec(notification)?;
    stream
        .write_all(&body)
        .await
        .context("Failed to write startup notification")?;
    stream.shutdown().await.ok();
    Ok(())
}
