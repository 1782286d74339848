//! Outbound delivery capability for notices.
//!
//! The dispatcher owns retry policy; a `Transport` makes exactly one attempt per call
//! and reports any failure as a [`TransportError`]. Network, auth and recipient
//! rejections are all retried the same way.

mod log_sink;
#[cfg(feature = "transport-webhook")]
mod webhook;

use anyhow::{anyhow, Result};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::TransportError;
use crate::notify::Payload;

pub use log_sink::LogTransport;
#[cfg(feature = "transport-webhook")]
pub use webhook::{parse_webhook_endpoint, WebhookTransport};

/// Transport capability.
///
/// Implementations must bound their own call duration where the underlying client
/// allows it; the dispatcher additionally enforces a per-attempt timeout.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn send(&self, payload: &Payload) -> Result<(), TransportError>;
}

/// Transport selection from configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Log every notice and report success.
    #[default]
    Log,
    /// POST notices as JSON to an HTTP endpoint. Requires `transport-webhook`.
    Webhook,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "log" | "stub" => Ok(Self::Log),
            "webhook" | "http" => Ok(Self::Webhook),
            other => Err(anyhow!(
                "unknown transport '{}': expected 'log' or 'webhook'",
                other
            )),
        }
    }
}

/// Build the configured transport.
pub fn build_transport(
    kind: TransportKind,
    webhook_url: Option<&str>,
) -> Result<Arc<dyn Transport>> {
    match kind {
        TransportKind::Log => Ok(Arc::new(LogTransport::new())),
        TransportKind::Webhook => build_webhook(webhook_url),
    }
}

#[cfg(feature = "transport-webhook")]
fn build_webhook(webhook_url: Option<&str>) -> Result<Arc<dyn Transport>> {
    let url = webhook_url.ok_or_else(|| anyhow!("webhook transport requires a webhook url"))?;
    Ok(Arc::new(WebhookTransport::new(url)?))
}

#[cfg(not(feature = "transport-webhook"))]
fn build_webhook(_webhook_url: Option<&str>) -> Result<Arc<dyn Transport>> {
    Err(anyhow!(
        "webhook transport requested but the 'transport-webhook' feature is not enabled"
    ))
}
