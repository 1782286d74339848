use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;

use super::Transport;
use crate::error::TransportError;
use crate::notify::Payload;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Parse a webhook endpoint. Plain http is only accepted for loopback hosts.
pub fn parse_webhook_endpoint(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid webhook url {}", raw))?;
    match url.scheme() {
        "https" => Ok(url),
        "http" => {
            let loopback = match url.host() {
                Some(url::Host::Domain(host)) => host == "localhost",
                Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
                Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
                None => false,
            };
            if loopback {
                Ok(url)
            } else {
                Err(anyhow!(
                    "webhook url must use https for non-loopback hosts: {}",
                    raw
                ))
            }
        }
        other => Err(anyhow!("unsupported webhook scheme: {}", other)),
    }
}

/// Posts each notice as a JSON document.
pub struct WebhookTransport {
    endpoint: Url,
    agent: ureq::Agent,
}

impl WebhookTransport {
    pub fn new(raw_url: &str) -> Result<Self> {
        Self::with_timeout(raw_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(raw_url: &str, timeout: Duration) -> Result<Self> {
        let endpoint = parse_webhook_endpoint(raw_url)?;
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { endpoint, agent })
    }
}

impl Transport for WebhookTransport {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn send(&self, payload: &Payload) -> Result<(), TransportError> {
        match self
            .agent
            .post(self.endpoint.as_str())
            .send_json(payload)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) if code == 401 || code == 403 => {
                Err(TransportError::Auth(format!("status {}", code)))
            }
            Err(ureq::Error::Status(code, _)) if (400..500).contains(&code) => {
                Err(TransportError::Rejected(format!("status {}", code)))
            }
            Err(ureq::Error::Status(code, _)) => {
                Err(TransportError::Network(format!("status {}", code)))
            }
            Err(err) => Err(TransportError::Network(err.to_string())),
        }
    }
}
