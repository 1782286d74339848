use std::sync::atomic::{AtomicU64, Ordering};

use super::Transport;
use crate::error::TransportError;
use crate::notify::Payload;

/// Stub transport: logs each notice and reports success.
#[derive(Debug, Default)]
pub struct LogTransport {
    delivered: AtomicU64,
}

impl LogTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }
}

impl Transport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    fn send(&self, payload: &Payload) -> Result<(), TransportError> {
        let n = self.delivered.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!(
            "notice #{} to={} subject={:?} attachment={}",
            n,
            payload.recipient,
            payload.subject,
            payload.attachment.is_some()
        );
        log::debug!("notice body:\n{}", payload.body);
        Ok(())
    }
}
