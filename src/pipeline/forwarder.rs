//! The per-message pipeline: loop guard → transform → compose → relay.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::transformer::ContentTransformer;
use super::types::{Disposition, MessageHandler};
use crate::channels::email_types::ParsedMessage;
use crate::channels::smtp::{Relay, compose_forward};

/// Forwards every message that does not already carry the marker.
pub struct Forwarder {
    transformer: ContentTransformer,
    relay: Arc<dyn Relay>,
    marker: String,
}

impl Forwarder {
    pub fn new(transformer: ContentTransformer, relay: Arc<dyn Relay>, marker: impl Into<String>) -> Self {
        Self {
            transformer,
            relay,
            marker: marker.into(),
        }
    }

    /// True if the subject shows the message was produced by a forward.
    pub fn is_forwarded(&self, subject: &str) -> bool {
        subject.trim_start().starts_with(&self.marker)
    }
}

#[async_trait]
impl MessageHandler for Forwarder {
    async fn handle(&self, message: ParsedMessage) -> Disposition {
        let uid = message.uid;
        if self.is_forwarded(&message.subject) {
            info!(uid = ?uid, subject = %message.subject, "Already forwarded, skipping");
            return Disposition::Skipped;
        }

        let message = self.transformer.transform(message).await;
        let outbound = compose_forward(&message, &self.marker);
        debug!(uid = ?uid, subject = %outbound.subject, "Relaying message");

        match self.relay.send(&outbound).await {
            Ok(()) => Disposition::Forwarded,
            Err(e) if e.is_auth() => {
                error!(uid = ?uid, stage = "relay", "SMTP authentication failed: {e}");
                Disposition::Failed
            }
            Err(e) => {
                error!(uid = ?uid, stage = "relay", "Failed to forward message: {e}");
                Disposition::Failed
            }
        }
    }
}
