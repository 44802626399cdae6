//! Shared types for the forwarding pipeline.

use async_trait::async_trait;

use crate::channels::email_types::ParsedMessage;

/// Outcome of handling one message. Decides whether it gets marked seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Relayed to the destination.
    Forwarded,
    /// Deliberately not relayed (already carries the forward marker).
    Skipped,
    /// Relay failed; leave unseen so the next cycle retries it.
    Failed,
}

impl Disposition {
    pub fn label(self) -> &'static str {
        match self {
            Self::Forwarded => "forwarded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    /// Whether the source message should be flagged `\Seen`.
    pub fn marks_seen(self) -> bool {
        matches!(self, Self::Forwarded | Self::Skipped)
    }
}

/// Per-message callback invoked by the worker loop, one message at a time,
/// in server order.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ParsedMessage) -> Disposition;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_failed_stays_unseen() {
        assert!(Disposition::Forwarded.marks_seen());
        assert!(Disposition::Skipped.marks_seen());
        assert!(!Disposition::Failed.marks_seen());
    }

    #[test]
    fn labels() {
        assert_eq!(Disposition::Forwarded.label(), "forwarded");
        assert_eq!(Disposition::Failed.label(), "failed");
    }
}
