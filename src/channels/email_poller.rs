//! Fixed-interval IMAP poller.
//!
//! Every cycle connects, lists unseen messages, runs each through the
//! [`MessageHandler`] in server order, marks forwarded or skipped ones
//! `\Seen` and disconnects. Failed messages stay unseen and come back on
//! the next cycle.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::email_types::ParsedMessage;
use super::imap::Mailbox;
use super::run_state::{RunState, WorkerHandle};
use crate::error::MailboxError;
use crate::pipeline::{Disposition, MessageHandler};

/// Counters for one pass over the unseen list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub listed: usize,
    pub forwarded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Listed but gone by the time they were fetched.
    pub missing: usize,
}

impl CycleReport {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Forwarded => self.forwarded += 1,
            Disposition::Skipped => self.skipped += 1,
            Disposition::Failed => self.failed += 1,
        }
    }

    /// Messages the cycle finished with, one way or another.
    pub fn handled(&self) -> usize {
        self.forwarded + self.skipped + self.failed + self.missing
    }
}

/// Run the pipeline over every unseen message in `folder`.
///
/// The mailbox must be connected and `run_state` running. A stop request is
/// honoured between messages; anything not yet handled stays unseen.
/// Only list/fetch failures abort the cycle.
pub async fn process_unseen(
    mailbox: &mut dyn Mailbox,
    folder: &str,
    handler: &dyn MessageHandler,
    run_state: &RunState,
) -> Result<CycleReport, MailboxError> {
    let uids = mailbox.list_unseen(folder).await?;
    let mut report = CycleReport {
        listed: uids.len(),
        ..Default::default()
    };
    if uids.is_empty() {
        debug!(folder, "No unseen messages");
        return Ok(report);
    }
    info!(folder, count = uids.len(), "Found unseen messages");

    let mut fetched = mailbox.fetch_raw(&uids).await?;

    for uid in uids {
        if !run_state.is_running() {
            info!(
                remaining = report.listed - report.handled(),
                "Stop requested, leaving remaining messages unseen"
            );
            break;
        }

        let Some(raw) = fetched.remove(&uid) else {
            warn!(uid = %uid, "Message disappeared before fetch, skipping");
            report.missing += 1;
            continue;
        };

        let message = match ParsedMessage::parse(uid, raw) {
            Ok(message) => message,
            Err(e) => {
                error!(uid = %uid, stage = "parse", "Failed to parse message: {e}");
                report.failed += 1;
                continue;
            }
        };

        let disposition = handler.handle(message).await;
        debug!(uid = %uid, outcome = disposition.label(), "Message handled");
        report.record(disposition);

        if disposition.marks_seen()
            && let Err(e) = mailbox.mark_seen(uid).await
        {
            warn!(uid = %uid, "Failed to mark message seen: {e}");
        }
    }

    Ok(report)
}

pub(crate) fn log_report(report: &CycleReport) {
    if report.listed == 0 {
        return;
    }
    info!(
        listed = report.listed,
        forwarded = report.forwarded,
        skipped = report.skipped,
        failed = report.failed,
        missing = report.missing,
        "Cycle complete"
    );
}

pub(crate) fn log_mailbox_error(e: &MailboxError) {
    if e.is_auth() {
        error!("IMAP authentication failed, check SOURCE_EMAIL/SOURCE_PASSWORD: {e}");
    } else {
        error!("Mailbox error: {e}");
    }
}

/// Polls the source folder every `interval`.
pub struct PollingScheduler {
    mailbox: Box<dyn Mailbox>,
    handler: Arc<dyn MessageHandler>,
    folder: String,
    interval: Duration,
}

impl PollingScheduler {
    pub fn new(
        mailbox: Box<dyn Mailbox>,
        handler: Arc<dyn MessageHandler>,
        folder: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            mailbox,
            handler,
            folder: folder.into(),
            interval,
        }
    }

    /// Start the loop on its own task.
    pub fn spawn(self) -> WorkerHandle {
        let run_state = Arc::new(RunState::new());
        run_state.start();
        let task = tokio::spawn(self.run(Arc::clone(&run_state)));
        WorkerHandle::new(run_state, task)
    }

    async fn run(mut self, run_state: Arc<RunState>) {
        info!(
            folder = %self.folder,
            "Email poller started, polling every {}s",
            self.interval.as_secs()
        );

        while run_state.is_running() {
            self.run_cycle(&run_state).await;
            if !run_state.wait(self.interval).await {
                break;
            }
        }

        info!("Email poller stopped");
        run_state.finish();
    }

    /// connect → process → disconnect. The session never outlives the cycle.
    async fn run_cycle(&mut self, run_state: &RunState) {
        if let Err(e) = self.mailbox.connect().await {
            log_mailbox_error(&e);
            self.mailbox.disconnect().await;
            return;
        }

        let result = process_unseen(
            self.mailbox.as_mut(),
            &self.folder,
            self.handler.as_ref(),
            run_state,
        )
        .await;
        self.mailbox.disconnect().await;

        match result {
            Ok(report) => log_report(&report),
            Err(e) => log_mailbox_error(&e),
        }
    }
}
