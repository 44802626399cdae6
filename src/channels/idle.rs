//! Push-driven trigger using IMAP IDLE.
//!
//! One long-lived session: a catch-up cycle after every (re)connect, then
//! IDLE until the server reports new mail, the idle timeout lapses (check
//! again, then re-arm) or a stop is requested. Any mailbox error drops the session and retries
//! after `reconnect_delay`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::email_poller::{log_mailbox_error, log_report, process_unseen};
use super::imap::{IdleEvent, Mailbox};
use super::run_state::{RunState, WorkerHandle};
use crate::error::MailboxError;
use crate::pipeline::MessageHandler;

/// Where the notifier currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Disconnected,
    Idling,
    Handling,
}

pub struct IdleNotifier {
    mailbox: Box<dyn Mailbox>,
    handler: Arc<dyn MessageHandler>,
    folder: String,
    idle_timeout: Duration,
    reconnect_delay: Duration,
    state: IdleState,
}

impl IdleNotifier {
    pub fn new(
        mailbox: Box<dyn Mailbox>,
        handler: Arc<dyn MessageHandler>,
        folder: impl Into<String>,
        idle_timeout: Duration,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            mailbox,
            handler,
            folder: folder.into(),
            idle_timeout,
            reconnect_delay,
            state: IdleState::Disconnected,
        }
    }

    pub fn spawn(self) -> WorkerHandle {
        let run_state = Arc::new(RunState::new());
        run_state.start();
        let task = tokio::spawn(self.run(Arc::clone(&run_state)));
        WorkerHandle::new(run_state, task)
    }

    fn set_state(&mut self, state: IdleState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "IDLE notifier state");
            self.state = state;
        }
    }

    async fn run(mut self, run_state: Arc<RunState>) {
        info!(
            folder = %self.folder,
            "IDLE listener started, re-arming every {}s",
            self.idle_timeout.as_secs()
        );

        while run_state.is_running() {
            match self.session(&run_state).await {
                Ok(()) => break,
                Err(e) => {
                    log_mailbox_error(&e);
                    self.mailbox.disconnect().await;
                    self.set_state(IdleState::Disconnected);
                    info!("Reconnecting in {}s", self.reconnect_delay.as_secs());
                    if !run_state.wait(self.reconnect_delay).await {
                        break;
                    }
                }
            }
        }

        self.mailbox.disconnect().await;
        self.set_state(IdleState::Disconnected);
        info!("IDLE listener stopped");
        run_state.finish();
    }

    /// One connected session. `Ok` means a stop was requested.
    async fn session(&mut self, run_state: &RunState) -> Result<(), MailboxError> {
        self.mailbox.connect().await?;
        self.handle_new_mail(run_state).await?;

        while run_state.is_running() {
            self.set_state(IdleState::Idling);
            match self.mailbox.idle(self.idle_timeout, run_state).await? {
                IdleEvent::NewMail => {
                    info!("New mail notification");
                    self.handle_new_mail(run_state).await?;
                }
                IdleEvent::Timeout => {
                    // Mail announced outside IDLE may not have been reported.
                    debug!("IDLE timed out, checking before re-arming");
                    self.handle_new_mail(run_state).await?;
                }
                IdleEvent::Stopped => break,
            }
        }
        Ok(())
    }

    async fn handle_new_mail(&mut self, run_state: &RunState) -> Result<(), MailboxError> {
        self.set_state(IdleState::Handling);
        let report = process_unseen(
            self.mailbox.as_mut(),
            &self.folder,
            self.handler.as_ref(),
            run_state,
        )
        .await?;
        log_report(&report);
        Ok(())
    }
}
