//! Mail I/O: IMAP source, SMTP relay and the two worker triggers.

pub mod email_poller;
pub mod email_types;
pub mod idle;
pub mod imap;
pub mod run_state;
pub mod smtp;

pub use email_poller::{CycleReport, PollingScheduler, process_unseen};
pub use email_types::{Attachment, ParsedMessage, RawMessage, Uid};
pub use idle::{IdleNotifier, IdleState};
pub use imap::{IdleEvent, ImapMailbox, ImapSession, Mailbox};
pub use run_state::{RunState, WorkerHandle, WorkerState};
pub use smtp::{OutboundBody, OutboundMessage, Relay, SmtpRelay, compose_forward};
