//! Email LLM forwarder: watch an IMAP folder, optionally rewrite each new
//! message through an LLM and relay it to a fixed address over SMTP.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod logging;
pub mod pipeline;
