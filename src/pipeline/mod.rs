//! Per-message forwarding pipeline.
//!
//! Every unseen message the worker loop fetches flows through:
//! 1. loop guard: subjects already carrying the forward marker are skipped
//! 2. `ContentTransformer::transform()`: optional LLM rewrite, pass-through on failure
//! 3. `compose_forward()` + `Relay::send()`
//!
//! The returned `Disposition` decides whether the source message is marked seen.

pub mod forwarder;
pub mod transformer;
pub mod types;

pub use forwarder::Forwarder;
pub use transformer::ContentTransformer;
pub use types::{Disposition, MessageHandler};
