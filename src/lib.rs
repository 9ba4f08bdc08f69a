//! Braid - Conversation Memory Infrastructure
//!
//! Branching conversation trees for AI agents: turn alternatives, active-path
//! activation cascades, asynchronous content binding, and token-accounted
//! working-memory assembly.

pub mod engine;
pub mod error;
pub mod ingest;
pub mod realtime;
pub mod storage;
pub mod tokens;
pub mod types;

pub use engine::ConversationEngine;
pub use error::{BraidError, Result};
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
