//! Engine event broadcasting

pub mod events;

pub use events::{EngineEvent, EventBus, EventType};
