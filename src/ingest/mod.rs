//! Asynchronous intake from producer collaborators

pub mod worker;

pub use worker::{IngestCommand, IngestWorker};
