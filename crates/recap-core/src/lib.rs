//! # recap-core
//!
//! Core types, traits, and abstractions for the recap summarization job system.
//!
//! This crate provides the job data model, the shared error type, defaults,
//! logging conventions, stream event types, and the [`ContentOperations`]
//! collaborator trait that other recap crates depend on.

pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{EventKind, MessageLevel, StreamEvent};
pub use models::*;
pub use traits::*;
