//! Shared building blocks for the diwan back office: identifiers,
//! configuration and domain events.

pub mod config;
pub mod events;
pub mod types;

pub use crate::config::*;
pub use crate::events::{Event, EventPublisher, InMemoryPublisher, PublishError, TracingPublisher};
pub use crate::types::*;
