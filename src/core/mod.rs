//! Core services - event bus and the compose queue.
//!
//! Independent of any front end: the CLI and tests drive them directly.

pub mod compose_queue;
pub mod event_bus;
pub mod events;

pub use compose_queue::LayerComposeTaskManager;
pub use event_bus::{EventBus, EventEmitter, Notifier};
