//! Filmeto - timeline layer composition library
//!
//! Re-exports all modules for use by the binary target.

// Core services (events, compose queue)
pub mod core;

// Domain and I/O
pub mod entities;
pub mod media;

// App modules
pub mod cli;
pub mod config;
pub mod paths;

// Re-export commonly used types
pub use config::FilmetoConfig;
pub use core::compose_queue::LayerComposeTaskManager;
pub use core::event_bus::{downcast_event, BoxedEvent, EventBus, EventEmitter, Notifier};
pub use entities::{Layer, LayerManager, LayerType, Timeline, TimelineItem};
