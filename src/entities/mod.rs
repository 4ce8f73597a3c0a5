//! Entities - layers, timeline items and the work done on them.
//!
//! - `layer` / `layer_manager`: per-item layer set and its persistence
//! - `compositor`: pixel blending shared by image and video composition
//! - `compose_task`: one composition run for one item
//! - `timeline`: items on disk, selection
//! - `task`: generation task bookkeeping

pub mod compose_task;
pub mod compositor;
pub mod layer;
pub mod layer_manager;
pub mod task;
pub mod timeline;

pub use compose_task::{ComposeState, LayerComposeTask};
pub use layer::{Layer, LayerType};
pub use layer_manager::{LayerError, LayerManager};
pub use task::{ProjectTaskManager, Task, TaskStatus, TimelineItemTaskManager};
pub use timeline::{ItemServices, Timeline, TimelineItem};
