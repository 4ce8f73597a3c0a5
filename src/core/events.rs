//! Typed notifications published on the event bus.
//!
//! Producers:
//! - `LayerManager` emits [`LayerChangedEvent`] after every successful mutation,
//!   but only while its owning item is the timeline's current item.
//! - `LayerComposeTask` emits [`TimelineChangedEvent`] once an item's flattened
//!   outputs have been rewritten.
//! - `Timeline` emits [`TimelineItemSelectedEvent`] when the current item changes.
//! - `ProjectTaskManager` emits the task events.

use std::path::PathBuf;

use crate::entities::layer::Layer;

/// What happened to a layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayerChangeKind {
    Added,
    Removed,
    Modified,
    Reordered,
}

impl LayerChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerChangeKind::Added => "added",
            LayerChangeKind::Removed => "removed",
            LayerChangeKind::Modified => "modified",
            LayerChangeKind::Reordered => "reordered",
        }
    }
}

/// Emitted when a layer of the current timeline item changes.
#[derive(Clone, Debug)]
pub struct LayerChangedEvent {
    /// 1-based index of the owning timeline item
    pub item_index: usize,
    /// Snapshot of the layer after the change (before removal for `Removed`)
    pub layer: Layer,
    pub kind: LayerChangeKind,
}

/// Emitted when an item's `image.png` / `video.mp4` were refreshed.
#[derive(Clone, Debug)]
pub struct TimelineChangedEvent {
    pub item_index: usize,
    pub image_path: PathBuf,
    pub video_path: PathBuf,
}

/// Emitted when the timeline's current item changes.
#[derive(Clone, Debug)]
pub struct TimelineItemSelectedEvent {
    pub previous: Option<usize>,
    pub current: usize,
}

/// Progress report for a generation task (0..=100).
#[derive(Clone, Debug)]
pub struct TaskProgressEvent {
    pub task_id: String,
    pub item_index: usize,
    pub percent: u8,
}

/// Generation task reached a terminal state.
#[derive(Clone, Debug)]
pub struct TaskFinishedEvent {
    pub task_id: String,
    pub item_index: usize,
    /// Layer registered from the task output, if it completed
    pub layer_id: Option<u32>,
    pub error: Option<String>,
}
