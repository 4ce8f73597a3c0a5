//! Timeline and timeline items.
//!
//! Project layout:
//! ```text
//! <project>/timeline/
//!   1/ image.png  video.mp4  config.yml  layers/  tasks/
//!   2/ ...
//! ```
//!
//! Items are numbered from 1 without gaps. Each item lazily owns one
//! [`LayerManager`] and one [`TimelineItemTaskManager`]. Selection is an
//! index shared between the timeline and its items (0 = nothing selected),
//! so an item can answer `is_selected()` without pointing back at the timeline.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info, trace, warn};
use serde_yaml::{Mapping, Value};

use crate::config::FilmetoConfig;
use crate::core::compose_queue::LayerComposeTaskManager;
use crate::core::event_bus::Notifier;
use crate::core::events::TimelineItemSelectedEvent;

use super::layer_manager::{LayerError, LayerManager};
use super::task::TimelineItemTaskManager;

pub const TIMELINE_DIR: &str = "timeline";
pub const IMAGE_FILE: &str = "image.png";
pub const VIDEO_FILE: &str = "video.mp4";
pub const CONFIG_FILE: &str = "config.yml";
pub const LAYERS_DIR: &str = "layers";
pub const TASKS_DIR: &str = "tasks";

/// Timeline / item bookkeeping errors
#[derive(Debug)]
pub enum TimelineError {
    Io { path: PathBuf, source: std::io::Error },
    Yaml { path: PathBuf, source: serde_yaml::Error },
    NoSuchItem(usize),
}

impl std::fmt::Display for TimelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimelineError::Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
            TimelineError::Yaml { path, source } => {
                write!(f, "Malformed YAML in {}: {}", path.display(), source)
            }
            TimelineError::NoSuchItem(index) => write!(f, "No timeline item {}", index),
        }
    }
}

impl std::error::Error for TimelineError {}

/// Collaborators handed to every item and layer manager.
#[derive(Clone, Debug)]
pub struct ItemServices {
    pub config: Arc<FilmetoConfig>,
    pub notifier: Notifier,
    pub composer: Option<LayerComposeTaskManager>,
}

impl ItemServices {
    /// No notifications, no compose queue.
    pub fn new(config: Arc<FilmetoConfig>) -> Self {
        Self {
            config,
            notifier: Notifier::dummy(),
            composer: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_composer(mut self, composer: LayerComposeTaskManager) -> Self {
        self.composer = Some(composer);
        self
    }
}

pub struct Timeline {
    dir: PathBuf,
    services: ItemServices,
    selection: Arc<AtomicUsize>,
    items: Mutex<HashMap<usize, Arc<TimelineItem>>>,
    /// Serializes directory creation in add_item
    create_lock: Mutex<()>,
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("dir", &self.dir)
            .field("current", &self.current_index())
            .finish()
    }
}

impl Timeline {
    /// Open (creating if needed) `<project_dir>/timeline`. Selects item 1 if present.
    pub fn open(project_dir: &Path, services: ItemServices) -> Result<Arc<Self>, TimelineError> {
        let dir = project_dir.join(TIMELINE_DIR);
        fs::create_dir_all(&dir).map_err(|source| TimelineError::Io {
            path: dir.clone(),
            source,
        })?;
        let timeline = Arc::new(Self {
            dir,
            services,
            selection: Arc::new(AtomicUsize::new(0)),
            items: Mutex::new(HashMap::new()),
            create_lock: Mutex::new(()),
        });
        let count = timeline.item_count();
        if count > 0 {
            timeline.selection.store(1, Ordering::SeqCst);
        }
        info!("Opened timeline {} ({} items)", timeline.dir.display(), count);
        Ok(timeline)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn services(&self) -> &ItemServices {
        &self.services
    }

    /// Number of contiguous item directories starting at 1.
    pub fn item_count(&self) -> usize {
        let mut n = 0;
        while self.dir.join((n + 1).to_string()).is_dir() {
            n += 1;
        }
        n
    }

    /// Create the next item directory. The first item becomes current.
    pub fn add_item(&self) -> Result<Arc<TimelineItem>, TimelineError> {
        let index = {
            let _guard = self.create_lock.lock().unwrap_or_else(|e| e.into_inner());
            let index = self.item_count() + 1;
            let path = self.dir.join(index.to_string());
            let layers = path.join(LAYERS_DIR);
            fs::create_dir_all(&layers).map_err(|source| TimelineError::Io { path: layers, source })?;
            index
        };
        info!("Created timeline item {}", index);
        if self.current_index().is_none() {
            self.set_current_index(index)?;
        }
        self.item(index)
    }

    /// Cached item handle, constructed on first access.
    pub fn item(&self, index: usize) -> Result<Arc<TimelineItem>, TimelineError> {
        let path = self.dir.join(index.to_string());
        if index == 0 || !path.is_dir() {
            return Err(TimelineError::NoSuchItem(index));
        }
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let item = items.entry(index).or_insert_with(|| {
            trace!("Caching timeline item {}", index);
            TimelineItem::new(index, path, Arc::clone(&self.selection), self.services.clone())
        });
        Ok(Arc::clone(item))
    }

    /// Drop the cached handle (and with it the item's managers once unused).
    pub fn evict(&self, index: usize) -> bool {
        let evicted = self
            .items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&index)
            .is_some();
        if evicted {
            debug!("Evicted timeline item {}", index);
        }
        evicted
    }

    pub fn current_index(&self) -> Option<usize> {
        match self.selection.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn set_current_index(&self, index: usize) -> Result<(), TimelineError> {
        if index == 0 || index > self.item_count() {
            return Err(TimelineError::NoSuchItem(index));
        }
        let previous = self.selection.swap(index, Ordering::SeqCst);
        if previous != index {
            self.services.notifier.emit(TimelineItemSelectedEvent {
                previous: (previous != 0).then_some(previous),
                current: index,
            });
        }
        Ok(())
    }
}

pub struct TimelineItem {
    me: Weak<TimelineItem>,
    index: usize,
    path: PathBuf,
    selection: Arc<AtomicUsize>,
    services: ItemServices,
    config_lock: Mutex<()>,
    layer_manager: Mutex<Option<Arc<LayerManager>>>,
    task_manager: Mutex<Option<Arc<TimelineItemTaskManager>>>,
}

impl std::fmt::Debug for TimelineItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineItem")
            .field("index", &self.index)
            .field("path", &self.path)
            .finish()
    }
}

impl TimelineItem {
    fn new(index: usize, path: PathBuf, selection: Arc<AtomicUsize>, services: ItemServices) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            index,
            path,
            selection,
            services,
            config_lock: Mutex::new(()),
            layer_manager: Mutex::new(None),
            task_manager: Mutex::new(None),
        })
    }

    /// 1-based position in the timeline
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layers_path(&self) -> PathBuf {
        self.path.join(LAYERS_DIR)
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.path.join(TASKS_DIR)
    }

    pub fn image_path(&self) -> PathBuf {
        self.path.join(IMAGE_FILE)
    }

    pub fn video_path(&self) -> PathBuf {
        self.path.join(VIDEO_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    pub fn is_selected(&self) -> bool {
        self.selection.load(Ordering::SeqCst) == self.index
    }

    pub fn services(&self) -> &ItemServices {
        &self.services
    }

    /// Layer manager, created and loaded on first access.
    pub fn layer_manager(&self) -> Result<Arc<LayerManager>, LayerError> {
        let mut slot = self.layer_manager.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(manager) = slot.as_ref() {
            return Ok(Arc::clone(manager));
        }
        let me = self.me.upgrade().ok_or(LayerError::NotLoaded)?;
        let manager = LayerManager::new(self.services.clone());
        manager.load(&me)?;
        *slot = Some(Arc::clone(&manager));
        Ok(manager)
    }

    /// Generation-task manager, created and loaded on first access.
    pub fn task_manager(&self) -> Arc<TimelineItemTaskManager> {
        let mut slot = self.task_manager.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(manager) = slot.as_ref() {
            return Arc::clone(manager);
        }
        let manager = Arc::new(TimelineItemTaskManager::new(self.index, self.tasks_path(), self.me.clone()));
        if let Err(e) = manager.load_tasks() {
            warn!("Item {}: {}", self.index, e);
        }
        *slot = Some(Arc::clone(&manager));
        manager
    }

    // === config.yml ===

    pub fn get_config_value(&self, key: &str) -> Result<Option<Value>, TimelineError> {
        let _guard = self.config_lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_config()?.get(key).cloned())
    }

    /// Set one top-level key, preserving all others.
    pub fn set_config_value(&self, key: &str, value: Value) -> Result<(), TimelineError> {
        let _guard = self.config_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut config = self.read_config()?;
        config.insert(Value::from(key), value);
        let path = self.config_path();
        let text = serde_yaml::to_string(&config).map_err(|source| TimelineError::Yaml {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, text).map_err(|source| TimelineError::Io { path, source })
    }

    fn read_config(&self) -> Result<Mapping, TimelineError> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(Mapping::new());
        }
        let text = fs::read_to_string(&path).map_err(|source| TimelineError::Io {
            path: path.clone(),
            source,
        })?;
        if text.trim().is_empty() {
            return Ok(Mapping::new());
        }
        serde_yaml::from_str(&text).map_err(|source| TimelineError::Yaml { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_bus::{EventBus, downcast_event};

    fn services() -> ItemServices {
        ItemServices::new(Arc::new(FilmetoConfig::default()))
    }

    #[test]
    fn test_layout_and_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let timeline = Timeline::open(tmp.path(), services()).unwrap();
        assert_eq!(timeline.item_count(), 0);
        assert_eq!(timeline.current_index(), None);

        let item = timeline.add_item().unwrap();
        assert_eq!(item.index(), 1);
        assert_eq!(item.path(), tmp.path().join("timeline").join("1"));
        assert!(item.layers_path().is_dir());
        assert_eq!(item.image_path().file_name().unwrap(), "image.png");
        assert_eq!(item.video_path().file_name().unwrap(), "video.mp4");
        assert!(item.is_selected());

        timeline.add_item().unwrap();
        assert_eq!(timeline.item_count(), 2);
        assert!(matches!(timeline.item(3), Err(TimelineError::NoSuchItem(3))));
        assert!(matches!(timeline.item(0), Err(TimelineError::NoSuchItem(0))));
    }

    #[test]
    fn test_items_are_cached_until_evicted() {
        let tmp = tempfile::tempdir().unwrap();
        let timeline = Timeline::open(tmp.path(), services()).unwrap();
        timeline.add_item().unwrap();
        let a = timeline.item(1).unwrap();
        let b = timeline.item(1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a.layer_manager().unwrap(), &b.layer_manager().unwrap()));

        assert!(timeline.evict(1));
        assert!(!timeline.evict(1));
        assert!(!Arc::ptr_eq(&a, &timeline.item(1).unwrap()));
    }

    #[test]
    fn test_selection_events() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let timeline = Timeline::open(
            tmp.path(),
            services().with_notifier(Notifier::from_emitter(bus.emitter())),
        )
        .unwrap();
        timeline.add_item().unwrap();
        timeline.add_item().unwrap();
        timeline.set_current_index(2).unwrap();
        timeline.set_current_index(2).unwrap();
        assert!(timeline.set_current_index(5).is_err());

        let selections: Vec<(Option<usize>, usize)> = bus
            .poll()
            .iter()
            .filter_map(|e| downcast_event::<TimelineItemSelectedEvent>(e))
            .map(|e| (e.previous, e.current))
            .collect();
        assert_eq!(selections, vec![(None, 1), (Some(1), 2)]);
        assert!(!timeline.item(1).unwrap().is_selected());
        assert!(timeline.item(2).unwrap().is_selected());
    }

    #[test]
    fn test_reopen_selects_first() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("timeline/1")).unwrap();
        fs::create_dir_all(tmp.path().join("timeline/2")).unwrap();
        fs::create_dir_all(tmp.path().join("timeline/4")).unwrap();
        let timeline = Timeline::open(tmp.path(), services()).unwrap();
        assert_eq!(timeline.item_count(), 2);
        assert_eq!(timeline.current_index(), Some(1));
    }

    #[test]
    fn test_config_values_preserved() {
        let tmp = tempfile::tempdir().unwrap();
        let timeline = Timeline::open(tmp.path(), services()).unwrap();
        let item = timeline.add_item().unwrap();
        assert_eq!(item.get_config_value("prompt").unwrap(), None);
        item.set_config_value("prompt", Value::from("dusk")).unwrap();
        item.set_config_value("seed", Value::from(7)).unwrap();
        assert_eq!(item.get_config_value("prompt").unwrap(), Some(Value::from("dusk")));

        fs::write(item.config_path(), "prompt: [unclosed\n").unwrap();
        assert!(matches!(
            item.get_config_value("prompt"),
            Err(TimelineError::Yaml { .. })
        ));
    }
}
