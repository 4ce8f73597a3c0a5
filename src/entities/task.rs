//! Generation task bookkeeping.
//!
//! A [`Task`] records one generation job (a tool run that will produce a layer
//! file) for a timeline item. Tasks are persisted as `<item>/tasks/<id>.yml`.
//! Completing a task registers its output as a new layer, which in turn
//! triggers auto-composition of the item.
//!
//! - [`TimelineItemTaskManager`]: per item, owns the task records
//! - [`ProjectTaskManager`]: per timeline, routes task ids to items and
//!   publishes progress / finished events

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::event_bus::Notifier;
use crate::core::events::{TaskFinishedEvent, TaskProgressEvent};

use super::layer::LayerType;
use super::layer_manager::LayerError;
use super::timeline::{Timeline, TimelineError, TimelineItem};

/// Task bookkeeping errors
#[derive(Debug)]
pub enum TaskError {
    UnknownTask(String),
    /// Task already completed or failed
    Finished(String),
    Io { path: PathBuf, source: std::io::Error },
    Yaml { path: PathBuf, source: serde_yaml::Error },
    Layer(LayerError),
    Timeline(TimelineError),
    /// Owning item was dropped
    Detached(usize),
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::UnknownTask(id) => write!(f, "Unknown task {}", id),
            TaskError::Finished(id) => write!(f, "Task {} already finished", id),
            TaskError::Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
            TaskError::Yaml { path, source } => write!(f, "Bad task file {}: {}", path.display(), source),
            TaskError::Layer(e) => write!(f, "{}", e),
            TaskError::Timeline(e) => write!(f, "{}", e),
            TaskError::Detached(index) => write!(f, "Timeline item {} no longer exists", index),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<LayerError> for TaskError {
    fn from(e: LayerError) -> Self {
        TaskError::Layer(e)
    }
}

impl From<TimelineError> for TaskError {
    fn from(e: TimelineError) -> Self {
        TaskError::Timeline(e)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Creation order within the item
    pub seq: u64,
    pub item_index: usize,
    pub tool: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub layer_id: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Tasks of one timeline item.
#[derive(Debug)]
pub struct TimelineItemTaskManager {
    item_index: usize,
    dir: PathBuf,
    item: Weak<TimelineItem>,
    tasks: Mutex<Vec<Task>>,
}

impl TimelineItemTaskManager {
    pub fn new(item_index: usize, dir: PathBuf, item: Weak<TimelineItem>) -> Self {
        Self {
            item_index,
            dir,
            item,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Replace in-memory tasks with `<dir>/*.yml`, ordered by creation.
    pub fn load_tasks(&self) -> Result<usize, TaskError> {
        let mut loaded = Vec::new();
        if self.dir.is_dir() {
            let entries = fs::read_dir(&self.dir).map_err(|source| TaskError::Io {
                path: self.dir.clone(),
                source,
            })?;
            for path in entries.flatten().map(|e| e.path()) {
                if path.extension().is_none_or(|e| e != "yml") {
                    continue;
                }
                match read_task(&path) {
                    Ok(task) => loaded.push(task),
                    Err(e) => warn!("Skipping task file: {}", e),
                }
            }
        }
        loaded.sort_by_key(|t| t.seq);
        let count = loaded.len();
        *self.tasks.lock().unwrap_or_else(|e| e.into_inner()) = loaded;
        debug!("Item {}: loaded {} tasks", self.item_index, count);
        Ok(count)
    }

    pub fn create_task(&self, tool: &str, params: BTreeMap<String, String>) -> Result<Task, TaskError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = Task {
            id: Uuid::new_v4().to_string(),
            seq: tasks.last().map_or(1, |t| t.seq + 1),
            item_index: self.item_index,
            tool: tool.to_owned(),
            params,
            status: TaskStatus::Pending,
            progress: 0,
            layer_id: None,
            error: None,
        };
        self.save(&task)?;
        tasks.push(task.clone());
        info!("Item {}: created {} task {}", self.item_index, task.tool, task.id);
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    /// All tasks in creation order
    pub fn list_tasks(&self) -> Vec<Task> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Record progress (clamped to 100); a pending task becomes running.
    pub fn update_progress(&self, id: &str, percent: u8) -> Result<Task, TaskError> {
        self.update(id, |task| {
            task.progress = percent.min(100);
            task.status = TaskStatus::Running;
        })
    }

    /// Register `output_file` as a new layer and mark the task completed.
    ///
    /// If the layer cannot be added the task is marked failed and the error returned.
    pub fn complete_task(&self, id: &str, output_file: &Path, layer_type: LayerType) -> Result<Task, TaskError> {
        self.ensure_open(id)?;
        let item = self.item.upgrade().ok_or(TaskError::Detached(self.item_index))?;
        let added = item
            .layer_manager()
            .and_then(|manager| manager.add_layer_from_file(output_file, layer_type));
        match added {
            Ok(layer) => self.update(id, |task| {
                task.status = TaskStatus::Completed;
                task.progress = 100;
                task.layer_id = Some(layer.id);
            }),
            Err(e) => {
                let message = e.to_string();
                self.fail_task(id, &message)?;
                Err(TaskError::Layer(e))
            }
        }
    }

    pub fn fail_task(&self, id: &str, message: &str) -> Result<Task, TaskError> {
        warn!("Item {}: task {} failed: {}", self.item_index, id, message);
        self.update(id, |task| {
            task.status = TaskStatus::Failed;
            task.error = Some(message.to_owned());
        })
    }

    fn ensure_open(&self, id: &str) -> Result<(), TaskError> {
        match self.get_task(id) {
            None => Err(TaskError::UnknownTask(id.to_owned())),
            Some(t) if t.status.is_finished() => Err(TaskError::Finished(id.to_owned())),
            Some(_) => Ok(()),
        }
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut Task)) -> Result<Task, TaskError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TaskError::UnknownTask(id.to_owned()))?;
        if task.status.is_finished() {
            return Err(TaskError::Finished(id.to_owned()));
        }
        f(task);
        let snapshot = task.clone();
        self.save(&snapshot)?;
        Ok(snapshot)
    }

    fn save(&self, task: &Task) -> Result<(), TaskError> {
        fs::create_dir_all(&self.dir).map_err(|source| TaskError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(format!("{}.yml", task.id));
        let text = serde_yaml::to_string(task).map_err(|source| TaskError::Yaml {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, text).map_err(|source| TaskError::Io { path, source })
    }
}

fn read_task(path: &Path) -> Result<Task, TaskError> {
    let text = fs::read_to_string(path).map_err(|source| TaskError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| TaskError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Timeline-wide task front door.
pub struct ProjectTaskManager {
    timeline: Arc<Timeline>,
    notifier: Notifier,
    /// task id → item index
    routes: Mutex<HashMap<String, usize>>,
}

impl ProjectTaskManager {
    pub fn new(timeline: Arc<Timeline>) -> Self {
        let notifier = timeline.services().notifier.clone();
        Self {
            timeline,
            notifier,
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild routes from every item's task directory.
    pub fn restore(&self) -> Result<usize, TaskError> {
        let mut routes = HashMap::new();
        for index in 1..=self.timeline.item_count() {
            let manager = self.timeline.item(index)?.task_manager();
            for task in manager.list_tasks() {
                routes.insert(task.id, index);
            }
        }
        let count = routes.len();
        *self.routes.lock().unwrap_or_else(|e| e.into_inner()) = routes;
        Ok(count)
    }

    pub fn submit(&self, item_index: usize, tool: &str, params: BTreeMap<String, String>) -> Result<String, TaskError> {
        let task = self.timeline.item(item_index)?.task_manager().create_task(tool, params)?;
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id.clone(), item_index);
        Ok(task.id)
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.item_tasks(task_id).ok()?.get_task(task_id)
    }

    pub fn update_progress(&self, task_id: &str, percent: u8) -> Result<(), TaskError> {
        let task = self.item_tasks(task_id)?.update_progress(task_id, percent)?;
        self.notifier.emit(TaskProgressEvent {
            task_id: task.id,
            item_index: task.item_index,
            percent: task.progress,
        });
        Ok(())
    }

    /// Returns the id of the layer created from `output_file`.
    pub fn complete(&self, task_id: &str, output_file: &Path, layer_type: LayerType) -> Result<u32, TaskError> {
        let tasks = self.item_tasks(task_id)?;
        match tasks.complete_task(task_id, output_file, layer_type) {
            Ok(task) => {
                let layer_id = task.layer_id.unwrap_or_default();
                self.finished(&task);
                Ok(layer_id)
            }
            Err(e) => {
                if let Some(task) = tasks.get_task(task_id).filter(|t| t.status == TaskStatus::Failed) {
                    self.finished(&task);
                }
                Err(e)
            }
        }
    }

    pub fn fail(&self, task_id: &str, message: &str) -> Result<(), TaskError> {
        let task = self.item_tasks(task_id)?.fail_task(task_id, message)?;
        self.finished(&task);
        Ok(())
    }

    fn item_tasks(&self, task_id: &str) -> Result<Arc<TimelineItemTaskManager>, TaskError> {
        let index = self
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .copied()
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_owned()))?;
        Ok(self.timeline.item(index)?.task_manager())
    }

    fn finished(&self, task: &Task) {
        self.notifier.emit(TaskFinishedEvent {
            task_id: task.id.clone(),
            item_index: task.item_index,
            layer_id: task.layer_id,
            error: task.error.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilmetoConfig;
    use crate::core::event_bus::{EventBus, downcast_event};
    use crate::entities::timeline::ItemServices;

    fn timeline(bus: &EventBus) -> (tempfile::TempDir, Arc<Timeline>) {
        let tmp = tempfile::tempdir().unwrap();
        let config = FilmetoConfig {
            ffmpeg_path: "/nonexistent/ffmpeg".into(),
            ffprobe_path: "/nonexistent/ffprobe".into(),
            ..FilmetoConfig::default()
        };
        let services = ItemServices::new(Arc::new(config)).with_notifier(Notifier::from_emitter(bus.emitter()));
        let timeline = Timeline::open(tmp.path(), services).unwrap();
        timeline.add_item().unwrap();
        (tmp, timeline)
    }

    #[test]
    fn test_task_lifecycle_adds_layer() {
        let bus = EventBus::new();
        let (tmp, timeline) = timeline(&bus);
        let tasks = ProjectTaskManager::new(Arc::clone(&timeline));

        let params = BTreeMap::from([("prompt".to_string(), "red square".to_string())]);
        let id = tasks.submit(1, "text2image", params).unwrap();
        assert_eq!(tasks.get_task(&id).unwrap().status, TaskStatus::Pending);

        tasks.update_progress(&id, 140).unwrap();
        let running = tasks.get_task(&id).unwrap();
        assert_eq!((running.status, running.progress), (TaskStatus::Running, 100));

        let output = tmp.path().join("out.png");
        image::RgbaImage::from_pixel(8, 8, image::Rgba([255, 0, 0, 255]))
            .save(&output)
            .unwrap();
        let layer_id = tasks.complete(&id, &output, LayerType::Image).unwrap();

        let manager = timeline.item(1).unwrap().layer_manager().unwrap();
        assert_eq!(manager.get_layer(layer_id).unwrap().width, 8);
        assert_eq!(tasks.get_task(&id).unwrap().status, TaskStatus::Completed);
        assert!(matches!(tasks.fail(&id, "late"), Err(TaskError::Finished(_))));

        let finished: Vec<Option<u32>> = bus
            .poll()
            .iter()
            .filter_map(|e| downcast_event::<TaskFinishedEvent>(e))
            .map(|e| e.layer_id)
            .collect();
        assert_eq!(finished, vec![Some(layer_id)]);
    }

    #[test]
    fn test_missing_output_fails_task() {
        let bus = EventBus::new();
        let (tmp, timeline) = timeline(&bus);
        let tasks = ProjectTaskManager::new(timeline);
        let id = tasks.submit(1, "image2video", BTreeMap::new()).unwrap();

        let err = tasks.complete(&id, &tmp.path().join("missing.mp4"), LayerType::Video);
        assert!(matches!(err, Err(TaskError::Layer(LayerError::Io { .. }))));
        let task = tasks.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());
        assert!(matches!(tasks.update_progress("nope", 1), Err(TaskError::UnknownTask(_))));
    }

    #[test]
    fn test_tasks_persist_in_creation_order() {
        let bus = EventBus::new();
        let (tmp, timeline) = timeline(&bus);
        let tasks = ProjectTaskManager::new(Arc::clone(&timeline));
        let ids: Vec<String> = (0..3)
            .map(|i| tasks.submit(1, &format!("tool{}", i), BTreeMap::new()).unwrap())
            .collect();
        tasks.fail(&ids[1], "gpu out of memory").unwrap();
        drop(tasks);
        drop(timeline);

        let reopened = Timeline::open(tmp.path(), ItemServices::new(Arc::new(FilmetoConfig::default()))).unwrap();
        let tasks = ProjectTaskManager::new(Arc::clone(&reopened));
        assert_eq!(tasks.restore().unwrap(), 3);
        let listed = reopened.item(1).unwrap().task_manager().list_tasks();
        assert_eq!(listed.iter().map(|t| t.id.clone()).collect::<Vec<_>>(), ids);
        assert_eq!(listed[1].error.as_deref(), Some("gpu out of memory"));
        assert_eq!(tasks.get_task(&ids[2]).unwrap().tool, "tool2");
    }
}
