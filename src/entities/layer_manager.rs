//! LayerManager - owns the layers of one timeline item.
//!
//! Responsibilities:
//! - CRUD on layers (blank placeholder or copied from a file)
//! - Persisting the layer list under the `layers` key of the item's config.yml
//! - Emitting [`LayerChangedEvent`] while the owning item is selected
//! - Requesting composition after every mutation when auto-compose is on
//!
//! Stacking order is always ascending id: lowest id is the bottom of the stack.
//!
//! A manager is inert until [`LayerManager::load`] binds it to its
//! [`TimelineItem`]; every other operation returns [`LayerError::NotLoaded`]
//! before that.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use log::{debug, info, trace, warn};

use crate::config::FilmetoConfig;
use crate::core::compose_queue::LayerComposeTaskManager;
use crate::core::event_bus::Notifier;
use crate::core::events::{LayerChangeKind, LayerChangedEvent};
use crate::media::ffmpeg::Ffmpeg;
use crate::media::h264;

use super::compositor::{self, LayerSource};
use super::layer::{Layer, LayerType};
use super::timeline::{ItemServices, TimelineItem};

/// Config key holding the persisted layer list
pub const LAYERS_KEY: &str = "layers";

/// Layer operation errors
#[derive(Debug)]
pub enum LayerError {
    /// Manager used before `load()` or after its item was dropped
    NotLoaded,
    Io { path: PathBuf, source: std::io::Error },
    /// Placeholder or converted file could not be written
    Encode(String),
    /// Layer list could not be read from or written to config.yml
    Config(String),
    InvalidPosition { position: usize, count: usize },
}

impl std::fmt::Display for LayerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerError::NotLoaded => write!(f, "Layer manager has no timeline item loaded"),
            LayerError::Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
            LayerError::Encode(e) => write!(f, "Failed to write layer file: {}", e),
            LayerError::Config(e) => write!(f, "Layer config error: {}", e),
            LayerError::InvalidPosition { position, count } => {
                write!(f, "Position {} out of range (0..{})", position, count)
            }
        }
    }
}

impl std::error::Error for LayerError {}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LayerError + '_ {
    move |source| LayerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Default)]
struct LayerState {
    layers: BTreeMap<u32, Layer>,
    /// Next id to hand out; only grows
    next_id: u32,
}

pub struct LayerManager {
    me: Weak<LayerManager>,
    item: OnceLock<Weak<TimelineItem>>,
    state: RwLock<LayerState>,
    auto_compose: AtomicBool,
    config: Arc<FilmetoConfig>,
    notifier: Notifier,
    composer: Option<LayerComposeTaskManager>,
}

impl std::fmt::Debug for LayerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerManager")
            .field("item_index", &self.item_index())
            .field("layers", &self.layer_count())
            .field("auto_compose", &self.auto_compose())
            .finish()
    }
}

impl LayerManager {
    pub fn new(services: ItemServices) -> Arc<Self> {
        let auto_compose = services.config.auto_compose;
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            item: OnceLock::new(),
            state: RwLock::new(LayerState {
                layers: BTreeMap::new(),
                next_id: 1,
            }),
            auto_compose: AtomicBool::new(auto_compose),
            config: services.config,
            notifier: services.notifier,
            composer: services.composer,
        })
    }

    /// Bind to the owning item and read its persisted layers.
    ///
    /// A manager binds once; loading again for the same item re-reads config.yml.
    pub fn load(&self, item: &Arc<TimelineItem>) -> Result<(), LayerError> {
        let bound = self.item.get_or_init(|| Arc::downgrade(item));
        if !Weak::ptr_eq(bound, &Arc::downgrade(item)) {
            return Err(LayerError::Config(format!(
                "manager already bound to another item (loading item {})",
                item.index()
            )));
        }

        let value = item
            .get_config_value(LAYERS_KEY)
            .map_err(|e| LayerError::Config(e.to_string()))?;
        let layers: Vec<Layer> = match value {
            Some(v) => serde_yaml::from_value(v)
                .map_err(|e| LayerError::Config(format!("item {}: {}", item.index(), e)))?,
            None => Vec::new(),
        };

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let max_id = layers.iter().map(|l| l.id).max().unwrap_or(0);
        state.next_id = state.next_id.max(max_id + 1);
        state.layers = layers.into_iter().map(|l| (l.id, l)).collect();
        debug!(
            "Item {}: loaded {} layers, next id {}",
            item.index(),
            state.layers.len(),
            state.next_id
        );
        Ok(())
    }

    /// Owning item. Fails if `load()` was never called.
    pub fn item(&self) -> Result<Arc<TimelineItem>, LayerError> {
        self.item
            .get()
            .and_then(Weak::upgrade)
            .ok_or(LayerError::NotLoaded)
    }

    pub fn item_index(&self) -> Option<usize> {
        self.item().ok().map(|item| item.index())
    }

    pub fn config(&self) -> &FilmetoConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn ffmpeg(&self) -> Ffmpeg {
        Ffmpeg::from_config(&self.config)
    }

    pub fn auto_compose(&self) -> bool {
        self.auto_compose.load(Ordering::Relaxed)
    }

    pub fn set_auto_compose(&self, enabled: bool) {
        self.auto_compose.store(enabled, Ordering::Relaxed);
    }

    // === Reads ===

    /// All layers, ascending id (bottom of stack first).
    pub fn get_layers(&self) -> Vec<Layer> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .layers
            .values()
            .cloned()
            .collect()
    }

    pub fn get_layer(&self, id: u32) -> Option<Layer> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .layers
            .get(&id)
            .cloned()
    }

    pub fn layer_count(&self) -> usize {
        self.state.read().unwrap_or_else(|e| e.into_inner()).layers.len()
    }

    // === Mutations ===

    /// Add a layer backed by a blank placeholder at the default size.
    ///
    /// Video: black clip encoded in-process, then re-encoded by ffmpeg when it
    /// is available (the in-process file is kept otherwise). Other types:
    /// transparent PNG.
    pub fn add_layer(&self, layer_type: LayerType) -> Result<Layer, LayerError> {
        let item = self.item()?;
        let layers_dir = item.layers_path();
        fs::create_dir_all(&layers_dir).map_err(io_err(&layers_dir))?;
        let size = self.config.default_size();

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let id = state.next_id;
        state.next_id += 1;

        let mut layer = Layer::new(id, layer_type);
        layer.set_size(size);
        let path = layer.file_path(&layers_dir);
        match layer_type {
            LayerType::Video => self.write_placeholder_video(&path, size)?,
            _ => compositor::save_png(&compositor::solid(size, [0, 0, 0, 0]), &path)
                .map_err(|e| LayerError::Encode(format!("{:#}", e)))?,
        }

        state.layers.insert(id, layer.clone());
        self.persist(&item, &state)?;
        drop(state);

        info!("Item {}: added {} layer {}", item.index(), layer_type, id);
        self.changed(&item, &layer, LayerChangeKind::Added);
        Ok(layer)
    }

    /// Copy `source` into the layers directory as a new layer.
    ///
    /// Image and graphic sources are stored as `<id>.png` (converted if needed),
    /// video as `<id>.mp4`, anything else keeps its own extension. Visual
    /// layers take the source's pixel size, or the default size if probing fails.
    pub fn add_layer_from_file(&self, source: &Path, layer_type: LayerType) -> Result<Layer, LayerError> {
        let item = self.item()?;
        if !source.is_file() {
            return Err(LayerError::Io {
                path: source.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "source file missing"),
            });
        }
        let layers_dir = item.layers_path();
        fs::create_dir_all(&layers_dir).map_err(io_err(&layers_dir))?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let id = state.next_id;
        state.next_id += 1;

        let mut layer = Layer::new(id, layer_type);
        let dest = match layer_type {
            LayerType::Image | LayerType::Graphic | LayerType::Video => layer.file_path(&layers_dir),
            LayerType::Audio | LayerType::Subtitle => {
                let ext = source
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy()))
                    .unwrap_or_default();
                layers_dir.join(format!("{}{}", id, ext))
            }
        };
        self.import_file(source, &dest, layer_type)?;

        if layer_type.is_visual() {
            let size = self.probe_size(&dest, layer_type).unwrap_or_else(|| {
                warn!("Could not probe {}, using default size", dest.display());
                self.config.default_size()
            });
            layer.set_size(size);
        }

        state.layers.insert(id, layer.clone());
        self.persist(&item, &state)?;
        drop(state);

        info!(
            "Item {}: added {} layer {} from {}",
            item.index(),
            layer_type,
            id,
            source.display()
        );
        self.changed(&item, &layer, LayerChangeKind::Added);
        Ok(layer)
    }

    /// Delete the layer and every `<id>.*` file. False if the id is unknown.
    pub fn remove_layer(&self, id: u32) -> Result<bool, LayerError> {
        let item = self.item()?;
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let Some(layer) = state.layers.remove(&id) else {
            return Ok(false);
        };

        let layers_dir = item.layers_path();
        let prefix = format!("{}.", id);
        match fs::read_dir(&layers_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    if !entry.file_name().to_string_lossy().starts_with(&prefix) {
                        continue;
                    }
                    let path = entry.path();
                    match fs::remove_file(&path) {
                        Ok(()) => trace!("Removed {}", path.display()),
                        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                    }
                }
            }
            Err(e) => warn!("Cannot list {}: {}", layers_dir.display(), e),
        }

        self.persist(&item, &state)?;
        drop(state);

        info!("Item {}: removed layer {}", item.index(), id);
        self.changed(&item, &layer, LayerChangeKind::Removed);
        Ok(true)
    }

    /// Flip visibility, returning the new value. None if the id is unknown.
    pub fn toggle_visibility(&self, id: u32) -> Result<Option<bool>, LayerError> {
        self.modify(id, LayerChangeKind::Modified, |layer| {
            layer.visible = !layer.visible;
            layer.visible
        })
    }

    /// Flip the lock flag, returning the new value. None if the id is unknown.
    pub fn toggle_lock(&self, id: u32) -> Result<Option<bool>, LayerError> {
        self.modify(id, LayerChangeKind::Modified, |layer| {
            layer.locked = !layer.locked;
            layer.locked
        })
    }

    pub fn rename_layer(&self, id: u32, name: &str) -> Result<bool, LayerError> {
        let name = name.to_owned();
        Ok(self
            .modify(id, LayerChangeKind::Modified, move |layer| layer.name = name)?
            .is_some())
    }

    /// Move the top-left corner.
    pub fn set_position(&self, id: u32, x: i32, y: i32) -> Result<bool, LayerError> {
        Ok(self
            .modify(id, LayerChangeKind::Modified, |layer| {
                layer.x = x;
                layer.y = y;
            })?
            .is_some())
    }

    /// Set the placed size; (0, 0) restores natural size.
    pub fn set_size(&self, id: u32, width: u32, height: u32) -> Result<bool, LayerError> {
        Ok(self
            .modify(id, LayerChangeKind::Modified, |layer| layer.set_size((width, height)))?
            .is_some())
    }

    /// Validate a stacking position for `id` and announce a reorder.
    ///
    /// Storage and stacking stay id-ascending: the position is checked
    /// against the layer count and forwarded to listeners only.
    pub fn move_layer(&self, id: u32, position: usize) -> Result<bool, LayerError> {
        let count = self.layer_count();
        if position >= count {
            return Err(LayerError::InvalidPosition { position, count });
        }
        Ok(self
            .modify(id, LayerChangeKind::Reordered, |_| ())?
            .is_some())
    }

    // === Composition ===

    /// Flatten `sources` bottom-to-top onto a transparent canvas and write it
    /// as PNG.
    ///
    /// Layers without a size take their image's natural size, both in
    /// `sources` and in this manager's layer table (not persisted, no event).
    pub fn composite_visible_layers(
        &self,
        sources: &mut [LayerSource],
        output: &Path,
        canvas_size: (u32, u32),
    ) -> anyhow::Result<()> {
        let needs_size: Vec<bool> = sources.iter().map(|s| !s.layer.has_size()).collect();
        let canvas = compositor::compose_layers(sources, canvas_size);

        let adopted: Vec<&Layer> = sources
            .iter()
            .zip(&needs_size)
            .filter(|(s, needed)| **needed && s.layer.has_size())
            .map(|(s, _)| &s.layer)
            .collect();
        if !adopted.is_empty() {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            for source in adopted {
                if let Some(layer) = state.layers.get_mut(&source.id) {
                    if !layer.has_size() {
                        trace!("Layer {}: natural size {}x{}", layer.id, source.width, source.height);
                        layer.set_size((source.width, source.height));
                    }
                }
            }
        }
        compositor::save_png(&canvas, output)
    }

    /// Submit this manager to the compose queue. No-op without a queue.
    pub fn request_compose(&self) -> Option<String> {
        let composer = self.composer.as_ref()?;
        let me = self.me.upgrade()?;
        composer.submit_compose_task(&me)
    }

    // === Internals ===

    fn modify<T>(
        &self,
        id: u32,
        kind: LayerChangeKind,
        f: impl FnOnce(&mut Layer) -> T,
    ) -> Result<Option<T>, LayerError> {
        let item = self.item()?;
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let Some(layer) = state.layers.get_mut(&id) else {
            return Ok(None);
        };
        let out = f(layer);
        let snapshot = layer.clone();
        self.persist(&item, &state)?;
        drop(state);

        debug!("Item {}: layer {} {}", item.index(), id, kind.as_str());
        self.changed(&item, &snapshot, kind);
        Ok(Some(out))
    }

    fn persist(&self, item: &TimelineItem, state: &LayerState) -> Result<(), LayerError> {
        let layers: Vec<&Layer> = state.layers.values().collect();
        let value = serde_yaml::to_value(&layers).map_err(|e| LayerError::Config(e.to_string()))?;
        item.set_config_value(LAYERS_KEY, value)
            .map_err(|e| LayerError::Config(e.to_string()))
    }

    /// Notify (selected item only) and request composition.
    fn changed(&self, item: &TimelineItem, layer: &Layer, kind: LayerChangeKind) {
        if item.is_selected() {
            self.notifier.emit(LayerChangedEvent {
                item_index: item.index(),
                layer: layer.clone(),
                kind,
            });
        }
        if self.auto_compose() {
            if let Some(task_id) = self.request_compose() {
                trace!("Item {}: auto-compose {}", item.index(), task_id);
            }
        }
    }

    fn write_placeholder_video(&self, path: &Path, size: (u32, u32)) -> Result<(), LayerError> {
        let cfg = &self.config;
        h264::write_solid(path, size, [0, 0, 0], cfg.clip_fps, cfg.clip_frames())
            .map_err(|e| LayerError::Encode(format!("{:#}", e)))?;

        // `<id>.h264.mp4` keeps the `<id>.` prefix so removal catches leftovers
        let tmp = path.with_extension("h264.mp4");
        match self.ffmpeg().transcode_h264(path, &tmp) {
            Ok(()) => {
                fs::rename(&tmp, path).map_err(io_err(path))?;
            }
            Err(e) => {
                warn!("Keeping raw placeholder {}: {}", path.display(), e);
                let _ = fs::remove_file(&tmp);
            }
        }
        Ok(())
    }

    fn import_file(&self, source: &Path, dest: &Path, layer_type: LayerType) -> Result<(), LayerError> {
        let is_png = source
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("png"));
        match layer_type {
            LayerType::Image | LayerType::Graphic if !is_png => {
                let img = compositor::load_rgba(source).map_err(|e| LayerError::Encode(format!("{:#}", e)))?;
                compositor::save_png(&img, dest).map_err(|e| LayerError::Encode(format!("{:#}", e)))
            }
            _ => fs::copy(source, dest).map(|_| ()).map_err(io_err(dest)),
        }
    }

    fn probe_size(&self, path: &Path, layer_type: LayerType) -> Option<(u32, u32)> {
        match layer_type {
            LayerType::Video => match self.ffmpeg().probe(path) {
                Ok(meta) if meta.width > 0 && meta.height > 0 => Some((meta.width, meta.height)),
                Ok(_) => None,
                Err(e) => {
                    debug!("ffprobe {}: {}", path.display(), e);
                    h264::read_info(path).ok().map(|info| (info.width, info.height))
                }
            },
            _ => image::image_dimensions(path).ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_bus::EventBus;
    use crate::entities::timeline::Timeline;

    fn offline_config() -> FilmetoConfig {
        FilmetoConfig {
            ffmpeg_path: "/nonexistent/ffmpeg".into(),
            ffprobe_path: "/nonexistent/ffprobe".into(),
            default_width: 32,
            default_height: 48,
            ..FilmetoConfig::default()
        }
    }

    fn setup(services: ItemServices) -> (tempfile::TempDir, Arc<Timeline>, Arc<LayerManager>) {
        let tmp = tempfile::tempdir().unwrap();
        let timeline = Timeline::open(tmp.path(), services).unwrap();
        timeline.add_item().unwrap();
        let manager = timeline.item(1).unwrap().layer_manager().unwrap();
        (tmp, timeline, manager)
    }

    fn offline() -> (tempfile::TempDir, Arc<Timeline>, Arc<LayerManager>) {
        setup(ItemServices::new(Arc::new(offline_config())))
    }

    #[test]
    fn test_not_loaded_fails() {
        let manager = LayerManager::new(ItemServices::new(Arc::new(offline_config())));
        assert!(matches!(manager.add_layer(LayerType::Image), Err(LayerError::NotLoaded)));
        assert!(matches!(manager.remove_layer(1), Err(LayerError::NotLoaded)));
        assert!(manager.get_layers().is_empty());
        assert_eq!(manager.item_index(), None);
    }

    #[test]
    fn test_ids_monotonic_after_removal() {
        let (_tmp, _timeline, manager) = offline();
        let a = manager.add_layer(LayerType::Image).unwrap();
        let b = manager.add_layer(LayerType::Graphic).unwrap();
        assert_eq!((a.id, b.id), (1, 2));

        assert!(manager.remove_layer(b.id).unwrap());
        let c = manager.add_layer(LayerType::Image).unwrap();
        assert_eq!(c.id, 3);

        assert!(manager.remove_layer(a.id).unwrap());
        assert!(manager.remove_layer(c.id).unwrap());
        assert_eq!(manager.add_layer(LayerType::Image).unwrap().id, 4);
        assert!(!manager.remove_layer(99).unwrap());
    }

    #[test]
    fn test_blank_placeholders() {
        let (_tmp, timeline, manager) = offline();
        let item = timeline.item(1).unwrap();
        let img = manager.add_layer(LayerType::Image).unwrap();
        let vid = manager.add_layer(LayerType::Video).unwrap();

        let png = compositor::load_rgba(&img.file_path(&item.layers_path())).unwrap();
        assert_eq!(png.dimensions(), (32, 48));
        assert_eq!(png.get_pixel(0, 0).0[3], 0);

        // No ffmpeg: in-process clip kept, no temp leftovers
        let info = h264::read_info(&vid.file_path(&item.layers_path())).unwrap();
        assert_eq!((info.width, info.height), (32, 48));
        assert!((info.duration.as_secs_f64() - 1.0).abs() < 0.05, "{:?}", info);
        assert!(!item.layers_path().join(format!("{}.h264.mp4", vid.id)).exists());
    }

    #[test]
    fn test_add_from_file_probes_and_converts() {
        let (tmp, timeline, manager) = offline();
        let item = timeline.item(1).unwrap();
        let src = tmp.path().join("red.jpg");
        image::RgbImage::from_pixel(20, 10, image::Rgb([255, 0, 0]))
            .save(&src)
            .unwrap();

        let layer = manager.add_layer_from_file(&src, LayerType::Image).unwrap();
        assert_eq!((layer.width, layer.height), (20, 10));
        let stored = layer.file_path(&item.layers_path());
        assert_eq!(stored.extension().unwrap(), "png");
        assert_eq!(compositor::load_rgba(&stored).unwrap().get_pixel(5, 5).0[3], 255);

        let srt = tmp.path().join("line.srt");
        fs::write(&srt, "1\n00:00:00,000 --> 00:00:01,000\nhi\n").unwrap();
        let sub = manager.add_layer_from_file(&srt, LayerType::Subtitle).unwrap();
        assert!(item.layers_path().join(format!("{}.srt", sub.id)).is_file());
        assert!(!sub.has_size());
        assert!(sub.has_file(&item.layers_path()));
        assert_eq!(sub.file_path(&item.layers_path()).extension().unwrap(), "srt");

        assert!(matches!(
            manager.add_layer_from_file(&tmp.path().join("nope.png"), LayerType::Image),
            Err(LayerError::Io { .. })
        ));
    }

    #[test]
    fn test_remove_deletes_all_prefixed_files() {
        let (_tmp, timeline, manager) = offline();
        let item = timeline.item(1).unwrap();
        let layer = manager.add_layer(LayerType::Image).unwrap();
        let dir = item.layers_path();
        fs::write(dir.join(format!("{}.mp4", layer.id)), b"x").unwrap();
        fs::write(dir.join(format!("{}0.png", layer.id)), b"keep").unwrap();

        assert!(manager.remove_layer(layer.id).unwrap());
        assert!(!dir.join(format!("{}.png", layer.id)).exists());
        assert!(!dir.join(format!("{}.mp4", layer.id)).exists());
        assert!(dir.join(format!("{}0.png", layer.id)).exists());
        assert_eq!(manager.layer_count(), 0);
    }

    #[test]
    fn test_toggles_and_rename() {
        let (_tmp, _timeline, manager) = offline();
        let layer = manager.add_layer(LayerType::Image).unwrap();
        assert_eq!(manager.toggle_visibility(layer.id).unwrap(), Some(false));
        assert_eq!(manager.toggle_visibility(layer.id).unwrap(), Some(true));
        assert_eq!(manager.toggle_lock(layer.id).unwrap(), Some(true));
        assert_eq!(manager.toggle_lock(42).unwrap(), None);
        assert!(manager.rename_layer(layer.id, "sky").unwrap());
        assert!(!manager.rename_layer(42, "sky").unwrap());
        assert_eq!(manager.get_layer(layer.id).unwrap().name, "sky");
        assert!(manager.get_layer(layer.id).unwrap().locked);
    }

    #[test]
    fn test_persisted_and_reloaded() {
        let tmp = tempfile::tempdir().unwrap();
        let services = ItemServices::new(Arc::new(offline_config()));
        {
            let timeline = Timeline::open(tmp.path(), services.clone()).unwrap();
            timeline.add_item().unwrap();
            let item = timeline.item(1).unwrap();
            item.set_config_value("prompt", "a red fox".into()).unwrap();
            let manager = item.layer_manager().unwrap();
            manager.add_layer(LayerType::Image).unwrap();
            let second = manager.add_layer(LayerType::Image).unwrap();
            manager.set_position(second.id, 4, -2).unwrap();
            manager.remove_layer(second.id).unwrap();
        }

        let timeline = Timeline::open(tmp.path(), services).unwrap();
        let item = timeline.item(1).unwrap();
        let manager = item.layer_manager().unwrap();
        assert_eq!(manager.get_layers().iter().map(|l| l.id).collect::<Vec<_>>(), vec![1]);
        // The counter restarts at the surviving max + 1, so the removed id 2 comes back
        assert_eq!(manager.add_layer(LayerType::Image).unwrap().id, 2);
        assert_eq!(
            item.get_config_value("prompt").unwrap(),
            Some(serde_yaml::Value::from("a red fox"))
        );
    }

    fn sources_of(manager: &LayerManager) -> Vec<LayerSource> {
        let dir = manager.item().unwrap().layers_path();
        manager
            .get_layers()
            .into_iter()
            .map(|layer| {
                let path = layer.file_path(&dir);
                LayerSource::new(layer, path)
            })
            .collect()
    }

    #[test]
    fn test_natural_size_reaches_manager() {
        let (tmp, timeline, manager) = offline();
        let item = timeline.item(1).unwrap();
        let src = tmp.path().join("small.png");
        compositor::solid((10, 7), [0, 0, 255, 255]).save(&src).unwrap();
        let layer = manager.add_layer_from_file(&src, LayerType::Image).unwrap();
        assert!(manager.set_size(layer.id, 0, 0).unwrap());

        let mut task = crate::entities::compose_task::LayerComposeTask::new("compose_1".into(), Arc::clone(&manager));
        task.execute();
        let stored = manager.get_layer(layer.id).unwrap();
        assert_eq!((stored.width, stored.height), (10, 7));

        // Direct call: both the passed sources and the table are updated
        assert!(manager.set_size(layer.id, 0, 0).unwrap());
        let mut sources = sources_of(&manager);
        let out = item.path().join("direct.png");
        manager.composite_visible_layers(&mut sources, &out, (16, 16)).unwrap();
        assert_eq!((sources[0].layer.width, sources[0].layer.height), (10, 7));
        let stored = manager.get_layer(layer.id).unwrap();
        assert_eq!((stored.width, stored.height), (10, 7));

        // A declared size is left alone
        assert!(manager.set_size(layer.id, 5, 5).unwrap());
        let mut sources = sources_of(&manager);
        manager.composite_visible_layers(&mut sources, &out, (16, 16)).unwrap();
        assert_eq!(manager.get_layer(layer.id).unwrap().width, 5);
    }

    #[test]
    fn test_composite_twice_is_byte_identical() {
        let (tmp, timeline, manager) = offline();
        let item = timeline.item(1).unwrap();
        let stack = [
            ((30, 20), [200, 40, 10, 255], (0, 0)),
            ((12, 12), [10, 180, 220, 128], (5, 3)),
            ((9, 15), [250, 250, 0, 77], (20, 8)),
            ((6, 6), [0, 0, 0, 200], (-2, -2)),
        ];
        for (i, (size, rgba, (x, y))) in stack.into_iter().enumerate() {
            let src = tmp.path().join(format!("l{}.png", i));
            compositor::solid(size, rgba).save(&src).unwrap();
            let layer = manager.add_layer_from_file(&src, LayerType::Image).unwrap();
            manager.set_position(layer.id, x, y).unwrap();
        }

        let first = item.path().join("first.png");
        let second = item.path().join("second.png");
        manager.composite_visible_layers(&mut sources_of(&manager), &first, (32, 24)).unwrap();
        manager.composite_visible_layers(&mut sources_of(&manager), &second, (32, 24)).unwrap();

        let a = fs::read(&first).unwrap();
        assert_eq!(a, fs::read(&second).unwrap());
        let pixel = compositor::load_rgba(&first).unwrap().get_pixel(7, 5).0;
        assert!(pixel[0] < 200 && pixel[2] > 10, "partial alpha blended: {:?}", pixel);
    }

    #[test]
    fn test_move_layer_keeps_id_order() {
        let (_tmp, _timeline, manager) = offline();
        for _ in 0..3 {
            manager.add_layer(LayerType::Image).unwrap();
        }
        assert!(manager.move_layer(3, 0).unwrap());
        assert_eq!(
            manager.get_layers().iter().map(|l| l.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(matches!(
            manager.move_layer(1, 3),
            Err(LayerError::InvalidPosition { position: 3, count: 3 })
        ));
        assert!(!manager.move_layer(9, 1).unwrap());
    }

    #[test]
    fn test_events_only_for_selected_item() {
        let bus = EventBus::new();
        let services = ItemServices::new(Arc::new(offline_config())).with_notifier(Notifier::from_emitter(bus.emitter()));
        let (_tmp, timeline, manager) = setup(services);
        timeline.add_item().unwrap();
        assert_eq!(timeline.current_index(), Some(1));

        manager.add_layer(LayerType::Image).unwrap();
        let other = timeline.item(2).unwrap().layer_manager().unwrap();
        other.add_layer(LayerType::Image).unwrap();

        let kinds: Vec<(usize, LayerChangeKind)> = bus
            .poll()
            .iter()
            .filter_map(|e| crate::core::event_bus::downcast_event::<LayerChangedEvent>(e))
            .map(|e| (e.item_index, e.kind))
            .collect();
        assert_eq!(kinds, vec![(1, LayerChangeKind::Added)]);
    }
}
