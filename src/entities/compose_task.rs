//! LayerComposeTask - flattens one item's layers into `image.png` + `video.mp4`.
//!
//! Decision:
//! 1. Walk layers top-to-bottom, skipping hidden and missing-file layers
//! 2. Stop at the first video layer (it is opaque: nothing below shows through)
//! 3. No video → image-only; video → image+video
//!
//! Image-only: canvas from layer extents → composite PNG → still clip.
//! Image+video: probe → decode/blend/encode frames, falling back to an ffmpeg
//! `filter_complex` overlay, then to copying the source video. The still is
//! the first frame of the result.
//!
//! Any failure ends in black placeholder outputs, never missing files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use image::{RgbImage, RgbaImage};
use log::{debug, error, info, warn};

use crate::core::events::TimelineChangedEvent;
use crate::media::h264;
use crate::media::ffmpeg::{Ffmpeg, OverlayInput, VideoMetadata, VideoReader, VideoWriter};

use super::compositor::{self, LayerSource};
use super::layer::{Layer, LayerType};
use super::layer_manager::LayerManager;
use super::timeline::TimelineItem;

/// Execution state of one task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComposeState {
    NotStarted,
    Running,
    Succeeded,
    FailedWithPlaceholder,
}

/// Identity used to collapse pending requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OwnerKey {
    /// Timeline item index
    Item(usize),
    /// Manager address, for managers without an item
    Manager(usize),
}

impl OwnerKey {
    pub fn of(manager: &Arc<LayerManager>) -> Self {
        match manager.item_index() {
            Some(index) => OwnerKey::Item(index),
            None => OwnerKey::Manager(Arc::as_ptr(manager) as usize),
        }
    }
}

/// Layers selected for composition, bottom-to-top.
#[derive(Debug, Default)]
pub struct CompositionPlan {
    pub candidates: Vec<LayerSource>,
    pub has_video: bool,
}

impl CompositionPlan {
    /// Apply the top-down walk to `layers` (ascending id = bottom first).
    pub fn from_layers(layers: &[Layer], layers_dir: &Path) -> Self {
        let mut candidates = Vec::new();
        let mut has_video = false;
        for layer in layers.iter().rev() {
            if !layer.visible || !layer.layer_type.is_visual() {
                continue;
            }
            let path = layer.file_path(layers_dir);
            if !path.is_file() {
                debug!("Layer {} has no file, skipping", layer.id);
                continue;
            }
            candidates.push(LayerSource::new(layer.clone(), path));
            if layer.layer_type == LayerType::Video {
                has_video = true;
                break;
            }
        }
        candidates.reverse();
        Self { candidates, has_video }
    }

    pub fn ids(&self) -> Vec<u32> {
        self.candidates.iter().map(|s| s.layer.id).collect()
    }
}

/// Temp files removed on drop.
struct Scratch(Vec<PathBuf>);

impl Scratch {
    fn add(&mut self, path: PathBuf) -> PathBuf {
        self.0.push(path.clone());
        path
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        for path in &self.0 {
            if path.exists() {
                if let Err(e) = fs::remove_file(path) {
                    warn!("Failed to remove temp file {}: {}", path.display(), e);
                }
            }
        }
    }
}

pub struct LayerComposeTask {
    id: String,
    owner: OwnerKey,
    manager: Arc<LayerManager>,
    item: Option<Arc<TimelineItem>>,
    state: ComposeState,
}

impl std::fmt::Debug for LayerComposeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerComposeTask")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state)
            .finish()
    }
}

impl LayerComposeTask {
    pub fn new(id: String, manager: Arc<LayerManager>) -> Self {
        let owner = OwnerKey::of(&manager);
        let item = manager.item().ok();
        Self {
            id,
            owner,
            manager,
            item,
            state: ComposeState::NotStarted,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> OwnerKey {
        self.owner
    }

    pub fn state(&self) -> ComposeState {
        self.state
    }

    /// Output paths (image, video), None without an item.
    pub fn outputs(&self) -> Option<(PathBuf, PathBuf)> {
        self.item.as_ref().map(|i| (i.image_path(), i.video_path()))
    }

    /// Run once. Never fails: errors end in placeholder outputs.
    pub fn execute(&mut self) -> ComposeState {
        if self.state != ComposeState::NotStarted {
            warn!("Compose task {} already ran", self.id);
            return self.state;
        }
        self.state = ComposeState::Running;

        let Some(item) = self.item.clone() else {
            error!("Compose task {}: layer manager has no timeline item", self.id);
            self.state = ComposeState::FailedWithPlaceholder;
            return self.state;
        };
        info!("Compose task {} started for item {}", self.id, item.index());

        let job = ComposeJob {
            task_id: &self.id,
            manager: &self.manager,
            item: &item,
            ffmpeg: self.manager.ffmpeg(),
        };
        self.state = match job.run() {
            Ok(()) => {
                info!("Compose task {} finished for item {}", self.id, item.index());
                self.manager.notifier().emit(TimelineChangedEvent {
                    item_index: item.index(),
                    image_path: item.image_path(),
                    video_path: item.video_path(),
                });
                ComposeState::Succeeded
            }
            Err(e) => {
                error!("Compose task {} failed for item {}: {:#}", self.id, item.index(), e);
                if let Err(e) = job.write_placeholders() {
                    error!("Compose task {}: placeholder outputs failed: {:#}", self.id, e);
                }
                ComposeState::FailedWithPlaceholder
            }
        };
        self.state
    }
}

/// Borrowed context of one `execute()`.
struct ComposeJob<'a> {
    task_id: &'a str,
    manager: &'a LayerManager,
    item: &'a TimelineItem,
    ffmpeg: Ffmpeg,
}

impl ComposeJob<'_> {
    fn run(&self) -> Result<()> {
        let layers = self.manager.get_layers();
        let plan = CompositionPlan::from_layers(&layers, &self.item.layers_path());
        debug!(
            "Compose task {}: candidates {:?} (video: {})",
            self.task_id,
            plan.ids(),
            plan.has_video
        );
        if plan.has_video {
            self.compose_with_video(plan.candidates)
        } else {
            self.compose_images(plan.candidates)
        }
    }

    fn scratch_path(&self, suffix: &str) -> PathBuf {
        self.item.path().join(format!(".compose_{}{}", self.task_id, suffix))
    }

    // === Image-only ===

    fn compose_images(&self, mut sources: Vec<LayerSource>) -> Result<()> {
        let canvas = self.canvas_size(&sources);
        let mut scratch = Scratch(Vec::new());
        let temp = scratch.add(self.scratch_path(".png"));

        self.manager
            .composite_visible_layers(&mut sources, &temp, canvas)
            .context("compositing image layers")?;
        let image_out = self.item.image_path();
        fs::copy(&temp, &image_out).with_context(|| format!("copying composite to {}", image_out.display()))?;
        self.still_video(&image_out)?;
        Ok(())
    }

    /// Union of layer extents; natural size for unsized layers; default if empty.
    fn canvas_size(&self, sources: &[LayerSource]) -> (u32, u32) {
        let (mut w, mut h) = (0i64, 0i64);
        for source in sources {
            let layer = &source.layer;
            let size = if layer.has_size() {
                Some((layer.width, layer.height))
            } else {
                image::image_dimensions(&source.path).ok()
            };
            let Some((lw, lh)) = size else { continue };
            w = w.max(layer.x as i64 + lw as i64);
            h = h.max(layer.y as i64 + lh as i64);
        }
        if w <= 0 || h <= 0 || w > u32::MAX as i64 || h > u32::MAX as i64 {
            return self.manager.config().default_size();
        }
        (w as u32, h as u32)
    }

    /// `video.mp4` from a still: ffmpeg, else the in-process encoder.
    fn still_video(&self, image: &Path) -> Result<()> {
        let cfg = self.manager.config();
        let video_out = self.item.video_path();
        match self.ffmpeg.still_clip(image, &video_out, cfg.clip_fps, cfg.clip_seconds) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Still clip via ffmpeg failed, encoding in-process: {}", e);
                let frame = flatten_on_black(&compositor::load_rgba(image)?);
                let frames = vec![frame; cfg.clip_frames() as usize];
                h264::write_frames(&video_out, &frames, cfg.clip_fps)
            }
        }
    }

    // === Image + video ===

    fn compose_with_video(&self, candidates: Vec<LayerSource>) -> Result<()> {
        let (videos, images): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|s| s.layer.layer_type == LayerType::Video);
        let Some(video) = videos.into_iter().next() else {
            bail!("no video layer among candidates");
        };

        let meta = match self.ffmpeg.probe(&video.path) {
            Ok(meta) if meta.is_valid() => meta,
            Ok(meta) => {
                warn!("Video layer {} unusable ({:?}), composing images only", video.layer.id, meta);
                return self.compose_images(images);
            }
            Err(e) => {
                warn!("Video layer {} unreadable ({}), composing images only", video.layer.id, e);
                return self.compose_images(images);
            }
        };

        let video_out = self.item.video_path();
        if images.is_empty() {
            fs::copy(&video.path, &video_out)
                .with_context(|| format!("copying {} to {}", video.path.display(), video_out.display()))?;
        } else {
            let overlays = self.load_overlays(images);
            self.overlay_video(&video.path, &meta, &overlays)?;
        }
        self.first_frame_still(&video_out, (meta.width, meta.height))
    }

    fn load_overlays(&self, images: Vec<LayerSource>) -> Vec<(RgbaImage, i32, i32)> {
        images
            .into_iter()
            .filter_map(|mut source| match compositor::load_layer_pixels(&mut source) {
                Ok(pixels) => Some((pixels, source.layer.x, source.layer.y)),
                Err(e) => {
                    warn!("Overlay layer {} skipped: {:#}", source.layer.id, e);
                    None
                }
            })
            .collect()
    }

    fn overlay_video(&self, video: &Path, meta: &VideoMetadata, overlays: &[(RgbaImage, i32, i32)]) -> Result<()> {
        let video_out = self.item.video_path();
        let mut scratch = Scratch(Vec::new());
        let temp = scratch.add(self.scratch_path(".mp4"));

        match self.blend_frames(video, meta, overlays, &temp) {
            Ok(frames) => {
                debug!("Compose task {}: blended {} frames", self.task_id, frames);
                fs::rename(&temp, &video_out).with_context(|| format!("moving result to {}", video_out.display()))?;
                return Ok(());
            }
            Err(e) => warn!("Frame overlay failed, trying filter_complex: {:#}", e),
        }

        let mut inputs = Vec::with_capacity(overlays.len());
        for (i, (pixels, x, y)) in overlays.iter().enumerate() {
            let path = scratch.add(self.scratch_path(&format!("_ov{}.png", i)));
            compositor::save_png(pixels, &path)?;
            inputs.push(OverlayInput { path, x: *x, y: *y });
        }
        match self.ffmpeg.overlay(video, &inputs, &temp) {
            Ok(()) => {
                fs::rename(&temp, &video_out).with_context(|| format!("moving result to {}", video_out.display()))?;
            }
            Err(e) => {
                warn!("filter_complex overlay failed, copying source video: {}", e);
                fs::copy(video, &video_out)
                    .with_context(|| format!("copying {} to {}", video.display(), video_out.display()))?;
            }
        }
        Ok(())
    }

    /// Decode → blend overlays fully inside the frame → encode. Returns frame count.
    fn blend_frames(
        &self,
        video: &Path,
        meta: &VideoMetadata,
        overlays: &[(RgbaImage, i32, i32)],
        output: &Path,
    ) -> Result<u64> {
        let writer = VideoWriter::spawn(&self.ffmpeg, output, (meta.width, meta.height), meta.fps)
            .context("opening video writer")?;
        let reader = match VideoReader::spawn(&self.ffmpeg, video, meta.width, meta.height) {
            Ok(reader) => reader,
            Err(e) => {
                let _ = writer.finish();
                return Err(e).context("opening video reader");
            }
        };

        let mut frames = 0u64;
        let mut write_result = Ok(());
        while let Some(mut frame) = reader.read_frame() {
            for (pixels, x, y) in overlays {
                compositor::blend_rgba_onto_frame(&mut frame, pixels, *x, *y);
            }
            if let Err(e) = writer.write_frame(&frame) {
                write_result = Err(e);
                break;
            }
            frames += 1;
        }
        let read_result = reader.finish();
        let finish_result = writer.finish();
        write_result.context("writing frame")?;
        read_result.context("decoding source video")?;
        finish_result.context("finalizing encoder")?;
        if frames == 0 {
            bail!("source video produced no frames");
        }
        Ok(frames)
    }

    fn first_frame_still(&self, video: &Path, size: (u32, u32)) -> Result<()> {
        let image_out = self.item.image_path();
        if let Err(e) = self.ffmpeg.extract_first_frame(video, &image_out) {
            warn!("First frame extraction failed, writing black still: {}", e);
            compositor::save_png(&compositor::solid(size, [0, 0, 0, 255]), &image_out)?;
        }
        Ok(())
    }

    // === Failure ===

    /// Black still + black clip at the default size.
    fn write_placeholders(&self) -> Result<()> {
        let cfg = self.manager.config();
        let size = cfg.default_size();
        let image_out = self.item.image_path();
        let video_out = self.item.video_path();

        let image_result = compositor::save_png(&compositor::solid(size, [0, 0, 0, 255]), &image_out);
        let video_result = match self.ffmpeg.black_clip(&video_out, size, cfg.clip_fps, cfg.clip_seconds) {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("ffmpeg placeholder failed ({}), encoding in-process", e);
                h264::write_solid(&video_out, size, [0, 0, 0], cfg.clip_fps, cfg.clip_frames())
            }
        };
        warn!("Item {}: wrote placeholder outputs", self.item.index());
        image_result.and(video_result)
    }
}

/// Drop alpha onto black.
fn flatten_on_black(img: &RgbaImage) -> RgbImage {
    let mut frame = RgbImage::new(img.width(), img.height());
    compositor::blend_rgba_onto_frame(&mut frame, img, 0, 0);
    frame
}
