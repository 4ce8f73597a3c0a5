//! Pixel compositor - flattens visible layers into one RGBA canvas.
//!
//! All blending is straight (non-premultiplied) "over":
//!
//! ```text
//! a_out = a_fg + a_bg * (1 - a_fg)
//! c_out = (c_fg * a_fg + c_bg * a_bg * (1 - a_fg)) / a_out     (a_out == 0 → divide by 1)
//! ```
//!
//! Used by:
//! - `LayerManager::composite_visible_layers` (image layers → canvas PNG)
//! - `LayerComposeTask` frame-by-frame overlay (RGBA overlays → opaque RGB frames)

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::imageops::{self, FilterType};
use image::{RgbImage, RgbaImage};
use log::{debug, trace, warn};
use rayon::prelude::*;

use super::layer::Layer;

/// A layer paired with the file its pixels come from.
#[derive(Clone, Debug)]
pub struct LayerSource {
    pub layer: Layer,
    pub path: PathBuf,
}

impl LayerSource {
    pub fn new(layer: Layer, path: PathBuf) -> Self {
        Self { layer, path }
    }
}

/// Visible rectangle of a placed image on a canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Placement {
    /// Canvas origin of the visible part
    pub dst_x: u32,
    pub dst_y: u32,
    /// Offset into the source image
    pub src_x: u32,
    pub src_y: u32,
    pub width: u32,
    pub height: u32,
}

/// Intersect a `w`x`h` image at (x, y) with a canvas. None if nothing is visible.
pub(crate) fn place(x: i32, y: i32, w: u32, h: u32, canvas: (u32, u32)) -> Option<Placement> {
    if w == 0 || h == 0 {
        return None;
    }
    let left = (x as i64).max(0);
    let top = (y as i64).max(0);
    let right = (x as i64 + w as i64).min(canvas.0 as i64);
    let bottom = (y as i64 + h as i64).min(canvas.1 as i64);
    if left >= right || top >= bottom {
        return None;
    }
    Some(Placement {
        dst_x: left as u32,
        dst_y: top as u32,
        src_x: (left - x as i64) as u32,
        src_y: (top - y as i64) as u32,
        width: (right - left) as u32,
        height: (bottom - top) as u32,
    })
}

/// Straight-alpha "over" of one RGBA pixel onto another.
#[inline]
pub fn blend_over(dst: &mut [u8], src: &[u8]) {
    let fg_a = src[3] as f32 / 255.0;
    if fg_a <= 0.0 {
        return;
    }
    let bg_a = dst[3] as f32 / 255.0;
    let bg_w = bg_a * (1.0 - fg_a);
    let out_a = fg_a + bg_w;
    let div = if out_a == 0.0 { 1.0 } else { out_a };
    for c in 0..3 {
        let v = (src[c] as f32 * fg_a + dst[c] as f32 * bg_w) / div;
        dst[c] = to_u8(v);
    }
    dst[3] = to_u8(out_a * 255.0);
}

/// "over" onto an opaque RGB pixel (background alpha is 1).
#[inline]
pub fn blend_over_opaque(dst: &mut [u8], src: &[u8]) {
    let fg_a = src[3] as f32 / 255.0;
    if fg_a <= 0.0 {
        return;
    }
    let inv = 1.0 - fg_a;
    for c in 0..3 {
        dst[c] = to_u8(src[c] as f32 * fg_a + dst[c] as f32 * inv);
    }
}

#[inline]
fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Blend `src` onto an RGBA canvas with its top-left at (x, y).
pub fn blend_rgba_onto(canvas: &mut RgbaImage, src: &RgbaImage, x: i32, y: i32) -> bool {
    let (cw, ch) = canvas.dimensions();
    let Some(p) = place(x, y, src.width(), src.height(), (cw, ch)) else {
        return false;
    };
    let stride = cw as usize * 4;
    let src_stride = src.width() as usize * 4;
    let src_raw = src.as_raw();
    canvas
        .par_chunks_mut(stride)
        .enumerate()
        .skip(p.dst_y as usize)
        .take(p.height as usize)
        .for_each(|(row, line)| {
            let sy = (row - p.dst_y as usize) + p.src_y as usize;
            let s_off = sy * src_stride + p.src_x as usize * 4;
            let d_off = p.dst_x as usize * 4;
            let n = p.width as usize * 4;
            let src_line = &src_raw[s_off..s_off + n];
            let dst_line = &mut line[d_off..d_off + n];
            for (d, s) in dst_line.chunks_exact_mut(4).zip(src_line.chunks_exact(4)) {
                blend_over(d, s);
            }
        });
    true
}

/// Blend `src` onto an opaque RGB frame. Only boxes fully inside the frame are drawn.
pub fn blend_rgba_onto_frame(frame: &mut RgbImage, src: &RgbaImage, x: i32, y: i32) -> bool {
    let (fw, fh) = frame.dimensions();
    let inside = x >= 0
        && y >= 0
        && x as i64 + src.width() as i64 <= fw as i64
        && y as i64 + src.height() as i64 <= fh as i64;
    if !inside || src.width() == 0 || src.height() == 0 {
        return false;
    }
    let stride = fw as usize * 3;
    let src_stride = src.width() as usize * 4;
    let src_raw = src.as_raw();
    let (x, y) = (x as usize, y as usize);
    frame
        .par_chunks_mut(stride)
        .enumerate()
        .skip(y)
        .take(src.height() as usize)
        .for_each(|(row, line)| {
            let s_off = (row - y) * src_stride;
            let src_line = &src_raw[s_off..s_off + src_stride];
            let dst_line = &mut line[x * 3..(x + src.width() as usize) * 3];
            for (d, s) in dst_line.chunks_exact_mut(3).zip(src_line.chunks_exact(4)) {
                blend_over_opaque(d, s);
            }
        });
    true
}

/// Load any supported image as RGBA; grayscale / RGB sources get opaque alpha.
pub fn load_rgba(path: &Path) -> Result<RgbaImage> {
    let img = image::open(path).with_context(|| format!("Failed to load {}", path.display()))?;
    Ok(img.to_rgba8())
}

/// Load and scale to the layer's declared box; adopts the natural size when unset.
pub fn load_layer_pixels(source: &mut LayerSource) -> Result<RgbaImage> {
    let img = load_rgba(&source.path)?;
    let layer = &mut source.layer;
    if layer.has_size() {
        if img.dimensions() != (layer.width, layer.height) {
            return Ok(imageops::resize(&img, layer.width, layer.height, FilterType::Triangle));
        }
        Ok(img)
    } else {
        layer.set_size(img.dimensions());
        Ok(img)
    }
}

/// Flatten `sources` (bottom-to-top) onto a transparent canvas.
///
/// Invisible layers and missing files are skipped; a layer that fails to load
/// is logged and skipped. Layers without a size get their natural size written
/// back into `sources`.
pub fn compose_layers(sources: &mut [LayerSource], canvas_size: (u32, u32)) -> RgbaImage {
    let (w, h) = (canvas_size.0.max(1), canvas_size.1.max(1));
    let mut canvas = RgbaImage::new(w, h);

    for source in sources.iter_mut() {
        if !source.layer.visible {
            trace!("Layer {} hidden, skipping", source.layer.id);
            continue;
        }
        if !source.path.is_file() {
            debug!(
                "Layer {} file missing ({}), skipping",
                source.layer.id,
                source.path.display()
            );
            continue;
        }
        let pixels = match load_layer_pixels(source) {
            Ok(p) => p,
            Err(e) => {
                warn!("Layer {}: {:#}", source.layer.id, e);
                continue;
            }
        };
        if !blend_rgba_onto(&mut canvas, &pixels, source.layer.x, source.layer.y) {
            debug!(
                "Layer {} at ({}, {}) {}x{} is outside the {}x{} canvas",
                source.layer.id,
                source.layer.x,
                source.layer.y,
                pixels.width(),
                pixels.height(),
                w,
                h
            );
        }
    }
    canvas
}

/// Write PNG with maximum compression, alpha preserved.
pub fn save_png(img: &RgbaImage, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let encoder = PngEncoder::new_with_quality(
        BufWriter::new(file),
        CompressionType::Best,
        PngFilterType::Adaptive,
    );
    img.write_with_encoder(encoder)
        .with_context(|| format!("Failed to encode {}", path.display()))?;
    Ok(())
}

/// Solid RGBA image.
pub fn solid(size: (u32, u32), rgba: [u8; 4]) -> RgbaImage {
    RgbaImage::from_pixel(size.0.max(1), size.1.max(1), image::Rgba(rgba))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::layer::LayerType;

    #[test]
    fn test_transparent_top_keeps_bottom() {
        let mut px = [10, 200, 30, 255];
        blend_over(&mut px, &[255, 255, 255, 0]);
        assert_eq!(px, [10, 200, 30, 255]);
    }

    #[test]
    fn test_opaque_top_replaces() {
        let mut px = [10, 200, 30, 77];
        blend_over(&mut px, &[1, 2, 3, 255]);
        assert_eq!(px, [1, 2, 3, 255]);
    }

    #[test]
    fn test_half_alpha_is_midpoint() {
        let mut px = [0, 0, 255, 255];
        blend_over(&mut px, &[255, 0, 0, 128]);
        assert!((px[0] as i32 - 128).abs() <= 1);
        assert!((px[2] as i32 - 127).abs() <= 1);
        assert_eq!(px[3], 255);

        let mut rgb = [0, 0, 255];
        blend_over_opaque(&mut rgb, &[255, 0, 0, 128]);
        assert!((rgb[0] as i32 - 128).abs() <= 1);
        assert!((rgb[2] as i32 - 127).abs() <= 1);
    }

    #[test]
    fn test_over_onto_transparent_keeps_color() {
        // Non-premultiplied: color survives regardless of alpha
        let mut px = [0, 0, 0, 0];
        blend_over(&mut px, &[200, 100, 50, 64]);
        assert_eq!(px, [200, 100, 50, 64]);
    }

    #[test]
    fn test_place_clips_and_rejects() {
        assert_eq!(
            place(-5, 2, 10, 10, (8, 8)),
            Some(Placement {
                dst_x: 0,
                dst_y: 2,
                src_x: 5,
                src_y: 0,
                width: 5,
                height: 6
            })
        );
        assert_eq!(place(8, 0, 4, 4, (8, 8)), None);
        assert_eq!(place(0, 0, 0, 4, (8, 8)), None);
    }

    #[test]
    fn test_compose_layers_order_and_natural_size() {
        let tmp = tempfile::tempdir().unwrap();
        let bottom = tmp.path().join("1.png");
        let top = tmp.path().join("2.png");
        solid((4, 4), [0, 0, 255, 255]).save(&bottom).unwrap();
        solid((2, 2), [255, 0, 0, 255]).save(&top).unwrap();

        let mut top_layer = Layer::new(2, LayerType::Image);
        top_layer.x = 1;
        top_layer.y = 1;
        let mut sources = vec![
            LayerSource::new(Layer::new(1, LayerType::Image), bottom),
            LayerSource::new(top_layer, top),
            LayerSource::new(
                Layer::new(3, LayerType::Image),
                tmp.path().join("missing.png"),
            ),
        ];
        let canvas = compose_layers(&mut sources, (4, 4));

        assert_eq!(canvas.get_pixel(0, 0).0, [0, 0, 255, 255]);
        assert_eq!(canvas.get_pixel(1, 1).0, [255, 0, 0, 255]);
        assert_eq!(canvas.get_pixel(2, 2).0, [255, 0, 0, 255]);
        assert_eq!(canvas.get_pixel(3, 3).0, [0, 0, 255, 255]);
        // Natural size written back
        assert_eq!((sources[1].layer.width, sources[1].layer.height), (2, 2));
        assert_eq!(sources[2].layer.width, 0);
    }

    #[test]
    fn test_declared_size_resizes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("1.png");
        solid((2, 2), [0, 255, 0, 255]).save(&path).unwrap();
        let mut layer = Layer::new(1, LayerType::Image);
        layer.set_size((6, 6));
        let mut sources = vec![LayerSource::new(layer, path)];
        let canvas = compose_layers(&mut sources, (8, 8));
        assert_eq!(canvas.get_pixel(5, 5).0, [0, 255, 0, 255]);
        assert_eq!(canvas.get_pixel(6, 6).0[3], 0);
    }

    #[test]
    fn test_frame_overlay_requires_full_box() {
        let mut frame = RgbImage::from_pixel(8, 8, image::Rgb([0, 0, 0]));
        let blue = solid((4, 4), [0, 0, 255, 255]);
        assert!(blend_rgba_onto_frame(&mut frame, &blue, 2, 2));
        assert_eq!(frame.get_pixel(2, 2).0, [0, 0, 255]);
        assert_eq!(frame.get_pixel(6, 6).0, [0, 0, 0]);
        assert!(!blend_rgba_onto_frame(&mut frame, &blue, 6, 6));
        assert!(!blend_rgba_onto_frame(&mut frame, &blue, -1, 0));
    }

    #[test]
    fn test_save_png_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let img = solid((16, 16), [12, 34, 56, 200]);
        let a = tmp.path().join("a.png");
        let b = tmp.path().join("b.png");
        save_png(&img, &a).unwrap();
        save_png(&img, &b).unwrap();
        assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
        assert_eq!(load_rgba(&a).unwrap(), img);
    }
}
