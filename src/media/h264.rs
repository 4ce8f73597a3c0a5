//! In-process H.264 (yuv420p) MP4 writer.
//!
//! Used where the external encoder cannot be relied on: placeholder video
//! layers, still clips and the black outputs written after a failed
//! composition. Frames are encoded with OpenH264 and muxed with `mp4`, so the
//! result is the same kind of file ffmpeg would produce.
//!
//! Frame sizes are truncated to even dimensions (4:2:0 chroma), matching the
//! `scale=trunc(iw/2)*2:trunc(ih/2)*2` the ffmpeg path applies.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use image::RgbImage;
use image::imageops::{self, FilterType};
use log::{debug, trace};
use mp4::{AvcConfig, MediaConfig, Mp4Config, Mp4Reader, Mp4Sample, Mp4Writer, TrackConfig, TrackType};
use openh264::OpenH264API;
use openh264::encoder::{Encoder, EncoderConfig};
use openh264::formats::{RgbSliceU8, YUVBuffer};

const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

/// Video track summary of an MP4 file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipInfo {
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
    pub frame_rate: f64,
    pub duration: Duration,
}

/// One access unit in MP4 (length-prefixed) form.
struct Sample {
    bytes: Vec<u8>,
    is_sync: bool,
    duration: u32,
}

/// Encode `frames` at `fps` into an H.264 MP4 at `path`.
///
/// All frames must share the first frame's dimensions.
pub fn write_frames(path: &Path, frames: &[RgbImage], fps: u32) -> Result<()> {
    let Some(first) = frames.first() else {
        bail!("no frames to write");
    };
    if fps == 0 {
        bail!("fps must be positive");
    }
    let (width, height) = even_size(first.dimensions());
    if width > u16::MAX as u32 || height > u16::MAX as u32 {
        bail!("{}x{} exceeds the MP4 track size limit", width, height);
    }

    let mut encoder = Encoder::with_api_config(OpenH264API::from_source(), EncoderConfig::new())
        .context("creating H.264 encoder")?;
    let mut sps: Option<Vec<u8>> = None;
    let mut pps: Option<Vec<u8>> = None;
    let mut samples: Vec<Sample> = Vec::with_capacity(frames.len());
    let mut leading_skips = 0u32;

    for (i, frame) in frames.iter().enumerate() {
        if frame.dimensions() != first.dimensions() {
            bail!(
                "frame {} is {}x{}, expected {}x{}",
                i,
                frame.width(),
                frame.height(),
                first.width(),
                first.height()
            );
        }
        let resized;
        let frame = if frame.dimensions() == (width, height) {
            frame
        } else {
            resized = imageops::resize(frame, width, height, FilterType::Triangle);
            &resized
        };
        let rgb = RgbSliceU8::new(frame.as_raw(), (width as usize, height as usize));
        let yuv = YUVBuffer::from_rgb_source(rgb);
        let annex_b = encoder
            .encode(&yuv)
            .with_context(|| format!("encoding frame {}", i))?
            .to_vec();

        let mut sample = Sample {
            bytes: Vec::with_capacity(annex_b.len()),
            is_sync: false,
            duration: 1,
        };
        for nal in split_annex_b(&annex_b) {
            match nal[0] & 0x1f {
                NAL_SPS => {
                    sps.get_or_insert_with(|| nal.to_vec());
                }
                NAL_PPS => {
                    pps.get_or_insert_with(|| nal.to_vec());
                }
                kind => {
                    sample.is_sync |= kind == NAL_IDR;
                    sample.bytes.extend_from_slice(&(nal.len() as u32).to_be_bytes());
                    sample.bytes.extend_from_slice(nal);
                }
            }
        }

        // Rate control may skip a frame; the previous picture is held instead
        if sample.bytes.is_empty() {
            trace!("Frame {} skipped by encoder", i);
            match samples.last_mut() {
                Some(last) => last.duration += 1,
                None => leading_skips += 1,
            }
            continue;
        }
        if samples.is_empty() {
            sample.duration += leading_skips;
        }
        samples.push(sample);
    }

    let (Some(sps), Some(pps)) = (sps, pps) else {
        bail!("encoder produced no parameter sets");
    };
    if samples.is_empty() {
        bail!("encoder produced no pictures");
    }
    mux(path, (width, height), fps, sps, pps, samples)?;
    debug!(
        "Wrote H.264 {}x{} {} frames @{}fps to {}",
        width,
        height,
        frames.len(),
        fps,
        path.display()
    );
    Ok(())
}

/// Solid-color clip of `frame_count` frames.
pub fn write_solid(path: &Path, (width, height): (u32, u32), rgb: [u8; 3], fps: u32, frame_count: u32) -> Result<()> {
    let frame = RgbImage::from_pixel(width.max(2), height.max(2), image::Rgb(rgb));
    let frames = vec![frame; frame_count.max(1) as usize];
    write_frames(path, &frames, fps)
}

/// First video track of the MP4 at `path`.
pub fn read_info(path: &Path) -> Result<ClipInfo> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let size = file.metadata()?.len();
    let reader = Mp4Reader::read_header(BufReader::new(file), size)
        .with_context(|| format!("{} is not an MP4 file", path.display()))?;
    let track = reader
        .tracks()
        .values()
        .find(|t| matches!(t.track_type(), Ok(TrackType::Video)))
        .with_context(|| format!("{} has no video track", path.display()))?;
    Ok(ClipInfo {
        width: track.width() as u32,
        height: track.height() as u32,
        frame_count: track.sample_count(),
        frame_rate: track.frame_rate(),
        duration: track.duration(),
    })
}

fn mux(path: &Path, (width, height): (u32, u32), fps: u32, sps: Vec<u8>, pps: Vec<u8>, samples: Vec<Sample>) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let config = Mp4Config {
        major_brand: "isom".parse()?,
        minor_version: 512,
        compatible_brands: vec!["isom".parse()?, "iso2".parse()?, "avc1".parse()?, "mp41".parse()?],
        timescale: 1000,
    };
    let mut writer = Mp4Writer::write_start(file, &config)?;
    writer.add_track(&TrackConfig {
        track_type: TrackType::Video,
        timescale: fps,
        language: "und".to_owned(),
        media_conf: MediaConfig::AvcConfig(AvcConfig {
            width: width as u16,
            height: height as u16,
            seq_param_set: sps,
            pic_param_set: pps,
        }),
    })?;

    let mut start_time = 0u64;
    for sample in samples {
        let duration = sample.duration;
        writer.write_sample(
            1,
            &Mp4Sample {
                start_time,
                duration,
                rendering_offset: 0,
                is_sync: sample.is_sync,
                bytes: Bytes::from(sample.bytes),
            },
        )?;
        start_time += duration as u64;
    }
    writer.write_end()?;
    Ok(())
}

fn even_size((width, height): (u32, u32)) -> (u32, u32) {
    ((width & !1).max(2), (height & !1).max(2))
}

/// NAL unit payloads of an Annex B byte stream (start codes removed).
fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    // (start code offset, payload offset)
    let mut marks = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            marks.push((code, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }
    marks
        .iter()
        .enumerate()
        .map(|(n, &(_, payload))| {
            let end = marks.get(n + 1).map_or(data.len(), |&(next, _)| next);
            &data[payload..end]
        })
        .filter(|nal| !nal.is_empty())
        .collect()
}
