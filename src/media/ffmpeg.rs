//! External encoder plumbing: ffmpeg / ffprobe command-line invocations.
//!
//! Every invocation passes `-y` and an explicit pixel format and is judged by
//! its exit status. Failures come back as [`FfmpegError`]; callers treat them
//! as soft and move on to the next fallback.
//!
//! Frame-accurate work goes through raw RGB pipes:
//! - [`VideoReader`]: `ffmpeg -i src -f rawvideo -pix_fmt rgb24 -` on a reader thread
//! - [`VideoWriter`]: rawvideo on stdin → H.264 / yuv420p, fed from a writer thread

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use serde::Deserialize;

use crate::config::FilmetoConfig;

/// Keep even dimensions for yuv420p.
const EVEN_SCALE: &str = "scale=trunc(iw/2)*2:trunc(ih/2)*2";

/// Encoder invocation errors
#[derive(Debug)]
pub enum FfmpegError {
    /// Executable missing
    NotFound(PathBuf),
    /// Process could not be started
    Spawn(String),
    /// Non-zero exit
    Failed {
        tool: PathBuf,
        status: String,
        args: String,
        stderr_tail: String,
    },
    /// Pipe or file I/O while talking to the process
    Io(String),
    /// ffprobe output unusable
    Probe(String),
}

impl std::fmt::Display for FfmpegError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FfmpegError::NotFound(p) => write!(f, "Executable not found: {}", p.display()),
            FfmpegError::Spawn(e) => write!(f, "Failed to spawn encoder: {}", e),
            FfmpegError::Failed {
                tool,
                status,
                args,
                stderr_tail,
            } => write!(
                f,
                "{} failed with {} (args='{}', stderr_tail='{}')",
                tool.display(),
                status,
                args,
                stderr_tail
            ),
            FfmpegError::Io(e) => write!(f, "Encoder I/O error: {}", e),
            FfmpegError::Probe(e) => write!(f, "Probe failed: {}", e),
        }
    }
}

impl std::error::Error for FfmpegError {}

/// Video stream properties reported by ffprobe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: u64,
}

impl VideoMetadata {
    /// Positive fps, size and frame count
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.fps > 0.0 && self.frame_count > 0
    }
}

/// Image placed onto a video by the `filter_complex` overlay path.
#[derive(Debug, Clone)]
pub struct OverlayInput {
    pub path: PathBuf,
    pub x: i32,
    pub y: i32,
}

/// Handle to the configured ffmpeg / ffprobe executables.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Ffmpeg {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    pub fn from_config(config: &FilmetoConfig) -> Self {
        Self::new(config.ffmpeg_path.clone(), config.ffprobe_path.clone())
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg
    }

    /// `ffmpeg -version` exits cleanly
    pub fn is_available(&self) -> bool {
        Command::new(&self.ffmpeg)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Re-encode any video to H.264 / yuv420p.
    pub fn transcode_h264(&self, input: &Path, output: &Path) -> Result<(), FfmpegError> {
        let mut args = base_args();
        args.extend(["-i".into(), path_arg(input), "-an".into()]);
        args.extend(h264_output_args());
        args.push(path_arg(output));
        self.run(&args)
    }

    /// Loop a still image into a `seconds`-long clip at `fps`.
    pub fn still_clip(
        &self,
        image: &Path,
        output: &Path,
        fps: u32,
        seconds: u32,
    ) -> Result<(), FfmpegError> {
        let mut args = base_args();
        args.extend([
            "-loop".into(),
            "1".into(),
            "-i".into(),
            path_arg(image),
            "-t".into(),
            seconds.max(1).to_string(),
            "-r".into(),
            fps.max(1).to_string(),
        ]);
        args.extend(h264_output_args());
        args.push(path_arg(output));
        self.run(&args)
    }

    /// Solid black clip generated by the lavfi color source.
    pub fn black_clip(
        &self,
        output: &Path,
        (width, height): (u32, u32),
        fps: u32,
        seconds: u32,
    ) -> Result<(), FfmpegError> {
        let mut args = base_args();
        args.extend([
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!(
                "color=c=black:s={}x{}:r={}:d={}",
                width.max(2),
                height.max(2),
                fps.max(1),
                seconds.max(1)
            ),
        ]);
        args.extend(h264_output_args());
        args.push(path_arg(output));
        self.run(&args)
    }

    /// Overlay images onto a video with one `overlay=x:y` stage per input.
    ///
    /// Overlay images must already be scaled to their target box.
    pub fn overlay(
        &self,
        video: &Path,
        overlays: &[OverlayInput],
        output: &Path,
    ) -> Result<(), FfmpegError> {
        let mut args = base_args();
        args.extend(["-i".into(), path_arg(video)]);
        for overlay in overlays {
            args.extend(["-i".into(), path_arg(&overlay.path)]);
        }
        let (graph, last) = overlay_graph(overlays);
        args.extend([
            "-filter_complex".into(),
            graph,
            "-map".into(),
            last,
            "-map".into(),
            "0:a?".into(),
            "-c:a".into(),
            "copy".into(),
        ]);
        args.extend(h264_codec_args());
        args.push(path_arg(output));
        self.run(&args)
    }

    /// Write the first frame of `video` as a PNG.
    pub fn extract_first_frame(&self, video: &Path, image: &Path) -> Result<(), FfmpegError> {
        let mut args = base_args();
        args.extend([
            "-i".into(),
            path_arg(video),
            "-frames:v".into(),
            "1".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            path_arg(image),
        ]);
        self.run(&args)
    }

    /// Query width/height/fps/frame count of the first video stream.
    pub fn probe(&self, path: &Path) -> Result<VideoMetadata, FfmpegError> {
        let args: Vec<String> = vec![
            "-v".into(),
            "error".into(),
            "-select_streams".into(),
            "v:0".into(),
            "-show_streams".into(),
            "-show_format".into(),
            "-print_format".into(),
            "json".into(),
            path_arg(path),
        ];
        debug!("{} {}", self.ffprobe.display(), args.join(" "));
        let output = Command::new(&self.ffprobe)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_error(&self.ffprobe, e))?;
        if !output.status.success() {
            return Err(FfmpegError::Failed {
                tool: self.ffprobe.clone(),
                status: output.status.to_string(),
                args: args.join(" "),
                stderr_tail: last_n_chars(&String::from_utf8_lossy(&output.stderr), 500),
            });
        }
        parse_probe(&output.stdout)
    }

    /// Run ffmpeg to completion.
    pub fn run(&self, args: &[String]) -> Result<(), FfmpegError> {
        debug!("{} {}", self.ffmpeg.display(), args.join(" "));
        let output = Command::new(&self.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| spawn_error(&self.ffmpeg, e))?;
        if !output.status.success() {
            let err = FfmpegError::Failed {
                tool: self.ffmpeg.clone(),
                status: output.status.to_string(),
                args: args.join(" "),
                stderr_tail: last_n_chars(&String::from_utf8_lossy(&output.stderr), 500),
            };
            warn!("{}", err);
            return Err(err);
        }
        Ok(())
    }
}

fn base_args() -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
    ]
}

fn h264_output_args() -> Vec<String> {
    let mut args = vec!["-vf".into(), EVEN_SCALE.into()];
    args.extend(h264_codec_args());
    args
}

fn h264_codec_args() -> Vec<String> {
    vec![
        "-c:v".into(),
        "libx264".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-movflags".into(),
        "+faststart".into(),
    ]
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn spawn_error(tool: &Path, error: std::io::Error) -> FfmpegError {
    if error.kind() == ErrorKind::NotFound {
        FfmpegError::NotFound(tool.to_path_buf())
    } else {
        FfmpegError::Spawn(format!("{}: {}", tool.display(), error))
    }
}

/// `[0:v][1:v]overlay=x:y[v1];[v1][2:v]overlay=x:y[v2]...`, returns (graph, last label).
fn overlay_graph(overlays: &[OverlayInput]) -> (String, String) {
    let mut stages = Vec::with_capacity(overlays.len() + 1);
    let mut current = "[0:v]".to_string();
    for (i, overlay) in overlays.iter().enumerate() {
        let label = format!("[v{}]", i + 1);
        stages.push(format!(
            "{}[{}:v]overlay={}:{}{}",
            current,
            i + 1,
            overlay.x,
            overlay.y,
            label
        ));
        current = label;
    }
    // Scale the final stage to even dimensions inside the graph; -vf can't be combined with it.
    let out = "[vout]".to_string();
    stages.push(format!("{}{}{}", current, EVEN_SCALE, out));
    (stages.join(";"), out)
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    r_frame_rate: Option<String>,
    #[serde(default)]
    avg_frame_rate: Option<String>,
    #[serde(default)]
    nb_frames: Option<String>,
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    duration: Option<String>,
}

fn parse_probe(stdout: &[u8]) -> Result<VideoMetadata, FfmpegError> {
    let parsed: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| FfmpegError::Probe(format!("bad ffprobe JSON: {}", e)))?;
    let stream = parsed
        .streams
        .first()
        .ok_or_else(|| FfmpegError::Probe("no video stream".into()))?;

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .unwrap_or(0.0);
    let duration = stream
        .duration
        .as_deref()
        .and_then(|d| d.trim().parse::<f64>().ok())
        .or_else(|| {
            parsed
                .format
                .as_ref()
                .and_then(|f| f.duration.as_deref())
                .and_then(|d| d.trim().parse::<f64>().ok())
        });
    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.trim().parse::<u64>().ok())
        .filter(|n| *n > 0)
        .or_else(|| duration.map(|d| (d * fps).round().max(0.0) as u64))
        .unwrap_or(0);

    Ok(VideoMetadata {
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        fps,
        frame_count,
    })
}

/// "30000/1001" or "25" → fps
fn parse_rate(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let value = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

fn read_stderr_tail(stderr: &mut Option<ChildStderr>) -> String {
    let Some(mut pipe) = stderr.take() else {
        return String::new();
    };
    let mut buf = Vec::new();
    if pipe.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    last_n_chars(&String::from_utf8_lossy(&buf), 500)
}

/// Last `max_chars` characters of `s`, not counting trailing whitespace.
fn last_n_chars(s: &str, max_chars: usize) -> String {
    let chars: Vec<char> = s.trim_end().chars().collect();
    let start = chars.len().saturating_sub(max_chars);
    chars[start..].iter().collect::<String>().trim_start().to_owned()
}

/// Decodes a video into packed RGB24 frames.
pub struct VideoReader {
    receiver: mpsc::Receiver<Vec<u8>>,
    worker: Option<JoinHandle<Result<(), FfmpegError>>>,
    child: Child,
    width: u32,
    height: u32,
}

impl VideoReader {
    pub fn spawn(tool: &Ffmpeg, input: &Path, width: u32, height: u32) -> Result<Self, FfmpegError> {
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(4);
        let mut child = Command::new(&tool.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(input)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| spawn_error(&tool.ffmpeg, e))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| FfmpegError::Io("failed to capture decoder stdout".into()))?;
        let frame_size = width as usize * height as usize * 3;

        let worker = thread::Builder::new()
            .name("filmeto-ffmpeg-decoder".to_owned())
            .spawn(move || {
                loop {
                    let mut buffer = vec![0u8; frame_size];
                    match stdout.read_exact(&mut buffer) {
                        Ok(()) => {
                            if sender.send(buffer).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(FfmpegError::Io(format!("decoder read: {}", e))),
                    }
                }
                Ok(())
            })
            .map_err(|e| FfmpegError::Spawn(format!("decoder reader thread: {}", e)))?;

        Ok(Self {
            receiver,
            worker: Some(worker),
            child,
            width,
            height,
        })
    }

    /// Next RGB24 frame, None at end of stream
    pub fn read_frame(&self) -> Option<image::RgbImage> {
        let raw = self.receiver.recv().ok()?;
        image::RgbImage::from_raw(self.width, self.height, raw)
    }

    pub fn finish(mut self) -> Result<(), FfmpegError> {
        // Unblock the reader if we stopped early
        drop(std::mem::replace(&mut self.receiver, mpsc::sync_channel(1).1));
        let _ = self.child.kill();
        let _ = self.child.wait();
        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(FfmpegError::Io("decoder reader thread panicked".into())),
            None => Ok(()),
        }
    }
}

/// Encodes packed RGB24 frames to H.264 / yuv420p.
pub struct VideoWriter {
    sender: Option<mpsc::SyncSender<Vec<u8>>>,
    worker: Option<JoinHandle<Result<(), FfmpegError>>>,
}

impl VideoWriter {
    /// Opens the encoder process. A spawn failure here is the "writer failed
    /// to open" condition.
    pub fn spawn(
        tool: &Ffmpeg,
        output: &Path,
        (width, height): (u32, u32),
        fps: f64,
    ) -> Result<Self, FfmpegError> {
        let mut args = base_args();
        args.extend([
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s:v".into(),
            format!("{}x{}", width, height),
            "-r".into(),
            format!("{}", fps),
            "-i".into(),
            "-".into(),
            "-an".into(),
        ]);
        args.extend(h264_output_args());
        args.push(path_arg(output));
        debug!("{} {}", tool.ffmpeg.display(), args.join(" "));

        let mut child = Command::new(&tool.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&tool.ffmpeg, e))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| FfmpegError::Io("failed to capture encoder stdin".into()))?;
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(4);
        let tool_path = tool.ffmpeg.clone();

        let worker = thread::Builder::new()
            .name("filmeto-ffmpeg-encoder".to_owned())
            .spawn(move || {
                let mut stderr = child.stderr.take();
                let mut write_error = None;
                while let Ok(frame) = receiver.recv() {
                    if let Err(e) = stdin.write_all(&frame) {
                        write_error = Some(e);
                        break;
                    }
                }
                let _ = stdin.flush();
                drop(stdin);
                let status = child
                    .wait()
                    .map_err(|e| FfmpegError::Io(format!("waiting for encoder: {}", e)))?;
                let stderr_tail = read_stderr_tail(&mut stderr);
                if !status.success() {
                    return Err(FfmpegError::Failed {
                        tool: tool_path,
                        status: status.to_string(),
                        args: args.join(" "),
                        stderr_tail,
                    });
                }
                if let Some(e) = write_error {
                    return Err(FfmpegError::Io(format!("writing frame: {}", e)));
                }
                Ok(())
            })
            .map_err(|e| FfmpegError::Spawn(format!("encoder writer thread: {}", e)))?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn write_frame(&self, frame: &image::RgbImage) -> Result<(), FfmpegError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| FfmpegError::Io("encoder already finalized".into()))?;
        sender
            .send(frame.as_raw().clone())
            .map_err(|_| FfmpegError::Io("encoder stopped accepting frames".into()))
    }

    /// Close stdin and wait for the encoder to exit.
    pub fn finish(mut self) -> Result<(), FfmpegError> {
        drop(self.sender.take());
        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(FfmpegError::Io("encoder writer thread panicked".into())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("8/1"), Some(8.0));
        assert_eq!(parse_rate("25"), Some(25.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("garbage"), None);
    }

    #[test]
    fn test_parse_probe_nb_frames_and_duration_fallback() {
        let json = br#"{"streams":[{"width":720,"height":1280,"r_frame_rate":"8/1","avg_frame_rate":"8/1","nb_frames":"8"}]}"#;
        let meta = parse_probe(json).unwrap();
        assert_eq!(
            meta,
            VideoMetadata {
                width: 720,
                height: 1280,
                fps: 8.0,
                frame_count: 8
            }
        );
        assert!(meta.is_valid());

        let json = br#"{"streams":[{"width":64,"height":64,"avg_frame_rate":"0/0","r_frame_rate":"8/1"}],"format":{"duration":"2.000000"}}"#;
        let meta = parse_probe(json).unwrap();
        assert_eq!(meta.frame_count, 16);

        assert!(matches!(parse_probe(br#"{"streams":[]}"#), Err(FfmpegError::Probe(_))));
    }

    #[test]
    fn test_overlay_graph_chains_stages() {
        let overlays = vec![
            OverlayInput {
                path: "a.png".into(),
                x: 10,
                y: 20,
            },
            OverlayInput {
                path: "b.png".into(),
                x: 0,
                y: 5,
            },
        ];
        let (graph, last) = overlay_graph(&overlays);
        assert_eq!(
            graph,
            "[0:v][1:v]overlay=10:20[v1];[v1][2:v]overlay=0:5[v2];[v2]scale=trunc(iw/2)*2:trunc(ih/2)*2[vout]"
        );
        assert_eq!(last, "[vout]");
    }

    #[test]
    fn test_missing_binary_is_soft_error() {
        let tool = Ffmpeg::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        assert!(!tool.is_available());
        let err = tool.run(&["-version".to_string()]).unwrap_err();
        assert!(matches!(err, FfmpegError::NotFound(_)));
        assert!(matches!(
            tool.probe(Path::new("video.mp4")),
            Err(FfmpegError::NotFound(_))
        ));
    }

    #[test]
    fn test_last_n_chars() {
        assert_eq!(last_n_chars("  hello world  ", 5), "world");
        assert_eq!(last_n_chars("abc", 10), "abc");
        // ffmpeg stderr ends in newlines; they must not eat the budget
        let stderr = format!("{}Conversion failed!\n\n\n", "x".repeat(600));
        assert_eq!(last_n_chars(&stderr, 18), "Conversion failed!");
        assert_eq!(last_n_chars(&stderr, 500).chars().count(), 500);
    }
}
