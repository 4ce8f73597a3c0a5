//! Video I/O: external ffmpeg/ffprobe plumbing and the in-process H.264 writer.

pub mod ffmpeg;
pub mod h264;

pub use ffmpeg::{Ffmpeg, FfmpegError, VideoMetadata};
pub use h264::ClipInfo;
