use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::entities::layer::LayerType;

// Build version with target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Video:  ffmpeg/ffprobe (external), in-process H.264 fallback\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Timeline layer composition tool
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Project directory (holds timeline/<n>/ item directories)
    #[arg(value_name = "PROJECT_DIR")]
    pub project_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,

    /// Enable logging to file (default: filmeto.log in the data directory)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Do not compose after layer edits
    #[arg(long = "no-compose")]
    pub no_compose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List timeline items
    Items,

    /// Create the next timeline item
    AddItem,

    /// List the layers of an item, bottom first
    Layers {
        #[arg(short, long, value_name = "N")]
        item: usize,
    },

    /// Add a blank layer, or one copied from a file
    AddLayer {
        #[arg(short, long, value_name = "N")]
        item: usize,
        /// image, video, graphic, audio, subtitle
        #[arg(short = 't', long = "type", value_name = "TYPE")]
        layer_type: LayerType,
        #[arg(long, value_name = "FILE")]
        from: Option<PathBuf>,
        #[arg(long, allow_hyphen_values = true)]
        x: Option<i32>,
        #[arg(long, allow_hyphen_values = true)]
        y: Option<i32>,
    },

    /// Delete a layer and its files
    RemoveLayer {
        #[arg(short, long, value_name = "N")]
        item: usize,
        #[arg(long)]
        id: u32,
    },

    /// Show or hide a layer
    ToggleVisible {
        #[arg(short, long, value_name = "N")]
        item: usize,
        #[arg(long)]
        id: u32,
    },

    /// Lock or unlock a layer
    ToggleLock {
        #[arg(short, long, value_name = "N")]
        item: usize,
        #[arg(long)]
        id: u32,
    },

    Rename {
        #[arg(short, long, value_name = "N")]
        item: usize,
        #[arg(long)]
        id: u32,
        #[arg(long)]
        name: String,
    },

    /// Request a new stacking position (validated; stacking stays by id)
    MoveLayer {
        #[arg(short, long, value_name = "N")]
        item: usize,
        #[arg(long)]
        id: u32,
        #[arg(long, value_name = "POS")]
        to: usize,
    },

    /// Compose one item or all items and wait for completion
    Compose {
        #[arg(short, long, value_name = "N", conflicts_with = "all", required_unless_present = "all")]
        item: Option<usize>,
        #[arg(long)]
        all: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_shape() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_add_layer() {
        let args = Args::try_parse_from([
            "filmeto", "-vv", "proj", "add-layer", "--item", "2", "--type", "video", "--x", "-4",
        ])
        .unwrap();
        assert_eq!(args.verbosity, 2);
        match args.command {
            Command::AddLayer { item, layer_type, x, from, .. } => {
                assert_eq!((item, layer_type, x, from), (2, LayerType::Video, Some(-4), None));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Args::try_parse_from(["filmeto", "proj", "compose"]).is_err());
        assert!(Args::try_parse_from(["filmeto", "proj", "compose", "--all"]).is_ok());
    }
}
