//! Layer: one visual element of a timeline item.
//!
//! A layer is backed by `<layers_dir>/<id>.<ext>` where ext follows the type
//! (`.png` for image/graphic, `.mp4` for video). Audio and subtitle files keep
//! the extension they were imported with. The id is assigned by the owning
//! `LayerManager` and never changes.
//!
//! # Coordinates
//!
//! - `x`, `y` - top-left corner on the item canvas
//! - `width`, `height` - placed size; 0 means "unset, use the file's natural size"

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Layer content kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerType {
    Image,
    Video,
    Graphic,
    Audio,
    Subtitle,
}

impl LayerType {
    pub const ALL: [LayerType; 5] = [
        LayerType::Image,
        LayerType::Video,
        LayerType::Graphic,
        LayerType::Audio,
        LayerType::Subtitle,
    ];

    /// Lowercase name, as stored in config.yml
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerType::Image => "image",
            LayerType::Video => "video",
            LayerType::Graphic => "graphic",
            LayerType::Audio => "audio",
            LayerType::Subtitle => "subtitle",
        }
    }

    /// Glyph shown next to the layer name in lists
    pub fn icon(&self) -> &'static str {
        match self {
            LayerType::Image => "\u{1F5BC}",    // framed picture
            LayerType::Video => "\u{1F3AC}",    // clapper board
            LayerType::Graphic => "\u{270F}",   // pencil
            LayerType::Audio => "\u{1F50A}",    // speaker
            LayerType::Subtitle => "\u{1F4AC}", // speech balloon
        }
    }

    /// Backing file extension including the dot
    pub fn extension(&self) -> &'static str {
        match self {
            LayerType::Video => ".mp4",
            _ => ".png",
        }
    }

    /// Types that carry pixels on disk and take part in composition
    pub fn is_visual(&self) -> bool {
        matches!(self, LayerType::Image | LayerType::Graphic | LayerType::Video)
    }
}

impl std::fmt::Display for LayerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LayerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LayerType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown layer type '{}'", s))
    }
}

/// Single layer. Serialized form is one entry of the `layers` list in config.yml.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub layer_type: LayerType,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

fn default_true() -> bool {
    true
}

impl Layer {
    pub fn new(id: u32, layer_type: LayerType) -> Self {
        Self {
            id,
            name: Self::default_name(id),
            layer_type,
            visible: true,
            locked: false,
            x: 0,
            y: 0,
            width: 0,
            height: 0,
        }
    }

    pub fn default_name(id: u32) -> String {
        format!("Layer {}", id)
    }

    /// `<layers_dir>/<id><ext>`. Non-visual layers resolve to whichever
    /// `<id>.*` file is on disk.
    pub fn file_path(&self, layers_dir: &Path) -> PathBuf {
        let typed = layers_dir.join(format!("{}{}", self.id, self.layer_type.extension()));
        if self.layer_type.is_visual() || typed.is_file() {
            return typed;
        }
        self.stored_file(layers_dir).unwrap_or(typed)
    }

    fn stored_file(&self, layers_dir: &Path) -> Option<PathBuf> {
        let prefix = format!("{}.", self.id);
        let mut found: Vec<PathBuf> = fs::read_dir(layers_dir)
            .ok()?
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        found.sort();
        found.into_iter().next()
    }

    /// Backing file exists
    pub fn has_file(&self, layers_dir: &Path) -> bool {
        self.file_path(layers_dir).is_file()
    }

    /// Both dimensions set
    pub fn has_size(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn set_size(&mut self, (width, height): (u32, u32)) {
        self.width = width;
        self.height = height;
    }

    /// Right/bottom edge (x + width, y + height), None if size unset.
    pub fn extent(&self) -> Option<(i64, i64)> {
        self.has_size().then(|| {
            (
                self.x as i64 + self.width as i64,
                self.y as i64 + self.height as i64,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_path_by_type() {
        let dir = Path::new("/items/1/layers");
        assert_eq!(
            Layer::new(3, LayerType::Image).file_path(dir),
            PathBuf::from("/items/1/layers/3.png")
        );
        assert_eq!(
            Layer::new(4, LayerType::Video).file_path(dir),
            PathBuf::from("/items/1/layers/4.mp4")
        );
        assert_eq!(
            Layer::new(5, LayerType::Graphic).file_path(dir),
            PathBuf::from("/items/1/layers/5.png")
        );
    }

    #[test]
    fn test_imported_extension_is_found() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let sub = Layer::new(6, LayerType::Subtitle);
        assert!(!sub.has_file(dir));
        assert_eq!(sub.file_path(dir), dir.join("6.png"));

        fs::write(dir.join("6.srt"), "1\n").unwrap();
        fs::write(dir.join("16.wav"), b"RIFF").unwrap();
        assert!(sub.has_file(dir));
        assert_eq!(sub.file_path(dir), dir.join("6.srt"));

        let audio = Layer::new(1, LayerType::Audio);
        assert!(!audio.has_file(dir));
        // Visual types never pick up a stray file
        fs::write(dir.join("7.jpg"), b"x").unwrap();
        assert!(!Layer::new(7, LayerType::Image).has_file(dir));
    }

    #[test]
    fn test_type_parsing_and_icons() {
        assert_eq!("Video".parse::<LayerType>(), Ok(LayerType::Video));
        assert!("hologram".parse::<LayerType>().is_err());
        let icons: std::collections::HashSet<_> = LayerType::ALL.iter().map(|t| t.icon()).collect();
        assert_eq!(icons.len(), LayerType::ALL.len());
    }

    #[test]
    fn test_yaml_shape() {
        let mut layer = Layer::new(2, LayerType::Image);
        layer.x = 10;
        layer.set_size((50, 60));
        let yaml = serde_yaml::to_string(&layer).unwrap();
        assert!(yaml.contains("type: image"));
        assert!(yaml.contains("name: Layer 2"));

        let back: Layer = serde_yaml::from_str("id: 7\nname: bg\ntype: video\n").unwrap();
        assert_eq!(back.layer_type, LayerType::Video);
        assert!(back.visible);
        assert!(!back.locked);
        assert_eq!(back.extent(), None);
    }
}
