//! Application file locations (config file, log file).

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Files whose presence in the working directory makes it the config directory.
const LOCAL_MARKERS: [&str; 2] = ["filmeto.yml", "filmeto.log"];

/// Configuration for overriding default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var (FILMETO_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| {
            std::env::var("FILMETO_CONFIG_DIR")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
        });

        Self { config_dir }
    }
}

/// Get path to a configuration file
///
/// Priority:
/// 1. CLI --config-dir argument
/// 2. FILMETO_CONFIG_DIR environment variable
/// 3. Working directory IF it already holds filmeto.yml or filmeto.log
/// 4. Platform config directory from dirs-next
///
/// Platform paths:
/// - Linux: ~/.config/filmeto/{name}
/// - macOS: ~/Library/Application Support/filmeto/{name}
/// - Windows: %APPDATA%\filmeto\{name}
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    resolve_dir(config, std::env::current_dir().ok(), dirs_next::config_dir()).join(name)
}

/// Get path to a data file (logs). Same priority as [`config_file`] with the
/// platform data directory as the last resort.
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    resolve_dir(config, std::env::current_dir().ok(), dirs_next::data_dir()).join(name)
}

/// Create config and data directories if missing.
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    for dir in [
        resolve_dir(config, std::env::current_dir().ok(), dirs_next::config_dir()),
        resolve_dir(config, std::env::current_dir().ok(), dirs_next::data_dir()),
    ] {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
    }
    Ok(())
}

fn has_local_markers(dir: &Path) -> bool {
    LOCAL_MARKERS.iter().any(|f| dir.join(f).exists())
}

fn resolve_dir(config: &PathConfig, cwd: Option<PathBuf>, platform: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }

    if let Some(cwd) = cwd {
        if has_local_markers(&cwd) {
            return cwd;
        }
    }

    if let Some(dir) = platform {
        return dir.join("filmeto");
    }

    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_with_custom_dir() {
        let config = PathConfig {
            config_dir: Some(PathBuf::from("/custom")),
        };
        assert_eq!(config_file("filmeto.yml", &config), PathBuf::from("/custom/filmeto.yml"));
        assert_eq!(data_file("filmeto.log", &config), PathBuf::from("/custom/filmeto.log"));
    }

    #[test]
    fn test_cli_dir_wins_over_env() {
        let config = PathConfig::from_env_and_cli(Some(PathBuf::from("/from-cli")));
        assert_eq!(config.config_dir, Some(PathBuf::from("/from-cli")));
    }

    #[test]
    fn test_platform_default_is_namespaced() {
        let dir = resolve_dir(
            &PathConfig::default(),
            None,
            Some(PathBuf::from("/home/u/.config")),
        );
        assert_eq!(dir, PathBuf::from("/home/u/.config/filmeto"));
        assert_eq!(resolve_dir(&PathConfig::default(), None, None), PathBuf::from("."));
    }

    #[test]
    fn test_local_markers_priority() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = tmp.path().to_path_buf();
        let platform = Some(PathBuf::from("/platform"));

        let without = resolve_dir(&PathConfig::default(), Some(cwd.clone()), platform.clone());
        assert_eq!(without, PathBuf::from("/platform/filmeto"));

        std::fs::write(cwd.join("filmeto.yml"), "clip_fps: 8\n").unwrap();
        let with = resolve_dir(&PathConfig::default(), Some(cwd.clone()), platform);
        assert_eq!(with, cwd);
    }
}
