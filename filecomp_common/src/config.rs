use crate::{CompareOptions, FileCompError};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "filecomp.toml";

/// Tuned engine constants. Defaults are the empirically chosen values; every
/// one of them can be overridden from the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes of each file sampled for encoding detection
    pub prefix_size: usize,
    /// Minimum sample for the statistical UTF-16 test
    pub utf16_min_sample: usize,
    /// Bhattacharyya coefficient above which UTF-16 is ruled out
    pub utf16_bhattacharyya_cutoff: f64,
    /// Minimum sample for the UTF-8 scan unless the whole file fits
    pub utf8_min_sample: usize,
    /// Codepage used for single-byte text without a recoding table
    pub default_codepage: String,
    /// Aligned read size of the binary read-ahead cache
    pub binary_block_size: usize,
    /// Bytes kept buffered per file by the binary read-ahead cache
    pub binary_window_size: usize,
    /// Maximum number of binary change regions reported
    pub max_binary_changes: usize,
    /// Minimum interval between progress events
    pub progress_interval_ms: u64,
    /// Files larger than this are compared in binary mode
    pub max_text_size: u64,
    /// Common rows kept around each change in the differences-only view
    pub context_lines: usize,
}

impl EngineConfig {
    pub const PREFIX_SIZE: usize = 64 * 1024;
    pub const UTF16_MIN_SAMPLE: usize = 5000;
    pub const UTF16_BHATTACHARYYA_CUTOFF: f64 = 0.4;
    pub const UTF8_MIN_SAMPLE: usize = 2500;
    pub const BINARY_BLOCK_SIZE: usize = 32 * 1024;
    pub const BINARY_WINDOW_SIZE: usize = 2 * 1024 * 1024;
    pub const MAX_BINARY_CHANGES: usize = 32_768;
    pub const PROGRESS_INTERVAL_MS: u64 = 500;
    pub const MAX_TEXT_SIZE: u64 = 1 << 30;

    /// Reject values the engines cannot work with
    pub fn validate(&self) -> Result<(), FileCompError> {
        if self.binary_block_size == 0 {
            return Err(FileCompError::Config("binary_block_size must be positive".to_string()));
        }
        if self.binary_window_size < self.binary_block_size {
            return Err(FileCompError::Config(
                "binary_window_size must hold at least one block".to_string(),
            ));
        }
        if self.prefix_size < 4 {
            return Err(FileCompError::Config("prefix_size must be at least 4 bytes".to_string()));
        }
        if !(0.0..=1.0).contains(&self.utf16_bhattacharyya_cutoff) {
            return Err(FileCompError::Config(
                "utf16_bhattacharyya_cutoff must lie in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefix_size: Self::PREFIX_SIZE,
            utf16_min_sample: Self::UTF16_MIN_SAMPLE,
            utf16_bhattacharyya_cutoff: Self::UTF16_BHATTACHARYYA_CUTOFF,
            utf8_min_sample: Self::UTF8_MIN_SAMPLE,
            default_codepage: "windows-1252".to_string(),
            binary_block_size: Self::BINARY_BLOCK_SIZE,
            binary_window_size: Self::BINARY_WINDOW_SIZE,
            max_binary_changes: Self::MAX_BINARY_CHANGES,
            progress_interval_ms: Self::PROGRESS_INTERVAL_MS,
            max_text_size: Self::MAX_TEXT_SIZE,
            context_lines: 2,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Options applied to every comparison unless overridden
    #[serde(default)]
    pub compare: CompareOptions,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Enable portable mode (config alongside binary)
    #[serde(default)]
    pub portable_mode: bool,
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: AppConfig,
    pub path: PathBuf,
    pub exists: bool,
    pub portable: bool,
}

pub fn load_config(prefer_portable: bool) -> Result<LoadedConfig, FileCompError> {
    let (path, portable) = resolve_config_path(prefer_portable)?;
    let mut loaded = load_config_from(&path)?;
    loaded.portable = portable;
    loaded.config.portable_mode = portable;
    Ok(loaded)
}

/// Load the configuration stored at `path`, falling back to defaults when
/// the file does not exist
pub fn load_config_from(path: &Path) -> Result<LoadedConfig, FileCompError> {
    let exists = path.exists();

    let config = if exists {
        let data = fs::read_to_string(path).map_err(|e| FileCompError::io(path, e))?;
        let config: AppConfig =
            toml::from_str(&data).map_err(|e| FileCompError::Serialization(e.to_string()))?;
        config.engine.validate()?;
        config
    } else {
        AppConfig::default()
    };

    Ok(LoadedConfig {
        config,
        path: path.to_path_buf(),
        exists,
        portable: false,
    })
}

pub fn ensure_config(prefer_portable: bool) -> Result<LoadedConfig, FileCompError> {
    let loaded = load_config(prefer_portable)?;
    if !loaded.exists {
        save_config(&loaded.path, &loaded.config)?;
    }
    Ok(loaded)
}

pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), FileCompError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| FileCompError::io(parent, e))?;
    }

    let data = toml::to_string_pretty(config)
        .map_err(|e| FileCompError::Serialization(e.to_string()))?;
    fs::write(path, data).map_err(|e| FileCompError::io(path, e))?;
    Ok(())
}

fn resolve_config_path(prefer_portable: bool) -> Result<(PathBuf, bool), FileCompError> {
    if let Some(portable_path) = portable_config_path() {
        if prefer_portable || portable_path.exists() {
            return Ok((portable_path, true));
        }
    }

    let dirs = ProjectDirs::from("", "aecs4u", "filecomp")
        .ok_or_else(|| FileCompError::Config("Unable to determine config directory".to_string()))?;
    Ok((dirs.config_dir().join(CONFIG_FILE_NAME), false))
}

fn portable_config_path() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|dir| dir.join(CONFIG_FILE_NAME)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let loaded = load_config_from(&temp.path().join(CONFIG_FILE_NAME)).unwrap();
        assert!(!loaded.exists);
        assert_eq!(loaded.config.engine.max_binary_changes, 32_768);
        assert_eq!(loaded.config.engine.utf16_min_sample, 5000);
    }

    #[test]
    fn test_config_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = AppConfig::default();
        config.compare.ignore_case = true;
        config.engine.max_binary_changes = 10;
        save_config(&path, &config).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert!(loaded.exists);
        assert!(loaded.config.compare.ignore_case);
        assert_eq!(loaded.config.engine.max_binary_changes, 10);
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[engine]\nutf16_bhattacharyya_cutoff = 0.3\n").unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.config.engine.utf16_bhattacharyya_cutoff, 0.3);
        assert_eq!(loaded.config.engine.binary_block_size, 32 * 1024);
        assert!(loaded.config.compare.detailed_differences);
    }

    #[test]
    fn test_invalid_engine_config_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[engine]\nbinary_block_size = 0\n").unwrap();

        assert!(matches!(load_config_from(&path), Err(FileCompError::Config(_))));
    }
}
