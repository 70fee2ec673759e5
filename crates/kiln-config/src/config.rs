//! Configuration structs with defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level Kiln configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub render: RenderConfig,
    pub assets: AssetConfig,
    pub debug: DebugConfig,
}

/// Frame driver and deferred canvas settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    /// Number of frames the host keeps in flight.
    pub frames_in_flight: u32,
    /// Command slots available to each frame in flight.
    pub command_buffers_per_frame: u32,
    /// Present with FIFO when true, otherwise the lowest-latency mode offered.
    pub vsync: bool,
    /// Shader definition used for the G-buffer geometry pass.
    pub gbuffer_shader: String,
    /// Shader definition used for the full-screen lighting pass.
    pub lighting_shader: String,
}

/// Asset store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssetConfig {
    /// Directory that relative asset paths resolve against.
    pub root: PathBuf,
}

/// Debug/development settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log filter directive (e.g. "debug", "info,kiln_render=trace").
    pub log_level: String,
    /// Directory for the JSON log file written in debug builds.
    pub log_dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            command_buffers_per_frame: 15,
            vsync: true,
            gbuffer_shader: "renderer/shaders/gbuffer.shader.json".to_string(),
            lighting_shader: "renderer/shaders/gbuffer_lighting.shader.json".to_string(),
        }
    }
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("content"),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

/// Platform configuration directory for Kiln, e.g. `~/.config/kiln` on Linux.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kiln")
}

// --- Load / Save / Reload ---

impl Config {
    /// Load `config.ron` from `config_dir`, writing a default file when absent.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Write this config to `config_dir/config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::Write)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::Write)
    }

    /// Re-read the file; `Some` only when its contents differ from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;
        new_config.validate()?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject values the frame driver cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.render.frames_in_flight == 0 {
            return Err(ConfigError::Invalid {
                field: "render.frames_in_flight",
                reason: "at least one frame must be in flight".to_string(),
            });
        }
        // The deferred canvas records a geometry and a lighting pass per frame.
        if self.render.command_buffers_per_frame < 2 {
            return Err(ConfigError::Invalid {
                field: "render.command_buffers_per_frame",
                reason: format!(
                    "need at least 2 command buffers per frame, got {}",
                    self.render.command_buffers_per_frame
                ),
            });
        }
        Ok(())
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        ron::from_str(&contents).map_err(ConfigError::Parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_render_budget() {
        let config = Config::default();
        assert_eq!(config.render.frames_in_flight, 2);
        assert_eq!(config.render.command_buffers_per_frame, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_serializes() {
        let ron_str =
            ron::ser::to_string_pretty(&Config::default(), ron::ser::PrettyConfig::new()).unwrap();
        assert!(ron_str.contains("frames_in_flight: 2"));
        assert!(ron_str.contains("gbuffer.shader.json"));
    }

    #[test]
    fn test_missing_section_uses_default() {
        let config: Config = ron::from_str("(render: (vsync: false))").unwrap();
        assert!(!config.render.vsync);
        assert_eq!(config.render.command_buffers_per_frame, 15);
        assert_eq!(config.assets, AssetConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(msaa_samples: 4)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.render.frames_in_flight = 3;
        config.assets.root = PathBuf::from("game/content");
        config.debug.log_dir = Some(PathBuf::from("logs"));

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.render.vsync = false;
        modified.save(dir.path()).unwrap();

        let reloaded = config.reload(dir.path()).unwrap();
        assert_eq!(reloaded.map(|c| c.render.vsync), Some(false));
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        let result = Config::load_or_create(dir.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_command_buffers_rejected() {
        let mut config = Config::default();
        config.render.command_buffers_per_frame = 1;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "render.command_buffers_per_frame",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_frames_in_flight_rejected() {
        let mut config = Config::default();
        config.render.frames_in_flight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_config_dir_ends_with_kiln() {
        assert!(default_config_dir().ends_with("kiln"));
    }
}
