//! Command-line overrides for Kiln hosts.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Kiln command-line arguments.
///
/// Values given here win over the ones loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "kiln", about = "Kiln deferred renderer")]
pub struct CliArgs {
    /// Frames kept in flight.
    #[arg(long)]
    pub frames_in_flight: Option<u32>,

    /// Enable or disable vsync.
    #[arg(long)]
    pub vsync: Option<bool>,

    /// Root directory for assets.
    #[arg(long)]
    pub asset_root: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directory for JSON log files.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl CliArgs {
    /// Config directory to load from: `--config` or the platform default.
    pub fn config_dir(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(crate::default_config_dir)
    }
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(frames) = args.frames_in_flight {
            self.render.frames_in_flight = frames;
        }
        if let Some(vsync) = args.vsync {
            self.render.vsync = vsync;
        }
        if let Some(ref root) = args.asset_root {
            self.assets.root = root.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        if let Some(ref dir) = args.log_dir {
            self.debug.log_dir = Some(dir.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            vsync: Some(false),
            asset_root: Some(PathBuf::from("/srv/assets")),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert!(!config.render.vsync);
        assert_eq!(config.assets.root, PathBuf::from("/srv/assets"));
        // Untouched fields keep defaults
        assert_eq!(config.render.frames_in_flight, 2);
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::try_parse_from([
            "kiln",
            "--frames-in-flight",
            "3",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.frames_in_flight, Some(3));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.config.is_none());
    }

    #[test]
    fn test_config_dir_prefers_flag() {
        let args = CliArgs {
            config: Some(PathBuf::from("/tmp/kiln-test")),
            ..Default::default()
        };
        assert_eq!(args.config_dir(), PathBuf::from("/tmp/kiln-test"));
    }
}
