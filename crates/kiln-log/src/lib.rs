//! Logging setup for Kiln hosts.
//!
//! Library crates in the workspace log through the `log` facade; this crate
//! installs the `tracing` subscriber that receives those records. Console
//! output is always on. Debug builds also write JSON lines to `kiln.log` when
//! a log directory is available.

use std::path::{Path, PathBuf};

use kiln_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config provides one.
pub const DEFAULT_FILTER: &str = "info,wgpu=warn,naga=warn";

/// File name of the JSON log written in debug builds.
pub const LOG_FILE_NAME: &str = "kiln.log";

/// Install the global subscriber.
///
/// Filter precedence is `RUST_LOG`, then `config.debug.log_level`, then
/// [`DEFAULT_FILTER`]. `log_dir` wins over `config.debug.log_dir` for the
/// JSON file. Calling this twice panics inside `tracing-subscriber`, so hosts
/// call it once at startup.
///
/// ```no_run
/// use kiln_config::Config;
///
/// let config = Config::default();
/// kiln_log::init_logging(None, cfg!(debug_assertions), Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let filter_str = filter_directive(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    let file_dir = log_dir
        .map(Path::to_path_buf)
        .or_else(|| config.and_then(|c| c.debug.log_dir.clone()));

    if debug_build
        && let Some(dir) = file_dir
        && let Some(log_file) = open_log_file(&dir)
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

/// `EnvFilter` built from [`DEFAULT_FILTER`].
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

fn filter_directive(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => {
            config.debug.log_level.clone()
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

fn log_file_path(dir: &Path) -> PathBuf {
    dir.join(LOG_FILE_NAME)
}

fn open_log_file(dir: &Path) -> Option<std::fs::File> {
    std::fs::create_dir_all(dir).ok()?;
    std::fs::File::create(log_file_path(dir)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_quiets_wgpu() {
        let filter_str = format!("{}", default_env_filter());
        assert!(filter_str.contains("wgpu=warn"));
        assert!(filter_str.contains("naga=warn"));
        assert!(filter_str.contains("info"));
    }

    #[test]
    fn test_filter_directive_without_config() {
        assert_eq!(filter_directive(None), DEFAULT_FILTER);
    }

    #[test]
    fn test_filter_directive_from_config() {
        let mut config = Config::default();
        config.debug.log_level = "debug,kiln_render=trace".to_string();
        assert_eq!(filter_directive(Some(&config)), "debug,kiln_render=trace");
    }

    #[test]
    fn test_blank_config_level_falls_back() {
        let mut config = Config::default();
        config.debug.log_level = "  ".to_string();
        assert_eq!(filter_directive(Some(&config)), DEFAULT_FILTER);
    }

    #[test]
    fn test_render_filters_parse() {
        for directive in ["info", "debug,kiln_render=trace", "warn,kiln_render::canvas=debug"] {
            assert!(
                EnvFilter::try_new(directive).is_ok(),
                "failed to parse filter: {directive}"
            );
        }
    }

    #[test]
    fn test_open_log_file_creates_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let nested = temp_dir.path().join("logs").join("session");
        assert!(open_log_file(&nested).is_some());
        assert!(log_file_path(&nested).exists());
    }
}
