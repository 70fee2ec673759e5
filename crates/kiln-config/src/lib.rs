//! Configuration for the Kiln renderer.
//!
//! Settings persist to disk as `config.ron`. Missing sections fall back to
//! their defaults, unknown fields are ignored, and command-line arguments
//! parsed with clap are layered on top of the loaded file.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{AssetConfig, Config, DebugConfig, RenderConfig, default_config_dir};
pub use error::ConfigError;
