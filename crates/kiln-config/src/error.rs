//! Configuration error types.

/// Errors raised while reading, writing or validating `config.ron`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config: {0}")]
    Read(#[source] std::io::Error),

    /// Failed to write the config file or its directory to disk.
    #[error("failed to write config: {0}")]
    Write(#[source] std::io::Error),

    /// Failed to parse RON content.
    #[error("failed to parse config: {0}")]
    Parse(#[source] ron::error::SpannedError),

    /// Failed to serialize config to RON.
    #[error("failed to serialize config: {0}")]
    Serialize(#[source] ron::Error),

    /// A value parsed correctly but cannot drive the renderer.
    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_io_errors_keep_their_source() {
        let err = ConfigError::Read(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        assert_eq!(err.to_string(), "failed to read config: missing");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_parse_error_keeps_its_source() {
        let spanned = ron::from_str::<u32>("not a number").unwrap_err();
        let err = ConfigError::Parse(spanned);
        assert!(err.to_string().starts_with("failed to parse config: "));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_invalid_names_the_field() {
        let err = ConfigError::Invalid {
            field: "render.frames_in_flight",
            reason: "must be at least 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid config value `render.frames_in_flight`: must be at least 1"
        );
        assert!(err.source().is_none());
    }
}
