//! Body engine configuration.
//!
//! Parsed from the `[body]` table of a TOML file or built in code. Every
//! field has a default, so an empty table is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Default chunk size for splitting buffered bodies into stream chunks (64 KB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default maximum size `buffer()` will materialize (10 MB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Limits and tuning for byte bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyConfig {
    /// Largest body `buffer()` will materialize before failing with
    /// `LimitExceeded`.
    pub max_buffer_size: usize,
    /// Bytes a shared buffer may hold for lagging readers under the
    /// `Fastest` backpressure mode before it stops pulling upstream.
    /// Falls back to `max_buffer_size` when unset.
    pub fastest_buffer_limit: Option<usize>,
    /// Queued bytes at which a push feed asks the transport to pause reads.
    pub feed_high_watermark: usize,
    /// Queued bytes at which a paused feed asks the transport to resume.
    pub feed_low_watermark: usize,
    /// Chunk size for bodies sliced from an existing buffer.
    pub chunk_size: usize,
    /// Record chunk acquisitions and releases in a leak detector.
    pub leak_detection: bool,
}

impl Default for BodyConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            fastest_buffer_limit: None,
            feed_high_watermark: 64 * 1024,
            feed_low_watermark: 16 * 1024,
            chunk_size: DEFAULT_CHUNK_SIZE,
            leak_detection: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    body: BodyConfig,
}

impl BodyConfig {
    /// Load the `[body]` table from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse the `[body]` table from TOML text.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        file.body.validate()?;
        Ok(file.body)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.chunk_size > 0, "chunk_size must be > 0");
        anyhow::ensure!(
            self.feed_low_watermark <= self.feed_high_watermark,
            "feed_low_watermark ({}) must not exceed feed_high_watermark ({})",
            self.feed_low_watermark,
            self.feed_high_watermark,
        );
        if let Some(limit) = self.fastest_buffer_limit {
            anyhow::ensure!(limit > 0, "fastest_buffer_limit must be > 0");
        }
        Ok(())
    }

    /// Effective memory bound for the `Fastest` backpressure mode.
    pub fn fastest_limit(&self) -> usize {
        self.fastest_buffer_limit.unwrap_or(self.max_buffer_size)
    }

    /// Builder method: set the materialization limit.
    pub fn with_max_buffer_size(self, max_buffer_size: usize) -> Self {
        Self {
            max_buffer_size,
            ..self
        }
    }

    /// Builder method: set the `Fastest` mode memory bound.
    pub fn with_fastest_buffer_limit(self, limit: usize) -> Self {
        Self {
            fastest_buffer_limit: Some(limit),
            ..self
        }
    }

    /// Builder method: set the feed pause/resume watermarks.
    pub fn with_feed_watermarks(self, low: usize, high: usize) -> Self {
        Self {
            feed_low_watermark: low,
            feed_high_watermark: high,
            ..self
        }
    }

    /// Builder method: enable leak detection.
    pub fn with_leak_detection(self, enabled: bool) -> Self {
        Self {
            leak_detection: enabled,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = BodyConfig::from_toml_str("").unwrap();
        assert_eq!(config, BodyConfig::default());
        assert_eq!(config.fastest_limit(), DEFAULT_MAX_BUFFER_SIZE);
    }

    #[test]
    fn parse_body_table() {
        let toml_str = r#"
[body]
max_buffer_size = 1024
fastest_buffer_limit = 256
feed_high_watermark = 512
feed_low_watermark = 128
leak_detection = true
"#;
        let config = BodyConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.max_buffer_size, 1024);
        assert_eq!(config.fastest_limit(), 256);
        assert_eq!(config.feed_high_watermark, 512);
        assert_eq!(config.feed_low_watermark, 128);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.leak_detection);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warpgrid.toml");
        std::fs::write(&path, "[body]\nchunk_size = 4096\n").unwrap();

        let config = BodyConfig::from_file(&path).unwrap();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.max_buffer_size, DEFAULT_MAX_BUFFER_SIZE);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BodyConfig::from_file(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn inverted_watermarks_are_rejected() {
        let toml_str = r#"
[body]
feed_high_watermark = 10
feed_low_watermark = 20
"#;
        let err = BodyConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("feed_low_watermark"));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let config = BodyConfig {
            chunk_size: 0,
            ..BodyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_keeps_limits() {
        let config = BodyConfig::default()
            .with_max_buffer_size(4096)
            .with_fastest_buffer_limit(2048);
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("max_buffer_size = 4096"));
        assert!(toml_str.contains("fastest_buffer_limit = 2048"));
    }

    #[test]
    fn builder_methods_chain() {
        let config = BodyConfig::default()
            .with_feed_watermarks(1, 2)
            .with_leak_detection(true);
        assert_eq!(config.feed_low_watermark, 1);
        assert_eq!(config.feed_high_watermark, 2);
        assert!(config.leak_detection);
    }
}
