//! Configuration types for WireReplay
//!
//! Values are layered with figment: built-in defaults, then `wirereplay.toml`
//! in the working directory, then an explicit config file, then
//! `WIREREPLAY_`-prefixed environment variables (`__` separates sections, so
//! `WIREREPLAY_PLAY__SPEED=2` sets `play.speed`). Command-line flags are
//! applied on top by the caller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WireReplayError};
use crate::stats::StatFormat;

/// File name picked up from the working directory
pub const DEFAULT_CONFIG_FILE: &str = "wirereplay.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "WIREREPLAY_";

/// Slowest accepted playback speed
pub const MIN_SPEED: f64 = 1e-3;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WireReplayConfig {
    /// Replay settings
    #[serde(default)]
    pub play: PlayConfig,

    /// Traffic splitting settings
    #[serde(default)]
    pub filter: FilterConfig,

    /// HTTP ingestion settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Stats sink settings
    #[serde(default)]
    pub stats: StatsConfig,
}

/// Replay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayConfig {
    /// Target connection URL
    pub target: String,

    /// Time multiplier; 2.0 replays twice as fast
    pub speed: f64,

    /// Number of passes over the file
    pub repeat: i32,

    /// Dispatch ignores timing entirely
    pub full_speed: bool,

    /// How far ahead of wall-clock time ops may be queued
    #[serde(with = "humantime_serde")]
    pub queue_time: Duration,

    /// Ops dispatched between pacing checks
    pub queue_granularity: usize,

    /// Per-connection queue capacity
    pub connection_buffer: usize,

    /// How long a dial keeps retrying before giving up
    #[serde(with = "humantime_serde")]
    pub dial_retry_window: Duration,

    /// Run the cursor preprocessing pass
    pub preprocess: bool,

    /// Input is gzip-compressed
    pub gzip: bool,
}

impl Default for PlayConfig {
    fn default() -> Self {
        Self {
            target: "mongodb://localhost:27017".to_string(),
            speed: 1.0,
            repeat: 1,
            full_speed: false,
            queue_time: Duration::from_secs(15),
            queue_granularity: 1000,
            connection_buffer: 10000,
            dial_retry_window: Duration::from_secs(5),
            preprocess: false,
            gzip: false,
        }
    }
}

impl PlayConfig {
    /// Reject values the scheduler cannot work with
    pub fn validate(&self) -> Result<()> {
        if !self.speed.is_finite() || self.speed < MIN_SPEED {
            return Err(WireReplayError::Configuration(format!(
                "speed must be a number no smaller than {}, got {}",
                MIN_SPEED, self.speed
            )));
        }
        if self.repeat < 1 {
            return Err(WireReplayError::Configuration(format!(
                "repeat must be at least 1, got {}",
                self.repeat
            )));
        }
        if self.queue_granularity < 1 {
            return Err(WireReplayError::Configuration(
                "queue granularity must be at least 1".to_string(),
            ));
        }
        if self.connection_buffer < 1 {
            return Err(WireReplayError::Configuration(
                "connection buffer must be at least 1".to_string(),
            ));
        }
        if self.target.trim().is_empty() {
            return Err(WireReplayError::Configuration(
                "target URL must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Traffic splitting configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Number of output shards
    pub split: usize,

    /// Shard file prefix, required when splitting
    pub output_prefix: Option<String>,

    /// Single output file, required when not splitting
    pub output_file: Option<PathBuf>,

    /// Drop handshake and heartbeat traffic
    pub remove_driver_ops: bool,

    /// Input is gzip-compressed
    pub gzip: bool,

    /// Compress the outputs
    pub gzip_output: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            split: 1,
            output_prefix: None,
            output_file: None,
            remove_driver_ops: false,
            gzip: false,
            gzip_output: false,
        }
    }
}

impl FilterConfig {
    /// Check the split / output combination
    pub fn validate(&self) -> Result<()> {
        if self.split < 1 {
            return Err(WireReplayError::Configuration(format!(
                "split must be at least 1, got {}",
                self.split
            )));
        }
        if self.split > 1 {
            if self.output_prefix.as_deref().is_none_or(str::is_empty) {
                return Err(WireReplayError::Configuration(
                    "an output prefix is required when split is greater than 1".to_string(),
                ));
            }
            if self.output_file.is_some() {
                return Err(WireReplayError::Configuration(
                    "an output file cannot be used when split is greater than 1".to_string(),
                ));
            }
        } else if self.output_file.is_none() {
            return Err(WireReplayError::Configuration(
                "an output file is required when split is 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP ingestion configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,

    /// Capacity of the queue between the endpoint and the scheduler
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9090".to_string(),
            queue_capacity: 10000,
        }
    }
}

/// Stats sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StatsConfig {
    /// Output format
    pub format: StatFormat,

    /// Output file; stdout when unset
    pub output: Option<PathBuf>,
}

impl WireReplayConfig {
    /// Load defaults, `wirereplay.toml`, an optional explicit file, then the
    /// environment
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a source is malformed or a value is
    /// out of range.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(WireReplayConfig::default()))
            .merge(Toml::file(DEFAULT_CONFIG_FILE));
        if let Some(path) = path {
            if !path.exists() {
                return Err(WireReplayError::Configuration(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: WireReplayConfig = figment.extract().map_err(|e| {
            WireReplayError::Configuration(format!("Failed to load configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults overlaid with one file only
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: WireReplayConfig =
            Figment::from(Serialized::defaults(WireReplayConfig::default()))
                .merge(Toml::file(path))
                .extract()
                .map_err(|e| {
                    WireReplayError::Configuration(format!(
                        "Failed to load configuration file: {}",
                        e
                    ))
                })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate everything every command relies on
    ///
    /// The split/output combination is checked by [`FilterConfig::validate`]
    /// when a filter actually runs.
    pub fn validate(&self) -> Result<()> {
        self.play.validate()?;
        if self.server.queue_capacity < 1 {
            return Err(WireReplayError::Configuration(
                "server queue capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WireReplayConfig::default();
        assert_eq!(config.play.speed, 1.0);
        assert_eq!(config.play.repeat, 1);
        assert_eq!(config.play.queue_time, Duration::from_secs(15));
        assert_eq!(config.play.queue_granularity, 1000);
        assert_eq!(config.play.connection_buffer, 10000);
        assert_eq!(config.play.target, "mongodb://localhost:27017");
        assert_eq!(config.server.listen, "0.0.0.0:9090");
        assert_eq!(config.stats.format, StatFormat::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.toml");
        std::fs::write(
            &path,
            r#"
[play]
speed = 2.5
repeat = 3
queue_time = "30s"
target = "mongodb://replay-target:27018"

[stats]
format = "json"
"#,
        )
        .unwrap();

        let config = WireReplayConfig::from_file(&path).unwrap();
        assert_eq!(config.play.speed, 2.5);
        assert_eq!(config.play.repeat, 3);
        assert_eq!(config.play.queue_time, Duration::from_secs(30));
        assert_eq!(config.play.queue_granularity, 1000);
        assert_eq!(config.stats.format, StatFormat::Json);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[play]\nspeed = 0.0\n").unwrap();
        let err = WireReplayConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, WireReplayError::Configuration(_)));

        let mut play = PlayConfig::default();
        play.repeat = 0;
        assert!(play.validate().is_err());
        play.repeat = 1;
        play.speed = f64::NAN;
        assert!(play.validate().is_err());
        play.speed = 1e-300;
        assert!(play.validate().is_err());
        play.speed = MIN_SPEED;
        assert!(play.validate().is_ok());
        play.speed = 1.0;
        play.queue_granularity = 0;
        assert!(play.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("wirereplay.toml", "[play]\nspeed = 4.0\n")?;
            jail.set_env("WIREREPLAY_PLAY__REPEAT", "5");
            jail.set_env("WIREREPLAY_PLAY__QUEUE_TIME", "2s");

            let config = WireReplayConfig::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.play.speed, 4.0);
            assert_eq!(config.play.repeat, 5);
            assert_eq!(config.play.queue_time, Duration::from_secs(2));
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = WireReplayConfig::load(Some(Path::new("/nonexistent/replay.toml"))).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_filter_split_rules() {
        let mut filter = FilterConfig::default();
        assert!(filter.validate().is_err(), "split 1 needs an output file");

        filter.output_file = Some(PathBuf::from("out.playback"));
        assert!(filter.validate().is_ok());

        filter.split = 3;
        assert!(filter.validate().is_err(), "split > 1 forbids an output file");

        filter.output_file = None;
        assert!(filter.validate().is_err(), "split > 1 needs a prefix");

        filter.output_prefix = Some("shard".to_string());
        assert!(filter.validate().is_ok());

        filter.split = 0;
        assert!(filter.validate().is_err());
    }
}
