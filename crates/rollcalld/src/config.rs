use rollcall_core::frame::LowLight;
use rollcall_core::session::SessionConfig;
use rollcall_core::PoseConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{key} must be between {min} and {max}, got {value}")]
    OutOfRange {
        key: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Longest scanning deadline a session may be configured with.
pub const MAX_SESSION_DEADLINE_SECS: u64 = 24 * 60 * 60;

/// Daemon configuration: defaults, then an optional TOML file named by
/// `ROLLCALL_CONFIG`, then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Extractor program, run once per image.
    pub extractor_command: String,
    pub extractor_args: Vec<String>,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity at or above which a probe matches.
    ///
    /// 0.20 suits the low-resolution extractor this was first tuned for.
    /// Run `rollcall calibrate` against your own extractor before relying on it.
    pub similarity_threshold: f32,
    /// Scanning deadline for attendance sessions.
    pub session_deadline_secs: u64,
    /// Timeout for each extractor call.
    pub extractor_timeout_ms: u64,
    /// Consecutive failed frames before a session reports the backend degraded.
    pub failure_threshold: u32,
    /// Samples kept per pose; an enrollment collects three times this many.
    pub shots_per_pose: usize,
    /// Mean brightness (0–255) below which frames get gamma correction.
    pub brightness_threshold: f32,
    pub gamma: f32,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
    pub pose: PoseConfig,
}

impl Default for Config {
    fn default() -> Self {
        let low_light = LowLight::default();
        Self {
            extractor_command: String::new(),
            extractor_args: Vec::new(),
            db_path: default_data_dir().join("faces.db"),
            similarity_threshold: 0.20,
            session_deadline_secs: 45,
            extractor_timeout_ms: 5000,
            failure_threshold: 3,
            shots_per_pose: 2,
            brightness_threshold: low_light.brightness_threshold,
            gamma: low_light.gamma,
            system_bus: false,
            pose: PoseConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Reject values a session or the extractor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("session_deadline_secs", self.session_deadline_secs, 1, MAX_SESSION_DEADLINE_SECS),
            ("extractor_timeout_ms", self.extractor_timeout_ms, 1, 10 * 60 * 1000),
            ("failure_threshold", self.failure_threshold as u64, 1, u32::MAX as u64),
            ("shots_per_pose", self.shots_per_pose as u64, 1, 64),
        ];
        for (key, value, min, max) in checks {
            if !(min..=max).contains(&value) {
                return Err(ConfigError::OutOfRange { key, value, min, max });
            }
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    fn apply_env(&mut self) {
        if let Ok(cmd) = std::env::var("ROLLCALL_EXTRACTOR") {
            let mut parts = cmd.split_whitespace().map(str::to_string);
            self.extractor_command = parts.next().unwrap_or_default();
            self.extractor_args = parts.collect();
        }
        if let Ok(path) = std::env::var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        self.similarity_threshold =
            env_or("ROLLCALL_SIMILARITY_THRESHOLD", self.similarity_threshold);
        self.session_deadline_secs =
            env_or("ROLLCALL_SESSION_DEADLINE_SECS", self.session_deadline_secs);
        self.extractor_timeout_ms =
            env_or("ROLLCALL_EXTRACTOR_TIMEOUT_MS", self.extractor_timeout_ms);
        self.failure_threshold = env_or("ROLLCALL_FAILURE_THRESHOLD", self.failure_threshold);
        self.shots_per_pose = env_or("ROLLCALL_SHOTS_PER_POSE", self.shots_per_pose);
        self.brightness_threshold =
            env_or("ROLLCALL_BRIGHTNESS_THRESHOLD", self.brightness_threshold);
        self.gamma = env_or("ROLLCALL_GAMMA", self.gamma);
        self.pose.jitter_threshold =
            env_or("ROLLCALL_JITTER_THRESHOLD", self.pose.jitter_threshold);
        if let Ok(v) = std::env::var("ROLLCALL_SYSTEM_BUS") {
            self.system_bus = v != "0";
        }
    }

    pub fn session_config(&self, deadline_secs: Option<u64>) -> SessionConfig {
        SessionConfig {
            threshold: self.similarity_threshold,
            deadline: Duration::from_secs(deadline_secs.unwrap_or(self.session_deadline_secs)),
            failure_threshold: self.failure_threshold,
        }
    }

    pub fn low_light(&self) -> LowLight {
        LowLight {
            brightness_threshold: self.brightness_threshold,
            gamma: self.gamma,
        }
    }

    pub fn extractor_timeout(&self) -> Duration {
        Duration::from_millis(self.extractor_timeout_ms)
    }
}

/// Parsed value of `key`, or `default` when unset or unparseable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert!((c.similarity_threshold - 0.20).abs() < 1e-6);
        assert_eq!(c.session_config(None).deadline, Duration::from_secs(45));
        assert_eq!(c.session_config(Some(10)).deadline, Duration::from_secs(10));
        assert_eq!(c.pose.stability_window, 5);
        assert!(c.db_path.ends_with("rollcall/faces.db"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c: Config = toml::from_str(
            r#"
            extractor_command = "/usr/lib/rollcall/extract"
            similarity_threshold = 0.55

            [pose]
            yaw_left = 0.65
            "#,
        )
        .unwrap();
        assert_eq!(c.extractor_command, "/usr/lib/rollcall/extract");
        assert!((c.similarity_threshold - 0.55).abs() < 1e-6);
        assert!((c.pose.yaw_left - 0.65).abs() < 1e-6);
        assert!((c.pose.yaw_right - 0.4).abs() < 1e-6);
        assert_eq!(c.shots_per_pose, 2);
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        assert!(Config::default().validate().is_ok());

        let c = Config {
            session_deadline_secs: u64::MAX,
            ..Config::default()
        };
        assert!(matches!(
            c.validate(),
            Err(ConfigError::OutOfRange { key: "session_deadline_secs", .. })
        ));

        let c = Config {
            failure_threshold: 0,
            ..Config::default()
        };
        assert!(c.validate().is_err());
    }
}
