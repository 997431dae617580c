use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

const CONFIG_FILE: &str = "sdamgia";
const ENV_PREFIX: &str = "SDAM";

/// Runtime settings. Sources, lowest priority first: built-in defaults,
/// optional `sdamgia.toml`, `SDAM_*` environment variables. CLI flags are
/// applied on top by `main`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: PathBuf,
    pub images_dir: PathBuf,
    /// Prefix prepended to a storage key to form the inline image reference.
    pub image_url_base: String,
    pub exam_type: String,
    pub concurrency: usize,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub image_deadline_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            db_path: PathBuf::from("data/tasks.sqlite"),
            images_dir: PathBuf::from("data/images"),
            image_url_base: "http://localhost:3001/tasks/images/".to_string(),
            exam_type: "ege".to_string(),
            concurrency: 4,
            max_retries: 3,
            base_backoff_ms: 500,
            request_timeout_secs: 10,
            image_deadline_secs: 30,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Message("concurrency must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 || self.image_deadline_secs == 0 {
            return Err(ConfigError::Message("timeouts must be non-zero".into()));
        }
        if !matches!(self.exam_type.as_str(), "ege" | "oge") {
            return Err(ConfigError::Message(format!(
                "unknown exam type '{}' (expected ege or oge)",
                self.exam_type
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn image_deadline(&self) -> Duration {
        Duration::from_secs(self.image_deadline_secs)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }
}
