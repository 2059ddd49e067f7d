use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

pub const HOT_LOG_ENV: &str = "QA40X_HOT_LOG";
pub const CONFIG_FILE_NAME: &str = "qa40x.toml";

pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        })
        .unwrap_or(false)
}

/// Cheap predicate guarding per-iteration log statements in the streaming
/// loop; the flag is read once per process.
pub fn hot_log_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| env_flag(HOT_LOG_ENV))
}

/// Session configuration, read once at session construction. Unknown keys
/// are ignored so configuration files can be shared across driver versions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub buffer_size_samples: Option<i64>,
    pub force_read: bool,
    pub attenuator: bool,
    #[serde(rename = "fullScaleInputLevelDBV")]
    pub full_scale_input_level_dbv: Option<f64>,
    #[serde(rename = "fullScaleOutputLevelDBV")]
    pub full_scale_output_level_dbv: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size_samples: None,
            force_read: false,
            attenuator: true,
            full_scale_input_level_dbv: None,
            full_scale_output_level_dbv: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = default_path()
            .ok_or_else(|| Error::InvalidParameter("cannot determine user directory".into()))?;
        Self::load_from(&path)
    }

    /// A missing file is not an error; every option has a default.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                debug!("no configuration file at {}: {}", path.display(), err);
                return Ok(Self::default());
            }
        };
        let config: Config = toml::from_str(&text)
            .map_err(|err| Error::InvalidParameter(format!("configuration file: {err}")))?;
        config.validate()?;
        debug!("loaded configuration: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(frames) = self.buffer_size_samples {
            if frames <= 0 {
                return Err(Error::InvalidParameter(
                    "bufferSizeSamples must be strictly positive".into(),
                ));
            }
            if frames > i64::from(i32::MAX) {
                return Err(Error::InvalidParameter("bufferSizeSamples is too large".into()));
            }
        }
        Ok(())
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}
