use std::{
    env, fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use log::{LevelFilter, error};
use serde::{Deserialize, Deserializer, de};

use crate::{
    constants::{
        EID_DEFAULT_DRIVER, EID_DEFAULT_LOG_FILE, EID_DEFAULT_PINPAD_TICK, EID_DEFAULT_PINPAD_TIMEOUT, EID_ENV_DRIVER,
        EID_ENV_LOG_LEVEL,
    },
    token::auth::PinpadTiming,
};

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn driver_path() -> PathBuf {
        match env::var(EID_ENV_DRIVER) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(EID_DEFAULT_DRIVER),
        }
    }

    fn log_level() -> LevelFilter {
        match env::var(EID_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!("Unrecognized value for log level in env var {}, using info", EID_ENV_LOG_LEVEL);
                    LevelFilter::Info
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn log_file() -> PathBuf {
        PathBuf::from(EID_DEFAULT_LOG_FILE)
    }

    fn pinpad_timeout() -> u64 {
        EID_DEFAULT_PINPAD_TIMEOUT
    }

    fn pinpad_tick() -> u64 {
        EID_DEFAULT_PINPAD_TICK
    }
}

//------------ Config --------------------------------------------------------

/// Settings of the token client, usually read from a TOML file.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::driver_path")]
    pub driver_path: PathBuf,

    #[serde(default = "ConfigDefaults::log_level", deserialize_with = "de_level_filter")]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    /// Seconds.
    #[serde(default = "ConfigDefaults::pinpad_timeout")]
    pub pinpad_timeout: u64,

    /// Milliseconds.
    #[serde(default = "ConfigDefaults::pinpad_tick")]
    pub pinpad_tick: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            driver_path: ConfigDefaults::driver_path(),
            log_level: ConfigDefaults::log_level(),
            log_type: ConfigDefaults::log_type(),
            log_file: ConfigDefaults::log_file(),
            pinpad_timeout: ConfigDefaults::pinpad_timeout(),
            pinpad_tick: ConfigDefaults::pinpad_tick(),
        }
    }
}

impl Config {
    pub fn read_config(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.verify()?;
        Ok(config)
    }

    fn verify(&self) -> Result<(), ConfigError> {
        if self.pinpad_tick == 0 {
            return Err(ConfigError::other("pinpad_tick must be greater than zero"));
        }
        Ok(())
    }

    pub fn pinpad_timing(&self) -> PinpadTiming {
        PinpadTiming {
            timeout: Duration::from_secs(self.pinpad_timeout),
            tick: Duration::from_millis(self.pinpad_tick),
        }
    }

    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
        }
    }

    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        self.file_dispatch(path)?
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {}", e)))
    }

    fn file_dispatch(&self, path: &Path) -> Result<fern::Dispatch, ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!("Failed to open log file '{}': {}", path.display(), err);
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        Ok(self.fern_logger().chain(file))
    }

    fn fern_logger(&self) -> fern::Dispatch {
        let show_target = self.log_level == LevelFilter::Trace || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            // suppress overly noisy runtime logging
            .level_for("tokio", self.log_level.min(LevelFilter::Warn))
    }
}

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\" or \"file\", found : \"{}\"",
                string
            ))),
        }
    }
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

//------------ Tests ---------------------------------------------------------
