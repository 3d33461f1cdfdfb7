use config::{Config, Environment, File};
use config::ConfigError as SourceConfigError;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{collections::HashMap, env, fs};
use std::path::Path;
use thiserror::Error;

use crate::thresholds::ThresholdError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    DELETE,
    // Add more as needed
}

impl Default for HttpMethod {
    fn default() -> Self {
        HttpMethod::POST
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no valid configuration file found in directory '{0}'")]
    NoConfigFile(String),
    #[error("invalid target url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("cannot read body file '{path}': {source}")]
    BodyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error(transparent)]
    Source(#[from] SourceConfigError),
}

/// The endpoint a run drives load against, plus the per-request check.
#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: Option<String>, // Direct inline body
    pub body_file: Option<String>, // Path to a file containing the request body
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub target: TargetConfig,
    /// Arrival rate in requests per second.
    pub rate: u32,
    /// Run duration in whole seconds.
    pub duration_secs: u64,
    #[serde(default = "default_pre_allocated_workers")]
    pub pre_allocated_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metric name -> comparison expressions, e.g. `p95_duration: ["< 1000ms"]`.
    #[serde(default)]
    pub thresholds: HashMap<String, Vec<String>>,
}

fn default_expected_status() -> u16 {
    200
}

fn default_pre_allocated_workers() -> usize {
    10
}

fn default_max_workers() -> usize {
    60
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    // Initialize logging based on the configuration
    pub fn init_logging(&self) {
        std::env::set_var("RUST_LOG", &self.log_level);
        env_logger::init();
    }
}

/// Everything a run needs, resolved and immutable: the body file is already
/// read into bytes and the URL already parsed.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub url: Url,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub rate: u32,
    pub duration: Duration,
    pub pre_allocated_workers: usize,
    pub max_workers: usize,
    pub expected_status: u16,
    pub request_timeout: Duration,
}

impl RunConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let target = &settings.target;
        let url = Url::parse(&target.url).map_err(|e| ConfigError::InvalidUrl {
            url: target.url.clone(),
            reason: e.to_string(),
        })?;

        // body_file takes precedence over an inline body; bytes are opaque here,
        // the payload is presumed to be whatever the endpoint expects.
        let body = if let Some(body_file_path) = &target.body_file {
            fs::read(body_file_path).map_err(|e| ConfigError::BodyFile {
                path: body_file_path.clone(),
                source: e,
            })?
        } else {
            target.body.clone().map(String::into_bytes).unwrap_or_default()
        };

        Ok(RunConfig {
            url,
            method: target.method.clone(),
            headers: target.headers.clone(),
            body,
            rate: settings.rate,
            duration: Duration::from_secs(settings.duration_secs),
            pre_allocated_workers: settings.pre_allocated_workers,
            max_workers: settings.max_workers,
            expected_status: target.expected_status,
            request_timeout: Duration::from_secs(settings.http_timeout_seconds),
        })
    }

    /// Total number of scheduled issue times: exactly rate x duration.
    pub fn total_ticks(&self) -> u64 {
        self.rate as u64 * self.duration.as_secs()
    }

    /// Spacing between consecutive target issue times.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.rate
    }
}

pub async fn load_config(explicit_path: Option<&str>) -> Result<Settings, ConfigError> {
    let mut config_builder = Config::builder();

    if let Some(path) = explicit_path {
        log::info!("Loading configuration from file: {}", path);
        config_builder = config_builder.add_source(File::with_name(path));
    } else {
        // Try to get the configuration directory from an environment variable; use a default if not found
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| "./config".to_string());
        log::info!("Loading configuration from directory: {}", config_dir);

        let config_paths = ["config.yaml", "config.yml", "config.toml"]
            .iter()
            .map(|file| format!("{}/{}", config_dir, file))
            .collect::<Vec<String>>();

        let mut found = false;
        for path_str in &config_paths {
            let path = Path::new(path_str);
            // Check if the file exists and is not empty before adding it as a source
            if let Ok(metadata) = fs::metadata(path) {
                if metadata.len() > 0 {
                    config_builder = config_builder.add_source(File::with_name(path_str).required(false));
                    log::info!("Found configuration file: {}", path.display());
                    found = true;
                    break; // Stop searching after the first valid config file is found
                }
            }
        }

        if !found {
            log::error!("No configuration file found or all are empty in directory: {}", config_dir);
            return Err(ConfigError::NoConfigFile(config_dir));
        }
    }

    // Add environment variables as the highest precedence source
    config_builder = config_builder.add_source(Environment::with_prefix("LOADPACER").separator("__"));

    let config = config_builder.build()?;

    let settings = config.try_deserialize::<Settings>()?;

    // Validate the settings
    validate_settings(&settings)?;

    log::info!("Configuration loaded and validated successfully. Current settings: {:?}", settings);

    Ok(settings)
}

pub fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if settings.target.url.is_empty() {
        return Err(ConfigError::Invalid("target url is missing".to_string()));
    }
    if let Err(e) = Url::parse(&settings.target.url) {
        return Err(ConfigError::InvalidUrl {
            url: settings.target.url.clone(),
            reason: e.to_string(),
        });
    }
    if settings.rate == 0 {
        return Err(ConfigError::Invalid(
            "arrival rate must be at least 1 request per second".to_string(),
        ));
    }
    if settings.duration_secs == 0 {
        return Err(ConfigError::Invalid(
            "run duration must be at least 1 second".to_string(),
        ));
    }
    if settings.pre_allocated_workers == 0 || settings.max_workers == 0 {
        return Err(ConfigError::Invalid(
            "worker counts must be at least 1".to_string(),
        ));
    }
    if settings.pre_allocated_workers > settings.max_workers {
        return Err(ConfigError::Invalid(format!(
            "pre_allocated_workers ({}) exceeds max_workers ({})",
            settings.pre_allocated_workers, settings.max_workers
        )));
    }
    if settings.http_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "http timeout must be at least 1 second".to_string(),
        ));
    }

    Ok(())
}
