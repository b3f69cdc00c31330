use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::Location;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub ssid: String,
    pub password: String,
    pub station_id: String,
    pub github_user: String,
    pub repo_name: String,
    pub file_path: String,
    pub github_token: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_ntp_server")]
    pub ntp_server: String,
    #[serde(default = "default_ntp_retries")]
    pub ntp_retries: u32,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_connect_retries")]
    pub max_connect_retries: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Scripted stimuli for running the node against the simulated board.
#[derive(Debug, Deserialize, Clone)]
pub struct SimulationConfig {
    /// Request a self-test every this many seconds.
    pub self_test_every_secs: Option<u64>,
    /// Raise the detect line once, roughly this many seconds after boot.
    pub event_after_secs: Option<u64>,
    /// Whether the simulated detector answers stimulus pulses.
    #[serde(default = "default_true")]
    pub detector_healthy: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            self_test_every_secs: None,
            event_after_secs: None,
            detector_healthy: true,
        }
    }
}

/// Fixed delays of the control loop.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub loop_sleep: Duration,
    pub loop_error_delay: Duration,
    pub fault_blink: Duration,
    pub connect_blink: Duration,
    pub connect_retry_delay: Duration,
    pub self_test_window: Duration,
    pub self_test_hold: Duration,
    pub self_test_poll: Duration,
    pub ntp_timeout: Duration,
    pub ntp_backoff: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            loop_sleep: Duration::from_millis(100),
            loop_error_delay: Duration::from_secs(5),
            fault_blink: Duration::from_secs(1),
            connect_blink: Duration::from_millis(500),
            connect_retry_delay: Duration::from_secs(5),
            self_test_window: Duration::from_secs(1),
            self_test_hold: Duration::from_secs(2),
            self_test_poll: Duration::from_millis(10),
            ntp_timeout: Duration::from_secs(5),
            ntp_backoff: Duration::from_secs(2),
        }
    }
}

impl Config {
    /// Prefers `device_config.json` under `CONFIG_DIR`, falling back to the environment.
    pub fn load() -> Result<Self> {
        let path = Self::get_config_file_path();
        if path.exists() {
            log::info!("Loading configuration from {}", path.display());
            Self::load_from_file()
        } else {
            Self::from_env()
        }
    }

    pub fn from_env() -> Result<Self> {
        let ssid = required_env("WIFI_SSID")?;
        let password = required_env("WIFI_PASSWORD")?;
        let station_id = required_env("STATION_ID")?;
        let github_user = required_env("GITHUB_USER")?;
        let repo_name = required_env("GITHUB_REPO")?;
        let file_path = required_env("GITHUB_FILE_PATH")?;
        let github_token = required_env("GITHUB_TOKEN")?;
        let branch = env::var("GITHUB_BRANCH").unwrap_or_else(|_| default_branch());
        let api_url = env::var("GITHUB_API_URL").unwrap_or_else(|_| default_api_url());

        let latitude = required_env("STATION_LAT")?
            .parse()
            .context("STATION_LAT is not a number")?;
        let longitude = required_env("STATION_LONG")?
            .parse()
            .context("STATION_LONG is not a number")?;

        let ntp_server = env::var("NTP_SERVER").unwrap_or_else(|_| default_ntp_server());
        let ntp_retries = get_env_var_u64("NTP_RETRIES", default_ntp_retries() as u64) as u32;
        let heartbeat_interval_secs =
            get_env_var_u64("HEARTBEAT_INTERVAL_SECS", default_heartbeat_interval_secs());
        let max_connect_retries =
            get_env_var_u64("MAX_CONNECT_RETRIES", default_max_connect_retries() as u64) as u32;
        let connect_timeout_secs =
            get_env_var_u64("CONNECT_TIMEOUT_SECS", default_connect_timeout_secs());

        let simulation = SimulationConfig {
            self_test_every_secs: optional_env_u64("SIM_SELF_TEST_EVERY_SECS"),
            event_after_secs: optional_env_u64("SIM_EVENT_AFTER_SECS"),
            detector_healthy: env::var("SIM_DETECTOR_HEALTHY").map(|v| v != "0").unwrap_or(true),
        };

        Ok(Config {
            ssid,
            password,
            station_id,
            github_user,
            repo_name,
            file_path,
            github_token,
            branch,
            api_url,
            latitude,
            longitude,
            ntp_server,
            ntp_retries,
            heartbeat_interval_secs,
            max_connect_retries,
            connect_timeout_secs,
            simulation,
        })
    }

    fn get_config_file_path() -> PathBuf {
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(config_dir).join("device_config.json")
    }

    pub fn load_from_file() -> Result<Self> {
        Self::read_file(&Self::get_config_file_path())
    }

    fn read_file(path: &std::path::Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn location(&self) -> Location {
        Location {
            lat: self.latitude,
            long: self.longitude,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Repository contents URL of the station document.
    pub fn document_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_url.trim_end_matches('/'),
            self.github_user,
            self.repo_name,
            self.file_path
        )
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests(api_url: &str) -> Self {
        Config {
            ssid: "lab".to_string(),
            password: "secret".to_string(),
            station_id: "ST-01".to_string(),
            github_user: "octo".to_string(),
            repo_name: "stations".to_string(),
            file_path: "data/st-01.json".to_string(),
            github_token: "ghp_test".to_string(),
            branch: default_branch(),
            api_url: api_url.to_string(),
            latitude: 51.5,
            longitude: -0.12,
            ntp_server: "127.0.0.1:123".to_string(),
            ntp_retries: 1,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_connect_retries: default_max_connect_retries(),
            connect_timeout_secs: default_connect_timeout_secs(),
            simulation: SimulationConfig::default(),
        }
    }
}

fn required_env(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("missing required setting {key}"))
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

fn optional_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_ntp_server() -> String {
    "pool.ntp.org:123".to_string()
}

fn default_ntp_retries() -> u32 {
    3
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_max_connect_retries() -> u32 {
    3
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}
