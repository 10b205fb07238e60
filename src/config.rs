//! Process configuration
//!
//! Everything is read once from the environment at startup. The coordinator
//! may later override the device address and push interval, which the
//! orchestrator applies to its own copies of [`DeviceEndpoint`] and
//! [`PushSettings`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_SERVER_URL: &str = "http://localhost:3000";
const DEFAULT_KINDLE_IP: &str = "192.168.15.244";
const DEFAULT_KINDLE_USER: &str = "root";
const DEFAULT_LOCAL_IMAGE: &str = "kindle-display.png";
const DEFAULT_REMOTE_IMAGE: &str = "/mnt/us/dashboard.png";

/// Default push period (15 seconds)
pub const DEFAULT_PUSH_INTERVAL_MS: u64 = 15_000;
/// Full refresh every 6 hours to prevent ghosting
const DEFAULT_FULL_REFRESH_SECS: u64 = 6 * 60 * 60;

/// Where sessions connect and how they authenticate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    pub address: String,
    pub port: u16,
    pub username: String,
    /// Private key used for public-key authentication
    pub key_path: PathBuf,
}

/// What gets pushed, where, and how often
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSettings {
    pub local_image_path: PathBuf,
    pub remote_path: String,
    pub push_interval: Duration,
    /// Period between clear-then-draw refreshes, pushed even when unchanged
    pub full_refresh_interval: Duration,
}

impl PushSettings {
    /// Directory holding the remote image, listed by the startup self-test
    pub fn remote_dir(&self) -> &str {
        match self.remote_path.rfind('/') {
            Some(0) => "/",
            Some(idx) => &self.remote_path[..idx],
            None => ".",
        }
    }
}

/// SSH handshake, command and keep-alive tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    pub handshake_timeout: Duration,
    /// Longest a single remote command may run before it is abandoned
    pub command_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Missed keep-alive replies before the session is declared dead
    pub keepalive_max: usize,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(5),
            keepalive_max: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub coordinator_url: String,
    pub endpoint: DeviceEndpoint,
    pub push: PushSettings,
    pub ssh: SshSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let key_path = match get("KINDLE_KEY_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_key_path(),
        };

        let endpoint = DeviceEndpoint {
            address: get("KINDLE_IP").unwrap_or_else(|| DEFAULT_KINDLE_IP.to_string()),
            port: parse_or(&get, "KINDLE_PORT", 22)?,
            username: get("KINDLE_USER").unwrap_or_else(|| DEFAULT_KINDLE_USER.to_string()),
            key_path,
        };

        let push_interval_ms = parse_or(&get, "PUSH_INTERVAL_MS", DEFAULT_PUSH_INTERVAL_MS)?;
        if push_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("PUSH_INTERVAL_MS"));
        }
        let full_refresh_secs =
            parse_or(&get, "FULL_REFRESH_INTERVAL_SECS", DEFAULT_FULL_REFRESH_SECS)?;

        let push = PushSettings {
            local_image_path: PathBuf::from(
                get("LOCAL_IMAGE_PATH").unwrap_or_else(|| DEFAULT_LOCAL_IMAGE.to_string()),
            ),
            remote_path: get("REMOTE_IMAGE_PATH")
                .unwrap_or_else(|| DEFAULT_REMOTE_IMAGE.to_string()),
            push_interval: Duration::from_millis(push_interval_ms),
            full_refresh_interval: Duration::from_secs(full_refresh_secs),
        };

        let defaults = SshSettings::default();
        let handshake_ms = parse_or(
            &get,
            "SSH_HANDSHAKE_TIMEOUT_MS",
            defaults.handshake_timeout.as_millis() as u64,
        )?;
        if handshake_ms == 0 {
            return Err(ConfigError::ZeroInterval("SSH_HANDSHAKE_TIMEOUT_MS"));
        }
        let command_ms = parse_or(
            &get,
            "SSH_COMMAND_TIMEOUT_MS",
            defaults.command_timeout.as_millis() as u64,
        )?;
        if command_ms == 0 {
            return Err(ConfigError::ZeroInterval("SSH_COMMAND_TIMEOUT_MS"));
        }
        let ssh = SshSettings {
            handshake_timeout: Duration::from_millis(handshake_ms),
            command_timeout: Duration::from_millis(command_ms),
            keepalive_interval: Duration::from_millis(parse_or(
                &get,
                "SSH_KEEPALIVE_INTERVAL_MS",
                defaults.keepalive_interval.as_millis() as u64,
            )?),
            keepalive_max: parse_or(&get, "SSH_KEEPALIVE_MAX", defaults.keepalive_max)?,
        };

        let coordinator_url = get("SERVER_URL")
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            coordinator_url,
            endpoint,
            push,
            ssh,
        })
    }
}

fn parse_or<T, F>(get: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("id_rsa")
}
