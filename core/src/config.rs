/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_TRANSPORT_ADDR: &str = "127.0.0.1:8081";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST API (no trailing slash)
    pub api_url: String,

    /// Address of the messaging transport (host:port)
    pub transport_addr: String,

    /// Directory holding the durable credential store
    pub data_dir: PathBuf,

    /// Username to log in with when no stored credential is valid
    pub username: Option<String>,

    /// Password to log in with
    pub password: Option<String>,

    /// Run against the in-memory backend instead of the remote one
    pub offline: bool,

    /// Number of characters of a text message shown in a notification
    pub notification_preview_chars: usize,

    /// How long a notification stays visible
    pub notification_duration: Duration,

    /// Largest transport frame accepted, in bytes
    pub max_frame_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            transport_addr: DEFAULT_TRANSPORT_ADDR.to_string(),
            data_dir: PathBuf::from(".chatlink"),
            username: None,
            password: None,
            offline: false,
            notification_preview_chars: 100,
            notification_duration: Duration::from_secs(5),
            max_frame_len: 1024 * 1024,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Config::default();
        let mut positional = 0;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    let path = flag_value(args, i, "--data-dir")?;
                    config.data_dir = PathBuf::from(path);
                    i += 2;
                }
                "--user" => {
                    config.username = Some(flag_value(args, i, "--user")?.to_string());
                    i += 2;
                }
                "--password" => {
                    config.password = Some(flag_value(args, i, "--password")?.to_string());
                    i += 2;
                }
                "--offline" => {
                    config.offline = true;
                    i += 1;
                }
                "--help" | "-h" => {
                    return Err(ChatError::Config(usage(args)));
                }
                other if other.starts_with("--") => {
                    return Err(ChatError::Config(format!(
                        "Unknown flag {}\n{}",
                        other,
                        usage(args)
                    )));
                }
                other => {
                    match positional {
                        0 => config.api_url = other.trim_end_matches('/').to_string(),
                        1 => config.transport_addr = other.to_string(),
                        _ => {
                            return Err(ChatError::Config(format!(
                                "Unexpected argument {}\n{}",
                                other,
                                usage(args)
                            )))
                        }
                    }
                    positional += 1;
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("CHATLINK_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(addr) = std::env::var("CHATLINK_TRANSPORT_ADDR") {
            config.transport_addr = addr;
        }
        if let Ok(dir) = std::env::var("CHATLINK_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(user) = std::env::var("CHATLINK_USER") {
            config.username = Some(user);
        }
        if let Ok(password) = std::env::var("CHATLINK_PASSWORD") {
            config.password = Some(password);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the values that would otherwise fail late at first use
    pub fn validate(&self) -> Result<()> {
        if !self.api_url.starts_with("http://") {
            return Err(ChatError::Config(format!(
                "API URL must start with http:// (got {})",
                self.api_url
            )));
        }
        if !self.transport_addr.contains(':') {
            return Err(ChatError::Config(format!(
                "Transport address must be host:port (got {})",
                self.transport_addr
            )));
        }
        if self.notification_preview_chars == 0 {
            return Err(ChatError::Config(
                "Notification preview length must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| ChatError::Config(format!("{} requires an argument", flag)))
}

fn usage(args: &[String]) -> String {
    format!(
        "Usage: {} [api_url] [transport_addr] [--data-dir <path>] [--user <name>] [--password <pw>] [--offline]",
        args.first().map(|s| s.as_str()).unwrap_or("chatlink")
    )
}
