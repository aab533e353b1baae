use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::mitm::ca_key_manager::FileBackend;
use crate::whitelist::Whitelist;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(anyhow::anyhow!(
                "Unknown LOG_FORMAT '{}' (expected text or json)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Server configuration
    pub host: String,
    pub port: u16,

    // Policy
    pub whitelist: Whitelist,

    // Root CA; generated at startup when no paths are given
    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,
    pub ca_export_path: Option<PathBuf>,

    // Leaf certificate cache
    pub cert_cache_size: usize,
    pub cert_ttl: Duration,

    // Timeouts
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub idle_timeout: Duration,

    pub log_format: LogFormat,
}

impl Config {
    /// Defaults for everything except the whitelist
    pub fn new(whitelist: Whitelist) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            whitelist,
            ca_cert_path: None,
            ca_key_path: None,
            ca_export_path: None,
            cert_cache_size: 1000,
            cert_ttl: Duration::from_secs(86400),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            log_format: LogFormat::Text,
        }
    }

    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let whitelist_source = env::var("PROXY_WHITELIST")
            .context("PROXY_WHITELIST environment variable is required (comma-separated patterns)")?;
        let whitelist = Whitelist::from_csv(&whitelist_source);

        let mut config = Self::new(whitelist);

        if let Ok(host) = env::var("PROXY_HOST") {
            config.host = host;
        }
        config.port = parse_var("PROXY_PORT", config.port)?;

        config.ca_cert_path = env::var("CA_CERT_PATH").ok().map(PathBuf::from);
        config.ca_key_path = env::var("CA_KEY_PATH").ok().map(PathBuf::from);
        config.ca_export_path = env::var("CA_EXPORT_PATH").ok().map(PathBuf::from);

        if config.ca_cert_path.is_some() != config.ca_key_path.is_some() {
            return Err(anyhow::anyhow!(
                "CA_CERT_PATH and CA_KEY_PATH must be set together"
            ));
        }

        config.cert_cache_size = parse_var("CERT_CACHE_SIZE", config.cert_cache_size)?;
        if config.cert_cache_size == 0 {
            return Err(anyhow::anyhow!("CERT_CACHE_SIZE must be at least 1"));
        }

        config.cert_ttl = seconds_var("CERT_TTL_SECONDS", config.cert_ttl)?;
        config.connect_timeout = seconds_var("CONNECT_TIMEOUT_SECONDS", config.connect_timeout)?;
        config.read_timeout = seconds_var("READ_TIMEOUT_SECONDS", config.read_timeout)?;
        config.idle_timeout = seconds_var("IDLE_TIMEOUT_SECONDS", config.idle_timeout)?;

        if let Ok(format) = env::var("LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        Ok(config)
    }

    /// Address to bind, `host:port`
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// File backend when a root CA is configured
    pub fn ca_backend(&self) -> Option<FileBackend> {
        match (&self.ca_cert_path, &self.ca_key_path) {
            (Some(cert), Some(key)) => Some(FileBackend::new(cert.clone(), key.clone())),
            _ => None,
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: '{}'", name, value)),
        Err(_) => Ok(default),
    }
}

fn seconds_var(name: &str, default: Duration) -> Result<Duration> {
    let seconds: u64 = parse_var(name, default.as_secs())?;
    if seconds == 0 {
        return Err(anyhow::anyhow!("{} must be greater than zero", name));
    }
    Ok(Duration::from_secs(seconds))
}
