//! Configuration file support for tributary.
//!
//! Configuration is loaded with the following precedence (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (prefixed with `TRIBUTARY_`, e.g., `TRIBUTARY_API_SECRET`)
//! 3. Config file (`--config FILE`, else ./tributary.toml)
//! 4. XDG config file (~/.config/tributary/config.toml)
//! 5. Built-in defaults
//!
//! Example config file:
//! ```toml
//! [api]
//! secret = "sk_live_..."  # or use TRIBUTARY_API_SECRET env var
//! rps = 80
//! timeout = 300
//!
//! [sink]
//! dir = "/var/lib/tributary"
//!
//! [[resources]]
//! name = "customers"
//! kind = "customer"
//! path = "/v1/customers"
//! event_types = ["customer.created", "customer.updated"]
//! deletion_events = ["customer.deleted"]
//! expand = ["sources"]
//! bundle = "billing"
//!
//! [resources.mapping]
//! fields = ["email", "currency"]
//! timestamps = ["created"]
//! flatten = ["metadata"]
//!
//! [[resources]]
//! name = "transfers"
//! kind = "transfer"
//! path = "/v1/transfers"
//!
//! [[resources.related]]
//! path = "/v1/balance/history"
//! filter_param = "transfer"
//! parent_key = "transfer_id"
//! ```

use std::path::{Path, PathBuf};

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::Deserialize;
use tributary::ResourceConfig;
use tributary::api::{DEFAULT_API_VERSION, DEFAULT_BASE_URL};
use tributary::rate_limit::DEFAULT_RPS;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upstream API configuration.
    pub api: ApiConfig,
    /// Output configuration.
    pub sink: SinkConfig,
    /// Resources to sync.
    pub resources: Vec<ResourceConfig>,
}

/// Upstream API configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Secret API key.
    /// Can also be set via TRIBUTARY_API_SECRET environment variable.
    pub secret: Option<String>,
    /// Base URL of the API.
    pub url: String,
    /// Pinned API version.
    pub version: String,
    /// Maximum request starts per second. Zero disables throttling.
    pub rps: u32,
    /// Per-request timeout in seconds.
    pub timeout: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            secret: None,
            url: DEFAULT_BASE_URL.to_string(),
            version: DEFAULT_API_VERSION.to_string(),
            rps: DEFAULT_RPS,
            timeout: 300,
        }
    }
}

/// Output configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Directory receiving the JSON-lines output and run context.
    /// Defaults to the XDG state directory.
    pub dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration using the config crate's layered approach.
    ///
    /// `explicit` replaces ./tributary.toml when given.
    pub fn load(explicit: Option<&Path>) -> Self {
        let mut builder = ConfigBuilder::builder();

        // Add XDG config file if it exists
        if let Some(path) = Self::default_config_path()
            && path.exists()
        {
            tracing::debug!("Loading config from {:?}", path);
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }

        // Add explicit or local config file (higher priority than XDG)
        match explicit {
            Some(path) => {
                tracing::debug!("Loading config from {:?}", path);
                builder = builder.add_source(
                    File::from(path.to_path_buf())
                        .format(FileFormat::Toml)
                        .required(true),
                );
            }
            None => {
                let local_config = PathBuf::from("tributary.toml");
                if local_config.exists() {
                    tracing::debug!("Loading config from ./tributary.toml");
                    builder = builder.add_source(
                        File::from(local_config)
                            .format(FileFormat::Toml)
                            .required(false),
                    );
                }
            }
        }

        // e.g., TRIBUTARY_API_SECRET -> api.secret
        builder = builder.add_source(
            Environment::with_prefix("TRIBUTARY")
                .separator("_")
                .try_parsing(true),
        );

        match builder.build() {
            Ok(settings) => match settings.try_deserialize::<Config>() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to deserialize config: {}", e);
                    Config::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to build config: {}", e);
                Config::default()
            }
        }
    }

    /// The configured secret, if it is non-empty.
    pub fn secret(&self) -> Option<&str> {
        self.api.secret.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Get the output directory, falling back to the default state directory.
    pub fn output_dir(&self) -> Option<PathBuf> {
        self.sink
            .dir
            .clone()
            .or_else(|| Self::default_state_dir().map(|dir| dir.join("output")))
    }

    /// Get the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "tributary").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the default state directory path.
    ///
    /// On Linux, this is `$XDG_STATE_HOME/tributary` or `~/.local/state/tributary`.
    /// On macOS/Windows, falls back to the data directory.
    pub fn default_state_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "tributary").map(|dirs| {
            dirs.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| dirs.data_dir().to_path_buf())
        })
    }
}
