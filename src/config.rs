//! Configuration management
//!
//! Server, upstream and worker settings come from an optional YAML file
//! merged with `SHEET_GATEWAY_`-prefixed environment variables. Rate-limit
//! thresholds, cache TTLs and store max ages are compiled-in constants.

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable read for the upstream API key by default
pub const API_KEY_ENV: &str = "GOOGLE_SHEETS_API_KEY";
/// Environment variable read for the spreadsheet id by default
pub const SPREADSHEET_ID_ENV: &str = "GOOGLE_SHEETS_SPREADSHEET_ID";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving secrets.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Spreadsheet upstream configuration
    pub upstream: UpstreamConfig,
    /// Offline cache controller configuration
    pub worker: WorkerConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Spreadsheet upstream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// API root, without the `/v4` suffix
    pub base_url: String,
    /// API key: literal value or `env:VAR_NAME`
    pub api_key: Option<String>,
    /// Spreadsheet id: literal value or `env:VAR_NAME`
    pub spreadsheet_id: Option<String>,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Outbound calls allowed per minute (0 = unlimited)
    pub max_requests_per_minute: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sheets.googleapis.com".to_string(),
            api_key: Some(format!("env:{API_KEY_ENV}")),
            spreadsheet_id: Some(format!("env:{SPREADSHEET_ID_ENV}")),
            timeout: Duration::from_secs(15),
            max_requests_per_minute: 60,
        }
    }
}

impl UpstreamConfig {
    /// Resolve the API key (expand `env:` references)
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.as_deref().and_then(resolve_secret)
    }

    /// Resolve the spreadsheet id (expand `env:` references)
    #[must_use]
    pub fn resolve_spreadsheet_id(&self) -> Option<String> {
        self.spreadsheet_id.as_deref().and_then(resolve_secret)
    }
}

/// Resolve a literal or `env:VAR` value; blank and unset values are `None`
fn resolve_secret(value: &str) -> Option<String> {
    let resolved = match value.strip_prefix("env:") {
        Some(var_name) => env::var(var_name).ok()?,
        None => value.to_string(),
    };
    let trimmed = resolved.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Offline cache controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the controller serves (scheme, host, port)
    pub origin: String,
    /// Version tag embedded in store names
    pub version: String,
    /// Paths fetched into the static store on install
    pub manifest: Vec<String>,
    /// Cross-origin hosts whose requests are intercepted
    pub allowed_hosts: Vec<String>,
    /// Path prefix of the data API
    pub api_prefix: String,
    /// Upper bound on the install phase
    #[serde(with = "humantime_serde")]
    pub install_timeout: Duration,
    /// Upper bound on the activate phase
    #[serde(with = "humantime_serde")]
    pub activate_timeout: Duration,
    /// Port of the edge host
    pub edge_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: "http://127.0.0.1:8080".to_string(),
            version: "v1".to_string(),
            manifest: [
                "/",
                "/index.html",
                "/manifest.json",
                "/css/styles.css",
                "/js/app.js",
                "/icons/icon-192.png",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            allowed_hosts: [
                "fonts.googleapis.com",
                "fonts.gstatic.com",
                "cdn.jsdelivr.net",
                "cdnjs.cloudflare.com",
                "unpkg.com",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            api_prefix: "/api/".to_string(),
            install_timeout: Duration::from_secs(30),
            activate_timeout: Duration::from_secs(30),
            edge_port: 39501,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("SHEET_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
                (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in URL settings
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.upstream.base_url = expand_string(&re, &self.upstream.base_url);
        self.worker.origin = expand_string(&re, &self.worker.origin);
        Ok(())
    }
}

fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_read_credentials_from_env_references() {
        let config = Config::default();
        assert_eq!(
            config.upstream.api_key.as_deref(),
            Some("env:GOOGLE_SHEETS_API_KEY")
        );
        assert_eq!(config.worker.version, "v1");
        assert!(config.worker.manifest.contains(&"/".to_string()));
    }

    #[test]
    fn resolve_secret_literal_and_blank() {
        assert_eq!(resolve_secret("abc"), Some("abc".to_string()));
        assert_eq!(resolve_secret("   "), None);
        assert_eq!(resolve_secret("env:SHEET_GATEWAY_TEST_SURELY_UNSET_VAR"), None);
    }

    #[test]
    fn load_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  port: 4000\n  request_timeout: 5s\nupstream:\n  api_key: literal-key\n  spreadsheet_id: sheet-1\n  timeout: 2s\nworker:\n  version: v7\n  origin: \"${{SHEET_GATEWAY_TEST_ORIGIN_UNSET:-http://localhost:9000}}\""
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.request_timeout, Duration::from_secs(5));
        assert_eq!(config.upstream.resolve_api_key().as_deref(), Some("literal-key"));
        assert_eq!(config.upstream.resolve_spreadsheet_id().as_deref(), Some("sheet-1"));
        assert_eq!(config.upstream.timeout, Duration::from_secs(2));
        assert_eq!(config.worker.version, "v7");
        assert_eq!(config.worker.origin, "http://localhost:9000");
    }

    #[test]
    fn missing_file_is_config_error() {
        let result = Config::load(Some(Path::new("/definitely/not/here.yaml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
