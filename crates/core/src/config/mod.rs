//! Worker configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (TAXI_OFFLINE_*)
//! 2. TOML config file (if TAXI_OFFLINE_CONFIG_FILE set)
//! 3. Built-in defaults
//!
//! Everything that used to be worker-global (cache version, store names,
//! precache manifest, expiration bounds) lives here and is handed to the
//! worker explicitly.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

mod validation;

pub use validation::ConfigError;

/// Offline worker configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (TAXI_OFFLINE_*)
/// 2. TOML config file (if TAXI_OFFLINE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineConfig {
    /// Origin of the calculator application, e.g. `https://taxi.example.com`.
    ///
    /// Requests to any other origin are not intercepted unless a font route
    /// claims them.
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Prefix shared by every store name.
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,

    /// Cache version tag. Changing it invalidates every older store on the
    /// next activation.
    #[serde(default = "default_version")]
    pub version: String,

    /// URLs fetched and stored at install time, in order. Relative entries
    /// resolve against `origin`.
    #[serde(default = "default_precache")]
    pub precache: Vec<String>,

    /// Page served to document requests when the network is unreachable.
    #[serde(default = "default_offline_fallback")]
    pub offline_fallback: String,

    /// Request immediate activation after a successful install.
    #[serde(default = "default_true")]
    pub skip_waiting_on_install: bool,

    #[serde(default = "default_image_max_entries")]
    pub image_max_entries: usize,

    #[serde(default = "default_image_max_age_secs")]
    pub image_max_age_secs: u64,

    #[serde(default = "default_font_max_entries")]
    pub font_max_entries: usize,

    #[serde(default = "default_font_max_age_secs")]
    pub font_max_age_secs: u64,

    /// Host serving font stylesheets (stale-while-revalidate).
    #[serde(default = "default_font_stylesheet_origin")]
    pub font_stylesheet_origin: String,

    /// Host serving font files (cache-first with expiration).
    #[serde(default = "default_font_file_origin")]
    pub font_file_origin: String,

    /// Path to SQLite cache database.
    ///
    /// Set via TAXI_OFFLINE_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// User-Agent string for network requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Maximum bytes to fetch per request.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Network request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_origin() -> String {
    "http://localhost:5000".into()
}

fn default_cache_prefix() -> String {
    "taxi-calculator-offline".into()
}

fn default_version() -> String {
    "v1".into()
}

fn default_precache() -> Vec<String> {
    vec!["/".into(), "/static/style.css".into(), "/static/script.js".into()]
}

fn default_offline_fallback() -> String {
    "/".into()
}

fn default_true() -> bool {
    true
}

fn default_image_max_entries() -> usize {
    60
}

fn default_image_max_age_secs() -> u64 {
    30 * 24 * 60 * 60 // 30 days
}

fn default_font_max_entries() -> usize {
    30
}

fn default_font_max_age_secs() -> u64 {
    365 * 24 * 60 * 60
}

fn default_font_stylesheet_origin() -> String {
    "https://fonts.googleapis.com".into()
}

fn default_font_file_origin() -> String {
    "https://fonts.gstatic.com".into()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./taxi-offline-cache.sqlite")
}

fn default_user_agent() -> String {
    "taxi-offline/0.1".into()
}

fn default_max_bytes() -> usize {
    5_242_880 // 5MB
}

fn default_timeout_ms() -> u64 {
    20_000
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            cache_prefix: default_cache_prefix(),
            version: default_version(),
            precache: default_precache(),
            offline_fallback: default_offline_fallback(),
            skip_waiting_on_install: true,
            image_max_entries: default_image_max_entries(),
            image_max_age_secs: default_image_max_age_secs(),
            font_max_entries: default_font_max_entries(),
            font_max_age_secs: default_font_max_age_secs(),
            font_stylesheet_origin: default_font_stylesheet_origin(),
            font_file_origin: default_font_file_origin(),
            db_path: default_db_path(),
            user_agent: default_user_agent(),
            max_bytes: default_max_bytes(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl OfflineConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Name of the store filled at install time for the current version.
    pub fn precache_store_name(&self) -> String {
        format!("{}-precache-{}", self.cache_prefix, self.version)
    }

    /// Name of the store filled lazily by intercepted fetches.
    pub fn runtime_store_name(&self) -> String {
        format!("{}-runtime-{}", self.cache_prefix, self.version)
    }

    /// The only store names that survive activation.
    pub fn current_store_names(&self) -> [String; 2] {
        [self.precache_store_name(), self.runtime_store_name()]
    }

    /// Parsed application origin.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if `origin` is not an absolute URL.
    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.origin)
            .map_err(|e| ConfigError::Invalid { field: "origin".into(), reason: e.to_string() })
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `TAXI_OFFLINE_`
    /// 2. TOML file from `TAXI_OFFLINE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("TAXI_OFFLINE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("TAXI_OFFLINE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OfflineConfig::default();
        assert_eq!(config.origin, "http://localhost:5000");
        assert_eq!(config.version, "v1");
        assert_eq!(config.precache, vec!["/", "/static/style.css", "/static/script.js"]);
        assert_eq!(config.offline_fallback, "/");
        assert!(config.skip_waiting_on_install);
        assert_eq!(config.image_max_entries, 60);
        assert_eq!(config.image_max_age_secs, 2_592_000);
        assert_eq!(config.font_max_entries, 30);
        assert_eq!(config.db_path, PathBuf::from("./taxi-offline-cache.sqlite"));
    }

    #[test]
    fn test_store_names_follow_version() {
        let config = OfflineConfig { version: "v7".into(), ..Default::default() };
        assert_eq!(config.precache_store_name(), "taxi-calculator-offline-precache-v7");
        assert_eq!(config.runtime_store_name(), "taxi-calculator-offline-runtime-v7");
        assert_eq!(
            config.current_store_names(),
            ["taxi-calculator-offline-precache-v7".to_string(), "taxi-calculator-offline-runtime-v7".to_string()]
        );
    }

    #[test]
    fn test_timeout_duration() {
        let config = OfflineConfig::default();
        assert_eq!(config.timeout(), Duration::from_millis(20_000));
    }

    #[test]
    fn test_load_layers_toml_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "offline.toml",
                r#"
                origin = "https://taxi.example.com"
                version = "v2"
                precache = ["/", "/static/app.css"]
                "#,
            )?;
            jail.set_env("TAXI_OFFLINE_CONFIG_FILE", "offline.toml");
            jail.set_env("TAXI_OFFLINE_VERSION", "v3");

            let config = OfflineConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.origin, "https://taxi.example.com");
            assert_eq!(config.version, "v3");
            assert_eq!(config.precache, vec!["/", "/static/app.css"]);
            Ok(())
        });
    }
}
