// Engine configuration.
//
// File config: `~/.atlas/config.toml` (optional, defaults apply)
// Secrets: `ATLAS_API_TOKEN` and `ATLAS_API_VERSION`, environment only.
// Both are required; their absence is a fatal configuration error at
// construction time, never a per-call failure.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use atlas_common::error::{Error, Result};

pub const API_TOKEN_ENV: &str = "ATLAS_API_TOKEN";
pub const API_VERSION_ENV: &str = "ATLAS_API_VERSION";

/// Root directory for Atlas global state: `~/.atlas/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".atlas"))
}

/// Path to the global config file: `~/.atlas/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Default snapshot cache directory: `~/.atlas/cache/`.
pub fn default_cache_dir() -> Option<PathBuf> {
    global_dir().map(|d| d.join("cache"))
}

// ── File config ─────────────────────────────────────────────────────

/// User-editable engine configuration at `~/.atlas/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    /// Remote API base URL.
    pub api_url: String,
    /// Which content backend to construct.
    pub backend: BackendKind,
    /// Snapshot cache directory override.
    pub cache_dir: Option<PathBuf>,
    /// Seconds the in-memory index is considered fresh.
    pub root_ttl_secs: u64,
    /// Seconds a direct children fetch is cached for uncovered parents.
    pub child_ttl_secs: u64,
    pub rate: RateConfig,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.atlas.dev/v1".to_string(),
            backend: BackendKind::Remote,
            cache_dir: None,
            root_ttl_secs: 300,
            child_ttl_secs: 30,
            rate: RateConfig::default(),
        }
    }
}

impl FileConfig {
    /// Load from `~/.atlas/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|error| Error::Config(format!("cannot read `{}`: {error}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|error| Error::Config(format!("cannot parse `{}`: {error}", path.display())))
    }
}

/// Outbound rate limiter parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateConfig {
    /// Bucket capacity (also the burst size).
    pub max_tokens: u32,
    /// Full-bucket refill window in milliseconds.
    pub window_ms: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self { max_tokens: 3, window_ms: 1000 }
    }
}

/// Content backend selector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Remote,
}

// ── Resolved config ─────────────────────────────────────────────────

/// Fully-resolved engine configuration: file config merged with the
/// required environment secrets.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub api_url: String,
    pub api_token: String,
    pub api_version: String,
    pub backend: BackendKind,
    pub cache_dir: PathBuf,
    pub root_ttl: Duration,
    pub child_ttl: Duration,
    pub rate: RateConfig,
}

impl EngineConfig {
    /// Resolve from `~/.atlas/config.toml` plus the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_parts(
            FileConfig::load(),
            std::env::var(API_TOKEN_ENV).ok(),
            std::env::var(API_VERSION_ENV).ok(),
        )
    }

    /// Resolve from explicit parts (tests inject file config and secrets).
    pub fn from_parts(
        file: FileConfig,
        api_token: Option<String>,
        api_version: Option<String>,
    ) -> Result<Self> {
        let api_token = non_empty(api_token)
            .ok_or_else(|| Error::Config(format!("{API_TOKEN_ENV} is not set")))?;
        let api_version = non_empty(api_version)
            .ok_or_else(|| Error::Config(format!("{API_VERSION_ENV} is not set")))?;
        validate_api_url(&file.api_url)?;

        let cache_dir = file
            .cache_dir
            .clone()
            .or_else(default_cache_dir)
            .ok_or_else(|| Error::Config("could not determine a cache directory".to_string()))?;

        Ok(Self {
            api_url: file.api_url,
            api_token,
            api_version,
            backend: file.backend,
            cache_dir,
            root_ttl: Duration::from_secs(file.root_ttl_secs),
            child_ttl: Duration::from_secs(file.child_ttl_secs),
            rate: file.rate,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn validate_api_url(value: &str) -> Result<()> {
    let parsed = Url::parse(value)
        .map_err(|error| Error::Config(format!("invalid api_url `{value}`: {error}")))?;
    match parsed.scheme() {
        "https" => Ok(()),
        "http" if is_loopback_host(parsed.host_str()) => Ok(()),
        _ => Err(Error::Config(
            "api_url must use https (http is allowed only for localhost testing)".to_string(),
        )),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn secrets() -> (Option<String>, Option<String>) {
        (Some("secret-token".to_string()), Some("2026-06-01".to_string()))
    }

    #[test]
    fn file_config_defaults() {
        let cfg = FileConfig::default();
        assert_eq!(cfg.backend, BackendKind::Remote);
        assert_eq!(cfg.root_ttl_secs, 300);
        assert_eq!(cfg.child_ttl_secs, 30);
        assert_eq!(cfg.rate.max_tokens, 3);
        assert_eq!(cfg.rate.window_ms, 1000);
        assert!(cfg.cache_dir.is_none());
    }

    #[test]
    fn file_config_partial_toml_uses_defaults() {
        let toml_str = r#"
root_ttl_secs = 60

[rate]
max_tokens = 10
"#;
        let cfg: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.root_ttl_secs, 60);
        assert_eq!(cfg.rate.max_tokens, 10);
        assert_eq!(cfg.rate.window_ms, 1000); // default
        assert_eq!(cfg.child_ttl_secs, 30); // default
    }

    #[test]
    fn file_config_load_missing_file_is_an_error_but_load_falls_back() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(FileConfig::load_from(&missing).is_err());
    }

    #[test]
    fn file_config_round_trips_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
api_url = "https://workspace.example.com/api"
backend = "remote"
root_ttl_secs = 120

[rate]
max_tokens = 5
window_ms = 2000
"#,
        )
        .unwrap();

        let cfg = FileConfig::load_from(&path).expect("config should parse");
        assert_eq!(cfg.api_url, "https://workspace.example.com/api");
        assert_eq!(cfg.root_ttl_secs, 120);
        assert_eq!(cfg.rate.max_tokens, 5);
        assert_eq!(cfg.rate.window_ms, 2000);
    }

    #[test]
    fn missing_token_is_a_fatal_config_error() {
        let (_, version) = secrets();
        let error = EngineConfig::from_parts(FileConfig::default(), None, version)
            .expect_err("missing token should fail");
        assert!(error.to_string().contains(API_TOKEN_ENV));
    }

    #[test]
    fn blank_version_is_a_fatal_config_error() {
        let (token, _) = secrets();
        let error =
            EngineConfig::from_parts(FileConfig::default(), token, Some("   ".to_string()))
                .expect_err("blank version should fail");
        assert!(error.to_string().contains(API_VERSION_ENV));
    }

    #[test]
    fn resolves_ttls_and_secrets() {
        let (token, version) = secrets();
        let file = FileConfig {
            cache_dir: Some(PathBuf::from("/tmp/atlas-cache")),
            root_ttl_secs: 120,
            ..FileConfig::default()
        };
        let cfg = EngineConfig::from_parts(file, token, version).expect("config should resolve");
        assert_eq!(cfg.api_token, "secret-token");
        assert_eq!(cfg.api_version, "2026-06-01");
        assert_eq!(cfg.root_ttl, Duration::from_secs(120));
        assert_eq!(cfg.cache_dir, PathBuf::from("/tmp/atlas-cache"));
    }

    #[test]
    fn rejects_non_tls_api_url() {
        let (token, version) = secrets();
        let file = FileConfig {
            api_url: "http://workspace.example.com/api".to_string(),
            ..FileConfig::default()
        };
        let error = EngineConfig::from_parts(file, token, version)
            .expect_err("plain http should be rejected");
        assert!(error.to_string().contains("https"));
    }

    #[test]
    fn allows_loopback_http_for_testing() {
        let (token, version) = secrets();
        let file = FileConfig {
            api_url: "http://127.0.0.1:8080".to_string(),
            cache_dir: Some(PathBuf::from("/tmp/atlas-cache")),
            ..FileConfig::default()
        };
        assert!(EngineConfig::from_parts(file, token, version).is_ok());
    }

    #[test]
    fn unknown_backend_kind_fails_at_parse_time() {
        let error = toml::from_str::<FileConfig>("backend = \"carrier-pigeon\"")
            .expect_err("unknown backend should fail");
        assert!(error.to_string().contains("unknown variant"));
    }
}
