use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_HOST: &str = "https://api.scraps.sh";

pub const DEFAULT_RECONNECT_BASE_MS: u64 = 500;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(
        rename = "default-host",
        alias = "default_host",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub default_host: Option<String>,

    #[serde(
        rename = "output-format",
        alias = "output_format",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub output_format: Option<OutputFormat>,

    #[serde(
        rename = "log-level",
        alias = "log_level",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub log_level: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch: Option<WatchConfig>,

    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OutputFormat {
    #[serde(rename = "table")]
    #[default]
    Table,
    #[serde(rename = "json")]
    Json,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransportKind {
    #[serde(rename = "sse")]
    #[default]
    Sse,
    #[serde(rename = "ws")]
    Ws,
}

/// Settings for `scraps watch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub transport: TransportKind,

    /// First reconnect delay in milliseconds (default: 500)
    #[serde(
        rename = "reconnect-base-ms",
        alias = "reconnect_base_ms",
        default = "WatchConfig::default_reconnect_base_ms"
    )]
    pub reconnect_base_ms: u64,

    /// Upper bound for the reconnect delay in milliseconds (default: 30000)
    #[serde(
        rename = "reconnect-max-ms",
        alias = "reconnect_max_ms",
        default = "WatchConfig::default_reconnect_max_ms"
    )]
    pub reconnect_max_ms: u64,

    #[serde(
        rename = "show-claims",
        alias = "show_claims",
        default = "WatchConfig::default_show_claims"
    )]
    pub show_claims: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
            show_claims: true,
        }
    }
}

impl WatchConfig {
    fn default_reconnect_base_ms() -> u64 {
        DEFAULT_RECONNECT_BASE_MS
    }

    fn default_reconnect_max_ms() -> u64 {
        DEFAULT_RECONNECT_MAX_MS
    }

    fn default_show_claims() -> bool {
        true
    }

    pub fn effective_reconnect_base_ms(&self) -> u64 {
        if self.reconnect_base_ms == 0 {
            DEFAULT_RECONNECT_BASE_MS
        } else {
            self.reconnect_base_ms
        }
    }

    pub fn effective_reconnect_max_ms(&self) -> u64 {
        if self.reconnect_max_ms == 0 {
            DEFAULT_RECONNECT_MAX_MS
        } else {
            self.reconnect_max_ms
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("default-host is empty")]
    HostEmpty,
    #[error("invalid default-host (expected http:// or https://): {host}")]
    InvalidHost { host: String },
    #[error("reconnect-max-ms ({max}) must be >= reconnect-base-ms ({base})")]
    InvalidReconnectWindow { base: u64, max: u64 },
}

impl ConfigFile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(host) = &self.default_host {
            validate_host(host)?;
        }

        if let Some(watch) = &self.watch {
            let base = watch.effective_reconnect_base_ms();
            let max = watch.effective_reconnect_max_ms();
            if max < base {
                return Err(ConfigError::InvalidReconnectWindow { base, max });
            }
        }

        Ok(())
    }

    pub fn effective_host(&self) -> &str {
        match self.default_host.as_deref().map(str::trim) {
            Some(h) if !h.is_empty() => h,
            _ => DEFAULT_HOST,
        }
    }

    pub fn effective_output_format(&self) -> OutputFormat {
        self.output_format.unwrap_or_default()
    }

    pub fn effective_watch(&self) -> WatchConfig {
        self.watch.clone().unwrap_or_default()
    }
}

pub fn validate_host(host: &str) -> Result<(), ConfigError> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::HostEmpty);
    }
    if !(trimmed.starts_with("https://") || trimmed.starts_with("http://")) {
        return Err(ConfigError::InvalidHost {
            host: trimmed.to_owned(),
        });
    }
    Ok(())
}

/// One entry of `credentials.json`, keyed by host.
#[derive(Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Credential {
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("api_key", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Credentials(pub BTreeMap<String, Credential>);

impl Credentials {
    /// Looks up the credential for `host`, ignoring a trailing slash on either side.
    pub fn for_host(&self, host: &str) -> Option<&Credential> {
        let wanted = host.trim().trim_end_matches('/');
        self.0
            .iter()
            .find(|(h, c)| h.trim_end_matches('/') == wanted && !c.api_key.is_empty())
            .map(|(_, c)| c)
    }
}

/// Environment-provided overrides, read once by the binary.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

/// Where to talk to and with which key.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Host precedence: flag, `SCRAPS_BASE_URL`, `default-host`, built-in default.
/// Key precedence: `SCRAPS_API_KEY`, then the credentials entry for the chosen host.
pub fn resolve_endpoint(
    config: &ConfigFile,
    credentials: &Credentials,
    host_flag: Option<&str>,
    env: &EnvOverrides,
) -> Result<Endpoint, ConfigError> {
    let host = non_empty(host_flag)
        .or_else(|| non_empty(env.base_url.as_deref()))
        .unwrap_or_else(|| config.effective_host());
    validate_host(host)?;
    let host = host.trim_end_matches('/').to_owned();

    let api_key = non_empty(env.api_key.as_deref())
        .map(str::to_owned)
        .or_else(|| credentials.for_host(&host).map(|c| c.api_key.clone()));

    Ok(Endpoint { host, api_key })
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: ConfigFile = toml::from_str("").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.effective_host(), DEFAULT_HOST);
        assert_eq!(cfg.effective_output_format(), OutputFormat::Table);

        let watch = cfg.effective_watch();
        assert_eq!(watch.transport, TransportKind::Sse);
        assert_eq!(watch.effective_reconnect_base_ms(), 500);
        assert_eq!(watch.effective_reconnect_max_ms(), 30_000);
        assert!(watch.show_claims);
    }

    #[test]
    fn watch_section_accepts_kebab_and_snake_keys() {
        let cfg: ConfigFile = toml::from_str(
            r#"
default-host = "http://localhost:8787"
output_format = "json"

[watch]
transport = "ws"
reconnect_base_ms = 250
reconnect-max-ms = 4000
show-claims = false
"#,
        )
        .unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.effective_host(), "http://localhost:8787");
        assert_eq!(cfg.effective_output_format(), OutputFormat::Json);
        let watch = cfg.effective_watch();
        assert_eq!(watch.transport, TransportKind::Ws);
        assert_eq!(watch.effective_reconnect_base_ms(), 250);
        assert_eq!(watch.effective_reconnect_max_ms(), 4_000);
        assert!(!watch.show_claims);
    }

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let cfg: ConfigFile = toml::from_str("theme = \"dark\"\n").unwrap();
        let out = toml::to_string(&cfg).unwrap();
        assert!(out.contains("theme = \"dark\""));
    }

    #[test]
    fn validate_rejects_bad_host_and_inverted_window() {
        let cfg: ConfigFile = toml::from_str("default-host = \"api.scraps.sh\"").unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidHost { .. })
        ));

        let cfg: ConfigFile =
            toml::from_str("[watch]\nreconnect-base-ms = 5000\nreconnect-max-ms = 100\n").unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidReconnectWindow {
                base: 5000,
                max: 100
            })
        ));
    }

    #[test]
    fn credentials_lookup_ignores_trailing_slash_and_empty_keys() {
        let creds: Credentials = serde_json::from_str(
            r#"{
                "https://api.scraps.sh/": {"api_key": "k1", "username": "ada"},
                "http://localhost:8787": {"api_key": ""}
            }"#,
        )
        .unwrap();

        assert_eq!(
            creds.for_host("https://api.scraps.sh").map(|c| c.api_key.as_str()),
            Some("k1")
        );
        assert!(creds.for_host("http://localhost:8787").is_none());
    }

    #[test]
    fn credential_debug_redacts_key() {
        let c = Credential {
            api_key: "secret".to_owned(),
            ..Credential::default()
        };
        assert!(!format!("{c:?}").contains("secret"));
    }

    #[test]
    fn endpoint_precedence_flag_env_config() {
        let cfg: ConfigFile = toml::from_str("default-host = \"http://cfg.local/\"").unwrap();
        let creds: Credentials = serde_json::from_str(
            r#"{"http://cfg.local": {"api_key": "cfg-key"}, "http://flag.local": {"api_key": "flag-key"}}"#,
        )
        .unwrap();

        let ep = resolve_endpoint(&cfg, &creds, None, &EnvOverrides::default()).unwrap();
        assert_eq!(ep.host, "http://cfg.local");
        assert_eq!(ep.api_key.as_deref(), Some("cfg-key"));

        let env = EnvOverrides {
            base_url: Some("http://env.local".to_owned()),
            api_key: None,
        };
        let ep = resolve_endpoint(&cfg, &creds, None, &env).unwrap();
        assert_eq!(ep.host, "http://env.local");
        assert_eq!(ep.api_key, None);

        let env = EnvOverrides {
            base_url: Some("http://env.local".to_owned()),
            api_key: Some("env-key".to_owned()),
        };
        let ep = resolve_endpoint(&cfg, &creds, Some("http://flag.local"), &env).unwrap();
        assert_eq!(ep.host, "http://flag.local");
        assert_eq!(ep.api_key.as_deref(), Some("env-key"));
        assert!(!format!("{ep:?}").contains("env-key"));
    }

    #[test]
    fn endpoint_rejects_schemeless_host() {
        let err = resolve_endpoint(
            &ConfigFile::default(),
            &Credentials::default(),
            Some("api.scraps.sh"),
            &EnvOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHost { .. }));
    }
}
