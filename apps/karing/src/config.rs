use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::cidr::{CidrError, normalize_ipv4_cidr};

/// Absolute ceiling on the number of active slots.
pub const MAX_LIMIT: u32 = 100;
/// Ceiling this binary was built with. Never above `MAX_LIMIT`.
pub const BUILD_LIMIT: u32 = MAX_LIMIT;
pub const HARD_MAX_FILE_BYTES: u64 = 20_971_520;
pub const HARD_MAX_TEXT_BYTES: u64 = 10_485_760;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_BASE_PATH: &str = "/";
const DEFAULT_DB_FILE_NAME: &str = "karing.db";
const DEFAULT_FTS_ENABLED: bool = true;
const DEFAULT_SEARCH_FALLBACK: bool = true;

const LIMIT_SETTING: &str = "limit";
const MAX_FILE_BYTES_SETTING: &str = "max_file_bytes";
const MAX_TEXT_BYTES_SETTING: &str = "max_text_bytes";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub log_json: bool,
    pub db_path: PathBuf,
    pub runtime_limit: u32,
    pub max_file_bytes: u64,
    pub max_text_bytes: u64,
    pub no_auth: bool,
    pub trust_proxy: bool,
    pub allow_localhost: bool,
    pub trusted_proxies: Vec<String>,
    pub base_path: String,
    pub fts_enabled: bool,
    pub search_fallback: bool,
    /// Limits that were lowered while building this configuration. Logged once
    /// tracing is installed.
    pub clamp_notices: Vec<ClampNotice>,
}

/// A requested limit that was lowered to its ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClampNotice {
    pub setting: &'static str,
    pub requested: u64,
    pub ceiling: u64,
}

impl fmt::Display for ClampNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} exceeds {}; clamping",
            self.setting, self.requested, self.ceiling
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid KARING_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid {name} value '{value}': expected a non-negative integer")]
    InvalidNumber { name: &'static str, value: String },
    #[error("invalid KARING_TRUSTED_PROXIES entry '{value}': {source}")]
    InvalidTrustedProxy { value: String, source: CidrError },
}

/// Command-line values that take precedence over the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub db_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub limit: Option<u32>,
    pub max_file_bytes: Option<u64>,
    pub max_text_bytes: Option<u64>,
    pub no_auth: bool,
    pub trust_proxy: bool,
    pub allow_localhost: bool,
    pub base_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let bind_addr_raw =
            non_empty("KARING_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr_raw
            .trim()
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw.clone(),
                source,
            })?;

        let log_filter =
            non_empty("KARING_LOG_FILTER").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        let log_json = non_empty("KARING_LOG_JSON").is_some_and(|value| is_truthy(&value));

        let db_path = non_empty("KARING_DATA")
            .map(|value| PathBuf::from(value.trim()))
            .unwrap_or_else(default_db_path);

        let runtime_limit = parse_number::<u32>("KARING_LIMIT", non_empty("KARING_LIMIT"))?
            .unwrap_or(BUILD_LIMIT);
        let max_file_bytes =
            parse_number::<u64>("KARING_MAX_FILE_BYTES", non_empty("KARING_MAX_FILE_BYTES"))?
                .unwrap_or(HARD_MAX_FILE_BYTES);
        let max_text_bytes =
            parse_number::<u64>("KARING_MAX_TEXT_BYTES", non_empty("KARING_MAX_TEXT_BYTES"))?
                .unwrap_or(HARD_MAX_TEXT_BYTES);

        let no_auth = non_empty("KARING_NO_AUTH").is_some_and(|value| is_truthy(&value));
        let trust_proxy = non_empty("KARING_TRUSTED_PROXY").is_some_and(|value| is_truthy(&value));
        let allow_localhost =
            non_empty("KARING_ALLOW_LOCALHOST").is_some_and(|value| is_truthy(&value));
        let trusted_proxies = non_empty("KARING_TRUSTED_PROXIES")
            .map(parse_csv)
            .unwrap_or_default()
            .into_iter()
            .map(|value| {
                normalize_ipv4_cidr(&value)
                    .map_err(|source| ConfigError::InvalidTrustedProxy { value, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let base_path = non_empty("KARING_BASE_PATH")
            .map(|value| normalize_base_path(&value))
            .unwrap_or_else(|| DEFAULT_BASE_PATH.to_string());

        let fts_enabled = non_empty("KARING_FTS")
            .map(|value| is_truthy(&value))
            .unwrap_or(DEFAULT_FTS_ENABLED);
        let search_fallback = non_empty("KARING_SEARCH_FALLBACK")
            .map(|value| is_truthy(&value))
            .unwrap_or(DEFAULT_SEARCH_FALLBACK);

        Ok(Self {
            bind_addr,
            log_filter,
            log_json,
            db_path,
            runtime_limit,
            max_file_bytes,
            max_text_bytes,
            no_auth,
            trust_proxy,
            allow_localhost,
            trusted_proxies,
            base_path,
            fts_enabled,
            search_fallback,
            clamp_notices: Vec::new(),
        }
        .clamped())
    }

    /// Applies command-line overrides, then re-clamps limits.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(path) = overrides.db_path.as_ref() {
            self.db_path = path.clone();
        }
        if let Some(port) = overrides.port {
            self.bind_addr.set_port(port);
        }
        if let Some(limit) = overrides.limit {
            self.runtime_limit = limit;
            self.forget_notice(LIMIT_SETTING);
        }
        if let Some(bytes) = overrides.max_file_bytes {
            self.max_file_bytes = bytes;
            self.forget_notice(MAX_FILE_BYTES_SETTING);
        }
        if let Some(bytes) = overrides.max_text_bytes {
            self.max_text_bytes = bytes;
            self.forget_notice(MAX_TEXT_BYTES_SETTING);
        }
        self.no_auth |= overrides.no_auth;
        self.trust_proxy |= overrides.trust_proxy;
        self.allow_localhost |= overrides.allow_localhost;
        if let Some(base_path) = overrides.base_path.as_ref() {
            self.base_path = normalize_base_path(base_path);
        }
        self.clamped()
    }

    /// Configuration can only tighten the compiled ceilings, never loosen them.
    fn clamped(mut self) -> Self {
        if self.runtime_limit > BUILD_LIMIT {
            self.note_clamp(LIMIT_SETTING, u64::from(self.runtime_limit), u64::from(BUILD_LIMIT));
        }
        self.runtime_limit = self.runtime_limit.clamp(1, BUILD_LIMIT);

        if self.max_file_bytes > HARD_MAX_FILE_BYTES {
            self.note_clamp(MAX_FILE_BYTES_SETTING, self.max_file_bytes, HARD_MAX_FILE_BYTES);
        }
        self.max_file_bytes = self.max_file_bytes.clamp(1, HARD_MAX_FILE_BYTES);

        if self.max_text_bytes > HARD_MAX_TEXT_BYTES {
            self.note_clamp(MAX_TEXT_BYTES_SETTING, self.max_text_bytes, HARD_MAX_TEXT_BYTES);
        }
        self.max_text_bytes = self.max_text_bytes.clamp(1, HARD_MAX_TEXT_BYTES);
        self
    }

    fn note_clamp(&mut self, setting: &'static str, requested: u64, ceiling: u64) {
        self.forget_notice(setting);
        self.clamp_notices.push(ClampNotice {
            setting,
            requested,
            ceiling,
        });
    }

    fn forget_notice(&mut self, setting: &str) {
        self.clamp_notices.retain(|notice| notice.setting != setting);
    }

    /// Largest request body accepted by the router: a full file plus multipart framing.
    pub fn request_body_limit(&self) -> usize {
        let bound = self.max_file_bytes.max(self.max_text_bytes) + 1024 * 1024;
        usize::try_from(bound).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
impl Config {
    #[must_use]
    pub fn for_tests(db_path: PathBuf) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: "debug".to_string(),
            log_json: false,
            db_path,
            runtime_limit: BUILD_LIMIT,
            max_file_bytes: HARD_MAX_FILE_BYTES,
            max_text_bytes: HARD_MAX_TEXT_BYTES,
            no_auth: false,
            trust_proxy: false,
            allow_localhost: false,
            trusted_proxies: Vec::new(),
            base_path: DEFAULT_BASE_PATH.to_string(),
            fts_enabled: true,
            search_fallback: true,
            clamp_notices: Vec::new(),
        }
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_number<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
) -> Result<Option<T>, ConfigError> {
    value
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidNumber { name, value: raw })
        })
        .transpose()
}

fn parse_csv(value: String) -> Vec<String> {
    value
        .split(',')
        .map(|segment| segment.trim().to_string())
        .filter(|segment| !segment.is_empty())
        .collect()
}

fn normalize_base_path(value: &str) -> String {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_BASE_PATH.to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("karing").join(DEFAULT_DB_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_use_hard_caps_and_build_limit() {
        let config = Config::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.runtime_limit, BUILD_LIMIT);
        assert_eq!(config.max_file_bytes, HARD_MAX_FILE_BYTES);
        assert_eq!(config.max_text_bytes, HARD_MAX_TEXT_BYTES);
        assert_eq!(config.base_path, "/");
        assert!(!config.no_auth);
        assert!(config.fts_enabled);
        assert!(config.search_fallback);
    }

    #[test]
    fn limits_can_only_tighten() {
        let config = Config::from_lookup(lookup(&[
            ("KARING_LIMIT", "500"),
            ("KARING_MAX_FILE_BYTES", "99999999999"),
            ("KARING_MAX_TEXT_BYTES", "0"),
        ]))
        .expect("config");
        assert_eq!(config.runtime_limit, BUILD_LIMIT);
        assert_eq!(config.max_file_bytes, HARD_MAX_FILE_BYTES);
        assert_eq!(config.max_text_bytes, 1);

        let config = Config::from_lookup(lookup(&[("KARING_LIMIT", "0")])).expect("config");
        assert_eq!(config.runtime_limit, 1);
    }

    #[test]
    fn truthy_flags_and_proxy_list_parse() {
        let config = Config::from_lookup(lookup(&[
            ("KARING_NO_AUTH", "on"),
            ("KARING_TRUSTED_PROXY", "YES"),
            ("KARING_ALLOW_LOCALHOST", "0"),
            ("KARING_TRUSTED_PROXIES", "10.0.0.0/8, 192.168.1.1 ,,"),
        ]))
        .expect("config");
        assert!(config.no_auth);
        assert!(config.trust_proxy);
        assert!(!config.allow_localhost);
        assert_eq!(config.trusted_proxies, vec!["10.0.0.0/8", "192.168.1.1/32"]);
    }

    #[test]
    fn malformed_trusted_proxies_are_errors() {
        for raw in ["garbage/-1,10.0.0.0/99", "10.0.0.0/-1", "10.0.0.0/8,proxy.local"] {
            let error = Config::from_lookup(lookup(&[("KARING_TRUSTED_PROXIES", raw)]))
                .expect_err("proxy list should be rejected");
            assert!(
                matches!(error, ConfigError::InvalidTrustedProxy { .. }),
                "{raw}: {error}"
            );
        }

        let config = Config::from_lookup(lookup(&[("KARING_TRUSTED_PROXIES", "10.1.2.3/8")]))
            .expect("config");
        assert_eq!(config.trusted_proxies, vec!["10.0.0.0/8"]);
    }

    #[test]
    fn clamps_are_kept_as_notices() {
        let config = Config::from_lookup(lookup(&[
            ("KARING_LIMIT", "500"),
            ("KARING_MAX_FILE_BYTES", "99999999999"),
        ]))
        .expect("config");
        assert_eq!(
            config.clamp_notices,
            vec![
                ClampNotice {
                    setting: "limit",
                    requested: 500,
                    ceiling: u64::from(BUILD_LIMIT),
                },
                ClampNotice {
                    setting: "max_file_bytes",
                    requested: 99_999_999_999,
                    ceiling: HARD_MAX_FILE_BYTES,
                },
            ]
        );
        assert_eq!(
            config.clamp_notices[0].to_string(),
            "limit 500 exceeds 100; clamping"
        );

        let config = config.with_overrides(&ConfigOverrides {
            limit: Some(20),
            ..ConfigOverrides::default()
        });
        assert_eq!(config.runtime_limit, 20);
        assert_eq!(config.clamp_notices.len(), 1);
        assert_eq!(config.clamp_notices[0].setting, "max_file_bytes");

        let quiet = Config::from_lookup(lookup(&[("KARING_LIMIT", "0")])).expect("config");
        assert!(quiet.clamp_notices.is_empty());
    }

    #[test]
    fn invalid_values_are_errors() {
        let error = Config::from_lookup(lookup(&[("KARING_LIMIT", "ten")])).unwrap_err();
        assert!(matches!(
            error,
            ConfigError::InvalidNumber {
                name: "KARING_LIMIT",
                ..
            }
        ));

        let error = Config::from_lookup(lookup(&[("KARING_BIND_ADDR", "nowhere")])).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidBindAddr { .. }));
    }

    #[test]
    fn overrides_take_precedence_and_reclamp() {
        let config = Config::from_lookup(lookup(&[("KARING_LIMIT", "10")])).expect("config");
        let config = config.with_overrides(&ConfigOverrides {
            port: Some(9191),
            limit: Some(250),
            max_text_bytes: Some(64),
            no_auth: true,
            base_path: Some("karing/".to_string()),
            ..ConfigOverrides::default()
        });
        assert_eq!(config.bind_addr.port(), 9191);
        assert_eq!(config.runtime_limit, BUILD_LIMIT);
        assert_eq!(config.clamp_notices.len(), 1);
        assert_eq!(config.clamp_notices[0].requested, 250);
        assert_eq!(config.max_text_bytes, 64);
        assert!(config.no_auth);
        assert_eq!(config.base_path, "/karing");
    }
}
