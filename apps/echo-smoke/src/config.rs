//! Environment-backed configuration for `echo-smoke`.

use std::{env, error::Error, fmt, time::Duration};

use echo_core::BackendInitConfig;
use echo_platform::DEFAULT_SERVICE as DEFAULT_KEYRING_SERVICE;

const DEFAULT_SERVER_URL: &str = "http://localhost:8000";
const DEFAULT_TIMELINE_LIMIT: u16 = 20;
const DEFAULT_DURATION_SECS: u64 = 30;

/// Credentials the smoke run authenticates with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Create the account first instead of logging in.
    pub signup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    /// Backend base URL sent with `BackendCommand::Init`.
    pub server_url: String,
    /// Login credentials. Without them the run tries to restore a stored session.
    pub credentials: Option<Credentials>,
    /// Keyring service holding the session and refresh cookie.
    pub keyring_service: String,
    /// Runtime tuning forwarded to `Init`.
    pub init_config: BackendInitConfig,
    /// How long realtime events are printed before shutting down.
    pub duration: Duration,
    /// Optional post published once the timeline is loaded.
    pub post_content: Option<String>,
}

impl SmokeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let server_url = optional_trimmed_env("ECHO_SERVER_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_owned());
        let keyring_service = optional_trimmed_env("ECHO_KEYRING_SERVICE", &mut lookup)
            .unwrap_or_else(|| DEFAULT_KEYRING_SERVICE.to_owned());

        let username = optional_trimmed_env("ECHO_USER", &mut lookup);
        let password = lookup("ECHO_PASSWORD").filter(|value| !value.is_empty());
        let signup = parse_flag("ECHO_SIGNUP", &mut lookup)?;
        let credentials = match (username, password) {
            (Some(username), Some(password)) => Some(Credentials {
                username,
                password,
                signup,
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::InvalidValue {
                    key: "ECHO_PASSWORD",
                    value: String::new(),
                    reason: "required when ECHO_USER is set".to_owned(),
                });
            }
            (None, Some(_)) => {
                return Err(ConfigError::InvalidValue {
                    key: "ECHO_USER",
                    value: String::new(),
                    reason: "required when ECHO_PASSWORD is set".to_owned(),
                });
            }
        };

        let timeline_limit = parse_optional_u16("ECHO_TIMELINE_LIMIT", &mut lookup)?
            .unwrap_or(DEFAULT_TIMELINE_LIMIT);
        if timeline_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ECHO_TIMELINE_LIMIT",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        let renewal_secs = parse_optional_u64("ECHO_STREAM_RENEWAL_SECS", &mut lookup)?;
        if renewal_secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "ECHO_STREAM_RENEWAL_SECS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        let duration_secs = parse_optional_u64("ECHO_SMOKE_DURATION_SECS", &mut lookup)?
            .unwrap_or(DEFAULT_DURATION_SECS);

        Ok(Self {
            server_url,
            credentials,
            keyring_service,
            init_config: BackendInitConfig {
                timeline_page_size: Some(timeline_limit),
                stream_renewal_interval_ms: renewal_secs.map(|secs| secs.saturating_mul(1_000)),
                ..BackendInitConfig::default()
            },
            duration: Duration::from_secs(duration_secs),
            post_content: optional_trimmed_env("ECHO_SMOKE_POST", &mut lookup),
        })
    }
}

/// Errors produced while parsing smoke configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_flag<F>(key: &'static str, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(false);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean".to_owned(),
        }),
    }
}

fn parse_optional_u16<F>(key: &'static str, lookup: &mut F) -> Result<Option<u16>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u16>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        SmokeConfig::from_lookup(|key| values.get(key).cloned())
    }

    #[test]
    fn uses_defaults_when_env_missing() {
        let cfg = config_from_pairs(&[]).expect("config should parse");

        assert_eq!(cfg.server_url, DEFAULT_SERVER_URL);
        assert_eq!(cfg.keyring_service, DEFAULT_KEYRING_SERVICE);
        assert_eq!(cfg.credentials, None);
        assert_eq!(cfg.init_config.timeline_page_size, Some(DEFAULT_TIMELINE_LIMIT));
        assert_eq!(cfg.init_config.stream_renewal_interval_ms, None);
        assert_eq!(cfg.duration, Duration::from_secs(DEFAULT_DURATION_SECS));
        assert_eq!(cfg.post_content, None);
    }

    #[test]
    fn parses_credentials_and_tuning() {
        let cfg = config_from_pairs(&[
            ("ECHO_SERVER_URL", " https://echo.example.org "),
            ("ECHO_USER", "mika"),
            ("ECHO_PASSWORD", " spaced secret "),
            ("ECHO_SIGNUP", "yes"),
            ("ECHO_TIMELINE_LIMIT", "50"),
            ("ECHO_STREAM_RENEWAL_SECS", "10"),
            ("ECHO_SMOKE_DURATION_SECS", "5"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.server_url, "https://echo.example.org");
        assert_eq!(
            cfg.credentials,
            Some(Credentials {
                username: "mika".to_owned(),
                password: " spaced secret ".to_owned(),
                signup: true,
            })
        );
        assert_eq!(cfg.init_config.timeline_page_size, Some(50));
        assert_eq!(cfg.init_config.stream_renewal_interval_ms, Some(10_000));
        assert_eq!(cfg.duration, Duration::from_secs(5));
    }

    #[test]
    fn rejects_half_configured_credentials() {
        let err = config_from_pairs(&[("ECHO_USER", "mika")])
            .expect_err("user without password should fail");

        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "ECHO_PASSWORD",
                ..
            }
        ));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = config_from_pairs(&[("ECHO_TIMELINE_LIMIT", "abc")])
            .expect_err("invalid limit should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "ECHO_TIMELINE_LIMIT",
                ..
            }
        ));

        let err = config_from_pairs(&[("ECHO_SIGNUP", "maybe")])
            .expect_err("invalid flag should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "ECHO_SIGNUP",
                ..
            }
        ));

        let err = config_from_pairs(&[("ECHO_STREAM_RENEWAL_SECS", "0")])
            .expect_err("zero renewal should fail");
        assert_eq!(err.to_string(), "invalid ECHO_STREAM_RENEWAL_SECS='0': must be at least 1");
    }
}
