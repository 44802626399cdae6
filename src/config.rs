//! Configuration types, built once from the environment at startup.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default system instruction for the rewrite step.
pub const DEFAULT_LLM_PROMPT: &str = "You are an email assistant. Summarize the following email \
     concisely in the language it was written in. Keep names, dates, amounts and action items. \
     Output plain text only.";

/// Default subject marker for forwarded mail.
pub const DEFAULT_FORWARD_MARKER: &str = "[EmailLLM]";

/// Which mechanism wakes the worker up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Fixed-interval polling.
    Poll,
    /// IMAP IDLE push notifications.
    Idle,
}

/// IMAP source mailbox.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub folder: String,
}

/// SMTP submission settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    /// Implicit-TLS port tried first.
    pub port: u16,
    /// STARTTLS port used when the implicit-TLS connection cannot be established.
    pub starttls_port: u16,
    pub username: String,
    pub password: SecretString,
    /// Envelope and header sender.
    pub from_address: String,
    /// Where every forwarded message goes.
    pub destination: String,
}

/// Optional LLM rewrite step.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub enabled: bool,
    pub prompt: String,
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

/// Scheduling of the worker loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub trigger: TriggerMode,
    pub check_interval: Duration,
    pub idle_timeout: Duration,
    pub reconnect_delay: Duration,
    pub forward_marker: String,
}

/// Log output.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

/// Full forwarder configuration.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub mailbox: MailboxConfig,
    pub relay: RelayConfig,
    pub transform: TransformConfig,
    pub scheduler: SchedulerConfig,
    pub log: LogConfig,
}

impl ForwarderConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let imap_host = required("SOURCE_IMAP_SERVER")?;
        let imap_port = parse_or(get("SOURCE_IMAP_PORT"), "SOURCE_IMAP_PORT", 993_u16)?;
        let username = required("SOURCE_EMAIL")?;
        let password = required("SOURCE_PASSWORD")?;
        let folder = get("SOURCE_FOLDER").unwrap_or_else(|| "INBOX".to_string());

        let smtp_host = get("SMTP_SERVER").unwrap_or_else(|| imap_host.replace("imap", "smtp"));
        let smtp_port = parse_or(get("SMTP_PORT"), "SMTP_PORT", 465_u16)?;
        let starttls_port = parse_or(get("SMTP_STARTTLS_PORT"), "SMTP_STARTTLS_PORT", 587_u16)?;
        let smtp_user = get("SMTP_USER").unwrap_or_else(|| username.clone());
        let smtp_password = get("SMTP_PASSWORD").unwrap_or_else(|| password.clone());
        let destination = required("TARGET_EMAIL")?;

        let check_interval = parse_or(get("CHECK_INTERVAL"), "CHECK_INTERVAL", 60_u64)?;
        if check_interval == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHECK_INTERVAL".into(),
                message: "must be greater than zero".into(),
            });
        }

        let trigger = match get("TRIGGER_MODE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("poll") => TriggerMode::Poll,
            Some("idle") => TriggerMode::Idle,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "TRIGGER_MODE".into(),
                    message: format!("expected 'poll' or 'idle', got '{other}'"),
                });
            }
        };
        let idle_timeout = parse_or(get("IDLE_TIMEOUT_SECS"), "IDLE_TIMEOUT_SECS", 29 * 60_u64)?;
        let reconnect_delay = parse_or(get("RECONNECT_DELAY_SECS"), "RECONNECT_DELAY_SECS", 5_u64)?;

        let llm_enabled = parse_bool(get("LLM_ENABLED"), "LLM_ENABLED")?;
        let api_key = get("OPENAI_API_KEY").map(SecretString::from);
        if llm_enabled && api_key.is_none() {
            return Err(ConfigError::MissingEnvVar("OPENAI_API_KEY".into()));
        }
        let llm_timeout = parse_or(get("LLM_TIMEOUT_SECS"), "LLM_TIMEOUT_SECS", 60_u64)?;

        Ok(Self {
            mailbox: MailboxConfig {
                host: imap_host,
                port: imap_port,
                username: username.clone(),
                password: SecretString::from(password),
                folder,
            },
            relay: RelayConfig {
                host: smtp_host,
                port: smtp_port,
                starttls_port,
                username: smtp_user,
                password: SecretString::from(smtp_password),
                from_address: username,
                destination,
            },
            transform: TransformConfig {
                enabled: llm_enabled,
                prompt: get("LLM_PROMPT").unwrap_or_else(|| DEFAULT_LLM_PROMPT.to_string()),
                api_key,
                base_url: get("OPENAI_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                model: get("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                timeout: Duration::from_secs(llm_timeout),
            },
            scheduler: SchedulerConfig {
                trigger,
                check_interval: Duration::from_secs(check_interval),
                idle_timeout: Duration::from_secs(idle_timeout),
                reconnect_delay: Duration::from_secs(reconnect_delay),
                forward_marker: get("FORWARD_MARKER")
                    .unwrap_or_else(|| DEFAULT_FORWARD_MARKER.to_string()),
            },
            log: LogConfig {
                level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
                file: get("LOG_FILE").map(PathBuf::from),
            },
        })
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}

fn parse_bool(value: Option<String>, key: &str) -> Result<bool, ConfigError> {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{other}' is not a boolean"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const MINIMAL: &[(&str, &str)] = &[
        ("SOURCE_IMAP_SERVER", "imap.example.com"),
        ("SOURCE_EMAIL", "bot@example.com"),
        ("SOURCE_PASSWORD", "hunter2"),
        ("TARGET_EMAIL", "me@example.org"),
    ];

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = ForwarderConfig::from_lookup(lookup(MINIMAL)).unwrap();
        assert_eq!(cfg.mailbox.port, 993);
        assert_eq!(cfg.mailbox.folder, "INBOX");
        assert_eq!(cfg.relay.host, "smtp.example.com");
        assert_eq!(cfg.relay.port, 465);
        assert_eq!(cfg.relay.starttls_port, 587);
        assert_eq!(cfg.scheduler.trigger, TriggerMode::Poll);
        assert_eq!(cfg.scheduler.check_interval, Duration::from_secs(60));
        assert_eq!(cfg.scheduler.forward_marker, "[EmailLLM]");
        assert!(!cfg.transform.enabled);
        assert!(cfg.log.file.is_none());
    }

    #[test]
    fn relay_credentials_fall_back_to_mailbox() {
        let cfg = ForwarderConfig::from_lookup(lookup(MINIMAL)).unwrap();
        assert_eq!(cfg.relay.username, "bot@example.com");
        assert_eq!(cfg.relay.password.expose_secret(), "hunter2");
        assert_eq!(cfg.relay.from_address, "bot@example.com");
    }

    #[test]
    fn relay_credentials_override() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("SMTP_SERVER", "mail.other.net"));
        pairs.push(("SMTP_PASSWORD", "app-specific"));
        let cfg = ForwarderConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(cfg.relay.host, "mail.other.net");
        assert_eq!(cfg.relay.password.expose_secret(), "app-specific");
    }

    #[test]
    fn missing_target_is_reported() {
        let pairs: Vec<_> = MINIMAL
            .iter()
            .copied()
            .filter(|(k, _)| *k != "TARGET_EMAIL")
            .collect();
        let err = ForwarderConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "TARGET_EMAIL"));
    }

    #[test]
    fn invalid_port_is_reported() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("SOURCE_IMAP_PORT", "not-a-port"));
        let err = ForwarderConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SOURCE_IMAP_PORT"));
    }

    #[test]
    fn zero_interval_rejected() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("CHECK_INTERVAL", "0"));
        assert!(ForwarderConfig::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn llm_enabled_requires_api_key() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("LLM_ENABLED", "true"));
        let err = ForwarderConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "OPENAI_API_KEY"));

        pairs.push(("OPENAI_API_KEY", "sk-test"));
        pairs.push(("OPENAI_BASE_URL", "https://llm.internal/v1/"));
        let cfg = ForwarderConfig::from_lookup(lookup(&pairs)).unwrap();
        assert!(cfg.transform.enabled);
        assert_eq!(cfg.transform.base_url, "https://llm.internal/v1");
    }

    #[test]
    fn idle_trigger_mode() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("TRIGGER_MODE", "IDLE"));
        let cfg = ForwarderConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(cfg.scheduler.trigger, TriggerMode::Idle);
        assert_eq!(cfg.scheduler.idle_timeout, Duration::from_secs(29 * 60));

        let mut bad = MINIMAL.to_vec();
        bad.push(("TRIGGER_MODE", "push"));
        assert!(ForwarderConfig::from_lookup(lookup(&bad)).is_err());
    }

    #[test]
    fn blank_values_count_as_unset() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("SMTP_PASSWORD", "   "));
        let cfg = ForwarderConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(cfg.relay.password.expose_secret(), "hunter2");
    }
}
