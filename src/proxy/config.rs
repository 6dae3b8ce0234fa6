use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::constants;
use crate::error::{ProxyError, ProxyResult};

// Immutable runtime configuration, resolved once at startup and passed to
// the pool, updater and router constructors.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    // Strict mode checks client keys against this value; ignored when
    // `allow_any_api_key` is set.
    pub valid_api_key: String,
    pub allow_any_api_key: bool,
    pub upstream_chat_url: String,
    pub upstream_login_url: String,
    pub upstream_model_id: String,
    // When set, every client model string maps to `upstream_model_id`.
    pub model_override: bool,
    pub tokens_file: PathBuf,
    pub accounts_file: PathBuf,
    pub max_token_failures: u32,
    pub enable_token_auto_update: bool,
    pub token_update_interval: Duration,
    pub tool_support: bool,
    pub scan_limit: usize,
    pub output_thinking: bool,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub debug_logging: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            valid_api_key: String::new(),
            allow_any_api_key: true,
            upstream_chat_url: constants::DEFAULT_CHAT_URL.to_string(),
            upstream_login_url: constants::DEFAULT_LOGIN_URL.to_string(),
            upstream_model_id: constants::DEFAULT_MODEL_ID.to_string(),
            model_override: true,
            tokens_file: PathBuf::from("tokens.txt"),
            accounts_file: PathBuf::from("accounts.txt"),
            max_token_failures: 3,
            enable_token_auto_update: false,
            token_update_interval: Duration::from_secs(3600),
            tool_support: true,
            scan_limit: 200_000,
            output_thinking: true,
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            debug_logging: false,
        }
    }
}

pub fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(name: &str, current: bool) -> bool {
    match env_string(name) {
        Some(raw) => match parse_env_bool(&raw) {
            Some(parsed) => parsed,
            None => {
                warn!("Ignoring invalid boolean for {}: {}", name, raw);
                current
            }
        },
        None => current,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, current: T) -> T {
    match env_string(name) {
        Some(raw) => match raw.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Ignoring invalid value for {}: {}", name, raw);
                current
            }
        },
        None => current,
    }
}

impl ProxyConfig {
    pub fn from_env() -> ProxyResult<Self> {
        let mut config = Self::default();

        if let Some(host) = env_string("HOST") {
            config.host = host;
        }
        config.port = env_parse("PORT", config.port);
        if let Some(key) = env_string("VALID_API_KEY") {
            config.valid_api_key = key;
            config.allow_any_api_key = false;
        }
        config.allow_any_api_key = env_bool("ALLOW_ANY_API_KEY", config.allow_any_api_key);
        if let Some(url) = env_string("K2THINK_API_URL") {
            config.upstream_chat_url = url;
        }
        if let Some(url) = env_string("K2THINK_LOGIN_URL") {
            config.upstream_login_url = url;
        }
        if let Some(model) = env_string("UPSTREAM_MODEL_ID") {
            config.upstream_model_id = model;
        }
        config.model_override = env_bool("MODEL_OVERRIDE", config.model_override);
        if let Some(path) = env_string("TOKENS_FILE") {
            config.tokens_file = PathBuf::from(path);
        }
        if let Some(path) = env_string("ACCOUNTS_FILE") {
            config.accounts_file = PathBuf::from(path);
        }
        config.max_token_failures = env_parse("MAX_TOKEN_FAILURES", config.max_token_failures);
        config.enable_token_auto_update =
            env_bool("ENABLE_TOKEN_AUTO_UPDATE", config.enable_token_auto_update);
        let interval_secs = env_parse(
            "TOKEN_UPDATE_INTERVAL",
            config.token_update_interval.as_secs(),
        );
        config.token_update_interval = Duration::from_secs(interval_secs);
        config.tool_support = env_bool("TOOL_SUPPORT", config.tool_support);
        config.scan_limit = env_parse("SCAN_LIMIT", config.scan_limit);
        config.output_thinking = env_bool("OUTPUT_THINKING", config.output_thinking);
        let timeout_secs = env_parse("REQUEST_TIMEOUT", config.request_timeout.as_secs());
        config.request_timeout = Duration::from_secs(timeout_secs);
        config.debug_logging = env_bool("DEBUG_LOGGING", config.debug_logging);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ProxyResult<()> {
        if self.port == 0 {
            return Err(ProxyError::Config("PORT must be non-zero".to_string()));
        }
        if self.upstream_chat_url.is_empty() {
            return Err(ProxyError::Config(
                "K2THINK_API_URL must not be empty".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ProxyError::Config(
                "REQUEST_TIMEOUT must be greater than zero".to_string(),
            ));
        }
        if !self.allow_any_api_key && self.valid_api_key.is_empty() {
            return Err(ProxyError::Config(
                "strict auth requires VALID_API_KEY (or set ALLOW_ANY_API_KEY=true)".to_string(),
            ));
        }
        if self.enable_token_auto_update {
            if self.upstream_login_url.is_empty() {
                return Err(ProxyError::Config(
                    "token auto-update requires K2THINK_LOGIN_URL".to_string(),
                ));
            }
            if !self.accounts_file.exists() {
                return Err(ProxyError::Config(format!(
                    "token auto-update enabled but accounts file {} does not exist",
                    self.accounts_file.display()
                )));
            }
        }

        if !self.tokens_file.exists() {
            if self.enable_token_auto_update {
                // The updater will populate this file after the first login
                // round; start from an empty pool.
                info!(
                    "Tokens file {} missing, creating empty file for auto-update",
                    self.tokens_file.display()
                );
                std::fs::write(&self.tokens_file, "# populated by the token updater\n").map_err(
                    |e| {
                        ProxyError::Config(format!(
                            "cannot create tokens file {}: {}",
                            self.tokens_file.display(),
                            e
                        ))
                    },
                )?;
            } else {
                return Err(ProxyError::Config(format!(
                    "tokens file {} does not exist (create it or enable ENABLE_TOKEN_AUTO_UPDATE)",
                    self.tokens_file.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_bool_accepts_common_spellings() {
        assert_eq!(parse_env_bool("true"), Some(true));
        assert_eq!(parse_env_bool("ON"), Some(true));
        assert_eq!(parse_env_bool("0"), Some(false));
        assert_eq!(parse_env_bool("maybe"), None);
    }

    #[test]
    fn strict_auth_without_key_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tokens = dir.path().join("tokens.txt");
        std::fs::write(&tokens, "tok-a\n").expect("write tokens");

        let config = ProxyConfig {
            allow_any_api_key: false,
            valid_api_key: String::new(),
            tokens_file: tokens,
            ..ProxyConfig::default()
        };
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn missing_tokens_file_is_fatal_without_auto_update() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ProxyConfig {
            tokens_file: dir.path().join("absent.txt"),
            enable_token_auto_update: false,
            ..ProxyConfig::default()
        };
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn missing_tokens_file_is_created_when_auto_update_enabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tokens = dir.path().join("tokens.txt");
        let accounts = dir.path().join("accounts.txt");
        std::fs::write(&accounts, "{\"email\":\"a@b\",\"password\":\"p\"}\n")
            .expect("write accounts");

        let config = ProxyConfig {
            tokens_file: tokens.clone(),
            accounts_file: accounts,
            enable_token_auto_update: true,
            ..ProxyConfig::default()
        };
        config.validate().expect("validate");
        assert!(tokens.exists());
    }
}
