//! Layered configuration for numberhub.
//!
//! Values are resolved in order, later layers winning:
//! 1. built-in defaults
//! 2. `numberhub.toml` (or the file passed with `--config`)
//! 3. environment variables, including a `.env` file loaded by the CLI
//! 4. CLI flags, applied by the command handlers
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8000
//! db_path = "numberhub.db"
//! public_url = "https://hub.example.com"
//!
//! [auth]
//! jwt_secret = "long-random-string"
//! token_ttl_minutes = 720
//! admin_username = "admin"
//!
//! [webhook]
//! enforce_signature = true
//! twilio_auth_token = "..."
//!
//! [otp]
//! visibility_minutes = 10
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "numberhub.toml";
pub const DEFAULT_JWT_SECRET: &str = "change-me";

const REDACTED: &str = "********";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub webhook: WebhookSection,
    #[serde(default)]
    pub otp: OtpSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Externally visible base URL, used to rebuild the signed webhook URL
    /// behind a proxy.
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default)]
    pub cors_permissive: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("numberhub.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            public_url: None,
            cors_permissive: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_token_ttl_minutes")]
    pub token_ttl_minutes: i64,
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    #[serde(default)]
    pub admin_password: Option<String>,
    #[serde(default)]
    pub admin_email: Option<String>,
}

fn default_jwt_secret() -> String {
    DEFAULT_JWT_SECRET.to_string()
}

fn default_token_ttl_minutes() -> i64 {
    720
}

fn default_admin_username() -> String {
    "admin".to_string()
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            token_ttl_minutes: default_token_ttl_minutes(),
            admin_username: default_admin_username(),
            admin_password: None,
            admin_email: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSection {
    #[serde(default = "default_enforce_signature")]
    pub enforce_signature: bool,
    #[serde(default)]
    pub twilio_auth_token: Option<String>,
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_enforce_signature() -> bool {
    true
}

fn default_provider() -> String {
    "twilio".to_string()
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            enforce_signature: default_enforce_signature(),
            twilio_auth_token: None,
            provider: default_provider(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpSection {
    #[serde(default = "default_visibility_minutes")]
    pub visibility_minutes: i64,
}

fn default_visibility_minutes() -> i64 {
    10
}

impl Default for OtpSection {
    fn default() -> Self {
        Self {
            visibility_minutes: default_visibility_minutes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::InvalidValue {
                key: "logging.format".into(),
                value: other.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Parse an environment flag. `None` means "leave the previous value".
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Some(true),
        "0" | "false" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `sqlite:///path/to.db` or `sqlite://relative.db` to a filesystem path.
fn sqlite_url_path(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix("sqlite:///").or_else(|| url.strip_prefix("sqlite://"))?;
    if rest.is_empty() {
        return None;
    }
    Some(PathBuf::from(rest))
}

impl HubConfig {
    /// Parse configuration from a TOML file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve the file and environment layers.
    ///
    /// An explicit `path` must exist; otherwise `numberhub.toml` in the working
    /// directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_file(p)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).and_then(non_empty);
        let number = |key: &str| text(key).and_then(|v| v.parse::<i64>().ok());
        let flag = |key: &str| text(key).and_then(|v| parse_bool(&v));

        if let Some(host) = text("NUMBERHUB_HOST") {
            self.server.host = host;
        }
        if let Some(port) = text("NUMBERHUB_PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.server.port = port;
        }
        if let Some(path) = text("DATABASE_URL").and_then(|v| sqlite_url_path(&v)) {
            self.server.db_path = path;
        }
        if let Some(path) = text("NUMBERHUB_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(url) = text("NUMBERHUB_PUBLIC_URL") {
            self.server.public_url = Some(url);
        }

        if let Some(secret) = text("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(ttl) = number("ACCESS_TOKEN_EXPIRE_MINUTES") {
            self.auth.token_ttl_minutes = ttl;
        }
        if let Some(username) = text("ADMIN_USERNAME") {
            self.auth.admin_username = username;
        }
        if let Some(password) = text("ADMIN_PASSWORD") {
            self.auth.admin_password = Some(password);
        }
        if let Some(email) = text("ADMIN_EMAIL") {
            self.auth.admin_email = Some(email);
        }

        if let Some(enforce) = flag("ENFORCE_TWILIO_SIGNATURE") {
            self.webhook.enforce_signature = enforce;
        }
        if let Some(token) = text("TWILIO_AUTH_TOKEN") {
            self.webhook.twilio_auth_token = Some(token);
        }

        if let Some(minutes) = number("OTP_VISIBILITY_MINUTES") {
            self.otp.visibility_minutes = minutes;
        }

        if let Some(level) = text("LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Some(format) = text("LOG_FORMAT").and_then(|v| LogFormat::from_str(&v).ok()) {
            self.logging.format = format;
        }
    }

    pub fn otp_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.otp.visibility_minutes.max(0))
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.auth.jwt_secret == DEFAULT_JWT_SECRET {
            warnings.push("auth.jwt_secret is the built-in default; set JWT_SECRET".to_string());
        }
        if self.auth.token_ttl_minutes <= 0 {
            warnings.push(format!(
                "auth.token_ttl_minutes is {}; issued tokens expire immediately",
                self.auth.token_ttl_minutes
            ));
        }
        if self.webhook.enforce_signature
            && self.webhook.twilio_auth_token.as_deref().unwrap_or("").is_empty()
        {
            warnings.push(
                "webhook.enforce_signature is on but no twilio_auth_token is set; every webhook will be rejected"
                    .to_string(),
            );
        }
        if self.otp.visibility_minutes <= 0 {
            warnings.push(format!(
                "otp.visibility_minutes is {}; OTP codes will never be shown",
                self.otp.visibility_minutes
            ));
        }
        if let Some(url) = &self.server.public_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            warnings.push(format!("server.public_url '{}' should start with http:// or https://", url));
        }

        warnings
    }

    /// TOML rendering with secrets masked, for `config show`.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.auth.jwt_secret != DEFAULT_JWT_SECRET {
            shown.auth.jwt_secret = REDACTED.to_string();
        }
        if shown.auth.admin_password.is_some() {
            shown.auth.admin_password = Some(REDACTED.to_string());
        }
        if shown.webhook.twilio_auth_token.is_some() {
            shown.webhook.twilio_auth_token = Some(REDACTED.to_string());
        }
        toml::to_string_pretty(&shown).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.auth.token_ttl_minutes, 720);
        assert_eq!(config.auth.admin_username, "admin");
        assert!(config.webhook.enforce_signature);
        assert_eq!(config.otp.visibility_minutes, 10);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_parse_partial_toml_keeps_defaults() {
        let config: HubConfig = toml::from_str(
            r#"
            [server]
            port = 9100

            [otp]
            visibility_minutes = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.otp.visibility_minutes, 3);
        assert_eq!(config.auth.token_ttl_minutes, 720);
    }

    #[test]
    fn test_load_file_errors_carry_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            HubConfig::load_file(&missing),
            Err(ConfigError::ReadFailed { .. })
        ));

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[server\nport = ").unwrap();
        match HubConfig::load_file(&broken) {
            Err(ConfigError::ParseFailed { path, .. }) => assert_eq!(path, broken),
            other => panic!("Expected ParseFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = HubConfig::default();
        config.apply_env(env(&[
            ("NUMBERHUB_PORT", "9000"),
            ("JWT_SECRET", "s3cret"),
            ("ACCESS_TOKEN_EXPIRE_MINUTES", "60"),
            ("ENFORCE_TWILIO_SIGNATURE", "no"),
            ("TWILIO_AUTH_TOKEN", "tok"),
            ("OTP_VISIBILITY_MINUTES", "5"),
            ("LOG_FORMAT", "JSON"),
        ]));
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.auth.jwt_secret, "s3cret");
        assert_eq!(config.auth.token_ttl_minutes, 60);
        assert!(!config.webhook.enforce_signature);
        assert_eq!(config.webhook.twilio_auth_token.as_deref(), Some("tok"));
        assert_eq!(config.otp.visibility_minutes, 5);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unparseable_env_keeps_previous_value() {
        let mut config = HubConfig::default();
        config.otp.visibility_minutes = 7;
        config.apply_env(env(&[
            ("NUMBERHUB_PORT", "http"),
            ("OTP_VISIBILITY_MINUTES", "ten"),
            ("ENFORCE_TWILIO_SIGNATURE", "maybe"),
            ("JWT_SECRET", "   "),
        ]));
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.otp.visibility_minutes, 7);
        assert!(config.webhook.enforce_signature);
        assert_eq!(config.auth.jwt_secret, DEFAULT_JWT_SECRET);
    }

    #[test]
    fn test_database_url_and_explicit_path() {
        let mut config = HubConfig::default();
        config.apply_env(env(&[("DATABASE_URL", "sqlite:///data/hub.db")]));
        assert_eq!(config.server.db_path, PathBuf::from("data/hub.db"));

        // NUMBERHUB_DB_PATH wins over DATABASE_URL.
        config.apply_env(env(&[
            ("DATABASE_URL", "sqlite:///data/hub.db"),
            ("NUMBERHUB_DB_PATH", "/var/lib/hub.db"),
        ]));
        assert_eq!(config.server.db_path, PathBuf::from("/var/lib/hub.db"));

        let mut config = HubConfig::default();
        config.apply_env(env(&[("DATABASE_URL", "postgres://db/hub")]));
        assert_eq!(config.server.db_path, default_db_path());
    }

    #[test]
    fn test_parse_bool() {
        for v in ["1", "true", "YES", " y "] {
            assert_eq!(parse_bool(v), Some(true), "{}", v);
        }
        for v in ["0", "false", "No", "n"] {
            assert_eq!(parse_bool(v), Some(false), "{}", v);
        }
        assert_eq!(parse_bool(""), None);
        assert_eq!(parse_bool("on"), None);
    }

    #[test]
    fn test_validate_warnings() {
        let config = HubConfig::default();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("jwt_secret")));
        assert!(warnings.iter().any(|w| w.contains("twilio_auth_token")));

        let mut config = HubConfig::default();
        config.auth.jwt_secret = "x".repeat(32);
        config.webhook.twilio_auth_token = Some("tok".into());
        assert!(config.validate().is_empty());

        config.otp.visibility_minutes = 0;
        config.server.public_url = Some("hub.example.com".into());
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_redacted_toml_masks_secrets() {
        let mut config = HubConfig::default();
        config.auth.jwt_secret = "super-secret".into();
        config.webhook.twilio_auth_token = Some("twilio-token".into());
        let rendered = config.to_redacted_toml().unwrap();
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("twilio-token"));
        assert!(rendered.contains(REDACTED));
    }
}
