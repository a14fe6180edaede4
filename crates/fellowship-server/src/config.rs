//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use fellowship_shared::constants::{APP_NAME, DEFAULT_FREE_DAILY_AI_QUESTIONS};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `None` (platform data directory).
    pub database_path: Option<PathBuf>,

    /// Ed25519 public key of the identity platform (hex-encoded, 64 chars).
    /// Session tokens must be signed by this key.
    /// Env: `IDENTITY_SERVER_PUBKEY`
    /// Default: all-zeros (development only, no token will verify).
    pub identity_server_pubkey: [u8; 32],

    /// Ed25519 public key of the payment server (hex-encoded, 64 chars).
    /// Env: `PAYMENT_SERVER_PUBKEY`
    /// Default: all-zeros (development only).
    pub payment_server_pubkey: [u8; 32],

    /// Assistant questions a user without `unlimited_ai_guide` may ask per
    /// UTC day.
    /// Env: `FREE_DAILY_AI_QUESTIONS`
    /// Default: `5`
    pub free_daily_ai_questions: u32,

    /// Base URL of the AI guide service.
    /// Env: `ASSISTANT_URL`
    /// Default: empty (assistant unavailable).
    pub assistant_url: Option<String>,

    /// Base URL of the billing service.
    /// Env: `BILLING_URL`
    /// Default: empty (checkout unavailable).
    pub billing_url: Option<String>,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Fellowship"`
    pub instance_name: String,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: None,
            identity_server_pubkey: [0u8; 32],
            payment_server_pubkey: [0u8; 32],
            free_daily_ai_questions: DEFAULT_FREE_DAILY_AI_QUESTIONS,
            assistant_url: None,
            billing_url: None,
            instance_name: APP_NAME.to_string(),
            admin_token: None,
        }
    }
}

// The admin token never reaches the logs.
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("identity_server_pubkey", &hex::encode(self.identity_server_pubkey))
            .field("payment_server_pubkey", &hex::encode(self.payment_server_pubkey))
            .field("free_daily_ai_questions", &self.free_daily_ai_questions)
            .field("assistant_url", &self.assistant_url)
            .field("billing_url", &self.billing_url)
            .field("instance_name", &self.instance_name)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = non_empty(var("DATABASE_PATH")) {
            config.database_path = Some(PathBuf::from(path));
        }

        if let Some(hex_key) = var("IDENTITY_SERVER_PUBKEY") {
            match parse_hex_pubkey(&hex_key) {
                Ok(key) => config.identity_server_pubkey = key,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid IDENTITY_SERVER_PUBKEY, using default (dev-only)");
                }
            }
        }

        if let Some(hex_key) = var("PAYMENT_SERVER_PUBKEY") {
            match parse_hex_pubkey(&hex_key) {
                Ok(key) => config.payment_server_pubkey = key,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid PAYMENT_SERVER_PUBKEY, using default (dev-only)");
                }
            }
        }

        if let Some(val) = var("FREE_DAILY_AI_QUESTIONS") {
            match val.parse::<u32>() {
                Ok(n) => config.free_daily_ai_questions = n,
                Err(_) => tracing::warn!(value = %val, "Invalid FREE_DAILY_AI_QUESTIONS, using default"),
            }
        }

        config.assistant_url = non_empty(var("ASSISTANT_URL"));
        config.billing_url = non_empty(var("BILLING_URL"));

        if let Some(name) = non_empty(var("INSTANCE_NAME")) {
            config.instance_name = name;
        }

        config.admin_token = non_empty(var("ADMIN_TOKEN"));

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parse a 64-character hex string into a 32-byte array.
pub fn parse_hex_pubkey(input: &str) -> Result<[u8; 32], String> {
    let input = input.trim();
    if input.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", input.len()));
    }

    let bytes = hex::decode(input).map_err(|e| format!("invalid hex: {e}"))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.payment_server_pubkey, [0u8; 32]);
        assert_eq!(config.free_daily_ai_questions, 5);
        assert_eq!(config.instance_name, APP_NAME);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_reads_variables() {
        let identity = "ab".repeat(32);
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("DATABASE_PATH", "/tmp/fellowship.db"),
            ("IDENTITY_SERVER_PUBKEY", &identity),
            ("FREE_DAILY_AI_QUESTIONS", "12"),
            ("ASSISTANT_URL", "http://guide.local"),
            ("BILLING_URL", "  "),
            ("ADMIN_TOKEN", "s3cret"),
        ]));

        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/fellowship.db")));
        assert_eq!(config.identity_server_pubkey, [0xab; 32]);
        assert_eq!(config.free_daily_ai_questions, 12);
        assert_eq!(config.assistant_url.as_deref(), Some("http://guide.local"));
        assert!(config.billing_url.is_none());
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_debug_redacts_admin_token() {
        let config = ServerConfig::from_lookup(lookup(&[("ADMIN_TOKEN", "s3cret")]));
        let printed = format!("{config:?}");
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("admin_token: Some(\"<redacted>\")"));
        assert!(format!("{:?}", ServerConfig::default()).contains("admin_token: None"));
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("PAYMENT_SERVER_PUBKEY", "abcd"),
            ("FREE_DAILY_AI_QUESTIONS", "-1"),
        ]));
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.payment_server_pubkey, [0u8; 32]);
        assert_eq!(config.free_daily_ai_questions, 5);
    }

    #[test]
    fn test_parse_hex_pubkey() {
        let hex = "ab".repeat(32);
        let key = parse_hex_pubkey(&hex).unwrap();
        assert_eq!(key, [0xab; 32]);
    }

    #[test]
    fn test_parse_hex_pubkey_wrong_length() {
        assert!(parse_hex_pubkey("abcd").is_err());
        assert!(parse_hex_pubkey(&"zz".repeat(32)).is_err());
    }
}
