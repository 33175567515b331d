use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use zeroize::Zeroize;

pub mod cors;
pub mod security;

pub use cors::create_cors_layer;
pub use security::create_security_headers_layer;

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/ticket_gate";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set to a non-empty value")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// HMAC key used to sign ticket credentials.
#[derive(Clone)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, ConfigError> {
        let bytes = secret.into();
        if bytes.is_empty() {
            return Err(ConfigError::Missing("QR_SIGNING_SECRET"));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(**redacted**)")
    }
}

impl Drop for SigningSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            _ => Err(()),
        }
    }
}

/// Tunables consumed by the scan engine.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub idempotency_window: Duration,
    pub duplicate_grace: Duration,
    pub store_timeout: Duration,
    pub device_rate_limit: u32,
    pub batch_max_items: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            idempotency_window: Duration::from_secs(300),
            duplicate_grace: Duration::from_secs(10),
            store_timeout: Duration::from_millis(250),
            device_rate_limit: 10,
            batch_max_items: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub store_backend: StoreBackend,
    pub signing_secret: SigningSecret,
    pub scan: ScanSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let signing_secret = env::var("QR_SIGNING_SECRET")
            .map_err(|_| ConfigError::Missing("QR_SIGNING_SECRET"))
            .and_then(SigningSecret::new)?;

        let defaults = ScanSettings::default();
        let scan = ScanSettings {
            idempotency_window: Duration::from_secs(parse_var(
                "SCAN_IDEMPOTENCY_WINDOW_SECS",
                defaults.idempotency_window.as_secs(),
            )?),
            duplicate_grace: Duration::from_secs(parse_var(
                "SCAN_DUPLICATE_GRACE_SECS",
                defaults.duplicate_grace.as_secs(),
            )?),
            store_timeout: Duration::from_millis(parse_var(
                "SCAN_STORE_TIMEOUT_MS",
                defaults.store_timeout.as_millis() as u64,
            )?),
            device_rate_limit: parse_var("SCAN_DEVICE_RATE_LIMIT", defaults.device_rate_limit)?,
            batch_max_items: parse_var("SCAN_BATCH_MAX_ITEMS", defaults.batch_max_items)?,
        };

        if scan.device_rate_limit == 0 {
            return Err(ConfigError::Invalid {
                name: "SCAN_DEVICE_RATE_LIMIT",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            bind_addr: parse_var("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3001)))?,
            store_backend: match env::var("STORE") {
                Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
                    name: "STORE",
                    value,
                })?,
                Err(_) => StoreBackend::Postgres,
            },
            signing_secret,
            scan,
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_secret_is_rejected() {
        assert!(matches!(
            SigningSecret::new(Vec::new()),
            Err(ConfigError::Missing("QR_SIGNING_SECRET"))
        ));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SigningSecret::new("hunter2").unwrap();
        assert_eq!(format!("{:?}", secret), "SigningSecret(**redacted**)");
    }

    #[test]
    fn test_parse_var_falls_back_to_default() {
        std::env::remove_var("TICKET_GATE_TEST_UNSET");
        assert_eq!(parse_var("TICKET_GATE_TEST_UNSET", 42u32).unwrap(), 42);
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        std::env::set_var("TICKET_GATE_TEST_GARBAGE", "ten");
        assert!(parse_var::<u32>("TICKET_GATE_TEST_GARBAGE", 1).is_err());
        std::env::remove_var("TICKET_GATE_TEST_GARBAGE");
    }

    #[test]
    fn test_store_backend_parsing() {
        assert_eq!("memory".parse::<StoreBackend>(), Ok(StoreBackend::Memory));
        assert_eq!("Postgres".parse::<StoreBackend>(), Ok(StoreBackend::Postgres));
        assert!("redis".parse::<StoreBackend>().is_err());
    }
}
