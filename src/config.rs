//! Configuration management
//!
//! Loads configuration from config.toml with support for:
//! - Identity provider settings (issuer, audience, JWKS endpoint)
//! - Server binding settings
//! - Redemption token lifetime

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub identity: IdentityConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub redemption: RedemptionConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Identity provider configuration (ID token verification)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Expected `iss` claim of participant ID tokens
    pub issuer: String,
    /// Expected `aud` claim (our channel/client id at the provider)
    pub audience: String,
    /// JWKS endpoint for the provider's public keys
    pub jwks_url: String,
    /// How long fetched keys stay valid in the read-through cache
    #[serde(default = "default_jwks_cache_ttl")]
    pub jwks_cache_ttl_secs: u64,
}

fn default_jwks_cache_ttl() -> u64 {
    3600
}

/// Database configuration (uses DATABASE_URL env var in practice)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    // Database URL is read from the DATABASE_URL environment variable.
    // This section exists for documentation and future extensibility.
}

/// Redemption token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionConfig {
    /// Days from issuance until a redemption token expires
    pub ttl_days: i64,
}

impl Config {
    /// Load from config.toml or use defaults
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load from specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            // Use embedded default config
            toml::from_str(DEFAULT_CONFIG).context("Failed to parse default config")
        }
    }

    /// Get the identity audience (env var takes precedence, required if the
    /// config value is empty)
    pub fn identity_audience(&self) -> Option<String> {
        match std::env::var("IDENTITY_AUDIENCE") {
            Ok(aud) if !aud.is_empty() => Some(aud),
            _ => {
                if self.identity.audience.is_empty() {
                    None
                } else {
                    Some(self.identity.audience.clone())
                }
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        // The embedded default config is validated at compile time,
        // so this should never fail. Using a fallback for robustness.
        toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|_| Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            identity: IdentityConfig {
                issuer: "https://id.example.com".to_string(),
                audience: String::new(),
                jwks_url: "https://id.example.com/.well-known/jwks.json".to_string(),
                jwks_cache_ttl_secs: 3600,
            },
            database: DatabaseConfig::default(),
            redemption: RedemptionConfig { ttl_days: 7 },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_default_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).expect("default config must parse");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.redemption.ttl_days, 7);
        assert_eq!(config.identity.jwks_cache_ttl_secs, 3600);
    }

    #[test]
    fn test_cache_ttl_defaults_when_absent() {
        let config: Config = toml::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9000

            [identity]
            issuer = "https://issuer.test"
            audience = "chan-1"
            jwks_url = "https://issuer.test/jwks"

            [redemption]
            ttl_days = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.identity.jwks_cache_ttl_secs, 3600);
        assert_eq!(config.redemption.ttl_days, 3);
    }
}
