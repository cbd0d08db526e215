//! Runtime configuration
//!
//! Everything is supplied by flags or environment variables and validated at
//! startup; a missing or empty required value aborts before anything binds or
//! dials out.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use aliri_clock::DurationSecs;
use clap::Parser;
use thiserror::Error;

use crate::backoff::ErrorBackoffConfig;
use crate::keeper::KeeperConfig;
use crate::tokens::TokenLifetimeConfig;

/// Service configuration
#[derive(Debug, Parser)]
#[command(name = "tokenkeeper", version, about)]
pub struct Config {
    /// The OAuth client ID issued by the brokerage
    #[arg(long, env = "TOKENKEEPER_CLIENT_ID")]
    pub client_id: String,

    /// The OAuth client secret
    #[arg(long, env = "TOKENKEEPER_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: String,

    /// The provider's token endpoint
    #[arg(long, env = "TOKENKEEPER_TOKEN_URL")]
    pub token_url: reqwest::Url,

    /// The provider's authorization endpoint
    #[arg(long, env = "TOKENKEEPER_AUTHORIZE_URL")]
    pub authorize_url: reqwest::Url,

    /// The redirect URI registered with the provider
    #[arg(long, env = "TOKENKEEPER_REDIRECT_URI")]
    pub redirect_uri: String,

    /// The scopes to request
    #[arg(long, env = "TOKENKEEPER_SCOPE", default_value = "accounts trading")]
    pub scope: String,

    /// Where the token record is persisted
    #[arg(
        long,
        env = "TOKENKEEPER_TOKEN_FILE",
        default_value = "tokenkeeper.json"
    )]
    pub token_file: PathBuf,

    /// Listen address for the HTTP surface
    #[arg(long, env = "TOKENKEEPER_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Seconds before expiry at which a proactive refresh is triggered
    #[arg(long, env = "TOKENKEEPER_REFRESH_LEAD_SECS", default_value_t = 300)]
    pub refresh_lead_secs: u64,

    /// Initial delay after a failed refresh, in milliseconds
    #[arg(long, env = "TOKENKEEPER_BACKOFF_INITIAL_MS", default_value_t = 1_000)]
    pub backoff_initial_ms: u64,

    /// Ceiling on the backoff delay, in milliseconds
    #[arg(long, env = "TOKENKEEPER_BACKOFF_MAX_MS", default_value_t = 60_000)]
    pub backoff_max_ms: u64,

    /// Factor applied to the backoff delay after each consecutive failure;
    /// 1 keeps the delay constant
    #[arg(long, env = "TOKENKEEPER_BACKOFF_MULTIPLIER", default_value_t = 2)]
    pub backoff_multiplier: u64,

    /// Consecutive refresh failures tolerated before locking
    #[arg(long, env = "TOKENKEEPER_MAX_FAILURES", default_value_t = 5)]
    pub max_consecutive_failures: u32,

    /// Timeout for calls to the provider, in seconds
    #[arg(long, env = "TOKENKEEPER_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub request_timeout_secs: u64,
}

/// A configuration value that cannot be used
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required value was supplied but empty
    #[error("{name} must not be empty")]
    Empty {
        /// The offending setting
        name: &'static str,
    },
    /// The redirect URI is not a valid URL
    #[error("redirect URI is not a valid URL")]
    BadRedirectUri(#[source] url::ParseError),
    /// The failure limit would lock on the first failure's success path
    #[error("max consecutive failures must be at least 1")]
    ZeroFailureLimit,
    /// A zero multiplier would collapse every retry delay to zero
    #[error("backoff multiplier must be at least 1")]
    ZeroBackoffMultiplier,
}

impl Config {
    /// Checks invariants clap cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Empty { name: "client ID" });
        }
        if self.client_secret.is_empty() {
            return Err(ConfigError::Empty {
                name: "client secret",
            });
        }
        reqwest::Url::parse(&self.redirect_uri).map_err(ConfigError::BadRedirectUri)?;
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::ZeroFailureLimit);
        }
        if self.backoff_multiplier == 0 {
            return Err(ConfigError::ZeroBackoffMultiplier);
        }
        Ok(())
    }

    /// The lifetime configuration for stamping new records
    pub fn lifetime(&self) -> TokenLifetimeConfig {
        TokenLifetimeConfig::new(DurationSecs(self.refresh_lead_secs), DurationSecs(30))
    }

    /// The keeper's failure-handling configuration
    pub fn keeper(&self) -> KeeperConfig {
        KeeperConfig {
            backoff: ErrorBackoffConfig::new(
                Duration::from_millis(self.backoff_initial_ms),
                Duration::from_millis(self.backoff_max_ms),
                self.backoff_multiplier,
            ),
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    /// The timeout applied to every provider call
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
