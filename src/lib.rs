//! Background management and renewal of brokerage OAuth2 tokens
//!
//! A trading engine needs a valid access token on every API call, but the
//! brokerage's authorization-code flow requires a human in the loop exactly
//! once. This crate keeps that one interactive login alive indefinitely: the
//! authorization code arriving on the provider redirect is exchanged
//! server-side for a token pair, the pair is persisted durably so it survives
//! restarts, and a background task renews the access token before it expires,
//! rotating the refresh token whenever the provider issues a new one.
//!
//! Consumers hold a [`TokenHandle`] and call [`TokenHandle::valid_token`] at
//! the moment they need to authenticate. The handle returns the cached token
//! when it is outside the refresh margin and otherwise waits on the single
//! in-flight refresh; it never returns a token closer to expiry than the
//! configured lead time. Because most providers invalidate a refresh token on
//! first use, all provider traffic is serialized through one keeper task —
//! concurrent callers can never race two refreshes against each other.
//!
//! Failure handling is explicit end to end. Callers and the `/token/status`
//! endpoint can always distinguish "never authorized" from "refresh in
//! progress" from "locked": after repeated refresh failures the keeper stops
//! trying and reports [`LifecycleState::Locked`] until an operator completes
//! a fresh interactive login, so downstream logic can halt rather than trade
//! on a stale token.
//!
//! # Setting up
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokenkeeper::authority::OAuth2Authority;
//! use tokenkeeper::store::FileTokenStore;
//! use tokenkeeper::{KeeperConfig, TokenKeeper, TokenLifetimeConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = reqwest::Client::builder()
//!     .timeout(std::time::Duration::from_secs(10))
//!     .build()?;
//!
//! let authority = OAuth2Authority::new(
//!     client,
//!     reqwest::Url::parse("https://broker.example.com/v1/oauth/token")?,
//!     reqwest::Url::parse("https://broker.example.com/v1/oauth/authorize")?,
//!     "https://app.example.com/oauth/callback".into(),
//!     tokenkeeper::ClientId::from_static("my-client"),
//!     tokenkeeper::ClientSecret::from_static("hush"),
//!     tokenkeeper::Scope::from_static("accounts trading"),
//! );
//!
//! let store = FileTokenStore::new("tokenkeeper.json".into());
//!
//! let handle = TokenKeeper::spawn(
//!     store,
//!     authority,
//!     TokenLifetimeConfig::default(),
//!     KeeperConfig::default(),
//! )
//! .await?;
//!
//! match handle.valid_token().await {
//!     Ok(token) => tracing::info!(token = format_args!("{:#?}", token), "authenticated"),
//!     Err(err) => tracing::warn!(error = %err, "no token available"),
//! }
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod authority;
pub mod backoff;
mod braids;
pub mod config;
pub mod http;
mod keeper;
pub mod store;
mod tokens;

pub use braids::*;
pub use keeper::{AuthError, KeeperConfig, LifecycleState, TokenHandle, TokenKeeper};
pub use tokens::{TokenLifetimeConfig, TokenRecord, TokenStatus};
