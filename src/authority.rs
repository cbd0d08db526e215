//! The OAuth2 token authority client
//!
//! Performs the one-time authorization-code exchange and the refresh-token
//! grant against the provider's token endpoint. Client credentials are sent
//! as HTTP Basic authentication and the grant parameters as form data, as the
//! brokerage API requires.

use aliri_clock::DurationSecs;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::braids::{
    AccessToken, AuthorizationCodeRef, ClientId, ClientSecret, RefreshToken, RefreshTokenRef,
    Scope,
};
use crate::store::StorageError;

/// A freshly issued token pair as reported by the provider
///
/// This is the raw result of a token request; the keeper stamps it into a
/// [`TokenRecord`][crate::TokenRecord] with lifetime bookkeeping.
#[derive(Debug)]
pub struct IssuedToken {
    /// The new access token
    pub access_token: AccessToken,
    /// A new refresh token, when the provider rotated it
    pub refresh_token: Option<RefreshToken>,
    /// Seconds until the access token expires
    pub expires_in: DurationSecs,
    /// The scope granted, if reported
    pub scope: Option<Scope>,
}

/// An error exchanging an authorization code for tokens
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The provider rejected the code. Codes are single use, so this is not
    /// retryable; a fresh interactive login is required.
    #[error("authorization code rejected: {reason}")]
    InvalidCode {
        /// What the provider reported
        reason: String,
    },
    /// The provider could not be reached or answered with a server error.
    /// Not retried automatically, since retrying with a consumed code would
    /// itself fail.
    #[error("token provider unavailable")]
    ProviderUnavailable(#[source] reqwest::Error),
    /// The provider answered with a body this client could not understand
    #[error("malformed token response: {detail}")]
    MalformedResponse {
        /// Why decoding failed
        detail: String,
    },
    /// The exchanged token could not be durably persisted
    #[error("failed to persist exchanged token")]
    Storage(#[source] StorageError),
    /// The keeper task has shut down
    #[error("token keeper has terminated")]
    Terminated,
}

/// An error refreshing the access token
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The provider rejected the refresh token
    #[error("refresh token rejected: {reason}")]
    Rejected {
        /// What the provider reported
        reason: String,
    },
    /// The provider could not be reached or answered with a server error
    #[error("token provider unavailable")]
    ProviderUnavailable(#[source] reqwest::Error),
    /// The provider answered with a body this client could not understand
    #[error("malformed token response: {detail}")]
    MalformedResponse {
        /// Why decoding failed
        detail: String,
    },
    /// The refreshed token could not be durably persisted
    #[error("failed to persist refreshed token")]
    Storage(#[source] StorageError),
}

/// An authority that can mint tokens from codes and refresh tokens
#[async_trait]
pub trait TokenAuthority: Send + Sync {
    /// Exchanges a single-use authorization code for an initial token pair
    ///
    /// Performs exactly one network call; the caller decides whether and how
    /// to surface failures.
    async fn exchange_code(&self, code: &AuthorizationCodeRef)
        -> Result<IssuedToken, ExchangeError>;

    /// Obtains a new access token using the refresh token grant
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<IssuedToken, RefreshError>;
}

fn default_expires_in() -> DurationSecs {
    // the brokerage omits expires_in on some responses; its tokens live 3600s
    DurationSecs(3600)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: AccessToken,
    #[serde(default)]
    refresh_token: Option<RefreshToken>,
    #[serde(default = "default_expires_in")]
    expires_in: DurationSecs,
    #[serde(default)]
    scope: Option<Scope>,
}

enum RequestError {
    Denied { status: reqwest::StatusCode, body: String },
    Unavailable(reqwest::Error),
    Malformed { detail: String },
}

/// A [`TokenAuthority`] backed by a real OAuth2 provider over HTTP
#[derive(Debug)]
pub struct OAuth2Authority {
    client: reqwest::Client,
    token_url: reqwest::Url,
    authorize_url: reqwest::Url,
    redirect_uri: String,
    client_id: ClientId,
    client_secret: ClientSecret,
    scope: Scope,
}

impl OAuth2Authority {
    /// Constructs a new authority client
    ///
    /// The provided `client` should carry a bounded request timeout; every
    /// call made through it inherits that bound.
    pub fn new(
        client: reqwest::Client,
        token_url: reqwest::Url,
        authorize_url: reqwest::Url,
        redirect_uri: String,
        client_id: ClientId,
        client_secret: ClientSecret,
        scope: Scope,
    ) -> Self {
        Self {
            client,
            token_url,
            authorize_url,
            redirect_uri,
            client_id,
            client_secret,
            scope,
        }
    }

    /// Builds the provider authorization URL an operator visits to begin the
    /// interactive login flow
    pub fn authorization_url(&self) -> reqwest::Url {
        let mut url = self.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", self.client_id.as_str())
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", self.scope.as_str());
        url
    }

    #[tracing::instrument(
        skip(self, params),
        fields(token_url = %self.token_url, credentials.client_id = %self.client_id),
    )]
    async fn request_token(
        &self,
        grant_type: &str,
        params: &[(&str, &str)],
    ) -> Result<IssuedToken, RequestError> {
        tracing::trace!("requesting token from authority");

        let resp = self
            .client
            .post(self.token_url.clone())
            .basic_auth(self.client_id.as_str(), Some(self.client_secret.as_str()))
            .form(params)
            .send()
            .await
            .map_err(RequestError::Unavailable)?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received token response from authority"
        );

        if let Err(source) = resp.error_for_status_ref() {
            let body = resp.text().await.unwrap_or_default();
            if status.is_client_error() {
                return Err(RequestError::Denied { status, body });
            }
            tracing::warn!(
                response.status = status.as_u16(),
                response.body = %body,
                "authority returned a server error"
            );
            return Err(RequestError::Unavailable(source));
        }

        let body = resp.bytes().await.map_err(RequestError::Unavailable)?;
        let resp: TokenResponse = serde_json::from_slice(&body).map_err(|err| {
            tracing::error!(
                response.status = status.as_u16(),
                response.length = body.len(),
                error = %err,
                "could not decode token response body"
            );
            RequestError::Malformed {
                detail: err.to_string(),
            }
        })?;

        if resp.expires_in.0 == 0 {
            return Err(RequestError::Malformed {
                detail: "expires_in must be positive".into(),
            });
        }

        tracing::info!(
            has_refresh_token = resp.refresh_token.is_some(),
            lifetime = resp.expires_in.0,
            "received new token from authority"
        );

        Ok(IssuedToken {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_in: resp.expires_in,
            scope: resp.scope,
        })
    }
}

#[async_trait]
impl TokenAuthority for OAuth2Authority {
    async fn exchange_code(
        &self,
        code: &AuthorizationCodeRef,
    ) -> Result<IssuedToken, ExchangeError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];

        let issued = self
            .request_token("authorization_code", &params)
            .await
            .map_err(|err| match err {
                RequestError::Denied { status, body } => ExchangeError::InvalidCode {
                    reason: format!("{status}: {body}"),
                },
                RequestError::Unavailable(source) => ExchangeError::ProviderUnavailable(source),
                RequestError::Malformed { detail } => ExchangeError::MalformedResponse { detail },
            })?;

        // the initial grant must establish a refresh token or the background
        // lifecycle can never run
        if issued.refresh_token.is_none() {
            return Err(ExchangeError::MalformedResponse {
                detail: "token response missing refresh_token".into(),
            });
        }

        Ok(issued)
    }

    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<IssuedToken, RefreshError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];

        self.request_token("refresh_token", &params)
            .await
            .map_err(|err| match err {
                RequestError::Denied { status, body } => RefreshError::Rejected {
                    reason: format!("{status}: {body}"),
                },
                RequestError::Unavailable(source) => RefreshError::ProviderUnavailable(source),
                RequestError::Malformed { detail } => RefreshError::MalformedResponse { detail },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> OAuth2Authority {
        OAuth2Authority::new(
            reqwest::Client::new(),
            reqwest::Url::parse("https://broker.example.com/v1/oauth/token").unwrap(),
            reqwest::Url::parse("https://broker.example.com/v1/oauth/authorize").unwrap(),
            "https://app.example.com/oauth/callback".into(),
            ClientId::from_static("my-client"),
            ClientSecret::from_static("hush"),
            Scope::from_static("accounts trading"),
        )
    }

    #[test]
    fn authorization_url_carries_the_expected_parameters() {
        let url = authority().authorization_url();
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert!(query.contains(&("client_id".into(), "my-client".into())));
        assert!(query.contains(&("response_type".into(), "code".into())));
        assert!(query.contains(&("scope".into(), "accounts trading".into())));
        assert!(query.contains(&(
            "redirect_uri".into(),
            "https://app.example.com/oauth/callback".into()
        )));
        assert!(!url.as_str().contains("hush"));
    }

    #[test]
    fn token_response_defaults_expires_in() {
        let resp: TokenResponse =
            serde_json::from_str(r#"{"access_token": "abc", "refresh_token": "def"}"#).unwrap();
        assert_eq!(resp.expires_in, DurationSecs(3600));
        assert_eq!(resp.access_token.as_str(), "abc");
    }
}
