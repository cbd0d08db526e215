//! The HTTP surface: provider callback, manual exchange, and status
//!
//! The callback performs the code exchange server-side immediately; the
//! confirmation pages and the status endpoint never carry the token or the
//! raw code, and all responses are marked uncacheable.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::authority::ExchangeError;
use crate::braids::AuthorizationCode;
use crate::keeper::{LifecycleState, TokenHandle};

/// Shared state for the HTTP handlers
#[derive(Debug)]
pub struct AppState {
    /// Handle to the token keeper
    pub handle: TokenHandle,
    /// The provider authorization URL operators visit to begin login
    pub authorization_url: reqwest::Url,
}

/// Builds the service router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/oauth/login", get(oauth_login))
        .route("/oauth/callback", get(oauth_callback))
        .route("/token/status", get(token_status))
        .route("/token/exchange", post(token_exchange))
        .with_state(state)
}

/// The callback is unauthenticated by nature of the protocol; responses must
/// never be cached by intermediaries.
fn no_store(resp: impl IntoResponse) -> Response {
    let mut resp = resp.into_response();
    resp.headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    resp
}

fn page(title: &str, detail: &str) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{title}</title></head>\n\
         <body><h1>{title}</h1><p>{detail}</p></body>\n</html>"
    ))
}

#[derive(Debug, Serialize)]
struct LoginBody {
    authorization_url: String,
}

async fn oauth_login(State(state): State<Arc<AppState>>) -> Response {
    no_store(Json(LoginBody {
        authorization_url: state.authorization_url.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<AuthorizationCode>,
    error: Option<String>,
}

async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error {
        tracing::warn!(provider_error = %error, "authorization denied by provider");
        return no_store((
            StatusCode::BAD_REQUEST,
            page(
                "Authorization failed",
                &format!("The provider reported an error: {error}"),
            ),
        ));
    }

    let Some(code) = params.code else {
        return no_store((
            StatusCode::BAD_REQUEST,
            page(
                "Authorization failed",
                "The redirect carried neither a code nor an error.",
            ),
        ));
    };

    match state.handle.exchange(code).await {
        Ok(()) => no_store(page(
            "Authorization complete",
            "The token has been stored. You can close this window.",
        )),
        Err(err) => {
            tracing::warn!(error = %err, "callback code exchange failed");
            no_store((
                exchange_status(&err),
                page("Authorization failed", &err.to_string()),
            ))
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusBody {
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_in: Option<u64>,
}

async fn token_status(State(state): State<Arc<AppState>>) -> Response {
    let body = match state.handle.status() {
        LifecycleState::Unauthorized => StatusBody {
            state: "unauthorized",
            expires_in: None,
        },
        LifecycleState::Valid { .. } => StatusBody {
            state: "valid",
            expires_in: state
                .handle
                .current_record()
                .map(|record| record.until_expired_with_clock(&aliri_clock::System).0),
        },
        LifecycleState::RefreshPending => StatusBody {
            state: "refresh_pending",
            expires_in: None,
        },
        LifecycleState::Locked => StatusBody {
            state: "locked",
            expires_in: None,
        },
    };
    no_store(Json(body))
}

#[derive(Debug, Deserialize)]
struct ExchangeBody {
    code: AuthorizationCode,
}

#[derive(Debug, Serialize)]
struct ExchangeOk {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

async fn token_exchange(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExchangeBody>,
) -> Response {
    match state.handle.exchange(body.code).await {
        Ok(()) => no_store(Json(ExchangeOk {
            status: "authorized",
        })),
        Err(err) => {
            tracing::warn!(error = %err, "manual code exchange failed");
            no_store((
                exchange_status(&err),
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            ))
        }
    }
}

fn exchange_status(err: &ExchangeError) -> StatusCode {
    match err {
        ExchangeError::InvalidCode { .. } => StatusCode::BAD_REQUEST,
        ExchangeError::ProviderUnavailable(_) | ExchangeError::MalformedResponse { .. } => {
            StatusCode::BAD_GATEWAY
        }
        ExchangeError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ExchangeError::Terminated => StatusCode::SERVICE_UNAVAILABLE,
    }
}
