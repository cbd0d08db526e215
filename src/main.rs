use std::sync::Arc;

use clap::Parser;
use tokenkeeper::authority::OAuth2Authority;
use tokenkeeper::config::Config;
use tokenkeeper::http::{build_router, AppState};
use tokenkeeper::store::FileTokenStore;
use tokenkeeper::TokenKeeper;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let client = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()?;

    let authority = OAuth2Authority::new(
        client,
        config.token_url.clone(),
        config.authorize_url.clone(),
        config.redirect_uri.clone(),
        config.client_id.clone().into(),
        config.client_secret.clone().into(),
        config.scope.clone().into(),
    );
    let authorization_url = authority.authorization_url();

    let store = FileTokenStore::new(config.token_file.clone());

    let handle =
        TokenKeeper::spawn(store, authority, config.lifetime(), config.keeper()).await?;

    let state = Arc::new(AppState {
        handle,
        authorization_url,
    });

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!(listen = %config.listen, "serving");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "unable to listen for the shutdown signal");
    }
}
