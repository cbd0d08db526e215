//! Background keeper of the token lifecycle
//!
//! A single actor task owns the token store and the authority client. Every
//! operation that touches the provider or the store (code exchange, scheduled
//! refresh, on-demand refresh) runs inside the actor, so at most one provider
//! call is in flight at any time and store writes never interleave. Callers
//! hold a cheap [`TokenHandle`] that reads published state over `watch`
//! channels, so health checks and token reads never wait on the wire.

use std::sync::Arc;

use aliri_clock::{Clock, DurationSecs, System, UnixTime};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::authority::{ExchangeError, RefreshError, TokenAuthority};
use crate::backoff::{ErrorBackoffConfig, ErrorBackoffHandler};
use crate::braids::{AccessToken, AuthorizationCode};
use crate::store::{StorageError, TokenStore};
use crate::tokens::{TokenLifetimeConfig, TokenRecord, TokenStatus};

/// The externally visible lifecycle state, published over a watch channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// No token has ever been persisted; the interactive login flow must be
    /// completed before any token can be served
    Unauthorized,
    /// A token is held and outside the refresh margin
    Valid {
        /// When the held token expires
        expiry: UnixTime,
    },
    /// A refresh is in flight or backing off after a failure
    RefreshPending,
    /// Refreshing has failed repeatedly; no further automatic attempts will
    /// be made until a fresh authorization code is exchanged
    Locked,
}

/// An error obtaining a currently valid access token
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token has ever been authorized
    #[error("not authorized; complete the interactive login flow")]
    NotAuthorized,
    /// The keeper is locked after repeated refresh failures
    #[error("token lifecycle is locked; re-authorization required")]
    Locked,
    /// The token is due for refresh and the refresh is currently failing
    #[error("token refresh failed: {reason}")]
    RefreshFailed {
        /// The most recent refresh failure
        reason: String,
    },
    /// The keeper task has shut down
    #[error("token keeper has terminated")]
    Terminated,
}

/// Tuning for the keeper's failure handling
#[derive(Clone, Debug)]
pub struct KeeperConfig {
    /// Backoff applied between failed refresh attempts
    pub backoff: ErrorBackoffConfig,
    /// Consecutive refresh failures tolerated before locking
    pub max_consecutive_failures: u32,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            backoff: ErrorBackoffConfig::default(),
            max_consecutive_failures: 5,
        }
    }
}

enum Command {
    EnsureFresh {
        reply: oneshot::Sender<Result<AccessToken, AuthError>>,
    },
    Exchange {
        code: AuthorizationCode,
        reply: oneshot::Sender<Result<(), ExchangeError>>,
    },
}

/// A cloneable handle for obtaining valid tokens and lifecycle state
#[derive(Clone, Debug)]
pub struct TokenHandle<C = System> {
    token_rx: watch::Receiver<Option<Arc<TokenRecord>>>,
    state_rx: watch::Receiver<LifecycleState>,
    cmd_tx: mpsc::Sender<Command>,
    clock: C,
}

impl<C: Clock> TokenHandle<C> {
    /// Returns an access token whose remaining lifetime exceeds the
    /// configured refresh margin
    ///
    /// If the held token is fresh this returns immediately without contacting
    /// the keeper. Otherwise the keeper refreshes on demand; callers arriving
    /// while a refresh is already in flight await that refresh's outcome
    /// rather than triggering another provider call. There is no stale-token
    /// fallback: when the refresh fails, so does this call.
    pub async fn valid_token(&self) -> Result<AccessToken, AuthError> {
        {
            let now = self.clock.now();
            let borrowed = self.token_rx.borrow();
            if let Some(record) = &*borrowed {
                if matches!(record.token_status_at(now), TokenStatus::Fresh) {
                    return Ok(record.access_token().to_owned());
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::EnsureFresh { reply: tx })
            .await
            .map_err(|_| AuthError::Terminated)?;
        rx.await.map_err(|_| AuthError::Terminated)?
    }

    /// Exchanges a single-use authorization code, replacing any held token
    ///
    /// On success the new record has been durably persisted before this
    /// returns. A locked keeper is unlocked by a successful exchange.
    pub async fn exchange(&self, code: AuthorizationCode) -> Result<(), ExchangeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Exchange { code, reply: tx })
            .await
            .map_err(|_| ExchangeError::Terminated)?;
        rx.await.map_err(|_| ExchangeError::Terminated)?
    }

    /// The current lifecycle state
    pub fn status(&self) -> LifecycleState {
        self.state_rx.borrow().clone()
    }

    /// The currently held token record, fresh or not
    pub fn current_record(&self) -> Option<Arc<TokenRecord>> {
        self.token_rx.borrow().clone()
    }
}

#[derive(Clone, Copy)]
enum Wake {
    /// Sleep until the held token goes stale
    Stale(UnixTime),
    /// Sleep until the backoff deadline, then retry the refresh
    Backoff(Instant),
}

/// The actor that owns the store and authority and runs the refresh loop
///
/// Constructed and spawned via [`TokenKeeper::spawn`]; all interaction goes
/// through the returned [`TokenHandle`]. The task exits when every handle has
/// been dropped.
#[derive(Debug)]
pub struct TokenKeeper<S, P, C = System> {
    store: S,
    authority: P,
    lifetime: TokenLifetimeConfig<C>,
    backoff: ErrorBackoffHandler,
    max_consecutive_failures: u32,
    clock: C,
    current: Option<Arc<TokenRecord>>,
    /// A refreshed record that failed to persist; saved before anything else
    /// on the next attempt, since the provider may have already invalidated
    /// the prior refresh token
    unsaved: Option<Arc<TokenRecord>>,
    locked: bool,
    next_retry: Option<Instant>,
    last_error: Option<String>,
    last_code: Option<AuthorizationCode>,
    token_tx: watch::Sender<Option<Arc<TokenRecord>>>,
    state_tx: watch::Sender<LifecycleState>,
}

impl<S, P> TokenKeeper<S, P, System>
where
    S: TokenStore + 'static,
    P: TokenAuthority + 'static,
{
    /// Spawns a keeper using the system clock
    ///
    /// Loads any previously persisted record so that authorization survives a
    /// restart. A load failure is surfaced here, at startup, rather than at
    /// first use.
    pub async fn spawn(
        store: S,
        authority: P,
        lifetime: TokenLifetimeConfig,
        config: KeeperConfig,
    ) -> Result<TokenHandle, StorageError> {
        Self::spawn_with_clock(store, authority, lifetime, config, System).await
    }
}

impl<S, P, C> TokenKeeper<S, P, C>
where
    S: TokenStore + 'static,
    P: TokenAuthority + 'static,
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Spawns a keeper using the given clock
    pub async fn spawn_with_clock(
        mut store: S,
        authority: P,
        lifetime: TokenLifetimeConfig<C>,
        config: KeeperConfig,
        clock: C,
    ) -> Result<TokenHandle<C>, StorageError> {
        let current = store.load().await?.map(Arc::new);

        let initial_state = match &current {
            Some(record) => {
                tracing::info!(
                    expiry = record.expiry().0,
                    "loaded persisted token record"
                );
                LifecycleState::Valid {
                    expiry: record.expiry(),
                }
            }
            None => {
                tracing::info!("no persisted token record; awaiting authorization");
                LifecycleState::Unauthorized
            }
        };

        let (token_tx, token_rx) = watch::channel(current.clone());
        let (state_tx, state_rx) = watch::channel(initial_state);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let keeper = TokenKeeper {
            store,
            authority,
            lifetime,
            backoff: ErrorBackoffHandler::new(config.backoff),
            max_consecutive_failures: config.max_consecutive_failures,
            clock: clock.clone(),
            current,
            unsaved: None,
            locked: false,
            next_retry: None,
            last_error: None,
            last_code: None,
            token_tx,
            state_tx,
        };

        tokio::spawn(keeper.run(cmd_rx));

        Ok(TokenHandle {
            token_rx,
            state_rx,
            cmd_tx,
            clock,
        })
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            let wake = self.next_wake();
            let clock = self.clock.clone();

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        tracing::info!("all token handles dropped, stopping keeper");
                        return;
                    }
                },
                _ = wait_for(wake, clock) => {
                    tracing::debug!("refresh timer fired");
                    let _ = self.refresh_once().await;
                }
            }
        }
    }

    fn next_wake(&self) -> Option<Wake> {
        if self.locked {
            return None;
        }
        if let Some(deadline) = self.next_retry {
            return Some(Wake::Backoff(deadline));
        }
        self.current.as_ref().map(|record| Wake::Stale(record.stale()))
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::EnsureFresh { reply } => {
                let _ = reply.send(self.ensure_fresh().await);
            }
            Command::Exchange { code, reply } => {
                let _ = reply.send(self.exchange(code).await);
            }
        }
    }

    async fn ensure_fresh(&mut self) -> Result<AccessToken, AuthError> {
        if self.locked {
            return Err(AuthError::Locked);
        }
        let Some(record) = &self.current else {
            return Err(AuthError::NotAuthorized);
        };

        if matches!(
            record.token_status_with_clock(&self.clock),
            TokenStatus::Fresh
        ) {
            return Ok(record.access_token().to_owned());
        }

        // inside the refresh margin; while a backoff delay is pending, report
        // the failure that caused it instead of hammering the provider
        if let Some(deadline) = self.next_retry {
            if deadline > Instant::now() {
                return Err(AuthError::RefreshFailed {
                    reason: self
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "refresh pending".into()),
                });
            }
        }

        match self.refresh_once().await {
            Ok(()) => match &self.current {
                Some(record) => Ok(record.access_token().to_owned()),
                None => Err(AuthError::NotAuthorized),
            },
            Err(err) => {
                if self.locked {
                    Err(AuthError::Locked)
                } else {
                    Err(AuthError::RefreshFailed {
                        reason: err.to_string(),
                    })
                }
            }
        }
    }

    async fn exchange(&mut self, code: AuthorizationCode) -> Result<(), ExchangeError> {
        // codes are single use; short-circuit a replay of the code we already
        // consumed without burning a provider call
        if self.last_code.as_ref() == Some(&code) {
            return Err(ExchangeError::InvalidCode {
                reason: "authorization code already consumed".into(),
            });
        }

        let mut issued = self.authority.exchange_code(&code).await?;

        // exchange_code guarantees a refresh token on success
        let refresh_token = match issued.refresh_token.take() {
            Some(token) => token,
            None => {
                return Err(ExchangeError::MalformedResponse {
                    detail: "token response missing refresh_token".into(),
                })
            }
        };

        let record = self.lifetime.create_record(
            issued.access_token,
            refresh_token,
            issued.scope,
            issued.expires_in,
        );
        self.store
            .save(&record)
            .await
            .map_err(ExchangeError::Storage)?;

        self.last_code = Some(code);
        // a fresh grant supersedes any refreshed record still awaiting a save
        self.unsaved = None;
        self.publish(Arc::new(record));
        tracing::info!("authorization code exchanged, token persisted");
        Ok(())
    }

    async fn refresh_once(&mut self) -> Result<(), RefreshError> {
        let record = match self.unsaved.take() {
            Some(pending) => pending,
            None => {
                let Some(current) = &self.current else {
                    return Ok(());
                };
                let refresh_token = current.refresh_token().to_owned();
                let previous_scope = current.scope().cloned();

                self.state_tx.send_replace(LifecycleState::RefreshPending);
                tracing::debug!("refreshing access token");

                let mut issued = match self.authority.refresh(&refresh_token).await {
                    Ok(issued) => issued,
                    Err(err) => {
                        self.note_failure(&err);
                        return Err(err);
                    }
                };

                let rotated = issued.refresh_token.is_some();
                let refresh_token = issued.refresh_token.take().unwrap_or(refresh_token);
                if rotated {
                    tracing::debug!("provider rotated the refresh token");
                }

                Arc::new(self.lifetime.create_record(
                    issued.access_token,
                    refresh_token,
                    issued.scope.or(previous_scope),
                    issued.expires_in,
                ))
            }
        };

        if let Err(err) = self.store.save(&record).await {
            self.unsaved = Some(record);
            let err = RefreshError::Storage(err);
            self.note_failure(&err);
            return Err(err);
        }

        self.publish(record);
        tracing::info!("access token refreshed");
        Ok(())
    }

    /// Makes a saved record the current one and resets all failure state
    fn publish(&mut self, record: Arc<TokenRecord>) {
        let expiry = record.expiry();
        self.current = Some(record.clone());
        self.token_tx.send_replace(Some(record));
        self.state_tx.send_replace(LifecycleState::Valid { expiry });
        self.backoff.success();
        self.next_retry = None;
        self.last_error = None;
        self.locked = false;
    }

    fn note_failure(&mut self, err: &RefreshError) {
        let delay = self.backoff.error();
        let failures = self.backoff.consecutive_failures();
        self.last_error = Some(err.to_string());

        if failures >= self.max_consecutive_failures {
            tracing::error!(
                failures,
                error = %err,
                "refresh failure limit reached, locking until re-authorization"
            );
            self.locked = true;
            self.next_retry = None;
            self.state_tx.send_replace(LifecycleState::Locked);
        } else {
            tracing::warn!(
                failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "refresh failed, backing off"
            );
            self.next_retry = Some(Instant::now() + delay);
        }
    }
}

async fn wait_for<C: Clock>(wake: Option<Wake>, clock: C) {
    match wake {
        None => std::future::pending().await,
        Some(Wake::Backoff(deadline)) => tokio::time::sleep_until(deadline).await,
        Some(Wake::Stale(at)) => {
            // The timer does not advance while a machine is suspended, so
            // rather than one long sleep we re-check the clock on a heartbeat
            // and wake at most this far past the stale instant.
            const HEARTBEAT: DurationSecs = DurationSecs(30);
            loop {
                let now = clock.now();
                if now >= at {
                    break;
                }
                let until_stale = at - now;
                tokio::time::sleep(until_stale.min(HEARTBEAT).into()).await;
            }
        }
    }
}
