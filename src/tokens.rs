use aliri_clock::{Clock, DurationSecs, System, UnixTime};
use serde::{Deserialize, Serialize};

use crate::braids::{AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef, Scope};

/// The persisted token pair along with its lifetime bookkeeping
///
/// A record is created by the first successful authorization-code exchange and
/// replaced wholesale by every successful refresh. The refresh token rotates
/// whenever the provider issues a new one.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenRecord {
    access_token: Box<AccessTokenRef>,
    refresh_token: Box<RefreshTokenRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<Scope>,
    lifetime: DurationSecs,
    issued: UnixTime,
    stale: UnixTime,
    expiry: UnixTime,
}

impl TokenRecord {
    pub(crate) fn clone_it(&self) -> Self {
        Self {
            access_token: self.access_token.to_owned().into_boxed_ref(),
            refresh_token: self.refresh_token.to_owned().into_boxed_ref(),
            scope: self.scope.clone(),
            lifetime: self.lifetime,
            issued: self.issued,
            stale: self.stale,
            expiry: self.expiry,
        }
    }
}

/// A token's lifecycle status
#[derive(Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and outside the refresh margin
    Fresh,
    /// The token is still valid, but due for a refresh
    Stale,
    /// The token is no longer valid
    Expired,
}

impl TokenRecord {
    /// Gets the current access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the current refresh token
    #[inline]
    pub fn refresh_token(&self) -> &RefreshTokenRef {
        &self.refresh_token
    }

    /// Gets the scope granted with this token, if the provider reported one
    #[inline]
    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    /// Gets the token's lifetime as declared by the provider
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.lifetime
    }

    /// Gets the time that the token was obtained
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// Gets the time at which a proactive refresh becomes due
    #[inline]
    pub fn stale(&self) -> UnixTime {
        self.stale
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// Gets the token's current lifetime status
    #[inline]
    pub fn token_status(&self) -> TokenStatus {
        self.token_status_with_clock(&System)
    }

    /// Gets the token's lifetime status based on the current time
    /// as reported by the provided clock
    #[inline]
    pub fn token_status_with_clock<C: Clock>(&self, clock: &C) -> TokenStatus {
        self.token_status_at(clock.now())
    }

    /// Gets the token's lifetime status as of the provided time
    #[inline]
    pub fn token_status_at(&self, time: UnixTime) -> TokenStatus {
        if time < self.stale {
            TokenStatus::Fresh
        } else if time < self.expiry {
            TokenStatus::Stale
        } else {
            TokenStatus::Expired
        }
    }

    /// Gets a duration for how much longer the token will be valid based on
    /// the current time as reported by the provided clock
    #[inline]
    pub fn until_expired_with_clock<C: Clock>(&self, clock: &C) -> DurationSecs {
        self.until_expired_at(clock.now())
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        if time < self.expiry {
            self.expiry - time
        } else {
            DurationSecs(0)
        }
    }
}

/// Configuration for determining when a token becomes due for refresh
///
/// A token is considered stale once it is within `refresh_lead_time` of its
/// expiry. Short-lived tokens always get at least `min_freshness` of fresh
/// time so that a token whose whole lifetime fits inside the lead margin does
/// not trigger a refresh storm.
#[derive(Clone, Debug)]
pub struct TokenLifetimeConfig<C = System> {
    refresh_lead_time: DurationSecs,
    min_freshness: DurationSecs,
    clock: C,
}

impl Default for TokenLifetimeConfig {
    /// Default lifetime configuration
    ///
    /// Uses a refresh lead time of 5 minutes with a minimum fresh period of
    /// 30 seconds, and the system clock.
    fn default() -> Self {
        Self {
            refresh_lead_time: DurationSecs(300),
            min_freshness: DurationSecs(30),
            clock: System,
        }
    }
}

impl TokenLifetimeConfig {
    /// Constructs a new lifetime configuration
    pub fn new(refresh_lead_time: DurationSecs, min_freshness: DurationSecs) -> Self {
        Self {
            refresh_lead_time,
            min_freshness,
            clock: System,
        }
    }
}

impl<C> TokenLifetimeConfig<C> {
    /// Replaces the clock used when stamping new records
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> TokenLifetimeConfig<D> {
        TokenLifetimeConfig {
            refresh_lead_time: self.refresh_lead_time,
            min_freshness: self.min_freshness,
            clock,
        }
    }

    fn time_to_stale(&self, issued: UnixTime, valid_duration: DurationSecs) -> UnixTime {
        let fresh_for = valid_duration
            .0
            .saturating_sub(self.refresh_lead_time.0)
            .max(self.min_freshness.0)
            .min(valid_duration.0);
        issued + DurationSecs(fresh_for)
    }
}

impl<C: Clock> TokenLifetimeConfig<C> {
    /// Stamps a freshly issued token pair into a [`TokenRecord`]
    ///
    /// The record is issued as of the clock's current time and expires after
    /// `valid_duration`; records always satisfy `expiry > issued` provided
    /// the duration is nonzero.
    pub fn create_record(
        &self,
        access_token: AccessToken,
        refresh_token: RefreshToken,
        scope: Option<Scope>,
        valid_duration: DurationSecs,
    ) -> TokenRecord {
        let issued = self.clock.now();
        TokenRecord {
            access_token: access_token.into_boxed_ref(),
            refresh_token: refresh_token.into_boxed_ref(),
            scope,
            lifetime: valid_duration,
            issued,
            stale: self.time_to_stale(issued, valid_duration),
            expiry: issued + valid_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use aliri_clock::TestClock;

    use super::*;

    fn record_at(now: u64, lifetime: u64, lead: u64) -> TokenRecord {
        let config = TokenLifetimeConfig::new(DurationSecs(lead), DurationSecs(30))
            .with_clock(TestClock::new(UnixTime(now)));
        config.create_record(
            AccessToken::from_static("access"),
            RefreshToken::from_static("refresh"),
            None,
            DurationSecs(lifetime),
        )
    }

    #[test]
    fn expiry_is_after_issuance() {
        let record = record_at(1_000, 1_800, 300);
        assert!(record.expiry() > record.issued());
        assert_eq!(record.expiry(), UnixTime(2_800));
        assert_eq!(record.stale(), UnixTime(2_500));
    }

    #[test]
    fn status_transitions_across_stale_and_expiry() {
        let record = record_at(1_000, 1_800, 300);
        assert_eq!(record.token_status_at(UnixTime(1_000)), TokenStatus::Fresh);
        assert_eq!(record.token_status_at(UnixTime(2_499)), TokenStatus::Fresh);
        assert_eq!(record.token_status_at(UnixTime(2_500)), TokenStatus::Stale);
        assert_eq!(record.token_status_at(UnixTime(2_799)), TokenStatus::Stale);
        assert_eq!(
            record.token_status_at(UnixTime(2_800)),
            TokenStatus::Expired
        );
    }

    #[test]
    fn short_lived_tokens_keep_a_minimum_fresh_window() {
        // lifetime shorter than the lead margin: fresh window floors at 30s
        let record = record_at(1_000, 60, 300);
        assert_eq!(record.stale(), UnixTime(1_030));
        assert_eq!(record.expiry(), UnixTime(1_060));
    }

    #[test]
    fn stale_never_exceeds_expiry() {
        // lifetime shorter than even the minimum fresh window
        let record = record_at(1_000, 10, 300);
        assert_eq!(record.stale(), UnixTime(1_010));
        assert_eq!(record.expiry(), UnixTime(1_010));
    }

    #[test]
    fn until_expired_counts_down_and_floors_at_zero() {
        let record = record_at(1_000, 1_800, 300);
        assert_eq!(record.until_expired_at(UnixTime(1_000)), DurationSecs(1_800));
        assert_eq!(record.until_expired_at(UnixTime(2_770)), DurationSecs(30));
        assert_eq!(record.until_expired_at(UnixTime(9_999)), DurationSecs(0));
    }
}
