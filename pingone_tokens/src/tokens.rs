use pingone_clock::{DurationMs, UnixTimeMs};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{region::RegionCode, AccessToken, AccessTokenRef, EnvironmentId, EnvironmentIdRef};

/// A token as returned by the authority, before it is placed in time
#[derive(Clone, Debug)]
pub struct IssuedToken {
    /// The bearer token
    pub access_token: AccessToken,
    /// The lifetime reported by the authority
    pub expires_in: DurationMs,
}

/// A token held by the cache, with the context it was issued for
#[derive(Clone, Debug)]
pub struct CachedToken {
    access_token: AccessToken,
    environment_id: EnvironmentId,
    region: RegionCode,
    issued: UnixTimeMs,
    expires_at: UnixTimeMs,
}

impl CachedToken {
    /// Places an issued token in time
    ///
    /// Expiry is always `issued + expires_in`.
    pub fn new(
        token: IssuedToken,
        environment_id: EnvironmentId,
        region: RegionCode,
        issued: UnixTimeMs,
    ) -> Self {
        Self {
            access_token: token.access_token,
            environment_id,
            region,
            issued,
            expires_at: issued + token.expires_in,
        }
    }

    /// The bearer token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// The environment the token was issued for
    #[inline]
    pub fn environment_id(&self) -> &EnvironmentIdRef {
        &self.environment_id
    }

    /// The region that issued the token
    #[inline]
    pub fn region(&self) -> RegionCode {
        self.region
    }

    /// When the token was received
    #[inline]
    pub fn issued(&self) -> UnixTimeMs {
        self.issued
    }

    /// When the authority stops accepting the token
    #[inline]
    pub fn expires_at(&self) -> UnixTimeMs {
        self.expires_at
    }

    /// Whether the token can still be handed out at `now`
    ///
    /// A token is usable only while more than `buffer` of its lifetime
    /// remains.
    #[inline]
    pub fn is_valid_at(&self, now: UnixTimeMs, buffer: DurationMs) -> bool {
        self.expires_at > now + buffer
    }

    /// Remaining lifetime as of `now`
    #[inline]
    pub fn expires_in_at(&self, now: UnixTimeMs) -> DurationMs {
        self.expires_at.saturating_since(now)
    }

    /// A point-in-time summary of the token
    pub fn info_at(&self, now: UnixTimeMs, buffer: DurationMs) -> TokenInfo {
        TokenInfo {
            expires_in_seconds: self.expires_in_at(now).as_secs(),
            is_valid: self.is_valid_at(now, buffer),
            expires_at: to_datetime(self.expires_at),
        }
    }
}

/// A point-in-time summary of the cached token
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    /// Whole seconds until expiry
    pub expires_in_seconds: u64,
    /// Whether the token would be handed out right now
    pub is_valid: bool,
    /// When the token expires
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Converts a clock reading into a calendar timestamp
pub fn to_datetime(time: UnixTimeMs) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(time.0) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_in_secs: u64, issued: u64) -> CachedToken {
        CachedToken::new(
            IssuedToken {
                access_token: AccessToken::new("token".to_owned()),
                expires_in: DurationMs::from_secs(expires_in_secs),
            },
            EnvironmentId::new("env".to_owned()),
            RegionCode::NA,
            UnixTimeMs(issued),
        )
    }

    #[test]
    fn validity_respects_the_buffer() {
        let buffer = DurationMs::from_mins(2);
        let t = token(3600, 0);

        assert!(t.is_valid_at(UnixTimeMs(0), buffer));
        assert!(t.is_valid_at(UnixTimeMs(3_479_999), buffer));
        assert!(!t.is_valid_at(UnixTimeMs(3_480_000), buffer));
        assert!(!t.is_valid_at(UnixTimeMs(3_601_000), buffer));
    }

    #[test]
    fn info_reports_remaining_lifetime() {
        let t = token(3600, 1_000_000);
        let info = t.info_at(UnixTimeMs(1_000_000), DurationMs::from_mins(2));
        assert_eq!(info.expires_in_seconds, 3600);
        assert!(info.is_valid);

        let later = t.info_at(UnixTimeMs(1_000_000 + 3_601_000), DurationMs::from_mins(2));
        assert_eq!(later.expires_in_seconds, 0);
        assert!(!later.is_valid);
    }

    #[test]
    fn timestamps_serialize_as_rfc3339() {
        let info = token(60, 0).info_at(UnixTimeMs(0), DurationMs::ZERO);
        let json = serde_json::to_value(info).unwrap();
        assert_eq!(json["expiresAt"], "1970-01-01T00:01:00Z");
        assert_eq!(json["expiresInSeconds"], 60);
        assert_eq!(json["isValid"], true);
    }
}
