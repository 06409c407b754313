//! Utilities for telling and faking time
//!
//! Token expiry, refresh buffers, rate limiting and cache staleness are all
//! expressed in milliseconds since the Unix epoch. Components take a [`Clock`]
//! rather than reading the system time directly, so that tests can move time
//! forward with a [`TestClock`] instead of sleeping.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    ops,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unix time in milliseconds
///
/// The number of milliseconds elapsed since the beginning of the Unix epoch
/// on 1970/01/01 at 00:00:00 UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    /// Whole seconds since the epoch
    #[inline]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1000
    }

    /// The time elapsed from `earlier` until `self`, or zero if `earlier` is later
    #[inline]
    pub fn saturating_since(self, earlier: UnixTimeMs) -> DurationMs {
        DurationMs(self.0.saturating_sub(earlier.0))
    }
}

impl From<SystemTime> for UnixTimeMs {
    #[inline]
    fn from(t: SystemTime) -> Self {
        // Times before the epoch collapse to the epoch itself.
        let millis = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        UnixTimeMs(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

/// A span of time in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct DurationMs(pub u64);

impl DurationMs {
    /// A zero-length duration
    pub const ZERO: DurationMs = DurationMs(0);

    /// Constructs a duration from whole seconds
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        DurationMs(secs.saturating_mul(1000))
    }

    /// Constructs a duration from whole minutes
    #[inline]
    pub const fn from_mins(mins: u64) -> Self {
        DurationMs::from_secs(mins.saturating_mul(60))
    }

    /// Whole seconds in this duration, rounded down
    #[inline]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1000
    }
}

impl From<Duration> for DurationMs {
    #[inline]
    fn from(d: Duration) -> Self {
        DurationMs(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

impl From<DurationMs> for Duration {
    #[inline]
    fn from(d: DurationMs) -> Self {
        Duration::from_millis(d.0)
    }
}

impl ops::Add<DurationMs> for UnixTimeMs {
    type Output = UnixTimeMs;

    #[inline]
    fn add(self, rhs: DurationMs) -> Self::Output {
        UnixTimeMs(self.0.saturating_add(rhs.0))
    }
}

impl ops::AddAssign<DurationMs> for UnixTimeMs {
    #[inline]
    fn add_assign(&mut self, rhs: DurationMs) {
        *self = *self + rhs;
    }
}

impl ops::Sub<DurationMs> for UnixTimeMs {
    type Output = UnixTimeMs;

    #[inline]
    fn sub(self, rhs: DurationMs) -> Self::Output {
        UnixTimeMs(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Sub<UnixTimeMs> for UnixTimeMs {
    type Output = DurationMs;

    #[inline]
    fn sub(self, rhs: UnixTimeMs) -> Self::Output {
        self.saturating_since(rhs)
    }
}

impl ops::Add for DurationMs {
    type Output = DurationMs;

    #[inline]
    fn add(self, rhs: DurationMs) -> Self::Output {
        DurationMs(self.0.saturating_add(rhs.0))
    }
}

impl ops::Sub for DurationMs {
    type Output = DurationMs;

    #[inline]
    fn sub(self, rhs: DurationMs) -> Self::Output {
        DurationMs(self.0.saturating_sub(rhs.0))
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for UnixTimeMs {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for UnixTimeMs {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Self(ms))
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for DurationMs {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for DurationMs {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Self(ms))
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time according to this clock
    fn now(&self) -> UnixTimeMs;
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now(&self) -> UnixTimeMs {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn now(&self) -> UnixTimeMs {
        (**self).now()
    }
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::from(SystemTime::now())
    }
}

/// A test clock whose time only moves when told to
///
/// Clones share the same underlying time, so a clone handed to a component
/// under test observes every [`set()`][Self::set()] or
/// [`advance()`][Self::advance()] made through the original.
#[derive(Clone, Debug, Default)]
pub struct TestClock {
    now: Arc<AtomicU64>,
}

impl Clock for TestClock {
    #[inline]
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now.load(Ordering::Acquire))
    }
}

impl TestClock {
    /// Creates a new test clock with the specified time
    pub fn new(time: UnixTimeMs) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(time.0)),
        }
    }

    /// Updates the clock's current time to `val`
    pub fn set(&self, val: UnixTimeMs) {
        self.now.store(val.0, Ordering::Release);
    }

    /// Moves the clock's current time forward by `by`
    pub fn advance(&self, by: DurationMs) {
        self.now.fetch_add(by.0, Ordering::AcqRel);
    }

    /// Moves the clock's current time forward by `secs` seconds
    pub fn advance_secs(&self, secs: u64) {
        self.advance(DurationMs::from_secs(secs));
    }

    /// Moves the clock's current time forward by `millis` milliseconds
    pub fn advance_millis(&self, millis: u64) {
        self.advance(DurationMs(millis));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_of_a_test_clock_share_time() {
        let clock = TestClock::new(UnixTimeMs(1_000));
        let observer = clock.clone();

        clock.advance_secs(2);
        assert_eq!(observer.now(), UnixTimeMs(3_000));

        observer.set(UnixTimeMs(10));
        assert_eq!(clock.now(), UnixTimeMs(10));
    }

    #[test]
    fn subtraction_saturates_at_zero() {
        let earlier = UnixTimeMs(500);
        let later = UnixTimeMs(2_000);

        assert_eq!(later - earlier, DurationMs(1_500));
        assert_eq!(earlier - later, DurationMs::ZERO);
        assert_eq!(earlier - DurationMs(1_000), UnixTimeMs(0));
    }

    #[test]
    fn durations_convert_to_and_from_std() {
        let d = DurationMs::from_mins(15);
        assert_eq!(d, DurationMs(900_000));
        assert_eq!(Duration::from(d), Duration::from_secs(900));
        assert_eq!(DurationMs::from(Duration::from_millis(51)), DurationMs(51));
    }

    #[test]
    fn system_clock_reports_milliseconds() {
        let now = System.now();
        assert!(now.as_secs() > 1_600_000_000);
        assert!(now.0 > 1_600_000_000_000);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serializes_as_plain_integer() {
        let json = serde_json::to_string(&UnixTimeMs(42)).unwrap();
        assert_eq!(json, "42");
        let back: UnixTimeMs = serde_json::from_str(&json).unwrap();
        assert_eq!(back, UnixTimeMs(42));
    }
}
