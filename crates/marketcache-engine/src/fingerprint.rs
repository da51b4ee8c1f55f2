//! Identity fingerprints for logical artifacts
//!
//! A fingerprint is the cache key of a request: the artifact type, its
//! effective parameters (key-sorted) and the volatility key evaluated at
//! request time. Argument order never changes the identity; the day a
//! `CurrentDate` feed is requested does.

use chrono::{DateTime, Utc};
use marketcache_common::checksum::compute_md5;
use marketcache_common::Params;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable cache key of a logical artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Compute the fingerprint of a request.
///
/// Pure: the volatility key must already be evaluated (see
/// [`VolatilityPolicy::evaluate`]). An empty key contributes nothing.
pub fn fingerprint(artifact_type_id: &str, params: &Params, volatility_key: &str) -> Fingerprint {
    // Unit/record separators cannot appear in type ids or parameter names.
    let mut canonical = String::with_capacity(64);
    canonical.push_str(artifact_type_id);
    canonical.push('\u{1d}');
    for (name, value) in params {
        canonical.push_str(name);
        canonical.push('\u{1f}');
        canonical.push_str(value.type_name());
        canonical.push(':');
        canonical.push_str(&value.to_string());
        canonical.push('\u{1e}');
    }
    if !volatility_key.is_empty() {
        canonical.push('\u{1d}');
        canonical.push_str(volatility_key);
    }
    Fingerprint(compute_md5(canonical.as_bytes()))
}

/// How a time-derived key is mixed into the fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityPolicy {
    #[default]
    None,
    /// One cache entry per calendar day (`YYYY-MM-DD`)
    CurrentDate,
    /// One cache entry per request instant
    CurrentTimestamp,
}

impl VolatilityPolicy {
    pub fn evaluate(&self, now: DateTime<Utc>) -> String {
        match self {
            VolatilityPolicy::None => String::new(),
            VolatilityPolicy::CurrentDate => now.format("%Y-%m-%d").to_string(),
            VolatilityPolicy::CurrentTimestamp => now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        }
    }
}

/// Source of "now" for volatility keys and metadata timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a settable instant
#[derive(Debug)]
pub struct FixedClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
