//! Counter keys, window bucketing and counter records.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Prefix of every rendered counter key.
const KEY_PREFIX: &str = "rl|";

/// Milliseconds since the Unix epoch, clamped at zero.
pub fn epoch_millis(now: DateTime<Utc>) -> u64 {
    now.timestamp_millis().max(0) as u64
}

/// Window length in milliseconds, never zero.
fn window_millis(window: Duration) -> u64 {
    (window.as_millis() as u64).max(1)
}

/// Key identifying one counter in one window bucket.
///
/// The window length is part of the key, so two windows of different
/// lengths over the same subject never share a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Rule scope label (`global`, `endpoint`, ...).
    pub scope: String,
    /// Identity component the scope counts against.
    pub subject: String,
    /// Length of the window.
    pub window: Duration,
    /// `floor(now / window)`.
    pub bucket: u64,
}

impl CounterKey {
    /// Create a counter key for an explicit bucket.
    pub fn new(scope: &str, subject: &str, window: Duration, bucket: u64) -> Self {
        Self {
            scope: scope.to_string(),
            subject: subject.to_string(),
            window,
            bucket,
        }
    }

    /// Create the counter key for the bucket containing `now`.
    pub fn at(scope: &str, subject: &str, window: Duration, now: DateTime<Utc>) -> Self {
        let bucket = epoch_millis(now) / window_millis(window);
        Self::new(scope, subject, window, bucket)
    }

    /// Start of this bucket's window, in epoch milliseconds.
    pub fn window_start_millis(&self) -> u64 {
        self.bucket.saturating_mul(window_millis(self.window))
    }

    /// End of this bucket's window, in epoch milliseconds.
    pub fn expires_at_millis(&self) -> u64 {
        self.bucket
            .saturating_add(1)
            .saturating_mul(window_millis(self.window))
    }

    /// Time left until this bucket's window closes.
    pub fn ttl_remaining(&self, now: DateTime<Utc>) -> Duration {
        Duration::from_millis(self.expires_at_millis().saturating_sub(epoch_millis(now)))
    }

    /// Whether the window for this bucket has closed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        epoch_millis(now) >= self.expires_at_millis()
    }

    /// Render the key as a store key.
    ///
    /// Format: `rl|{scope}|{subject}|{window_ms}|{bucket}`
    pub fn to_store_key(&self) -> String {
        format!(
            "{}{}|{}|{}|{}",
            KEY_PREFIX,
            self.scope,
            self.subject,
            window_millis(self.window),
            self.bucket
        )
    }

    /// Parse a rendered store key.
    pub fn from_store_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(KEY_PREFIX)?;

        // Numeric fields are split from the right so subjects may contain the delimiter
        let (rest, bucket) = rest.rsplit_once('|')?;
        let bucket: u64 = bucket.parse().ok()?;
        let (rest, window_ms) = rest.rsplit_once('|')?;
        let window_ms: u64 = window_ms.parse().ok()?;
        let (scope, subject) = rest.split_once('|')?;

        Some(Self {
            scope: scope.to_string(),
            subject: subject.to_string(),
            window: Duration::from_millis(window_ms),
            bucket,
        })
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

/// Result of a counter store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Count in the current window after the operation.
    pub count: u64,
    /// Time until the window resets.
    pub ttl_remaining: Duration,
}

/// A counter record owned by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRecord {
    /// Rendered counter key
    pub key: String,
    /// Hits recorded in this window
    pub count: u64,
    /// Window start, epoch milliseconds
    pub window_start: u64,
    /// Window end, epoch milliseconds
    pub expires_at: u64,
}

impl CounterRecord {
    /// Create an empty record for a counter key.
    pub fn new(key: &CounterKey) -> Self {
        Self {
            key: key.to_store_key(),
            count: 0,
            window_start: key.window_start_millis(),
            expires_at: key.expires_at_millis(),
        }
    }

    /// Whether the record's window has closed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        epoch_millis(now) >= self.expires_at
    }
}
