//! Version-stamped cache items and version ordering.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;
use uuid::Uuid;

/// Orders caller-supplied version tokens.
pub trait VersionComparator<Ver>: Send + Sync {
    /// Compare the stored version with a proposed one.
    fn compare(&self, current: &Ver, proposed: &Ver) -> Ordering;
}

impl<Ver, F> VersionComparator<Ver> for F
where
    F: Fn(&Ver, &Ver) -> Ordering + Send + Sync,
{
    fn compare(&self, current: &Ver, proposed: &Ver) -> Ordering {
        self(current, proposed)
    }
}

/// Comparator using the version type's own `Ord`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl<Ver: Ord> VersionComparator<Ver> for NaturalOrder {
    fn compare(&self, current: &Ver, proposed: &Ver) -> Ordering {
        current.cmp(proposed)
    }
}

/// Soft-lock marker carried by an item while a writer fences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMarker {
    pub owner: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl LockMarker {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// The stored form of a versioned put.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockableCachedItem<V, Ver> {
    pub value: V,
    pub version: Ver,
    pub lock: Option<LockMarker>,
    pub written_at: DateTime<Utc>,
}

impl<V, Ver> LockableCachedItem<V, Ver> {
    pub fn new(value: V, version: Ver) -> Self {
        Self {
            value,
            version,
            lock: None,
            written_at: Utc::now(),
        }
    }

    /// Whether a write carrying `proposed` may replace this item.
    ///
    /// An active lock marker blocks every writer. Otherwise the proposed
    /// version must be strictly newer than the stored one.
    pub fn is_puttable<C>(&self, proposed: &Ver, comparator: &C, now: DateTime<Utc>) -> bool
    where
        C: VersionComparator<Ver> + ?Sized,
    {
        if self.is_locked(now) {
            return false;
        }
        comparator.compare(&self.version, proposed) == Ordering::Less
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock.map(|m| m.is_active(now)).unwrap_or(false)
    }

    /// Place a marker for `owner`. Fails if another owner's marker is active.
    pub fn lock(&mut self, owner: Uuid, timeout: Duration, now: DateTime<Utc>) -> bool {
        if let Some(marker) = self.lock {
            if marker.is_active(now) && marker.owner != owner {
                return false;
            }
        }
        let timeout =
            ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::days(36_500));
        self.lock = Some(LockMarker {
            owner,
            expires_at: now.checked_add_signed(timeout).unwrap_or(DateTime::<Utc>::MAX_UTC),
        });
        true
    }

    /// Remove the marker if `owner` placed it or it has expired.
    pub fn unlock(&mut self, owner: Uuid, now: DateTime<Utc>) -> bool {
        match self.lock {
            Some(marker) if marker.owner == owner || !marker.is_active(now) => {
                self.lock = None;
                true
            }
            Some(_) => false,
            None => true,
        }
    }
}

/// What the read path finds at an entry key.
///
/// Versioned items are tried first; their strict field set keeps ordinary
/// payloads from matching.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StoredValue<V> {
    Versioned(LockableCachedItem<V, IgnoredAny>),
    Plain(V),
}

impl<V> StoredValue<V> {
    pub fn into_value(self) -> V {
        match self {
            StoredValue::Versioned(item) => item.value,
            StoredValue::Plain(value) => value,
        }
    }
}

/// Result of a versioned put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutOutcome {
    /// No item existed; one was written.
    Created,
    /// The stored item was older and has been replaced.
    Updated,
    /// The stored item was at least as new, or fenced. Nothing was written.
    Rejected,
}

impl PutOutcome {
    pub fn is_written(&self) -> bool {
        !matches!(self, PutOutcome::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_version_is_puttable() {
        let item = LockableCachedItem::new("a".to_string(), 2u64);
        let now = Utc::now();
        assert!(item.is_puttable(&3, &NaturalOrder, now));
        assert!(!item.is_puttable(&2, &NaturalOrder, now));
        assert!(!item.is_puttable(&1, &NaturalOrder, now));
    }

    #[test]
    fn test_closure_comparator_reverses_order() {
        let item = LockableCachedItem::new("a".to_string(), 5i64);
        let reversed = |a: &i64, b: &i64| b.cmp(a);
        let now = Utc::now();
        assert!(item.is_puttable(&4, &reversed, now));
        assert!(!item.is_puttable(&6, &reversed, now));
    }

    #[test]
    fn test_active_marker_blocks_writers() {
        let mut item = LockableCachedItem::new(1u8, 1u64);
        let owner = Uuid::now_v7();
        let now = Utc::now();
        assert!(item.lock(owner, Duration::from_secs(60), now));
        assert!(!item.is_puttable(&9, &NaturalOrder, now));

        // another owner cannot take it over
        assert!(!item.lock(Uuid::now_v7(), Duration::from_secs(60), now));
        assert!(!item.unlock(Uuid::now_v7(), now));

        assert!(item.unlock(owner, now));
        assert!(item.is_puttable(&9, &NaturalOrder, now));
    }

    #[test]
    fn test_expired_marker_is_ignored() {
        let mut item = LockableCachedItem::new(1u8, 1u64);
        let now = Utc::now();
        assert!(item.lock(Uuid::now_v7(), Duration::from_secs(1), now));
        let later = now + ChronoDuration::seconds(5);
        assert!(!item.is_locked(later));
        assert!(item.is_puttable(&2, &NaturalOrder, later));
        assert!(item.lock(Uuid::now_v7(), Duration::from_secs(1), later));
    }

    #[test]
    fn test_stored_value_distinguishes_items_from_plain_payloads() {
        let item = LockableCachedItem::new("payload".to_string(), 4u64);
        let bytes = serde_json::to_vec(&item).expect("serialize item");
        let stored: StoredValue<String> = serde_json::from_slice(&bytes).expect("decode item");
        assert!(matches!(stored, StoredValue::Versioned(_)));
        assert_eq!(stored.into_value(), "payload");

        let bytes = serde_json::to_vec("plain").expect("serialize plain");
        let stored: StoredValue<String> = serde_json::from_slice(&bytes).expect("decode plain");
        assert!(matches!(stored, StoredValue::Plain(_)));
        assert_eq!(stored.into_value(), "plain");
    }

    #[test]
    fn test_put_outcome_is_written() {
        assert!(PutOutcome::Created.is_written());
        assert!(PutOutcome::Updated.is_written());
        assert!(!PutOutcome::Rejected.is_written());
    }
}
