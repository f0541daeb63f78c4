use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Default expiry for cached entries (one week)
pub const DEFAULT_EXPIRY_SECS: u64 = 604_800;

/// Half-open byte interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Resolve optional bounds against a source of `size` bytes.
    ///
    /// Returns `None` when nothing can be read: `start >= size` or `start >= stop`.
    /// `stop` is clamped to `size`.
    pub fn resolve(start: Option<u64>, stop: Option<u64>, size: u64) -> Option<Self> {
        let start = start.unwrap_or(0);
        let stop = stop.unwrap_or(size);
        if start >= size || start >= stop {
            return None;
        }
        Some(Self::new(start, stop.min(size)))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Normalize an expiry setting: zero means "never expire"
pub fn effective_ttl(expiry_secs: Option<u64>) -> Option<u64> {
    expiry_secs.filter(|secs| *secs > 0)
}

/// Stored value in the memory store with metadata
#[derive(Debug, Clone)]
pub struct StoredValue {
    /// Raw byte data
    pub data: Bytes,
    /// Optional expiration time
    pub ttl: Option<Instant>,
    /// When the value was created
    pub created_at: Instant,
}

impl StoredValue {
    pub fn new(data: Bytes, ttl_secs: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            data,
            ttl: ttl_secs.map(|secs| now + std::time::Duration::from_secs(secs)),
            created_at: now,
        }
    }

    /// Check if the value has expired
    pub fn is_expired(&self) -> bool {
        self.ttl.is_some_and(|expires| Instant::now() >= expires)
    }

    /// Get remaining TTL in seconds
    pub fn remaining_ttl_secs(&self) -> Option<u64> {
        self.ttl.map(|expires| {
            let now = Instant::now();
            if now >= expires {
                0
            } else {
                (expires - now).as_secs()
            }
        })
    }
}

/// Statistics for the memory store
#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreStats {
    /// Total number of keys
    pub total_keys: usize,
    /// Estimated memory usage in bytes
    pub total_memory_bytes: usize,
    pub gets: u64,
    pub sets: u64,
    pub dels: u64,
    pub hits: u64,
    pub misses: u64,
}

impl StoreStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Counters kept by a cache-aside instance
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the store
    pub hits: u64,
    /// Lookups that went to the backing fetch
    pub misses: u64,
    /// Bytes returned by the backing fetch
    pub fetched_bytes: u64,
    /// Store operations skipped under the bypass policy; a miss whose get and set both
    /// failed counts twice
    pub bypassed: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Add another instance's counters to these
    pub fn accumulate(&mut self, other: &CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.fetched_bytes += other.fetched_bytes;
        self.bypassed += other.bypassed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults() {
        assert_eq!(
            ByteRange::resolve(None, None, 100),
            Some(ByteRange::new(0, 100))
        );
        assert_eq!(
            ByteRange::resolve(Some(10), None, 100),
            Some(ByteRange::new(10, 100))
        );
    }

    #[test]
    fn test_resolve_short_circuits() {
        assert_eq!(ByteRange::resolve(Some(100), None, 100), None);
        assert_eq!(ByteRange::resolve(Some(5), Some(5), 100), None);
        assert_eq!(ByteRange::resolve(Some(7), Some(3), 100), None);
        assert_eq!(ByteRange::resolve(None, None, 0), None);
    }

    #[test]
    fn test_resolve_clamps_stop() {
        assert_eq!(
            ByteRange::resolve(Some(90), Some(150), 100),
            Some(ByteRange::new(90, 100))
        );
    }

    #[test]
    fn test_effective_ttl() {
        assert_eq!(effective_ttl(None), None);
        assert_eq!(effective_ttl(Some(0)), None);
        assert_eq!(effective_ttl(Some(60)), Some(60));
    }

    #[test]
    fn test_stored_value_expiry() {
        let value = StoredValue::new(Bytes::from_static(b"abc"), None);
        assert!(!value.is_expired());
        assert_eq!(value.remaining_ttl_secs(), None);

        let value = StoredValue::new(Bytes::from_static(b"abc"), Some(0));
        assert!(value.is_expired());
        assert_eq!(value.remaining_ttl_secs(), Some(0));
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_accumulate() {
        let mut total = CacheStats {
            hits: 1,
            bypassed: 2,
            ..Default::default()
        };
        total.accumulate(&CacheStats {
            hits: 2,
            misses: 4,
            fetched_bytes: 40,
            bypassed: 1,
        });
        assert_eq!(
            total,
            CacheStats {
                hits: 3,
                misses: 4,
                fetched_bytes: 40,
                bypassed: 3,
            }
        );
    }
}
