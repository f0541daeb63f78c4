pub mod error;
pub mod types;

pub use error::{RangeCacheError, Result};
pub use types::{ByteRange, CacheStats, DEFAULT_EXPIRY_SECS, StoreStats, StoredValue, effective_ttl};
