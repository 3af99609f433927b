mod router;
mod entry;
mod bucket;
mod wal;
mod bucket_map;
mod manager;

pub use router::{bucket_index, jump_consistent_hash, murmur3_x64_64};
pub use entry::{now_ms, CacheEntry, Expiry, NO_EXPIRY};
pub use bucket::{Bucket, BucketSink};
pub use wal::{Wal, WalRecord};
pub use bucket_map::{BucketInfo, BucketMap};
pub use manager::BucketManager;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Bucket index {index} out of range ({count} active buckets)")]
    BucketIndexOutOfRange { index: usize, count: usize },

    #[error("Bucket {bucket_id} is not hosted on this node (owner {owner})")]
    BucketNotHosted { bucket_id: String, owner: String },

    #[error("WAL entry not found for version {0}")]
    VersionNotFound(u64),

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),
}
