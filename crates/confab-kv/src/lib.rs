//! Semantic key/value API over a remote ordered-list/hash/set store.
//!
//! All cross-replica coordination goes through this interface: workspace
//! request queues, response channels, process statuses, thread logs, locks.
//! Values serialize as structured text; plain strings round-trip as
//! themselves. Typed reads never fail on malformed stored values — they log
//! and return a miss, so schema changes degrade into cache misses.

mod codec;
mod error;
mod memory;
mod redis_store;
mod store;

pub use codec::{decode, encode};
pub use error::{KvError, KvResult};
pub use memory::MemoryBackend;
pub use redis_store::RedisBackend;
pub use store::{KvBackend, KvLock, KvStore, ListEnd};

/// Absolute TTLs, in seconds.
pub const EXP_TEN_MINUTES: u64 = 600;
pub const EXP_HOUR: u64 = 3600;
pub const EXP_WORKDAY: u64 = EXP_HOUR * 8;
pub const EXP_WEEK: u64 = 604_800;
pub const EXP_MONTH: u64 = 2_592_000;
pub const EXP_QUARTER: u64 = 7_776_000;
