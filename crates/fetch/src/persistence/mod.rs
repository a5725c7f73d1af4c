//! Persistence layer for the fetch engine
//!
//! This module provides:
//! - [`QueueStore`] trait covering the four store operations fetchers need
//! - [`InMemoryQueueStore`] for testing and single-process use
//! - [`RedisQueueStore`] for production (requires the `redis` feature)

mod memory;
#[cfg(feature = "redis")]
mod redis;
mod store;

pub use memory::InMemoryQueueStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisQueueStore;
pub use store::{unix_now, QueueStore, StoreError};
