//! Sync pipeline: persistence scheduling, the consumer-owned store, and its
//! two producers (remote subscriptions and local mutations).

pub mod derived;
pub mod mutation;
pub mod scheduler;
pub mod store;
pub mod subscription;
