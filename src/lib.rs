#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # flashgate
//!
//! Concurrency-control core for flash sales: a burst of buyers races for a
//! strictly limited stock inside a short sale window.
//!
//! ## Features
//!
//! - **Distributed token buckets** kept in a shared counter store and updated
//!   only through one atomic script, with a short-lived local reserve of
//!   pre-deducted tokens in front
//! - **Multi-level admission** (per-IP, per-user, global, ...) with a shared
//!   timeout budget and short-circuit on the first denial
//! - **Hash partitioning** of orders across a fixed number of tables
//! - **Idempotent order ledger**: at most one order per (user, product, sale),
//!   enforced by a locking read inside a per-partition transaction
//! - **Tower middleware** for putting admission in front of any service
//!
//! ## Quick Start
//!
//! ```rust
//! use flashgate::{
//!     FlashSaleConfig, InMemoryCounterStore, InMemoryOrderBackend, MultiLevelLimiter,
//!     OrderLedger, PurchaseGate, PurchaseOutcome,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = FlashSaleConfig::from_json_str(
//!         r#"{"limiters": [{"namespace": "global", "rate": 10, "capacity": 100}]}"#,
//!     )
//!     .unwrap();
//!
//!     let limiter =
//!         MultiLevelLimiter::from_config(Arc::new(InMemoryCounterStore::new()), &config).unwrap();
//!     let ledger = OrderLedger::new(InMemoryOrderBackend::new(config.partitions)).unwrap();
//!     let gate = PurchaseGate::new(limiter, ledger);
//!
//!     assert!(matches!(gate.purchase(1, 2, 3).await, PurchaseOutcome::Created(_)));
//!     assert_eq!(gate.purchase(1, 2, 3).await, PurchaseOutcome::AlreadyExists);
//! }
//! ```

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod order;
pub mod partition;
pub mod rate_limit;
pub mod sleeper;

// Re-exports
pub use backend::{BackendError, InMemoryOrderBackend, InMemoryTx, OrderBackend, PartitionTx};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, FlashSaleConfig, LimiterConfig, StoreConfig};
pub use error::AdmissionError;
pub use gate::{PurchaseGate, PurchaseOutcome};
pub use ledger::{CreateOutcome, OrderLedger};
pub use order::{InvalidStatus, OrderKey, OrderRecord, OrderStatus};
pub use partition::HashPartitioner;
pub use rate_limit::{
    Admission, CounterStore, InMemoryCounterStore, MultiLevelLimiter, RateLimitLayer,
    RateLimitService, RateLimiter, StoreError, TokenBucketLimiter, ACQUIRE_SCRIPT,
};
pub use sleeper::{ClockSleeper, Sleeper, TokioSleeper};
