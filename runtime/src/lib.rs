//! # Allocation Sync Runtime
//!
//! Runtime pieces that turn the core types into a running service.
//!
//! ## Core Components
//!
//! - **Config**: environment-based [`SyncConfig`]
//! - **Consumer**: [`InventoryUpdateConsumer`], the subscribe → normalize →
//!   reconcile → acknowledge loop
//! - **Metrics**: Prometheus exporter and [`SyncMetrics`] recorders
//!
//! ## Example
//!
//! ```ignore
//! use allocation_sync_runtime::{InventoryUpdateConsumer, SyncConfig};
//!
//! let config = SyncConfig::from_env()?;
//! let (consumer, shutdown) = InventoryUpdateConsumer::new(engine, event_bus, &config.kafka.topic);
//! let mut consumer = consumer
//!     .with_dead_letter_sink(dlq)
//!     .with_malformed_policy(config.consumer.malformed_policy);
//!
//! consumer.start().await?;
//! ```

/// Environment-based configuration
pub mod config;

/// Inbound message dispatch
pub mod consumer;

/// Prometheus metrics for observability
pub mod metrics;

pub use config::{ConfigError, Environment, SyncConfig};
pub use consumer::{BatchReport, ConsumerError, InventoryUpdateConsumer, MalformedPolicy};
pub use metrics::{MetricsError, MetricsServer, SyncMetrics};
