//! # Event Consumer
//!
//! Runtime for services that react to events published by the outbox relay.
//!
//! A service registers a handler for one or more `eventType` values, then
//! starts a [`ConsumerRuntime`] on its topics. Every delivery is decoded into an
//! [`event_bus::EventEnvelope`], its [`EventContext`] is restored, and the
//! handler runs with bounded retry. Messages that still fail go to the
//! dead-letter sink with their full envelope and error context.
//!
//! Delivery is at least once. Handlers that must not apply an event twice use
//! [`SequenceGuard`] in their own transaction.
//!
//! ```rust,no_run
//! use event_bus::dlq::InMemoryDeadLetterSink;
//! use event_bus::InMemoryBus;
//! use event_consumer::{
//!     handler_fn, ConsumerConfig, ConsumerMetrics, ConsumerRuntime, HandlerRegistry,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = HandlerRegistry::new();
//! registry.register(
//!     "trade.booked",
//!     handler_fn(|ctx, envelope| async move {
//!         tracing::info!(event_id = %ctx.event_id, payload = %envelope.payload, "booked");
//!         Ok(())
//!     }),
//! )?;
//!
//! let runtime = ConsumerRuntime::new(
//!     Arc::new(InMemoryBus::new()),
//!     registry,
//!     Arc::new(InMemoryDeadLetterSink::new()),
//!     ConsumerConfig::new("positions", vec!["trades.events".to_string()]),
//!     ConsumerMetrics::new(prometheus::default_registry())?,
//! );
//! let handle = runtime.start().await?;
//! // ...
//! let report = handle.shutdown().await;
//! println!("{} left for redelivery", report.left_unacknowledged);
//! # Ok(())
//! # }
//! ```

mod context;
mod registry;
mod router;

pub mod config;
pub mod idempotency;
pub mod metrics;
pub mod runtime;

pub use config::{CommitStrategy, ConfigError, ConsumerConfig};
pub use context::{DeliveryInfo, EventContext};
pub use idempotency::{InMemorySequenceGuard, SequenceCheck, SequenceGuard};
pub use metrics::ConsumerMetrics;
pub use registry::{handler_fn, EventHandler, FnHandler, HandlerError, HandlerRegistry, RegistryError};
pub use router::{DispatchOutcome, Router};
pub use runtime::{ConsumerHandle, ConsumerRuntime, ConsumerStats, ShutdownReport};

/// Embedded migration for the entity sequence table
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./db/migrations");
