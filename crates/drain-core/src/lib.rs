//! drain-core
//!
//! Transactional outbox drain: turns durably recorded "event happened"
//! rows into at-least-once deliveries to registered handlers.
//!
//! # Modules
//! - **domain**: ids, status, `OutboxRecord`
//! - **ports**: `OutboxStore`, `DeliveryHandler`, `Clock`
//! - **app**: router, retry policy, dispatcher, drain loop, reaper
//! - **typed**: typed events decoded from the opaque payload
//! - **impls**: PostgreSQL and in-memory stores
//!
//! ```ignore
//! let router = Router::builder()
//!     .route("incident.created", Arc::new(notifier))
//!     .build()?;
//! let store = Arc::new(PgOutboxStore::new(pool));
//! let handle = OutboxDrain::new(store, Arc::new(router), DrainConfig::default())?.start();
//! // ...
//! handle.stop().await?;
//! ```

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{DrainConfig, DrainHandle, OutboxDrain, ReapConfig, RetryPolicy, Router};
pub use domain::{EventType, OutboxId, OutboxRecord, OutboxStatus};
pub use error::{DeliveryError, DrainError, DrainResult, StoreError};
pub use ports::{DeliveryHandler, OutboxStore, handler_fn};
