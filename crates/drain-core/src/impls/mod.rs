//! OutboxStore implementations.
//!
//! - `PgOutboxStore`: production store on PostgreSQL
//! - `InMemoryOutboxStore`: tests and local development

pub mod memory;
pub mod postgres;

pub use self::memory::InMemoryOutboxStore;
pub use self::postgres::{PgOutboxStore, SCHEMA_SQL, insert_outbox_event};
