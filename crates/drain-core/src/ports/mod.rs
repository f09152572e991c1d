//! Ports - seams between the drain and the outside world.
//!
//! - `OutboxStore`: the durable queue (PostgreSQL in production)
//! - `DeliveryHandler`: where a claimed event goes
//! - `Clock`: time source for the in-memory store

pub mod clock;
pub mod handler;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::handler::{DeliveryHandler, FnHandler, handler_fn};
pub use self::store::OutboxStore;
