//! Typed event API on top of the opaque payload contract.
//!
//! - `Event`: payload type + its event-type string
//! - `EventHandler<E>`: handles a decoded `E`
//! - `TypedHandler<E, H>`: erases to `DeliveryHandler` for the `Router`

pub mod event;
pub mod handler;

pub use self::event::Event;
pub use self::handler::{EventHandler, TypedHandler};
