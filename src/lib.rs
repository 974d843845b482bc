//! Signature-driven DBus message bodies and an async call core.
//!
//! This crate sits between application code and a DBus transport. It does
//! not open sockets or encode headers. What it does do:
//!
//! * Parse type signatures into trees, cached per process, in the
//!   [`signature`] module.
//! * Represent message bodies as [`Value`] trees, including variants that
//!   carry their own signature.
//! * Move unix file descriptors between a body and the out-of-band
//!   descriptor array a message carries them in, in the [`fds`] module.
//!   A body can hold the same descriptor more than once and it is only
//!   sent once.
//! * Marshal bodies to and from the DBus wire format ([`ser`] and [`de`]).
//! * Run a connection inside a scope ([`bus`]) that correlates replies to
//!   calls by serial and guarantees that nothing outlives the connection:
//!   when it ends, every task started in it is stopped and every caller
//!   still waiting for a reply is told why.
//!
//! Messages come in two forms: a [`Message`] with descriptors held
//! directly in its body, and a [`Frame`] that is what a transport reads
//! and writes.
//!
//! [`Message`]: crate::message::Message
//! [`Frame`]: crate::message::Frame

mod align;
pub mod bus;
pub mod de;
pub mod error;
pub mod fds;
pub mod message;
mod primitives;
pub mod ser;
pub mod signature;
pub mod value;

pub use bus::{BusConfig, Connection, ConnectionState, MessageBus};
pub use error::{Error, Result};
pub use fds::{from_indexed, signature_contains_type, to_indexed};
pub use message::{Frame, Message, MessageType};
pub use signature::{parse_signature, SignatureTree};
pub use value::{Value, Variant};
