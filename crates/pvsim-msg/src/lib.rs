//! ---
//! pvsim_section: "02-messaging"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Frame codec and broker transports."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Messaging primitives shared by the meter and PV services: the textual
//! `START`/`DATA`/`END` frame codec, the queue transport abstraction with its
//! in-memory and AMQP backends, and reconnect backoff.

pub mod amqp;
pub mod frame;
pub mod retry;
pub mod transport;

/// Shared result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Decode failures for a single frame. Never fatal to a consumer loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The frame does not follow the `TAG::payload` grammar.
    #[error("malformed frame {input:?}: {reason}")]
    Malformed {
        /// Offending input, lossily decoded.
        input: String,
        /// What did not parse.
        reason: &'static str,
    },
    /// Tag is syntactically fine but not one of `START`, `DATA`, `END`.
    #[error("unknown frame tag {0:?}")]
    UnknownTag(String),
}

/// Broker-side failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connecting to the broker failed or the connection dropped.
    #[error("broker connection failure: {0}")]
    Connection(String),
    /// An operation was attempted without a live channel.
    #[error("transport is not connected")]
    NotConnected,
    /// The broker or consumer stream closed.
    #[error("transport closed")]
    Closed,
    /// Publisher confirm came back negative.
    #[error("broker rejected published frame")]
    Nacked,
    /// Ack or reject for a delivery tag that is not outstanding.
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),
    /// Error surfaced by the AMQP client.
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}

pub use amqp::AmqpTransport;
pub use frame::Frame;
pub use retry::{connect_with_retry, RetryPolicy};
pub use transport::{Delivery, InMemoryTransport, Transport};
