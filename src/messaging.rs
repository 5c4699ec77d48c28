//! Messaging platform transports.

pub mod telegram;
#[cfg(test)]
pub mod testing;
pub mod traits;

pub use telegram::TelegramTransport;
pub use traits::{Connection, InboundStream, Transport, TransportDyn};
