//! Transport trait and dynamic dispatch companion.

use crate::error::TransportError;
use crate::presence::PresenceAction;
use crate::{BotProfile, InboundEvent};

use futures::Stream;
use std::pin::Pin;

/// Inbound event stream. An `Err` item reports why the connection is going
/// away; the stream ending means the connection was lost.
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<InboundEvent, TransportError>> + Send>>;

/// A live connection to the platform.
pub struct Connection {
    pub profile: BotProfile,
    pub events: InboundStream,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

/// Static trait for platform transports.
/// Use this for type-safe implementations.
pub trait Transport: Send + Sync + 'static {
    /// Platform name, used in logs.
    fn name(&self) -> &str;

    /// Connect and start streaming inbound events.
    fn connect(
        &self,
    ) -> impl std::future::Future<Output = Result<Connection, TransportError>> + Send;

    /// Ask the platform to show `action` in `chat_id`. One call, no retries.
    fn send_presence(
        &self,
        chat_id: i64,
        action: PresenceAction,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Close the connection. Any open inbound stream ends.
    fn shutdown(&self) -> impl std::future::Future<Output = Result<(), TransportError>> + Send {
        async { Ok(()) }
    }
}

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn TransportDyn>`.
pub trait TransportDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn connect<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Connection, TransportError>> + Send + 'a>>;

    fn send_presence<'a>(
        &'a self,
        chat_id: i64,
        action: PresenceAction,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), TransportError>> + Send + 'a>>;

    fn shutdown<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), TransportError>> + Send + 'a>>;
}

/// Blanket implementation: any type implementing Transport automatically implements TransportDyn.
impl<T: Transport> TransportDyn for T {
    fn name(&self) -> &str {
        Transport::name(self)
    }

    fn connect<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Connection, TransportError>> + Send + 'a>>
    {
        Box::pin(Transport::connect(self))
    }

    fn send_presence<'a>(
        &'a self,
        chat_id: i64,
        action: PresenceAction,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(Transport::send_presence(self, chat_id, action))
    }

    fn shutdown<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(Transport::shutdown(self))
    }
}
