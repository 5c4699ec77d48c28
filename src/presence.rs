//! Presence simulation: conversation keys, emitter, tickers and their registry.

pub mod action;
pub mod emitter;
pub mod key;
pub mod registry;
pub mod ticker;

pub use action::PresenceAction;
pub use emitter::PresenceEmitter;
pub use key::ConversationKey;
pub use registry::{Acquired, TickerRegistry};
pub use ticker::{StopReason, TickerHandle, TickerState};
