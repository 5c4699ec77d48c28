//! Presence emitter: one chat action call per invocation.

use crate::error::TransportError;
use crate::messaging::TransportDyn;
use crate::presence::{ConversationKey, PresenceAction};

use std::sync::Arc;
use std::time::Duration;

/// Issues presence calls for one bot identity.
///
/// Holds no per-conversation state. Each `emit` is a single platform call
/// bounded by `timeout`; retrying is up to the caller.
#[derive(Clone)]
pub struct PresenceEmitter {
    transport: Arc<dyn TransportDyn>,
    action: PresenceAction,
    timeout: Duration,
}

impl std::fmt::Debug for PresenceEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceEmitter")
            .field("transport", &self.transport.name())
            .field("action", &self.action)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PresenceEmitter {
    pub fn new(transport: Arc<dyn TransportDyn>, action: PresenceAction, timeout: Duration) -> Self {
        Self {
            transport,
            action,
            timeout,
        }
    }

    pub fn action(&self) -> PresenceAction {
        self.action
    }

    /// Show the configured action in the key's chat.
    pub async fn emit(&self, key: &ConversationKey) -> Result<(), TransportError> {
        match tokio::time::timeout(
            self.timeout,
            self.transport.send_presence(key.chat_id(), self.action),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}
