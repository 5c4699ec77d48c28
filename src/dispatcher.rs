//! Routes inbound events to the ticker registry.

use crate::config::FilterConfig;
use crate::error::{EventError, PresenceError};
use crate::presence::{ConversationKey, TickerRegistry};
use crate::{BotProfile, ChatKind, EventKind, InboundEvent};

/// Outcome of dispatching one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// A new ticker was started for the conversation.
    Started(ConversationKey),
    /// The conversation's running ticker had its idle clock reset.
    Refreshed(ConversationKey),
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    NotAddressable(EventKind),
    ChatKindFiltered(ChatKind),
    OwnMessage,
    MalformedEvent,
    RegistryClosed,
}

/// Turns inbound events of one bot identity into ticker starts and refreshes.
///
/// Dispatching only touches the registry; it never waits on a presence call.
#[derive(Debug)]
pub struct EventDispatcher {
    registry: TickerRegistry,
    filter: FilterConfig,
    /// The connected bot's own user id, once known.
    self_user_id: Option<u64>,
}

impl EventDispatcher {
    pub fn new(registry: TickerRegistry, filter: FilterConfig) -> Self {
        Self {
            registry,
            filter,
            self_user_id: None,
        }
    }

    /// Remember who we are so our own messages don't start tickers.
    pub fn bind_profile(&mut self, profile: &BotProfile) {
        self.self_user_id = Some(profile.user_id);
    }

    pub fn registry(&self) -> &TickerRegistry {
        &self.registry
    }

    pub async fn dispatch(&self, event: &InboundEvent) -> Dispatch {
        if !event.kind.is_addressable() {
            return Dispatch::Ignored(IgnoreReason::NotAddressable(event.kind));
        }

        let chat = match event.chat {
            Some(chat) => chat,
            None => {
                let error = EventError::MissingChat {
                    event_id: event.id.clone(),
                    kind: event.kind,
                };
                tracing::warn!(bot_id = %self.registry.bot_id(), %error, "dropping malformed event");
                return Dispatch::Ignored(IgnoreReason::MalformedEvent);
            }
        };

        if !self.filter.allows(chat.kind) {
            return Dispatch::Ignored(IgnoreReason::ChatKindFiltered(chat.kind));
        }

        if self
            .self_user_id
            .is_some_and(|self_id| event.sender.is_some_and(|sender| sender.id == self_id))
        {
            return Dispatch::Ignored(IgnoreReason::OwnMessage);
        }

        let key = ConversationKey::new(self.registry.bot_id().clone(), chat.id);
        match self.registry.get_or_create(key.clone()).await {
            Ok(acquired) if acquired.created => {
                tracing::debug!(
                    bot_id = %key.bot_id(),
                    chat_id = key.chat_id(),
                    chat_kind = %chat.kind,
                    generation = acquired.ticker.generation(),
                    "started presence ticker"
                );
                Dispatch::Started(key)
            }
            Ok(_) => Dispatch::Refreshed(key),
            Err(error @ PresenceError::RegistryClosed(_)) => {
                tracing::debug!(chat_id = key.chat_id(), %error, "event arrived during shutdown");
                Dispatch::Ignored(IgnoreReason::RegistryClosed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresenceConfig;
    use crate::messaging::testing::{MockTransport, message_event};
    use crate::presence::{PresenceAction, PresenceEmitter};
    use crate::{ChatRef, Sender};
    use std::sync::Arc;
    use std::time::Duration;

    fn dispatcher(transport: Arc<MockTransport>) -> EventDispatcher {
        let settings = PresenceConfig::default();
        let emitter =
            PresenceEmitter::new(transport, PresenceAction::Typing, settings.emit_timeout);
        let registry = TickerRegistry::new(Arc::from("alpha"), emitter, settings);
        let mut dispatcher = EventDispatcher::new(registry, FilterConfig::default());
        dispatcher.bind_profile(&BotProfile {
            user_id: 1,
            username: Some("alpha_bot".into()),
        });
        dispatcher
    }

    #[tokio::test(start_paused = true)]
    async fn first_event_starts_and_later_events_refresh() {
        let transport = Arc::new(MockTransport::new(1));
        let dispatcher = dispatcher(transport.clone());
        let key = ConversationKey::new(Arc::from("alpha"), -500);

        assert_eq!(
            dispatcher.dispatch(&message_event(-500, 42)).await,
            Dispatch::Started(key.clone())
        );
        assert_eq!(
            dispatcher.dispatch(&message_event(-500, 43)).await,
            Dispatch::Refreshed(key)
        );
        assert_eq!(dispatcher.registry().len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn own_messages_are_ignored() {
        let transport = Arc::new(MockTransport::new(1));
        let dispatcher = dispatcher(transport.clone());

        let outcome = dispatcher.dispatch(&message_event(-500, 1)).await;

        assert_eq!(outcome, Dispatch::Ignored(IgnoreReason::OwnMessage));
        assert!(dispatcher.registry().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn channels_are_filtered_by_default() {
        let transport = Arc::new(MockTransport::new(1));
        let dispatcher = dispatcher(transport.clone());
        let mut event = message_event(-1009, 42);
        event.kind = EventKind::ChannelPost;
        event.chat = Some(ChatRef {
            id: -1009,
            kind: ChatKind::Channel,
        });

        let outcome = dispatcher.dispatch(&event).await;

        assert_eq!(
            outcome,
            Dispatch::Ignored(IgnoreReason::ChatKindFiltered(ChatKind::Channel))
        );
        assert!(transport.emissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn other_updates_are_not_addressable() {
        let transport = Arc::new(MockTransport::new(1));
        let dispatcher = dispatcher(transport.clone());
        let mut event = message_event(-500, 42);
        event.kind = EventKind::Other;

        assert_eq!(
            dispatcher.dispatch(&event).await,
            Dispatch::Ignored(IgnoreReason::NotAddressable(EventKind::Other))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn message_without_chat_is_dropped_and_dispatching_continues() {
        let transport = Arc::new(MockTransport::new(1));
        let dispatcher = dispatcher(transport.clone());
        let mut malformed = message_event(-500, 42);
        malformed.chat = None;

        assert_eq!(
            dispatcher.dispatch(&malformed).await,
            Dispatch::Ignored(IgnoreReason::MalformedEvent)
        );
        assert!(matches!(
            dispatcher.dispatch(&message_event(-500, 42)).await,
            Dispatch::Started(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn events_after_drain_are_swallowed() {
        let transport = Arc::new(MockTransport::new(1));
        let dispatcher = dispatcher(transport.clone());
        dispatcher.registry().drain_all().await;

        assert_eq!(
            dispatcher.dispatch(&message_event(-500, 42)).await,
            Dispatch::Ignored(IgnoreReason::RegistryClosed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_does_not_wait_for_slow_emits() {
        let transport = Arc::new(MockTransport::new(1));
        transport.set_emit_delay(Duration::from_secs(8));
        let dispatcher = dispatcher(transport.clone());
        let started = tokio::time::Instant::now();

        for chat_id in 1..=3 {
            let mut event = message_event(chat_id, 42);
            event.sender = Some(Sender {
                id: 42,
                is_bot: false,
            });
            dispatcher.dispatch(&event).await;
        }

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(dispatcher.registry().len().await, 3);
    }
}
