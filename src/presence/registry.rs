//! Ticker registry: at most one live ticker per conversation key.

use crate::BotId;
use crate::config::PresenceConfig;
use crate::error::PresenceError;
use crate::presence::ticker::Ticker;
use crate::presence::{ConversationKey, PresenceEmitter, TickerHandle};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;

/// Result of `TickerRegistry::get_or_create`.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub ticker: TickerHandle,
    /// False when an already running ticker was refreshed.
    pub created: bool,
}

/// Registry of presence tickers for one bot identity.
///
/// Entries are handles, not tasks. Ticker tasks are owned by the registry's
/// task tracker so shutdown can wait for every one of them, including
/// tickers that were already replaced in the map.
#[derive(Clone)]
pub struct TickerRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    bot_id: BotId,
    emitter: PresenceEmitter,
    settings: PresenceConfig,
    slots: RwLock<Slots>,
    tasks: TaskTracker,
    next_generation: AtomicU64,
}

#[derive(Default)]
struct Slots {
    tickers: HashMap<ConversationKey, TickerHandle>,
    closed: bool,
}

impl Slots {
    /// Drop the entry for `key` if it still belongs to `generation`.
    fn release(&mut self, key: &ConversationKey, generation: u64) {
        if self
            .tickers
            .get(key)
            .is_some_and(|handle| handle.generation() == generation)
        {
            self.tickers.remove(key);
        }
    }
}

impl std::fmt::Debug for TickerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickerRegistry")
            .field("bot_id", &self.inner.bot_id)
            .finish_non_exhaustive()
    }
}

impl TickerRegistry {
    pub fn new(bot_id: BotId, emitter: PresenceEmitter, settings: PresenceConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                bot_id,
                emitter,
                settings,
                slots: RwLock::new(Slots::default()),
                tasks: TaskTracker::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn bot_id(&self) -> &BotId {
        &self.inner.bot_id
    }

    pub fn emitter(&self) -> &PresenceEmitter {
        &self.inner.emitter
    }

    /// Return the running ticker for `key`, refreshing its idle clock, or
    /// start a new one. Check and insert happen under one write guard, so
    /// concurrent calls for the same key create exactly one ticker.
    pub async fn get_or_create(&self, key: ConversationKey) -> Result<Acquired, PresenceError> {
        debug_assert_eq!(key.bot_id(), &self.inner.bot_id);

        let mut slots = self.inner.slots.write().await;
        if slots.closed {
            return Err(PresenceError::RegistryClosed(self.inner.bot_id.to_string()));
        }

        if let Some(existing) = slots.tickers.get(&key) {
            if existing.refresh() {
                return Ok(Acquired {
                    ticker: existing.clone(),
                    created: false,
                });
            }
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (ticker, handle) = Ticker::new(
            key.clone(),
            generation,
            self.inner.emitter.clone(),
            self.inner.settings,
            Arc::downgrade(&self.inner),
        );
        self.inner.tasks.spawn(ticker.run());

        // A stopping ticker may still hold the slot until it releases itself.
        if let Some(previous) = slots.tickers.insert(key, handle.clone()) {
            previous.cancel();
        }

        Ok(Acquired {
            ticker: handle,
            created: true,
        })
    }

    /// Look up the entry for `key`.
    pub async fn get(&self, key: &ConversationKey) -> Option<TickerHandle> {
        self.inner.slots.read().await.tickers.get(key).cloned()
    }

    /// Remove the entry for `key` and cancel its ticker.
    pub async fn remove(&self, key: &ConversationKey) -> Option<TickerHandle> {
        let removed = self.inner.slots.write().await.tickers.remove(key);
        if let Some(handle) = &removed {
            handle.cancel();
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.slots.read().await.tickers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.slots.read().await.tickers.is_empty()
    }

    pub async fn keys(&self) -> Vec<ConversationKey> {
        self.inner.slots.read().await.tickers.keys().cloned().collect()
    }

    /// Close the registry, cancel every ticker and wait until all of them
    /// have stopped. Later `get_or_create` calls fail.
    pub async fn drain_all(&self) {
        let handles: Vec<TickerHandle> = {
            let mut slots = self.inner.slots.write().await;
            slots.closed = true;
            slots.tickers.drain().map(|(_, handle)| handle).collect()
        };

        for handle in &handles {
            handle.cancel();
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        tracing::debug!(
            bot_id = %self.inner.bot_id,
            drained = handles.len(),
            "ticker registry drained"
        );
    }
}

impl RegistryInner {
    /// Drop the entry for `key` if it still belongs to `generation`.
    pub(crate) async fn release(&self, key: &ConversationKey, generation: u64) {
        self.slots.write().await.release(key, generation);
    }

    /// `release` for callers that can't await. Falls back to a spawned task
    /// when the slots are locked.
    pub(crate) fn release_detached(self: Arc<Self>, key: ConversationKey, generation: u64) {
        if let Ok(mut slots) = self.slots.try_write() {
            slots.release(&key, generation);
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { self.release(&key, generation).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::testing::MockTransport;
    use crate::presence::{PresenceAction, StopReason, TickerState};
    use std::time::Duration;

    fn registry(transport: Arc<MockTransport>) -> TickerRegistry {
        let settings = PresenceConfig {
            cadence: Duration::from_secs(4),
            idle_timeout: Duration::from_secs(30),
            failure_threshold: 3,
            emit_timeout: Duration::from_secs(2),
        };
        let emitter = PresenceEmitter::new(transport, PresenceAction::Typing, settings.emit_timeout);
        TickerRegistry::new(Arc::from("alpha"), emitter, settings)
    }

    fn key(chat_id: i64) -> ConversationKey {
        ConversationKey::new(Arc::from("alpha"), chat_id)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_get_or_create_yields_one_ticker() {
        let transport = Arc::new(MockTransport::new(1));
        let registry = registry(transport.clone());

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create(key(9)).await.unwrap() })
            })
            .collect();

        let mut created = 0;
        let mut generations = std::collections::HashSet::new();
        for attempt in attempts {
            let acquired = attempt.await.unwrap();
            created += usize::from(acquired.created);
            generations.insert(acquired.ticker.generation());
        }

        assert_eq!(created, 1);
        assert_eq!(generations.len(), 1);
        assert_eq!(registry.len().await, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.emissions_for(9), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_returns_the_same_ticker_and_resets_idle_clock() {
        let transport = Arc::new(MockTransport::new(1));
        let registry = registry(transport.clone());

        let first = registry.get_or_create(key(9)).await.unwrap();
        let before = first.ticker.last_activity();
        tokio::time::sleep(Duration::from_secs(10)).await;
        let second = registry.get_or_create(key(9)).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.ticker.generation(), second.ticker.generation());
        assert!(second.ticker.last_activity() > before);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_ticker_is_absent_and_next_event_starts_a_new_one() {
        let transport = Arc::new(MockTransport::new(1));
        let registry = registry(transport.clone());

        let first = registry.get_or_create(key(9)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(first.ticker.state(), TickerState::Stopped);
        assert!(registry.get(&key(9)).await.is_none());

        let second = registry.get_or_create(key(9)).await.unwrap();
        assert!(second.created);
        assert_ne!(first.ticker.generation(), second.ticker.generation());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_release_does_not_remove_newer_ticker() {
        let transport = Arc::new(MockTransport::new(1));
        let registry = registry(transport.clone());

        let first = registry.get_or_create(key(9)).await.unwrap();
        first.ticker.cancel();
        // The stopping ticker still owns the slot until it releases itself;
        // a new event replaces it.
        let second = registry.get_or_create(key(9)).await.unwrap();
        assert!(second.created);

        first.ticker.stopped().await;
        let current = registry.get(&key(9)).await.unwrap();
        assert_eq!(current.generation(), second.ticker.generation());
        assert!(current.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_cancels_the_ticker() {
        let transport = Arc::new(MockTransport::new(1));
        let registry = registry(transport.clone());

        let acquired = registry.get_or_create(key(9)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let removed = registry.remove(&key(9)).await.unwrap();
        removed.stopped().await;

        assert_eq!(removed.generation(), acquired.ticker.generation());
        assert!(matches!(removed.stop_reason(), Some(StopReason::Cancelled)));
        assert!(registry.remove(&key(9)).await.is_none());

        let emitted = transport.emissions_for(9);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(transport.emissions_for(9), emitted);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_all_stops_everything_and_closes() {
        let transport = Arc::new(MockTransport::new(1));
        let registry = registry(transport.clone());

        let tickers: Vec<_> = futures::future::join_all((1..=5).map(|chat| registry.get_or_create(key(chat))))
            .await
            .into_iter()
            .map(|acquired| acquired.unwrap().ticker)
            .collect();
        tokio::time::sleep(Duration::from_secs(6)).await;

        registry.drain_all().await;

        assert!(registry.is_empty().await);
        for ticker in &tickers {
            assert_eq!(ticker.state(), TickerState::Stopped);
        }
        let emitted = transport.emissions().len();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.emissions().len(), emitted);

        let error = registry.get_or_create(key(1)).await.unwrap_err();
        assert!(matches!(error, PresenceError::RegistryClosed(bot) if bot == "alpha"));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_all_waits_for_in_flight_emits() {
        let transport = Arc::new(MockTransport::new(1));
        transport.set_emit_delay(Duration::from_secs(1));
        let registry = registry(transport.clone());

        let acquired = registry.get_or_create(key(3)).await.unwrap();
        // Let the first emit start; it is now sleeping inside the transport.
        tokio::time::sleep(Duration::from_millis(500)).await;
        registry.drain_all().await;

        assert_eq!(acquired.ticker.state(), TickerState::Stopped);
        assert_eq!(transport.emissions_for(3), 1);
    }
}
