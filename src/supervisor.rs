//! Per-identity connection lifecycle and the runner for all identities.

use crate::config::{BotConfig, Config, FilterConfig, PresenceConfig, ReconnectConfig};
use crate::dispatcher::{Dispatch, EventDispatcher};
use crate::error::TransportError;
use crate::messaging::{InboundStream, TransportDyn};
use crate::presence::{PresenceAction, PresenceEmitter, TickerRegistry};
use crate::BotId;

use futures::StreamExt as _;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Lifecycle of one bot identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    Connected,
    Reconnecting,
    /// Shut down on request.
    Stopped,
    /// Gave up: the platform rejected the identity, retries ran out, or the
    /// supervisor task panicked.
    Failed,
}

impl SupervisorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SupervisorState::Stopped | SupervisorState::Failed)
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SupervisorState::Starting => "starting",
            SupervisorState::Connected => "connected",
            SupervisorState::Reconnecting => "reconnecting",
            SupervisorState::Stopped => "stopped",
            SupervisorState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Read-only view of a supervisor, for status reporting.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    bot_id: BotId,
    action: PresenceAction,
    registry: TickerRegistry,
    state: watch::Receiver<SupervisorState>,
}

impl SupervisorHandle {
    pub fn bot_id(&self) -> &BotId {
        &self.bot_id
    }

    pub fn action(&self) -> PresenceAction {
        self.action
    }

    /// Current state. A supervisor whose task died without reaching a
    /// terminal state reads as failed.
    pub fn state(&self) -> SupervisorState {
        let state = *self.state.borrow();
        if !state.is_terminal() && self.state.has_changed().is_err() {
            SupervisorState::Failed
        } else {
            state
        }
    }

    pub async fn active_tickers(&self) -> usize {
        self.registry.len().await
    }

    /// Wait until the supervisor reports `target`.
    pub async fn wait_for(&mut self, target: SupervisorState) {
        let _ = self.state.wait_for(|state| *state == target).await;
    }
}

/// Why event streaming stopped.
enum StreamEnd {
    Shutdown,
    Lost(Option<TransportError>),
}

/// Runs one bot identity: connect, feed events to the dispatcher, reconnect
/// with backoff, and tear everything down on shutdown.
pub struct BotSupervisor {
    bot_id: BotId,
    transport: Arc<dyn TransportDyn>,
    dispatcher: EventDispatcher,
    reconnect: ReconnectConfig,
    state: watch::Sender<SupervisorState>,
}

impl BotSupervisor {
    pub fn new(
        bot_id: BotId,
        transport: Arc<dyn TransportDyn>,
        action: PresenceAction,
        presence: PresenceConfig,
    ) -> Self {
        let emitter = PresenceEmitter::new(transport.clone(), action, presence.emit_timeout);
        let registry = TickerRegistry::new(bot_id.clone(), emitter, presence);
        let (state, _) = watch::channel(SupervisorState::Starting);

        Self {
            bot_id,
            transport,
            dispatcher: EventDispatcher::new(registry, FilterConfig::default()),
            reconnect: ReconnectConfig::default(),
            state,
        }
    }

    /// Build a supervisor for a configured bot.
    pub fn from_config(bot: &BotConfig, config: &Config, transport: Arc<dyn TransportDyn>) -> Self {
        Self::new(Arc::from(bot.id.as_str()), transport, bot.action, config.presence)
            .with_filter(config.filter.clone())
            .with_reconnect(config.reconnect)
    }

    pub fn with_filter(mut self, filter: FilterConfig) -> Self {
        let registry = self.dispatcher.registry().clone();
        self.dispatcher = EventDispatcher::new(registry, filter);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn bot_id(&self) -> &BotId {
        &self.bot_id
    }

    pub fn registry(&self) -> &TickerRegistry {
        self.dispatcher.registry()
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            bot_id: self.bot_id.clone(),
            action: self.dispatcher.registry().emitter().action(),
            registry: self.dispatcher.registry().clone(),
            state: self.state.subscribe(),
        }
    }

    /// Run until shutdown is signalled or the identity fails for good.
    /// Returns the terminal state.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SupervisorState {
        tracing::info!(
            bot_id = %self.bot_id,
            transport = self.transport.name(),
            action = %self.dispatcher.registry().emitter().action(),
            "bot supervisor started"
        );

        let outcome = self.connection_loop(&mut shutdown).await;

        self.dispatcher.registry().drain_all().await;
        if let Err(error) = self.transport.shutdown().await {
            tracing::warn!(bot_id = %self.bot_id, %error, "failed to shut down transport");
        }

        self.state.send_replace(outcome);
        tracing::info!(bot_id = %self.bot_id, state = %outcome, "bot supervisor finished");
        outcome
    }

    async fn connection_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> SupervisorState {
        let mut attempt = 0u32;

        loop {
            let connected = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return SupervisorState::Stopped,
                result = self.transport.connect() => result,
            };

            match connected {
                Ok(connection) => {
                    attempt = 0;
                    self.dispatcher.bind_profile(&connection.profile);
                    self.state.send_replace(SupervisorState::Connected);
                    tracing::info!(
                        bot_id = %self.bot_id,
                        bot_username = ?connection.profile.username,
                        "bot connected"
                    );

                    match self.stream_events(connection.events, shutdown).await {
                        StreamEnd::Shutdown => return SupervisorState::Stopped,
                        StreamEnd::Lost(Some(error)) if error.is_permanent() => {
                            tracing::error!(bot_id = %self.bot_id, %error, "bot identity rejected, giving up");
                            return SupervisorState::Failed;
                        }
                        StreamEnd::Lost(Some(error)) => {
                            tracing::warn!(bot_id = %self.bot_id, %error, "connection lost");
                        }
                        StreamEnd::Lost(None) => {
                            tracing::warn!(bot_id = %self.bot_id, "event stream ended");
                        }
                    }
                }
                Err(error) if error.is_permanent() => {
                    tracing::error!(bot_id = %self.bot_id, %error, "bot identity rejected, giving up");
                    return SupervisorState::Failed;
                }
                Err(error) => {
                    tracing::warn!(bot_id = %self.bot_id, %error, "failed to connect");
                }
            }

            attempt += 1;
            if self.reconnect.exhausted(attempt) {
                tracing::error!(
                    bot_id = %self.bot_id,
                    attempts = attempt - 1,
                    "reconnect attempts exhausted, giving up"
                );
                return SupervisorState::Failed;
            }

            let delay = self.reconnect.backoff_delay(attempt);
            self.state.send_replace(SupervisorState::Reconnecting);
            tracing::info!(
                bot_id = %self.bot_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );

            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return SupervisorState::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Feed events to the dispatcher in arrival order.
    async fn stream_events(
        &self,
        mut events: InboundStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return StreamEnd::Shutdown,
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if let Dispatch::Ignored(reason) = self.dispatcher.dispatch(&event).await {
                        tracing::trace!(bot_id = %self.bot_id, event_id = %event.id, ?reason, "event ignored");
                    }
                }
                Some(Err(error)) => return StreamEnd::Lost(Some(error)),
                None => return StreamEnd::Lost(None),
            }
        }
    }
}

/// Resolves once shutdown is signalled or the signal's sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|requested| *requested).await;
}

/// Run every supervisor in its own task, starting them `stagger` apart, and
/// wait for all of them. A panicking supervisor is reported as failed and
/// does not affect the others.
pub async fn run_all(
    supervisors: Vec<BotSupervisor>,
    shutdown: watch::Receiver<bool>,
    stagger: Duration,
) -> Vec<(BotId, SupervisorState)> {
    let mut tasks = JoinSet::new();
    let mut task_bots = HashMap::new();
    let mut outcomes = Vec::with_capacity(supervisors.len());
    let mut stagger_shutdown = shutdown.clone();

    let mut pending = supervisors.into_iter();
    let mut first = true;
    while let Some(supervisor) = pending.next() {
        if !first && !stagger.is_zero() {
            let interrupted = tokio::select! {
                biased;
                _ = shutdown_requested(&mut stagger_shutdown) => true,
                _ = tokio::time::sleep(stagger) => false,
            };
            if interrupted {
                // Never started; nothing to drain.
                for unstarted in std::iter::once(supervisor).chain(pending.by_ref()) {
                    unstarted.state.send_replace(SupervisorState::Stopped);
                    outcomes.push((unstarted.bot_id.clone(), SupervisorState::Stopped));
                }
                break;
            }
        }
        first = false;

        let bot_id = supervisor.bot_id.clone();
        let handle = tasks.spawn(supervisor.run(shutdown.clone()));
        task_bots.insert(handle.id(), bot_id);
    }

    while let Some(result) = tasks.join_next_with_id().await {
        match result {
            Ok((id, state)) => {
                if let Some(bot_id) = task_bots.remove(&id) {
                    outcomes.push((bot_id, state));
                }
            }
            Err(error) => {
                let bot_id = task_bots.remove(&error.id());
                tracing::error!(bot_id = ?bot_id, %error, "bot supervisor crashed");
                if let Some(bot_id) = bot_id {
                    outcomes.push((bot_id, SupervisorState::Failed));
                }
            }
        }
    }

    outcomes
}
