//! Conversation ticker: repeats the presence action for one conversation
//! until cancelled, idle, or rejected by the platform.

use crate::config::PresenceConfig;
use crate::error::TransportError;
use crate::presence::registry::RegistryInner;
use crate::presence::{ConversationKey, PresenceEmitter};

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Ticker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickerState {
    /// Emitting on cadence.
    Running,
    /// A stop condition fired. No further emits are issued.
    Stopping,
    /// Task finished and registry entry released.
    Stopped,
}

impl TickerState {
    /// Check if the ticker can move from this state to `target`.
    pub fn can_transition_to(self, target: TickerState) -> bool {
        use TickerState::*;

        matches!((self, target), (Running, Stopping) | (Stopping, Stopped))
    }
}

/// Why a ticker stopped.
#[derive(Debug, Clone)]
pub enum StopReason {
    /// Cancelled from outside (registry removal or shutdown).
    Cancelled,
    /// No refreshing event within the idle timeout.
    IdleTimeout,
    /// Too many transient failures in a row.
    FailureThreshold { failures: u32 },
    /// The platform refused the conversation or the identity.
    Rejected(TransportError),
    /// The ticker task ended without finishing its run, e.g. on a panic.
    Aborted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::IdleTimeout => write!(f, "idle timeout"),
            StopReason::FailureThreshold { failures } => {
                write!(f, "{failures} consecutive failures")
            }
            StopReason::Rejected(error) => write!(f, "rejected: {error}"),
            StopReason::Aborted => write!(f, "aborted"),
        }
    }
}

/// State shared between a ticker task and the handles that observe it.
pub(crate) struct TickerShared {
    key: ConversationKey,
    generation: u64,
    state: watch::Sender<TickerState>,
    last_activity: watch::Sender<Instant>,
    cancel: CancellationToken,
    emissions: AtomicU64,
    stop_reason: OnceLock<StopReason>,
}

impl TickerShared {
    fn transition_to(&self, target: TickerState) -> bool {
        self.state.send_if_modified(|state| {
            if state.can_transition_to(target) {
                *state = target;
                true
            } else {
                false
            }
        })
    }

    fn idle_deadline(&self, idle_timeout: Duration) -> Instant {
        let last_activity = *self.last_activity.borrow();
        last_activity
            .checked_add(idle_timeout)
            .unwrap_or_else(|| last_activity + FAR_FUTURE)
    }

    /// Move to `stopping` if the idle deadline has passed. Decided under the
    /// state lock, so it cannot interleave with `refresh`.
    fn stop_if_idle(&self, idle_timeout: Duration) -> bool {
        self.state.send_if_modified(|state| {
            if *state == TickerState::Running && self.idle_deadline(idle_timeout) <= Instant::now() {
                *state = TickerState::Stopping;
                true
            } else {
                false
            }
        })
    }
}

/// Stand-in deadline for idle timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Non-owning reference to a ticker. Cheap to clone; lets the registry look
/// tickers up, refresh and cancel them.
#[derive(Clone)]
pub struct TickerHandle {
    shared: Arc<TickerShared>,
}

impl std::fmt::Debug for TickerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickerHandle")
            .field("key", &self.shared.key)
            .field("generation", &self.shared.generation)
            .field("state", &self.state())
            .finish()
    }
}

impl TickerHandle {
    pub fn key(&self) -> &ConversationKey {
        &self.shared.key
    }

    /// Distinguishes successive tickers for the same key.
    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    pub fn state(&self) -> TickerState {
        *self.shared.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == TickerState::Running
    }

    /// Successful emits so far.
    pub fn emissions(&self) -> u64 {
        self.shared.emissions.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> Instant {
        *self.shared.last_activity.borrow()
    }

    /// Set once the ticker has stopped.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.shared.stop_reason.get().cloned()
    }

    /// Reset the idle clock. Returns false, leaving the clock alone, once the
    /// ticker has decided to stop.
    pub(crate) fn refresh(&self) -> bool {
        let mut refreshed = false;
        self.shared.state.send_if_modified(|state| {
            if *state == TickerState::Running {
                self.shared.last_activity.send_replace(Instant::now());
                refreshed = true;
            }
            false
        });
        refreshed
    }

    /// Ask the ticker to stop. No-op if it is already stopping or stopped.
    pub fn cancel(&self) {
        self.shared.transition_to(TickerState::Stopping);
        self.shared.cancel.cancel();
    }

    /// Wait until the ticker reaches `stopped`.
    pub async fn stopped(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|state| *state == TickerState::Stopped).await;
    }
}

/// The task side of a ticker. Consumed by `run`.
pub(crate) struct Ticker {
    shared: Arc<TickerShared>,
    emitter: PresenceEmitter,
    settings: PresenceConfig,
    registry: Weak<RegistryInner>,
}

impl Ticker {
    /// Build a running ticker and the handle that observes it.
    pub(crate) fn new(
        key: ConversationKey,
        generation: u64,
        emitter: PresenceEmitter,
        settings: PresenceConfig,
        registry: Weak<RegistryInner>,
    ) -> (Self, TickerHandle) {
        let (state, _) = watch::channel(TickerState::Running);
        let (last_activity, _) = watch::channel(Instant::now());
        let shared = Arc::new(TickerShared {
            key,
            generation,
            state,
            last_activity,
            cancel: CancellationToken::new(),
            emissions: AtomicU64::new(0),
            stop_reason: OnceLock::new(),
        });

        let handle = TickerHandle {
            shared: shared.clone(),
        };
        let ticker = Self {
            shared,
            emitter,
            settings,
            registry,
        };
        (ticker, handle)
    }

    /// Drive the ticker to `stopped`.
    pub(crate) async fn run(self) {
        let mut guard = AbortGuard {
            shared: self.shared.clone(),
            registry: self.registry.clone(),
            armed: true,
        };
        let key = &self.shared.key;
        tracing::debug!(
            bot_id = %key.bot_id(),
            chat_id = key.chat_id(),
            generation = self.shared.generation,
            cadence_ms = self.settings.cadence.as_millis() as u64,
            "presence ticker started"
        );

        let reason = self.cycle().await;
        self.shared.transition_to(TickerState::Stopping);

        match &reason {
            StopReason::Rejected(error) => tracing::info!(
                bot_id = %key.bot_id(),
                chat_id = key.chat_id(),
                %error,
                "platform rejected presence, stopping ticker"
            ),
            StopReason::FailureThreshold { failures } => tracing::warn!(
                bot_id = %key.bot_id(),
                chat_id = key.chat_id(),
                failures,
                "presence ticker giving up after consecutive failures"
            ),
            _ => tracing::debug!(
                bot_id = %key.bot_id(),
                chat_id = key.chat_id(),
                reason = %reason,
                emissions = self.shared.emissions.load(Ordering::Relaxed),
                "presence ticker stopping"
            ),
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.release(key, self.shared.generation).await;
        }

        let _ = self.shared.stop_reason.set(reason);
        self.shared.transition_to(TickerState::Stopped);
        guard.armed = false;
    }

    /// Emit on cadence until a stop condition fires.
    async fn cycle(&self) -> StopReason {
        let mut cadence = tokio::time::interval(self.settings.cadence);
        cadence.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            if let Some(reason) = self.wait_for_tick(&mut cadence).await {
                return reason;
            }

            match self.emitter.emit(&self.shared.key).await {
                Ok(()) => {
                    failures = 0;
                    self.shared.emissions.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) if error.is_permanent() => return StopReason::Rejected(error),
                Err(error) => {
                    failures += 1;
                    tracing::debug!(
                        bot_id = %self.shared.key.bot_id(),
                        chat_id = self.shared.key.chat_id(),
                        %error,
                        failures,
                        "presence emit failed, skipping cycle"
                    );
                    if failures >= self.settings.failure_threshold {
                        return StopReason::FailureThreshold { failures };
                    }
                }
            }
        }
    }

    /// Wait for the next cadence tick. Returns a stop reason instead if the
    /// ticker was cancelled or went idle first. A tick due at the same instant
    /// as the idle deadline is still served.
    async fn wait_for_tick(&self, cadence: &mut Interval) -> Option<StopReason> {
        let idle_timeout = self.settings.idle_timeout;
        loop {
            let idle_deadline = self.shared.idle_deadline(idle_timeout);
            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return Some(StopReason::Cancelled),
                _ = cadence.tick() => return None,
                _ = tokio::time::sleep_until(idle_deadline) => {
                    // The deadline may have moved while we slept.
                    if self.shared.stop_if_idle(idle_timeout) {
                        return Some(StopReason::IdleTimeout);
                    }
                    if *self.shared.state.borrow() != TickerState::Running {
                        return Some(StopReason::Cancelled);
                    }
                }
            }
        }
    }
}

/// Frees the registry slot and publishes `stopped` when a ticker task is
/// dropped before `run` completes.
struct AbortGuard {
    shared: Arc<TickerShared>,
    registry: Weak<RegistryInner>,
    armed: bool,
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let key = &self.shared.key;
        tracing::error!(
            bot_id = %key.bot_id(),
            chat_id = key.chat_id(),
            generation = self.shared.generation,
            "presence ticker task ended abnormally"
        );

        self.shared.cancel.cancel();
        let _ = self.shared.stop_reason.set(StopReason::Aborted);
        if let Some(registry) = self.registry.upgrade() {
            registry.release_detached(key.clone(), self.shared.generation);
        }
        self.shared.state.send_replace(TickerState::Stopped);
    }
}
