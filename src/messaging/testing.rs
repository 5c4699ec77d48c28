//! Scripted in-memory transport for unit tests.

use crate::error::TransportError;
use crate::messaging::traits::{Connection, Transport};
use crate::presence::PresenceAction;
use crate::{BotProfile, ChatKind, ChatRef, EventKind, InboundEvent, Sender};

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One recorded `send_presence` call, successful or not.
#[derive(Debug, Clone)]
pub struct Emission {
    pub chat_id: i64,
    pub action: PresenceAction,
    pub at: Instant,
    pub succeeded: bool,
}

type EventSender = mpsc::UnboundedSender<Result<InboundEvent, TransportError>>;

/// Transport double. Presence calls succeed unless a result was queued with
/// `fail_next`; connects hand out queued streams, then a stream that never
/// yields.
pub struct MockTransport {
    profile: BotProfile,
    emissions: Mutex<Vec<Emission>>,
    emit_results: Mutex<VecDeque<Result<(), TransportError>>>,
    emit_delay: Mutex<Duration>,
    panic_next: AtomicBool,
    connects: Mutex<VecDeque<Result<mpsc::UnboundedReceiver<Result<InboundEvent, TransportError>>, TransportError>>>,
    connect_count: Mutex<u32>,
    shutdown_count: Mutex<u32>,
}

impl MockTransport {
    pub fn new(user_id: u64) -> Self {
        Self {
            profile: BotProfile {
                user_id,
                username: Some(format!("bot{user_id}")),
            },
            emissions: Mutex::new(Vec::new()),
            emit_results: Mutex::new(VecDeque::new()),
            emit_delay: Mutex::new(Duration::ZERO),
            panic_next: AtomicBool::new(false),
            connects: Mutex::new(VecDeque::new()),
            connect_count: Mutex::new(0),
            shutdown_count: Mutex::new(0),
        }
    }

    /// Queue results for the next presence calls, in order.
    pub fn fail_next(&self, results: impl IntoIterator<Item = TransportError>) {
        self.emit_results
            .lock()
            .unwrap()
            .extend(results.into_iter().map(Err));
    }

    /// Make the next presence call panic.
    pub fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn set_emit_delay(&self, delay: Duration) {
        *self.emit_delay.lock().unwrap() = delay;
    }

    /// Queue a successful connection and return the sender feeding its stream.
    pub fn push_connection(&self) -> EventSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connects.lock().unwrap().push_back(Ok(rx));
        tx
    }

    pub fn push_connect_error(&self, error: TransportError) {
        self.connects.lock().unwrap().push_back(Err(error));
    }

    pub fn emissions(&self) -> Vec<Emission> {
        self.emissions.lock().unwrap().clone()
    }

    pub fn emissions_for(&self, chat_id: i64) -> usize {
        self.emissions
            .lock()
            .unwrap()
            .iter()
            .filter(|emission| emission.chat_id == chat_id)
            .count()
    }

    pub fn connect_count(&self) -> u32 {
        *self.connect_count.lock().unwrap()
    }

    pub fn shutdown_count(&self) -> u32 {
        *self.shutdown_count.lock().unwrap()
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        *self.connect_count.lock().unwrap() += 1;
        let next = self.connects.lock().unwrap().pop_front();
        let events: crate::messaging::InboundStream = match next {
            Some(Ok(rx)) => Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)),
            Some(Err(error)) => return Err(error),
            None => Box::pin(futures::stream::pending()),
        };
        Ok(Connection {
            profile: self.profile.clone(),
            events,
        })
    }

    async fn send_presence(
        &self,
        chat_id: i64,
        action: PresenceAction,
    ) -> Result<(), TransportError> {
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("presence call to chat {chat_id} panicked");
        }
        let delay = *self.emit_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self.emit_results.lock().unwrap().pop_front().unwrap_or(Ok(()));
        self.emissions.lock().unwrap().push(Emission {
            chat_id,
            action,
            at: Instant::now(),
            succeeded: result.is_ok(),
        });
        result
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        *self.shutdown_count.lock().unwrap() += 1;
        Ok(())
    }
}

/// A plain message event in a group chat.
pub fn message_event(chat_id: i64, sender_id: u64) -> InboundEvent {
    InboundEvent {
        id: format!("{chat_id}-{sender_id}"),
        kind: EventKind::Message,
        chat: Some(ChatRef {
            id: chat_id,
            kind: ChatKind::Group,
        }),
        sender: Some(Sender {
            id: sender_id,
            is_bot: false,
        }),
        timestamp: chrono::Utc::now(),
    }
}
