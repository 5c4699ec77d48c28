//! Telegram transport using teloxide.

use crate::error::TransportError;
use crate::messaging::traits::{Connection, Transport};
use crate::presence::PresenceAction;
use crate::{BotProfile, ChatKind, ChatRef, EventKind, InboundEvent, Sender};

use arc_swap::ArcSwap;
use teloxide::payloads::setters::*;
use teloxide::requests::{Request, Requester};
use teloxide::types::{Chat, ChatAction, ChatId, Update, UpdateKind};
use teloxide::{ApiError, Bot, RequestError};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Telegram chat actions disappear after this long unless repeated.
pub const CHAT_ACTION_EXPIRY: Duration = Duration::from_secs(5);

const TELEGRAM_LONG_POLL_TIMEOUT_SECS: u32 = 30;
const TELEGRAM_HTTP_TIMEOUT: Duration = Duration::from_secs(35);

const INBOUND_BUFFER: usize = 256;

fn build_telegram_http_client() -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(TELEGRAM_HTTP_TIMEOUT)
        .tcp_nodelay(true);

    const TELOXIDE_PROXY: &str = "TELOXIDE_PROXY";

    if let Ok(proxy) = std::env::var(TELOXIDE_PROXY) {
        match reqwest::Proxy::all(proxy) {
            Ok(proxy) => {
                builder = builder.proxy(proxy);
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    "invalid TELOXIDE_PROXY URL; using direct Telegram connection"
                );
            }
        }
    }

    match builder.build() {
        Ok(client) => client,
        Err(error) => {
            tracing::warn!(
                %error,
                "failed to create telegram reqwest client with custom timeout, falling back to default client"
            );
            reqwest::Client::new()
        }
    }
}

/// Telegram transport for one bot token.
pub struct TelegramTransport {
    bot: Bot,
    drop_pending_updates: bool,
    /// Set once pending updates have been dropped; reconnects keep them.
    pending_dropped: AtomicBool,
    /// Next getUpdates offset, kept across reconnects.
    offset: Arc<AtomicI32>,
    /// Cancels the polling task of the current connection.
    poll_cancel: ArcSwap<CancellationToken>,
}

impl TelegramTransport {
    pub fn new(token: impl Into<String>, drop_pending_updates: bool) -> Self {
        let bot = Bot::with_client(token.into(), build_telegram_http_client());
        Self {
            bot,
            drop_pending_updates,
            pending_dropped: AtomicBool::new(false),
            offset: Arc::new(AtomicI32::new(0)),
            poll_cancel: ArcSwap::from_pointee(CancellationToken::new()),
        }
    }
}

impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        let me = self.bot.get_me().send().await.map_err(|e| classify(&e))?;
        let profile = BotProfile {
            user_id: me.id.0,
            username: me.username.clone(),
        };

        if self.drop_pending_updates && !self.pending_dropped.load(Ordering::Acquire) {
            self.bot
                .delete_webhook()
                .drop_pending_updates(true)
                .send()
                .await
                .map_err(|e| classify(&e))?;
            self.pending_dropped.store(true, Ordering::Release);
            tracing::debug!(bot_username = ?profile.username, "dropped pending telegram updates");
        }

        tracing::info!(
            bot_name = %me.first_name,
            bot_username = ?me.username,
            "telegram connected"
        );

        let cancel = CancellationToken::new();
        let previous = self.poll_cancel.swap(Arc::new(cancel.clone()));
        previous.cancel();

        let (events_tx, events_rx) = mpsc::channel(INBOUND_BUFFER);
        tokio::spawn(poll_updates(
            self.bot.clone(),
            self.offset.clone(),
            events_tx,
            cancel,
        ));

        Ok(Connection {
            profile,
            events: Box::pin(tokio_stream::wrappers::ReceiverStream::new(events_rx)),
        })
    }

    async fn send_presence(
        &self,
        chat_id: i64,
        action: PresenceAction,
    ) -> Result<(), TransportError> {
        self.bot
            .send_chat_action(ChatId(chat_id), action.into())
            .send()
            .await
            .map(|_| ())
            .map_err(|e| classify(&e))
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.poll_cancel.load().cancel();
        tracing::info!("telegram transport shut down");
        Ok(())
    }
}

/// Long-poll getUpdates until cancelled, the receiver goes away, or a poll
/// fails. A failed poll is forwarded as the stream's last item.
async fn poll_updates(
    bot: Bot,
    offset: Arc<AtomicI32>,
    events: mpsc::Sender<Result<InboundEvent, TransportError>>,
    cancel: CancellationToken,
) {
    loop {
        let request_started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("telegram polling loop shutting down");
                return;
            }
            _ = events.closed() => return,
            result = bot
                .get_updates()
                .offset(offset.load(Ordering::Acquire))
                .timeout(TELEGRAM_LONG_POLL_TIMEOUT_SECS)
                .send() => result,
        };

        let updates = match result {
            Ok(updates) => updates,
            Err(error) => {
                tracing::warn!(
                    %error,
                    elapsed_ms = request_started.elapsed().as_millis() as u64,
                    poll_timeout_secs = TELEGRAM_LONG_POLL_TIMEOUT_SECS,
                    http_timeout_secs = TELEGRAM_HTTP_TIMEOUT.as_secs(),
                    "telegram getUpdates failed"
                );
                let _ = events.send(Err(classify(&error))).await;
                return;
            }
        };

        if !forward_updates(&updates, &offset, &events).await {
            tracing::debug!("inbound receiver dropped, stopping telegram polling loop");
            return;
        }
    }
}

/// Hand a batch over in order. The offset only moves past an update once it
/// was delivered. Returns false if the receiver is gone.
async fn forward_updates(
    updates: &[Update],
    offset: &AtomicI32,
    events: &mpsc::Sender<Result<InboundEvent, TransportError>>,
) -> bool {
    for update in updates {
        if events.send(Ok(map_update(update))).await.is_err() {
            return false;
        }
        offset.store(update.id.as_offset(), Ordering::Release);
    }
    true
}

/// Reduce a Telegram update to an inbound event.
fn map_update(update: &Update) -> InboundEvent {
    let (kind, message) = match &update.kind {
        UpdateKind::Message(message) => (EventKind::Message, Some(message)),
        UpdateKind::EditedMessage(message) => (EventKind::EditedMessage, Some(message)),
        UpdateKind::ChannelPost(message) | UpdateKind::EditedChannelPost(message) => {
            (EventKind::ChannelPost, Some(message))
        }
        _ => (EventKind::Other, None),
    };

    let chat = match message {
        Some(message) => Some(chat_ref(&message.chat)),
        None => update.chat().map(chat_ref),
    };
    let sender = message
        .and_then(|message| message.from.as_ref())
        .or_else(|| update.from())
        .map(|user| Sender {
            id: user.id.0,
            is_bot: user.is_bot,
        });

    InboundEvent {
        id: update.id.0.to_string(),
        kind,
        chat,
        sender,
        timestamp: message
            .map(|message| message.date)
            .unwrap_or_else(chrono::Utc::now),
    }
}

fn chat_ref(chat: &Chat) -> ChatRef {
    let kind = if chat.is_private() {
        ChatKind::Private
    } else if chat.is_group() {
        ChatKind::Group
    } else if chat.is_supergroup() {
        ChatKind::Supergroup
    } else {
        ChatKind::Channel
    };
    ChatRef {
        id: chat.id.0,
        kind,
    }
}

/// Sort a Bot API failure into transient and permanent transport errors.
fn classify(error: &RequestError) -> TransportError {
    match error {
        RequestError::Api(api_error) => match api_error {
            ApiError::BotBlocked
            | ApiError::ChatNotFound
            | ApiError::UserNotFound
            | ApiError::BotKicked
            | ApiError::BotKickedFromSupergroup
            | ApiError::UserDeactivated
            | ApiError::CantInitiateConversation
            | ApiError::CantTalkWithBots => {
                TransportError::ConversationUnavailable(api_error.to_string())
            }
            ApiError::InvalidToken => TransportError::Unauthorized(api_error.to_string()),
            other => TransportError::Api(other.to_string()),
        },
        // The old chat id is dead; the new supergroup gets its own ticker on
        // its next message.
        RequestError::MigrateToChatId(new_chat_id) => TransportError::ConversationUnavailable(
            format!("group migrated to supergroup {new_chat_id}"),
        ),
        RequestError::RetryAfter(seconds) => TransportError::RateLimited(seconds.duration()),
        RequestError::Network(source) if source.is_timeout() => {
            TransportError::Timeout(TELEGRAM_HTTP_TIMEOUT)
        }
        RequestError::Network(source) => TransportError::Network(source.to_string()),
        other => TransportError::Api(other.to_string()),
    }
}

impl From<PresenceAction> for ChatAction {
    fn from(action: PresenceAction) -> Self {
        match action {
            PresenceAction::Typing => ChatAction::Typing,
            PresenceAction::UploadPhoto => ChatAction::UploadPhoto,
            PresenceAction::RecordVideo => ChatAction::RecordVideo,
            PresenceAction::UploadVideo => ChatAction::UploadVideo,
            PresenceAction::RecordVoice => ChatAction::RecordVoice,
            PresenceAction::UploadVoice => ChatAction::UploadVoice,
            PresenceAction::UploadDocument => ChatAction::UploadDocument,
            PresenceAction::ChooseSticker => ChatAction::ChooseSticker,
            PresenceAction::FindLocation => ChatAction::FindLocation,
            PresenceAction::RecordVideoNote => ChatAction::RecordVideoNote,
            PresenceAction::UploadVideoNote => ChatAction::UploadVideoNote,
        }
    }
}
