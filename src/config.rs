//! Configuration loading and validation.

use crate::ChatKind;
use crate::error::{ConfigError, Result};
use crate::presence::PresenceAction;

use anyhow::Context as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level presencebot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance root directory (~/.presencebot or PRESENCEBOT_DIR).
    pub instance_dir: PathBuf,
    /// Bot identities, one supervisor each.
    pub bots: Vec<BotConfig>,
    /// Ticker timing shared by all identities.
    pub presence: PresenceConfig,
    /// Reconnect policy for lost platform connections.
    pub reconnect: ReconnectConfig,
    /// Which inbound events start a ticker.
    pub filter: FilterConfig,
    /// HTTP health endpoint.
    pub api: ApiConfig,
    /// Delay between starting consecutive identities.
    pub startup_stagger: Duration,
    /// Skip updates that queued up while the bot was offline.
    pub drop_pending_updates: bool,
}

/// One bot identity.
#[derive(Clone)]
pub struct BotConfig {
    pub id: String,
    pub token: String,
    pub action: PresenceAction,
    pub enabled: bool,
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("id", &self.id)
            .field("token", &"[redacted]")
            .field("action", &self.action)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Ticker timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Interval between presence calls. Must stay below the platform's
    /// expiry window or the indicator flickers.
    pub cadence: Duration,
    /// A ticker with no refreshing event for this long stops.
    pub idle_timeout: Duration,
    /// Consecutive transient failures that stop a ticker.
    pub failure_threshold: u32,
    /// Bound on a single presence call.
    pub emit_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_secs(4),
            idle_timeout: Duration::from_secs(300),
            failure_threshold: 5,
            emit_timeout: Duration::from_secs(10),
        }
    }
}

/// Exponential backoff for reconnecting a lost transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Give up after this many consecutive failed attempts. None retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_retries.is_some_and(|max| attempt > max)
    }
}

/// Inbound event filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    /// Chat kinds that get a ticker.
    pub chat_kinds: Vec<ChatKind>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            chat_kinds: vec![ChatKind::Private, ChatKind::Group, ChatKind::Supergroup],
        }
    }
}

impl FilterConfig {
    pub fn allows(&self, kind: ChatKind) -> bool {
        self.chat_kinds.contains(&kind)
    }
}

/// HTTP health endpoint configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".into(),
            port: DEFAULT_API_PORT,
        }
    }
}

const DEFAULT_API_PORT: u16 = 5000;
const DEFAULT_STARTUP_STAGGER: Duration = Duration::from_secs(3);
/// Upper bound for every configured duration.
pub const MAX_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

// -- TOML deserialization types --

#[derive(Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    presence: TomlPresenceConfig,
    #[serde(default)]
    reconnect: TomlReconnectConfig,
    #[serde(default)]
    filter: TomlFilterConfig,
    #[serde(default)]
    api: TomlApiConfig,
    startup_stagger_secs: Option<u64>,
    drop_pending_updates: Option<bool>,
    #[serde(default)]
    bots: Vec<TomlBotConfig>,
}

#[derive(Deserialize, Default)]
struct TomlPresenceConfig {
    action: Option<String>,
    cadence_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    failure_threshold: Option<u32>,
    emit_timeout_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlReconnectConfig {
    initial_backoff_secs: Option<u64>,
    max_backoff_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Deserialize, Default)]
struct TomlFilterConfig {
    chat_types: Option<Vec<ChatKind>>,
}

#[derive(Deserialize, Default)]
struct TomlApiConfig {
    enabled: Option<bool>,
    bind: Option<String>,
    port: Option<u16>,
}

#[derive(Deserialize)]
struct TomlBotConfig {
    id: Option<String>,
    token: Option<String>,
    action: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Resolve a value that might be an "env:VAR_NAME" reference.
fn resolve_env_value(value: &str, env: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    if let Some(var_name) = value.strip_prefix("env:") {
        env(var_name)
    } else {
        Some(value.to_string())
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &dyn Fn(&str) -> Option<String>,
    name: &'static str,
) -> std::result::Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|error| ConfigError::InvalidValue {
                field: name,
                reason: error.to_string(),
            }),
        None => Ok(None),
    }
}

fn parse_action(raw: Option<&str>) -> std::result::Result<Option<PresenceAction>, ConfigError> {
    raw.map(str::parse).transpose()
}

/// Build bot identities from a comma-separated token list.
fn bots_from_tokens(raw: &str, default_action: Option<PresenceAction>) -> Vec<BotConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .enumerate()
        .map(|(index, token)| BotConfig {
            id: format!("bot{}", index + 1),
            token: token.to_string(),
            action: default_action.unwrap_or_else(|| PresenceAction::for_index(index)),
            enabled: true,
        })
        .collect()
}

fn port_from_env(env: &dyn Fn(&str) -> Option<String>) -> std::result::Result<u16, ConfigError> {
    Ok(parse_env::<u16>(env, "PORT")?.unwrap_or(DEFAULT_API_PORT))
}

impl Config {
    /// Resolve the instance directory from env or default (~/.presencebot).
    pub fn default_instance_dir() -> PathBuf {
        std::env::var("PRESENCEBOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|d| d.join(".presencebot"))
                    .unwrap_or_else(|| PathBuf::from("./.presencebot"))
            })
    }

    /// Load configuration from the default config file, falling back to env vars.
    pub fn load() -> Result<Self> {
        let instance_dir = Self::default_instance_dir();

        let config_path = instance_dir.join("config.toml");
        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::load_from_env(&instance_dir)
        }
    }

    /// Load from a specific TOML config file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let instance_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        Self::from_toml_str(&content, instance_dir, &|name| std::env::var(name).ok())
    }

    /// Load from environment variables only (no config file).
    pub fn load_from_env(instance_dir: &Path) -> Result<Self> {
        Self::from_env_lookup(instance_dir, &|name| std::env::var(name).ok())
    }

    fn from_env_lookup(
        instance_dir: &Path,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let default_action = parse_action(env("PRESENCE_ACTION").as_deref())?;
        let bots = bots_from_tokens(&env("BOT_TOKENS").unwrap_or_default(), default_action);

        let defaults = PresenceConfig::default();
        let presence = PresenceConfig {
            cadence: parse_env::<u64>(env, "PRESENCE_CADENCE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.cadence),
            idle_timeout: parse_env::<u64>(env, "PRESENCE_IDLE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            failure_threshold: parse_env::<u32>(env, "PRESENCE_FAILURE_THRESHOLD")?
                .unwrap_or(defaults.failure_threshold),
            emit_timeout: defaults.emit_timeout,
        };

        let config = Self {
            instance_dir: instance_dir.to_path_buf(),
            bots,
            presence,
            reconnect: ReconnectConfig::default(),
            filter: FilterConfig::default(),
            api: ApiConfig {
                port: port_from_env(env)?,
                ..ApiConfig::default()
            },
            startup_stagger: DEFAULT_STARTUP_STAGGER,
            drop_pending_updates: true,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document. `env` resolves `env:VAR` values
    /// and the environment fallbacks.
    pub fn from_toml_str(
        content: &str,
        instance_dir: PathBuf,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let toml_config: TomlConfig =
            toml::from_str(content).context("failed to parse config TOML")?;
        Self::from_toml(toml_config, instance_dir, env)
    }

    fn from_toml(
        toml: TomlConfig,
        instance_dir: PathBuf,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let default_action = parse_action(toml.presence.action.as_deref())?;

        let mut bots = Vec::with_capacity(toml.bots.len());
        for (index, bot) in toml.bots.into_iter().enumerate() {
            let id = bot.id.unwrap_or_else(|| format!("bot{}", index + 1));
            let token = bot
                .token
                .as_deref()
                .and_then(|value| resolve_env_value(value, env))
                .filter(|token| !token.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingToken(id.clone()))?;
            let action = parse_action(bot.action.as_deref())?
                .or(default_action)
                .unwrap_or_else(|| PresenceAction::for_index(index));

            bots.push(BotConfig {
                id,
                token,
                action,
                enabled: bot.enabled,
            });
        }

        // No [[bots]] in the file: fall back to BOT_TOKENS.
        if bots.is_empty() {
            bots = bots_from_tokens(&env("BOT_TOKENS").unwrap_or_default(), default_action);
        }

        let presence_defaults = PresenceConfig::default();
        let presence = PresenceConfig {
            cadence: toml
                .presence
                .cadence_secs
                .map(Duration::from_secs)
                .unwrap_or(presence_defaults.cadence),
            idle_timeout: toml
                .presence
                .idle_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(presence_defaults.idle_timeout),
            failure_threshold: toml
                .presence
                .failure_threshold
                .unwrap_or(presence_defaults.failure_threshold),
            emit_timeout: toml
                .presence
                .emit_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(presence_defaults.emit_timeout),
        };

        let reconnect_defaults = ReconnectConfig::default();
        let reconnect = ReconnectConfig {
            initial_backoff: toml
                .reconnect
                .initial_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(reconnect_defaults.initial_backoff),
            max_backoff: toml
                .reconnect
                .max_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(reconnect_defaults.max_backoff),
            max_retries: toml.reconnect.max_retries,
        };

        let filter = toml
            .filter
            .chat_types
            .map(|chat_kinds| FilterConfig { chat_kinds })
            .unwrap_or_default();

        let api_defaults = ApiConfig::default();
        let api = ApiConfig {
            enabled: toml.api.enabled.unwrap_or(api_defaults.enabled),
            bind: toml.api.bind.unwrap_or(api_defaults.bind),
            port: match toml.api.port {
                Some(port) => port,
                None => port_from_env(env)?,
            },
        };

        let config = Self {
            instance_dir,
            bots,
            presence,
            reconnect,
            filter,
            api,
            startup_stagger: toml
                .startup_stagger_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STARTUP_STAGGER),
            drop_pending_updates: toml.drop_pending_updates.unwrap_or(true),
        };
        config.validate()?;
        Ok(config)
    }

    /// Bots that should be started.
    pub fn enabled_bots(&self) -> impl Iterator<Item = &BotConfig> {
        self.bots.iter().filter(|bot| bot.enabled)
    }

    /// Reject configurations the service can't run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.enabled_bots().next().is_none() {
            return Err(ConfigError::NoIdentities);
        }

        for (index, bot) in self.bots.iter().enumerate() {
            if self.bots[..index].iter().any(|other| other.id == bot.id) {
                return Err(ConfigError::InvalidValue {
                    field: "bots.id",
                    reason: format!("duplicate bot id '{}'", bot.id),
                });
            }
        }

        let non_zero = [
            ("presence.cadence_secs", self.presence.cadence),
            ("presence.idle_timeout_secs", self.presence.idle_timeout),
            ("presence.emit_timeout_secs", self.presence.emit_timeout),
            ("reconnect.initial_backoff_secs", self.reconnect.initial_backoff),
        ];
        for (field, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }

        let bounded = [
            ("presence.cadence_secs", self.presence.cadence),
            ("presence.idle_timeout_secs", self.presence.idle_timeout),
            ("presence.emit_timeout_secs", self.presence.emit_timeout),
            ("reconnect.initial_backoff_secs", self.reconnect.initial_backoff),
            ("reconnect.max_backoff_secs", self.reconnect.max_backoff),
            ("startup_stagger_secs", self.startup_stagger),
        ];
        for (field, value) in bounded {
            if value > MAX_DURATION {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("must not exceed {} seconds", MAX_DURATION.as_secs()),
                });
            }
        }

        if self.presence.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "presence.failure_threshold",
                reason: "must be at least 1".into(),
            });
        }

        if self.reconnect.max_backoff < self.reconnect.initial_backoff {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.max_backoff_secs",
                reason: "must not be below initial_backoff_secs".into(),
            });
        }

        if self.presence.cadence >= crate::messaging::telegram::CHAT_ACTION_EXPIRY {
            tracing::warn!(
                cadence_secs = self.presence.cadence.as_secs(),
                expiry_secs = crate::messaging::telegram::CHAT_ACTION_EXPIRY.as_secs(),
                "presence cadence is not shorter than the chat action expiry; the indicator will flicker"
            );
        }

        Ok(())
    }
}
