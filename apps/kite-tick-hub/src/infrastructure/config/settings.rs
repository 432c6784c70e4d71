//! Hub Configuration Settings
//!
//! Configuration types for the tick hub, loaded from environment variables.
//! Every variable has a default; a variable that is set but malformed is a
//! [`ConfigError`].

use std::collections::HashMap;
use std::time::Duration;

use crate::domain::streaming::{InstrumentToken, TickMode};

/// Default upstream ticker endpoint.
pub const DEFAULT_TICKER_URL: &str = "wss://ws.kite.trade";

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Client WebSocket and admin HTTP port.
    pub port: u16,
    /// Health check and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8000,
            health_port: 8082,
        }
    }
}

/// Upstream feed settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSettings {
    /// Ticker WebSocket base URL (credentials are appended).
    pub url: String,
    /// Streaming mode requested for every token.
    pub mode: TickMode,
    /// Start the feed at process startup.
    pub autostart: bool,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Consecutive authentication failures before giving up.
    pub max_auth_failures: u32,
    /// Idle time before the connector pings the ticker.
    pub heartbeat_interval: Duration,
    /// Silence after a ping before the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Capacity of the channel from the receive loop to ingestion.
    pub tick_channel_capacity: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_TICKER_URL.to_string(),
            mode: TickMode::Full,
            autostart: true,
            reconnect_delay_initial: Duration::from_millis(1_000),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_auth_failures: 3,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            tick_channel_capacity: 1_024,
        }
    }
}

/// Downstream client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// Bounded outbound queue length per client.
    pub queue_capacity: usize,
    /// Idle time before a client is pinged, and the grace period after.
    pub idle_timeout: Duration,
    /// Upper bound on a single socket write.
    pub send_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            idle_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Instrument Directory
// =============================================================================

/// Trading symbols for known instrument tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentDirectory {
    symbols: HashMap<InstrumentToken, String>,
}

impl InstrumentDirectory {
    /// Parse `token:SYMBOL` pairs separated by commas.
    ///
    /// ```rust
    /// use kite_tick_hub::infrastructure::config::InstrumentDirectory;
    /// use kite_tick_hub::domain::streaming::InstrumentToken;
    ///
    /// let dir = InstrumentDirectory::parse("256265:NIFTY 50, 738561:RELIANCE").unwrap();
    /// assert_eq!(dir.symbol(InstrumentToken::new(738_561)), "RELIANCE");
    /// assert_eq!(dir.symbol(InstrumentToken::new(1)), "");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error for an entry without `:`, a bad token or an empty
    /// symbol.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut symbols = HashMap::new();

        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let invalid = || ConfigError::InvalidInstrument(entry.to_string());

            let (token, symbol) = entry.split_once(':').ok_or_else(invalid)?;
            let token = token
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|raw| InstrumentToken::try_from(raw).ok())
                .ok_or_else(invalid)?;
            let symbol = symbol.trim();
            if symbol.is_empty() {
                return Err(invalid());
            }

            symbols.insert(token, symbol.to_string());
        }

        Ok(Self { symbols })
    }

    /// Build from explicit pairs.
    #[must_use]
    pub fn from_pairs<S: Into<String>>(pairs: impl IntoIterator<Item = (InstrumentToken, S)>) -> Self {
        Self {
            symbols: pairs.into_iter().map(|(t, s)| (t, s.into())).collect(),
        }
    }

    /// Symbol for `token`, or an empty string if unknown.
    #[must_use]
    pub fn symbol(&self, token: InstrumentToken) -> &str {
        self.symbols.get(&token).map_or("", String::as_str)
    }

    /// Number of known instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

// =============================================================================
// Hub Configuration
// =============================================================================

/// Complete hub configuration.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// Server port settings.
    pub server: ServerSettings,
    /// Upstream feed settings.
    pub feed: FeedSettings,
    /// Downstream client settings.
    pub client: ClientSettings,
    /// Token to symbol directory.
    pub instruments: InstrumentDirectory,
}

impl HubConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a malformed value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a malformed value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let server_defaults = ServerSettings::default();
        let feed_defaults = FeedSettings::default();
        let client_defaults = ClientSettings::default();

        let server = ServerSettings {
            port: env.parse("TICK_HUB_PORT", server_defaults.port)?,
            health_port: env.parse("TICK_HUB_HEALTH_PORT", server_defaults.health_port)?,
        };

        let mode = match env.get("KITE_TICKER_MODE") {
            Some(raw) => TickMode::from_str_case_insensitive(&raw)
                .ok_or(ConfigError::InvalidValue {
                    key: "KITE_TICKER_MODE",
                    value: raw,
                })?,
            None => feed_defaults.mode,
        };

        let feed = FeedSettings {
            url: env.ticker_url("KITE_TICKER_URL", feed_defaults.url)?,
            mode,
            autostart: env.parse_bool("TICK_HUB_AUTOSTART", feed_defaults.autostart)?,
            reconnect_delay_initial: env.millis(
                "TICK_HUB_RECONNECT_DELAY_INITIAL_MS",
                feed_defaults.reconnect_delay_initial,
            )?,
            reconnect_delay_max: env.secs(
                "TICK_HUB_RECONNECT_DELAY_MAX_SECS",
                feed_defaults.reconnect_delay_max,
            )?,
            reconnect_delay_multiplier: env.parse(
                "TICK_HUB_RECONNECT_DELAY_MULTIPLIER",
                feed_defaults.reconnect_delay_multiplier,
            )?,
            max_auth_failures: env
                .parse("TICK_HUB_MAX_AUTH_FAILURES", feed_defaults.max_auth_failures)?,
            heartbeat_interval: env.secs(
                "TICK_HUB_FEED_HEARTBEAT_INTERVAL_SECS",
                feed_defaults.heartbeat_interval,
            )?,
            heartbeat_timeout: env.secs(
                "TICK_HUB_FEED_HEARTBEAT_TIMEOUT_SECS",
                feed_defaults.heartbeat_timeout,
            )?,
            tick_channel_capacity: env.capacity(
                "TICK_HUB_TICK_CHANNEL_CAPACITY",
                feed_defaults.tick_channel_capacity,
            )?,
        };

        let client = ClientSettings {
            queue_capacity: env
                .capacity("TICK_HUB_CLIENT_QUEUE_CAPACITY", client_defaults.queue_capacity)?,
            idle_timeout: env.secs(
                "TICK_HUB_CLIENT_IDLE_TIMEOUT_SECS",
                client_defaults.idle_timeout,
            )?,
            send_timeout: env.secs(
                "TICK_HUB_CLIENT_SEND_TIMEOUT_SECS",
                client_defaults.send_timeout,
            )?,
        };

        let instruments = match env.get("TICK_HUB_INSTRUMENTS") {
            Some(spec) => InstrumentDirectory::parse(&spec)?,
            None => InstrumentDirectory::default(),
        };

        Ok(Self {
            server,
            feed,
            client,
            instruments,
        })
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has a value that cannot be parsed.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// Raw value.
        value: String,
    },
    /// Instrument directory entry is malformed.
    #[error("invalid instrument entry {0:?}: expected token:SYMBOL")]
    InvalidInstrument(String),
}

/// Typed access to a key lookup. Blank values count as unset.
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidValue { key, value }),
            None => Ok(default),
        }
    }

    fn parse_bool(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            Some(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue { key, value }),
            },
            None => Ok(default),
        }
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default_ms).map(Duration::from_millis)
    }

    fn ticker_url(&self, key: &'static str, default: String) -> Result<String, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(default);
        };
        match url::Url::parse(&value) {
            Ok(url) if matches!(url.scheme(), "ws" | "wss") && url.has_host() => Ok(value),
            _ => Err(ConfigError::InvalidValue { key, value }),
        }
    }

    fn capacity(&self, key: &'static str, default: usize) -> Result<usize, ConfigError> {
        let value = self.parse(key, default)?;
        if value == 0 {
            return Err(ConfigError::InvalidValue {
                key,
                value: "0".to_string(),
            });
        }
        Ok(value)
    }
}
