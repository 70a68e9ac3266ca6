//! Client configuration.
//!
//! Defaults follow the relay's documented surface: 5s connection timeout,
//! auto-reconnect with up to 5 attempts 2s apart, and a 10s direction
//! assignment timeout.

use std::time::Duration;
use sync_core::ReconnectPolicy;
use sync_types::SessionId;
use thiserror::Error;

/// Environment variable prefix read by [`ClientConfig::from_env`].
pub const ENV_PREFIX: &str = "TUTOR_SYNC_";

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A setting could not be parsed.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Setting name.
        key: String,
        /// Offending value.
        value: String,
    },

    /// The relay URL is not an http(s) or ws(s) URL.
    #[error("invalid relay URL {url:?}: {reason}")]
    InvalidUrl {
        /// Configured URL.
        url: String,
        /// Parser message.
        reason: String,
    },
}

/// Configuration for [`SyncClient`](crate::SyncClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL (http or https).
    pub server_url: String,
    /// Session CRUD path on the relay.
    pub session_path: String,
    /// Realtime channel path on the relay.
    pub channel_path: String,
    /// This client's ID, sent on every frame and at upgrade time.
    pub client_id: String,
    /// How long a connect may take before failing.
    pub connection_timeout: Duration,
    /// Reconnect after unexpected drops.
    pub auto_reconnect: bool,
    /// Reconnect budget per drop.
    pub max_reconnect_attempts: u32,
    /// Delay between reconnect attempts.
    pub reconnect_policy: ReconnectPolicy,
    /// How long to wait for a direction assignment. `None` waits forever.
    pub direction_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            session_path: "/sessions".to_string(),
            channel_path: "/ws".to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            connection_timeout: Duration::from_millis(5000),
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_policy: ReconnectPolicy::default(),
            direction_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl ClientConfig {
    /// Defaults pointed at `server_url`.
    pub fn new(server_url: &str) -> Self {
        Self::default().with_server_url(server_url)
    }

    /// Set the relay base URL.
    pub fn with_server_url(mut self, url: &str) -> Self {
        self.server_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Set the client ID.
    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = client_id.to_string();
        self
    }

    /// Set the session and channel paths.
    pub fn with_paths(mut self, session_path: &str, channel_path: &str) -> Self {
        self.session_path = session_path.to_string();
        self.channel_path = channel_path.to_string();
        self
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Enable or disable auto-reconnect.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the reconnect budget.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Use a fixed reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_policy = ReconnectPolicy::Fixed(delay);
        self
    }

    /// Use exponential backoff with jitter starting at `base`.
    pub fn with_exponential_backoff(mut self, base: Duration) -> Self {
        self.reconnect_policy = ReconnectPolicy::Exponential { base };
        self
    }

    /// Set or disable the direction assignment timeout.
    pub fn with_direction_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.direction_timeout = timeout;
        self
    }

    /// Defaults overridden by `TUTOR_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup("TUTOR_SYNC_<NAME>")`.
    ///
    /// Recognized names: `SERVER_URL`, `SESSION_PATH`, `CHANNEL_PATH`,
    /// `CLIENT_ID`, `CONNECTION_TIMEOUT_MS`, `AUTO_RECONNECT`,
    /// `MAX_RECONNECT_ATTEMPTS`, `RECONNECT_DELAY_MS`, `RECONNECT_BACKOFF`
    /// (`fixed` or `exponential`), `DIRECTION_TIMEOUT_MS` (`0` disables).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(url) = get("SERVER_URL") {
            config = config.with_server_url(&url);
        }
        if let Some(path) = get("SESSION_PATH") {
            config.session_path = path;
        }
        if let Some(path) = get("CHANNEL_PATH") {
            config.channel_path = path;
        }
        if let Some(id) = get("CLIENT_ID") {
            config.client_id = id;
        }
        if let Some(ms) = parse::<u64>(&get, "CONNECTION_TIMEOUT_MS")? {
            config.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(enabled) = parse::<bool>(&get, "AUTO_RECONNECT")? {
            config.auto_reconnect = enabled;
        }
        if let Some(attempts) = parse::<u32>(&get, "MAX_RECONNECT_ATTEMPTS")? {
            config.max_reconnect_attempts = attempts;
        }

        let delay = parse::<u64>(&get, "RECONNECT_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(2000));
        config.reconnect_policy = match get("RECONNECT_BACKOFF").as_deref() {
            None | Some("fixed") => ReconnectPolicy::Fixed(delay),
            Some("exponential") => ReconnectPolicy::Exponential { base: delay },
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}RECONNECT_BACKOFF"),
                    value: other.to_string(),
                })
            }
        };

        if let Some(ms) = parse::<u64>(&get, "DIRECTION_TIMEOUT_MS")? {
            config.direction_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        Ok(config)
    }

    /// URL of the session endpoint.
    pub fn session_url(&self) -> String {
        format!("{}{}", self.server_url, self.session_path)
    }

    /// Realtime channel URL for `session`, with `session` and `clientId`
    /// query parameters.
    pub fn channel_url(&self, session: &SessionId) -> Result<String, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: self.server_url.clone(),
            reason,
        };

        let mut url = reqwest::Url::parse(&format!("{}{}", self.server_url, self.channel_path))
            .map_err(|e| invalid(e.to_string()))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(invalid(format!("unsupported scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| invalid(format!("cannot switch to {scheme}")))?;
        url.query_pairs_mut()
            .append_pair("session", session.as_str())
            .append_pair("clientId", &self.client_id);
        Ok(url.into())
    }
}

fn parse<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    get(name)
        .map(|value| {
            value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{name}"),
                value,
            })
        })
        .transpose()
}
