//! Client configuration, built programmatically or loaded from environment
//! variables.
//!
//! Recognised variables:
//! - `TICKMUX_PUBLIC_URL` / `TICKMUX_PRIVATE_URL` - WebSocket endpoints
//! - `TICKMUX_API_KEY` / `TICKMUX_API_SECRET` - credentials (both or neither)
//! - `TICKMUX_PROFILE` - `channel-id` or `topic`
//! - `TICKMUX_HEARTBEAT_SECS`, `TICKMUX_MAX_MISSED_HEARTBEATS`
//! - `TICKMUX_BACKOFF_INITIAL_MS`, `TICKMUX_BACKOFF_MULTIPLIER`, `TICKMUX_BACKOFF_MAX_MS`
//! - `TICKMUX_DELTA_BUFFER`, `TICKMUX_QUEUE_CAPACITY`

use std::str::FromStr;
use std::time::Duration;

use crate::auth::Credentials;
use crate::profile::ProfileKind;
use crate::{Result, TickmuxError};

/// Default public WebSocket endpoint.
const DEFAULT_PUBLIC_URL: &str = "ws://127.0.0.1:8765/ws";

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);
const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;
const DEFAULT_DELTA_BUFFER: usize = 256;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub profile: ProfileKind,
    pub client: ClientConfig,
}

/// Reconnect delay schedule: `initial * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Settings for one [`StreamClient`](crate::StreamClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub public_url: String,
    /// Endpoint used instead of `public_url` when credentials are set.
    pub private_url: Option<String>,
    pub credentials: Option<Credentials>,
    pub heartbeat_interval: Duration,
    /// Consecutive silent heartbeat intervals before the socket is
    /// considered dead.
    pub max_missed_heartbeats: u32,
    pub backoff: BackoffPolicy,
    /// Deltas held per symbol while waiting for the first snapshot.
    pub delta_buffer_limit: usize,
    /// Updates held per subscription before the oldest is dropped.
    pub queue_capacity: usize,
}

impl ClientConfig {
    #[must_use]
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into(),
            private_url: None,
            credentials: None,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            backoff: BackoffPolicy::default(),
            delta_buffer_limit: DEFAULT_DELTA_BUFFER,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_private_url(mut self, url: impl Into<String>) -> Self {
        self.private_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, max_missed: u32) -> Self {
        self.heartbeat_interval = interval;
        self.max_missed_heartbeats = max_missed;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_delta_buffer_limit(mut self, limit: usize) -> Self {
        self.delta_buffer_limit = limit;
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// The endpoint to connect to.
    pub fn endpoint(&self) -> &str {
        match (&self.credentials, &self.private_url) {
            (Some(_), Some(private)) => private,
            _ => &self.public_url,
        }
    }
}

/// Loads the application configuration from environment variables.
///
/// API credentials are optional (public channels only) but when one is set
/// both must be present.
///
/// # Errors
///
/// Returns [`TickmuxError::Config`] if only one credential variable is set,
/// or if a numeric or profile variable cannot be parsed.
pub fn fetch_config() -> Result<AppConfig> {
    let public_url =
        non_empty_var("TICKMUX_PUBLIC_URL").unwrap_or_else(|| DEFAULT_PUBLIC_URL.to_string());

    let api_key = non_empty_var("TICKMUX_API_KEY");
    let api_secret = non_empty_var("TICKMUX_API_SECRET");

    let credentials = match (api_key, api_secret) {
        (Some(key), Some(secret)) => Some(Credentials::new(key, secret)),
        (Some(_), None) => {
            return Err(TickmuxError::Config(
                "TICKMUX_API_KEY is set but TICKMUX_API_SECRET is missing".to_string(),
            ));
        }
        (None, Some(_)) => {
            return Err(TickmuxError::Config(
                "TICKMUX_API_SECRET is set but TICKMUX_API_KEY is missing".to_string(),
            ));
        }
        (None, None) => None,
    };

    let profile = parsed_var::<ProfileKind>("TICKMUX_PROFILE")?.unwrap_or_default();

    let defaults = BackoffPolicy::default();
    let backoff = BackoffPolicy {
        initial: parsed_var("TICKMUX_BACKOFF_INITIAL_MS")?
            .map_or(defaults.initial, Duration::from_millis),
        multiplier: parsed_var("TICKMUX_BACKOFF_MULTIPLIER")?.unwrap_or(defaults.multiplier),
        max: parsed_var("TICKMUX_BACKOFF_MAX_MS")?.map_or(defaults.max, Duration::from_millis),
    };

    let client = ClientConfig {
        public_url,
        private_url: non_empty_var("TICKMUX_PRIVATE_URL"),
        credentials,
        heartbeat_interval: parsed_var("TICKMUX_HEARTBEAT_SECS")?
            .map_or(DEFAULT_HEARTBEAT, Duration::from_secs),
        max_missed_heartbeats: parsed_var("TICKMUX_MAX_MISSED_HEARTBEATS")?
            .unwrap_or(DEFAULT_MAX_MISSED_HEARTBEATS),
        backoff,
        delta_buffer_limit: parsed_var("TICKMUX_DELTA_BUFFER")?.unwrap_or(DEFAULT_DELTA_BUFFER),
        queue_capacity: parsed_var("TICKMUX_QUEUE_CAPACITY")?.unwrap_or(DEFAULT_QUEUE_CAPACITY),
    };

    Ok(AppConfig { profile, client })
}

/// Returns the value of an environment variable if it exists and is non-empty.
fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

/// Parses a non-empty environment variable.
fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    non_empty_var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| TickmuxError::Config(format!("invalid {name}={raw}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const VARS: [&str; 12] = [
        "TICKMUX_PUBLIC_URL",
        "TICKMUX_PRIVATE_URL",
        "TICKMUX_API_KEY",
        "TICKMUX_API_SECRET",
        "TICKMUX_PROFILE",
        "TICKMUX_HEARTBEAT_SECS",
        "TICKMUX_MAX_MISSED_HEARTBEATS",
        "TICKMUX_BACKOFF_INITIAL_MS",
        "TICKMUX_BACKOFF_MULTIPLIER",
        "TICKMUX_BACKOFF_MAX_MS",
        "TICKMUX_DELTA_BUFFER",
        "TICKMUX_QUEUE_CAPACITY",
    ];

    /// Serializes tests that touch the process environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Helper that clears every tickmux variable, applies `vars`, runs `f`,
    /// then restores the originals.
    fn with_env<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let originals: Vec<(&str, Option<String>)> =
            VARS.iter().map(|k| (*k, std::env::var(k).ok())).collect();

        // SAFETY: every test touching these variables holds ENV_LOCK.
        unsafe {
            for k in VARS {
                std::env::remove_var(k);
            }
            for (k, v) in vars {
                std::env::set_var(k, v);
            }
        }

        f();

        for (k, original) in originals {
            // SAFETY: restoring original values under the same lock.
            unsafe {
                match original {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    #[test]
    fn defaults_without_env_vars() {
        with_env(&[], || {
            let config = fetch_config().unwrap();
            assert_eq!(config.profile, ProfileKind::ChannelId);
            assert_eq!(config.client.public_url, DEFAULT_PUBLIC_URL);
            assert!(config.client.credentials.is_none());
            assert_eq!(config.client.heartbeat_interval, Duration::from_secs(15));
            assert_eq!(config.client.max_missed_heartbeats, 3);
            assert_eq!(config.client.backoff, BackoffPolicy::default());
            assert_eq!(config.client.delta_buffer_limit, 256);
            assert_eq!(config.client.queue_capacity, 1024);
        });
    }

    #[test]
    fn loads_credentials_and_private_url() {
        with_env(
            &[
                ("TICKMUX_API_KEY", "test-key"),
                ("TICKMUX_API_SECRET", "test-secret"),
                ("TICKMUX_PRIVATE_URL", "wss://private.example.com"),
            ],
            || {
                let config = fetch_config().unwrap();
                let credentials = config.client.credentials.as_ref().unwrap();
                assert_eq!(credentials.api_key, "test-key");
                assert_eq!(config.client.endpoint(), "wss://private.example.com");
            },
        );
    }

    #[test]
    fn private_url_ignored_without_credentials() {
        with_env(&[("TICKMUX_PRIVATE_URL", "wss://private.example.com")], || {
            let config = fetch_config().unwrap();
            assert_eq!(config.client.endpoint(), DEFAULT_PUBLIC_URL);
        });
    }

    #[test]
    fn rejects_key_without_secret() {
        with_env(&[("TICKMUX_API_KEY", "key-only")], || {
            let err = fetch_config().unwrap_err();
            assert!(err.to_string().contains("TICKMUX_API_SECRET is missing"));
        });
    }

    #[test]
    fn rejects_secret_without_key() {
        with_env(&[("TICKMUX_API_SECRET", "secret-only")], || {
            let err = fetch_config().unwrap_err();
            assert!(err.to_string().contains("TICKMUX_API_KEY is missing"));
        });
    }

    #[test]
    fn empty_values_treated_as_absent() {
        with_env(
            &[
                ("TICKMUX_API_KEY", ""),
                ("TICKMUX_API_SECRET", ""),
                ("TICKMUX_PUBLIC_URL", ""),
                ("TICKMUX_HEARTBEAT_SECS", ""),
            ],
            || {
                let config = fetch_config().unwrap();
                assert_eq!(config.client.public_url, DEFAULT_PUBLIC_URL);
                assert!(config.client.credentials.is_none());
                assert_eq!(config.client.heartbeat_interval, DEFAULT_HEARTBEAT);
            },
        );
    }

    #[test]
    fn parses_tuning_variables() {
        with_env(
            &[
                ("TICKMUX_PROFILE", "topic"),
                ("TICKMUX_HEARTBEAT_SECS", "5"),
                ("TICKMUX_BACKOFF_INITIAL_MS", "250"),
                ("TICKMUX_BACKOFF_MULTIPLIER", "1.5"),
                ("TICKMUX_QUEUE_CAPACITY", "8"),
            ],
            || {
                let config = fetch_config().unwrap();
                assert_eq!(config.profile, ProfileKind::Topic);
                assert_eq!(config.client.heartbeat_interval, Duration::from_secs(5));
                assert_eq!(config.client.backoff.initial, Duration::from_millis(250));
                assert_eq!(config.client.backoff.multiplier, 1.5);
                assert_eq!(config.client.queue_capacity, 8);
            },
        );
    }

    #[test]
    fn rejects_unparsable_numbers() {
        with_env(&[("TICKMUX_DELTA_BUFFER", "lots")], || {
            let err = fetch_config().unwrap_err();
            assert!(matches!(err, TickmuxError::Config(_)));
            assert!(err.to_string().contains("TICKMUX_DELTA_BUFFER"));
        });
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(1),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }
}
