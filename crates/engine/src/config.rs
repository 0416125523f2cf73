use std::str::FromStr;
use std::time::Duration;

use flowsync_core::topics::Topic;

use crate::classify::ClassifyPolicy;
use crate::client::TicketAuth;
use crate::reconnect::ReconnectConfig;
use crate::scheduler::{DebounceConfig, InvalidationScheduler};

/// Upper bound for millisecond settings (one day).
const MAX_MILLIS: u64 = 86_400_000;

/// Upper bound for second settings (one day).
const MAX_SECS: u64 = 86_400;

/// Default stream endpoint of a locally running backend.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8000/api/v1/sse/events";

/// Wire transport used to reach the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// `text/event-stream` over HTTP(S).
    Sse,
    /// JSON text frames over WebSocket.
    WebSocket,
}

impl FromStr for Transport {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sse" => Ok(Self::Sse),
            "ws" | "websocket" => Ok(Self::WebSocket),
            other => Err(ConfigError::Invalid {
                key: "SYNC_TRANSPORT",
                value: other.to_string(),
                reason: "expected `sse` or `ws`".into(),
            }),
        }
    }
}

/// Engine configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub endpoint: String,
    pub transport: Transport,
    /// Stream ticket exchange; only used by the SSE transport.
    pub ticket_auth: Option<TicketAuth>,
    /// Debounce window for `workflow-collection`.
    pub workflow_window: DebounceConfig,
    /// Debounce window for `job-collection`.
    pub job_window: DebounceConfig,
    pub reconnect: ReconnectConfig,
    /// Abandon a connection attempt that has not opened within this long.
    pub connect_timeout: Duration,
    /// Close and reopen a session that has been silent this long.
    /// `None` disables the check.
    pub idle_timeout: Option<Duration>,
    pub classify: ClassifyPolicy,
    /// Start without connecting; `SyncHandle::resume` brings the engine up.
    pub start_paused: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            transport: Transport::Sse,
            ticket_auth: None,
            workflow_window: DebounceConfig::new(
                Duration::from_millis(1000),
                Duration::from_millis(2000),
            ),
            job_window: DebounceConfig::new(Duration::from_millis(500), Duration::from_millis(1000)),
            reconnect: ReconnectConfig::default(),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(45)),
            classify: ClassifyPolicy::default(),
            start_paused: false,
        }
    }
}

impl SyncConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                         | Default                                    |
    /// |---------------------------------|--------------------------------------------|
    /// | `SYNC_ENDPOINT`                 | `http://localhost:8000/api/v1/sse/events`  |
    /// | `SYNC_TRANSPORT`                | `sse` (`ws` for WebSocket)                 |
    /// | `SYNC_TICKET_URL`               | unset                                      |
    /// | `SYNC_AUTH_TOKEN`               | unset                                      |
    /// | `SYNC_WORKFLOW_DEBOUNCE_MS`     | `1000`                                     |
    /// | `SYNC_WORKFLOW_MAX_WAIT_MS`     | `2000`                                     |
    /// | `SYNC_JOB_DEBOUNCE_MS`          | `500`                                      |
    /// | `SYNC_JOB_MAX_WAIT_MS`          | `1000`                                     |
    /// | `SYNC_RECONNECT_INITIAL_MS`     | `1000`                                     |
    /// | `SYNC_RECONNECT_MAX_MS`         | `30000`                                    |
    /// | `SYNC_CONNECT_TIMEOUT_SECS`     | `30`                                       |
    /// | `SYNC_IDLE_TIMEOUT_SECS`        | `45` (`0` disables)                        |
    /// | `SYNC_REFRESH_ON_FIELD_UPDATES` | `false`                                    |
    /// | `SYNC_DISABLED`                 | `false` (`true` starts paused)             |
    ///
    /// Durations are capped at one day.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let endpoint = get("SYNC_ENDPOINT").unwrap_or(defaults.endpoint);

        let transport = match get("SYNC_TRANSPORT") {
            Some(raw) => raw.parse()?,
            None => defaults.transport,
        };

        let ticket_auth = match (get("SYNC_TICKET_URL"), get("SYNC_AUTH_TOKEN")) {
            (Some(ticket_url), Some(bearer_token)) => Some(TicketAuth {
                ticket_url,
                bearer_token,
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("SYNC_AUTH_TOKEN")),
            (None, Some(_)) => return Err(ConfigError::Missing("SYNC_TICKET_URL")),
        };

        let workflow_window = window(
            &get,
            ("SYNC_WORKFLOW_DEBOUNCE_MS", "SYNC_WORKFLOW_MAX_WAIT_MS"),
            defaults.workflow_window,
        )?;
        let job_window = window(
            &get,
            ("SYNC_JOB_DEBOUNCE_MS", "SYNC_JOB_MAX_WAIT_MS"),
            defaults.job_window,
        )?;

        let reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(parse_bounded(
                &get,
                "SYNC_RECONNECT_INITIAL_MS",
                defaults.reconnect.initial_delay.as_millis() as u64,
                MAX_MILLIS,
            )?),
            max_delay: Duration::from_millis(parse_bounded(
                &get,
                "SYNC_RECONNECT_MAX_MS",
                defaults.reconnect.max_delay.as_millis() as u64,
                MAX_MILLIS,
            )?),
            ..defaults.reconnect
        };
        if reconnect.initial_delay.is_zero() {
            return Err(ConfigError::Invalid {
                key: "SYNC_RECONNECT_INITIAL_MS",
                value: "0".into(),
                reason: "reconnect delay must be positive".into(),
            });
        }
        if reconnect.initial_delay > reconnect.max_delay {
            return Err(ConfigError::Invalid {
                key: "SYNC_RECONNECT_INITIAL_MS",
                value: reconnect.initial_delay.as_millis().to_string(),
                reason: format!(
                    "initial delay exceeds the maximum delay ({}ms)",
                    reconnect.max_delay.as_millis()
                ),
            });
        }

        let connect_secs = parse_bounded(
            &get,
            "SYNC_CONNECT_TIMEOUT_SECS",
            defaults.connect_timeout.as_secs(),
            MAX_SECS,
        )?;
        if connect_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "SYNC_CONNECT_TIMEOUT_SECS",
                value: "0".into(),
                reason: "connect timeout must be positive".into(),
            });
        }
        let connect_timeout = Duration::from_secs(connect_secs);

        let idle_secs = parse_bounded(
            &get,
            "SYNC_IDLE_TIMEOUT_SECS",
            defaults.idle_timeout.map_or(0, |d| d.as_secs()),
            MAX_SECS,
        )?;
        let idle_timeout = (idle_secs > 0).then(|| Duration::from_secs(idle_secs));

        let classify = ClassifyPolicy {
            refresh_on_field_updates: parse_or(&get, "SYNC_REFRESH_ON_FIELD_UPDATES", false)?,
        };

        let start_paused = parse_or(&get, "SYNC_DISABLED", defaults.start_paused)?;

        Ok(Self {
            endpoint,
            transport,
            ticket_auth,
            workflow_window,
            job_window,
            reconnect,
            connect_timeout,
            idle_timeout,
            classify,
            start_paused,
        })
    }

    /// Build the invalidation scheduler described by this configuration.
    pub fn scheduler(&self) -> InvalidationScheduler {
        InvalidationScheduler::new(self.workflow_window)
            .with_window(Topic::WORKFLOWS, self.workflow_window)
            .with_window(Topic::JOBS, self.job_window)
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Like [`parse_or`], rejecting values above `max`.
fn parse_bounded<G>(get: &G, key: &'static str, default: u64, max: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value = parse_or(get, key, default)?;
    if value > max {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: format!("must not exceed {max}"),
        });
    }
    Ok(value)
}

fn window<G>(
    get: &G,
    (wait_key, max_wait_key): (&'static str, &'static str),
    default: DebounceConfig,
) -> Result<DebounceConfig, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let wait = parse_bounded(get, wait_key, default.wait.as_millis() as u64, MAX_MILLIS)?;
    let max_wait = parse_bounded(
        get,
        max_wait_key,
        default.max_wait.as_millis() as u64,
        MAX_MILLIS,
    )?;

    if max_wait < wait {
        return Err(ConfigError::Invalid {
            key: max_wait_key,
            value: max_wait.to_string(),
            reason: format!("max wait must be at least the debounce window ({wait}ms)"),
        });
    }

    Ok(DebounceConfig::new(
        Duration::from_millis(wait),
        Duration::from_millis(max_wait),
    ))
}

/// Errors raised while loading [`SyncConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is required because a related one was set.
    #[error("Missing configuration value: {0}")]
    Missing(&'static str),

    /// A variable is set but cannot be used.
    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = load(&[]).unwrap();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.transport, Transport::Sse);
        assert!(config.ticket_auth.is_none());
        assert_eq!(config.workflow_window.wait, Duration::from_millis(1000));
        assert_eq!(config.workflow_window.max_wait, Duration::from_millis(2000));
        assert_eq!(config.job_window.wait, Duration::from_millis(500));
        assert_eq!(config.job_window.max_wait, Duration::from_millis(1000));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(45)));
        assert!(!config.classify.refresh_on_field_updates);
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("SYNC_ENDPOINT", "ws://backend:9000/ws/events"),
            ("SYNC_TRANSPORT", "WS"),
            ("SYNC_JOB_DEBOUNCE_MS", "250"),
            ("SYNC_JOB_MAX_WAIT_MS", "750"),
            ("SYNC_RECONNECT_MAX_MS", "5000"),
            ("SYNC_IDLE_TIMEOUT_SECS", "0"),
            ("SYNC_REFRESH_ON_FIELD_UPDATES", "true"),
        ])
        .unwrap();

        assert_eq!(config.endpoint, "ws://backend:9000/ws/events");
        assert_eq!(config.transport, Transport::WebSocket);
        assert_eq!(config.job_window.wait, Duration::from_millis(250));
        assert_eq!(config.job_window.max_wait, Duration::from_millis(750));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, None);
        assert!(config.classify.refresh_on_field_updates);
    }

    #[test]
    fn ticket_auth_needs_both_values() {
        let config = load(&[
            ("SYNC_TICKET_URL", "http://backend/api/v1/sse/ticket"),
            ("SYNC_AUTH_TOKEN", "abc"),
        ])
        .unwrap();
        assert_eq!(
            config.ticket_auth.unwrap().ticket_url,
            "http://backend/api/v1/sse/ticket"
        );

        assert_matches!(
            load(&[("SYNC_TICKET_URL", "http://backend/api/v1/sse/ticket")]),
            Err(ConfigError::Missing("SYNC_AUTH_TOKEN"))
        );
    }

    #[test]
    fn unparseable_number_is_rejected() {
        assert_matches!(
            load(&[("SYNC_JOB_DEBOUNCE_MS", "soon")]),
            Err(ConfigError::Invalid {
                key: "SYNC_JOB_DEBOUNCE_MS",
                ..
            })
        );
    }

    #[test]
    fn max_wait_below_window_is_rejected() {
        assert_matches!(
            load(&[
                ("SYNC_WORKFLOW_DEBOUNCE_MS", "3000"),
                ("SYNC_WORKFLOW_MAX_WAIT_MS", "1000"),
            ]),
            Err(ConfigError::Invalid {
                key: "SYNC_WORKFLOW_MAX_WAIT_MS",
                ..
            })
        );
    }

    #[test]
    fn unknown_transport_is_rejected() {
        assert_matches!(
            load(&[("SYNC_TRANSPORT", "carrier-pigeon")]),
            Err(ConfigError::Invalid { key: "SYNC_TRANSPORT", .. })
        );
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("SYNC_ENDPOINT", "  "), ("SYNC_JOB_DEBOUNCE_MS", "")]).unwrap();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.job_window.wait, Duration::from_millis(500));
    }

    #[test]
    fn scheduler_uses_per_topic_windows() {
        let config = SyncConfig::default();
        let scheduler = config.scheduler();
        assert_eq!(scheduler.window(Topic::WORKFLOWS), config.workflow_window);
        assert_eq!(scheduler.window(Topic::JOBS), config.job_window);
    }

    #[test]
    fn durations_above_one_day_are_rejected() {
        assert_matches!(
            load(&[("SYNC_IDLE_TIMEOUT_SECS", "18446744073709551615")]),
            Err(ConfigError::Invalid {
                key: "SYNC_IDLE_TIMEOUT_SECS",
                ..
            })
        );
        assert_matches!(
            load(&[("SYNC_JOB_MAX_WAIT_MS", "86400001")]),
            Err(ConfigError::Invalid {
                key: "SYNC_JOB_MAX_WAIT_MS",
                ..
            })
        );
        assert_matches!(
            load(&[("SYNC_CONNECT_TIMEOUT_SECS", "100000")]),
            Err(ConfigError::Invalid {
                key: "SYNC_CONNECT_TIMEOUT_SECS",
                ..
            })
        );
        assert_eq!(
            load(&[("SYNC_IDLE_TIMEOUT_SECS", "86400")]).unwrap().idle_timeout,
            Some(Duration::from_secs(86_400))
        );
    }

    #[test]
    fn initial_reconnect_delay_above_max_is_rejected() {
        assert_matches!(
            load(&[
                ("SYNC_RECONNECT_INITIAL_MS", "60000"),
                ("SYNC_RECONNECT_MAX_MS", "30000"),
            ]),
            Err(ConfigError::Invalid {
                key: "SYNC_RECONNECT_INITIAL_MS",
                ..
            })
        );
    }

    #[test]
    fn connect_timeout_and_disable_flag() {
        let config = load(&[]).unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert!(!config.start_paused);

        let config = load(&[("SYNC_CONNECT_TIMEOUT_SECS", "5"), ("SYNC_DISABLED", "true")]).unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert!(config.start_paused);

        assert_matches!(
            load(&[("SYNC_CONNECT_TIMEOUT_SECS", "0")]),
            Err(ConfigError::Invalid {
                key: "SYNC_CONNECT_TIMEOUT_SECS",
                ..
            })
        );
    }
}
