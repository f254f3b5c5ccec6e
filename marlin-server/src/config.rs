//! Server-level configuration and the clamps that keep it sane.
//!
//! Sites carry their own settings (see [`crate::site::SiteBuilder`]); this
//! module holds the per-server tunables and the dotted-key binding
//! (`Server.MaxThreads`, `Logging.Detail`, ...) recognized at init time.

use std::path::PathBuf;
use std::time::Duration;

/// Smallest accepted listener backlog.
pub const INIT_HTTP_BACKLOGQUEUE: i32 = 64;
/// Largest accepted listener backlog.
pub const MAXX_HTTP_BACKLOGQUEUE: i32 = 640;

/// Lower bound of the inbound streaming limit (1 MiB).
pub const STREAMING_LIMIT_MIN: u64 = 1024 * 1024;
/// Upper bound of the inbound streaming limit (2 GiB).
pub const STREAMING_LIMIT_MAX: u64 = 2 * 1024 * 1024 * 1024;
/// Largest body the server will gzip (25 memory pages).
pub const COMPRESS_LIMIT_MAX: u64 = 25 * 4096;

/// Default quiet interval before an event stream gets a keep-alive comment.
pub const DEFAULT_EVENT_KEEP_ALIVE: Duration = Duration::from_millis(30_000);

/// Site-wide HTTP cache policy; out-of-range values coerce to `Nocache`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Responses are never cached.
    #[default]
    Nocache,
    /// Cached until the user invalidates.
    UserInvalidates,
    /// Cached for the given number of seconds.
    TimeToLive(u32),
    /// Cached as long as the cache allows.
    Maximum,
}

impl CachePolicy {
    /// Builds a policy from its numeric form, coercing out-of-range input.
    pub fn from_raw(kind: i32, seconds: u32) -> CachePolicy {
        match kind {
            0 => CachePolicy::Nocache,
            1 => CachePolicy::UserInvalidates,
            2 => CachePolicy::TimeToLive(seconds),
            3 => CachePolicy::Maximum,
            _ => CachePolicy::Nocache,
        }
    }
}

/// Error for a configuration value the server cannot accept.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The key is not one the server recognizes.
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),
    /// The value does not parse for its key.
    #[error("bad value for {key}: {value}")]
    BadValue {
        /// The key the value was given for.
        key: String,
        /// The offending value.
        value: String,
    },
}

/// The per-server tunables, with every clamp applied on the way in.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Server display name used in logs.
    pub name: String,
    /// Root directory for file serving and If-Modified-Since checks.
    pub webroot: PathBuf,
    /// Listener backlog, clamped to the backlog bounds.
    pub queue_length: i32,
    /// Minimum pool workers (pool applies its own floors).
    pub min_threads: usize,
    /// Maximum pool workers (pool applies its own caps).
    pub max_threads: usize,
    /// Worker stack size in bytes.
    pub stack_size: usize,
    /// Hard cap on inbound bodies without Content-Length.
    pub streaming_limit: u64,
    /// Largest response body the server will gzip.
    pub compress_limit: u64,
    /// Quiet interval before event streams receive a keep-alive.
    #[serde(with = "humantime_serde")]
    pub event_keep_alive: Duration,
    /// Namespace accepted for WS-ReliableMessaging envelopes.
    pub reliable_namespace: String,
    /// Log request handling detail lines.
    pub log_detail: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            name: "marlin".to_owned(),
            webroot: PathBuf::from("."),
            queue_length: INIT_HTTP_BACKLOGQUEUE,
            min_threads: 4,
            max_threads: crate::pool::NUM_THREADS_DEFAULT,
            stack_size: crate::pool::THREAD_STACKSIZE,
            streaming_limit: STREAMING_LIMIT_MIN,
            compress_limit: COMPRESS_LIMIT_MAX,
            event_keep_alive: DEFAULT_EVENT_KEEP_ALIVE,
            reliable_namespace: marlin_types::soap::NS_RELIABLE.to_owned(),
            log_detail: false,
        }
    }
}

impl ServerConfig {
    /// Applies one dotted configuration key.
    ///
    /// Site-level keys (`Encryption.*`, `Authentication.*`, `Security.*`)
    /// belong on the site builder and are rejected here.
    pub fn apply_setting(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let bad = |key: &str, value: &str| ConfigError::BadValue {
            key: key.to_owned(),
            value: value.to_owned(),
        };
        match key {
            "Server.WebRoot" => self.webroot = PathBuf::from(value),
            "Server.QueueLength" => {
                let length: i32 = value.parse().map_err(|_| bad(key, value))?;
                self.queue_length = length.clamp(INIT_HTTP_BACKLOGQUEUE, MAXX_HTTP_BACKLOGQUEUE);
            }
            "Server.MinThreads" => {
                self.min_threads = value.parse().map_err(|_| bad(key, value))?;
            }
            "Server.MaxThreads" => {
                self.max_threads = value.parse().map_err(|_| bad(key, value))?;
            }
            "Server.StackSize" => {
                self.stack_size = value.parse().map_err(|_| bad(key, value))?;
            }
            "Server.StreamingLimit" => {
                let limit: u64 = value.parse().map_err(|_| bad(key, value))?;
                self.streaming_limit = limit.clamp(STREAMING_LIMIT_MIN, STREAMING_LIMIT_MAX);
            }
            "Server.CompressLimit" => {
                let limit: u64 = value.parse().map_err(|_| bad(key, value))?;
                self.compress_limit = limit.min(COMPRESS_LIMIT_MAX);
            }
            "Server.EventKeepAlive" => {
                let millis: u64 = value.parse().map_err(|_| bad(key, value))?;
                self.event_keep_alive = Duration::from_millis(millis);
            }
            "Server.ReliableNamespace" => self.reliable_namespace = value.to_owned(),
            "Logging.Detail" => {
                self.log_detail = parse_bool(value).ok_or_else(|| bad(key, value))?;
            }
            // The remaining Logging.* keys configure the tracing
            // subscriber of the hosting application, not the engine.
            "Logging.Logfile" | "Logging.DoLogging" | "Logging.DoTiming" | "Logging.DoEvents"
            | "Logging.Cache" => {}
            other => return Err(ConfigError::UnknownKey(other.to_owned())),
        }
        Ok(())
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_length_is_clamped_to_its_bounds() {
        let mut config = ServerConfig::default();
        config.apply_setting("Server.QueueLength", "5").unwrap();
        assert_eq!(config.queue_length, INIT_HTTP_BACKLOGQUEUE);
        config.apply_setting("Server.QueueLength", "100000").unwrap();
        assert_eq!(config.queue_length, MAXX_HTTP_BACKLOGQUEUE);
        config.apply_setting("Server.QueueLength", "128").unwrap();
        assert_eq!(config.queue_length, 128);
    }

    #[test]
    fn streaming_limit_boundaries() {
        let mut config = ServerConfig::default();
        config.apply_setting("Server.StreamingLimit", "1").unwrap();
        assert_eq!(config.streaming_limit, STREAMING_LIMIT_MIN);
        config
            .apply_setting("Server.StreamingLimit", &(u64::MAX.to_string()))
            .unwrap();
        assert_eq!(config.streaming_limit, STREAMING_LIMIT_MAX);
    }

    #[test]
    fn compress_limit_caps_at_25_pages() {
        let mut config = ServerConfig::default();
        config.apply_setting("Server.CompressLimit", "999999999").unwrap();
        assert_eq!(config.compress_limit, COMPRESS_LIMIT_MAX);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut config = ServerConfig::default();
        assert!(matches!(
            config.apply_setting("Server.Nonsense", "1"),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn config_deserializes_with_humantime_durations() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"name": "edge", "event-keep-alive": "45s", "min-threads": 6}"#,
        )
        .unwrap();
        assert_eq!(config.name, "edge");
        assert_eq!(config.event_keep_alive, Duration::from_secs(45));
        assert_eq!(config.min_threads, 6);
        // Unnamed fields keep their defaults
        assert_eq!(config.compress_limit, COMPRESS_LIMIT_MAX);
    }

    #[test]
    fn cache_policy_coerces_out_of_range() {
        assert_eq!(CachePolicy::from_raw(2, 60), CachePolicy::TimeToLive(60));
        assert_eq!(CachePolicy::from_raw(9, 0), CachePolicy::Nocache);
        assert_eq!(CachePolicy::from_raw(-1, 0), CachePolicy::Nocache);
    }
}
