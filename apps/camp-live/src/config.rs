use std::env;
use std::time::Duration;

use rand::Rng;

pub const DEFAULT_API_BASE: &str = stream_registry::DEFAULT_API_BASE;
/// The broker's `/ws` endpoint is SockJS; raw WebSocket clients use the
/// `/websocket` transport path under it.
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8080/ws/websocket";
const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

/// Bounded exponential backoff for bus reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// Total connection attempts, including the first.
    pub attempts: u32,
}

impl Backoff {
    /// Delay before retry number `retry` (0-based), capped at `max`, with up to
    /// a quarter of extra jitter so reconnecting peers spread out.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
        let base = self.initial.saturating_mul(factor).min(self.max);
        let jitter_ms = (base.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(8),
            attempts: 6,
        }
    }
}

/// Session core configuration
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Registry base URL, e.g. `http://localhost:8080`
    pub api_base: String,
    /// STOMP websocket endpoint of the signaling broker
    pub signaling_url: String,
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat failures tolerated before the session is presumed gone
    pub heartbeat_failure_budget: u32,
    /// How long a peer link may stay outside CONNECTED
    pub negotiation_timeout: Duration,
    pub reconnect: Backoff,
    /// Upper bound on waiting for any single teardown step
    pub teardown_timeout: Duration,
    pub ice_servers: Vec<String>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_failure_budget: 3,
            negotiation_timeout: Duration::from_secs(20),
            reconnect: Backoff::default(),
            teardown_timeout: Duration::from_secs(5),
            ice_servers: vec![DEFAULT_STUN.to_string()],
        }
    }
}

impl LiveConfig {
    /// Load configuration from `CAMP_LIVE_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = if env::var("CAMP_LIVE_LOCALHOST_ONLY").is_ok() {
            Vec::new()
        } else if let Ok(list) = env::var("CAMP_LIVE_ICE_SERVERS") {
            list.split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            defaults.ice_servers.clone()
        };

        Self {
            api_base: env::var("CAMP_LIVE_API_BASE").unwrap_or(defaults.api_base),
            signaling_url: env::var("CAMP_LIVE_SIGNALING_URL").unwrap_or(defaults.signaling_url),
            heartbeat_interval: env_millis("CAMP_LIVE_HEARTBEAT_MS")
                .unwrap_or(defaults.heartbeat_interval),
            heartbeat_failure_budget: env_parse("CAMP_LIVE_HEARTBEAT_BUDGET")
                .filter(|budget| *budget > 0)
                .unwrap_or(defaults.heartbeat_failure_budget),
            negotiation_timeout: env_millis("CAMP_LIVE_NEGOTIATION_TIMEOUT_MS")
                .unwrap_or(defaults.negotiation_timeout),
            reconnect: Backoff {
                initial: env_millis("CAMP_LIVE_RECONNECT_INITIAL_MS")
                    .unwrap_or(defaults.reconnect.initial),
                max: env_millis("CAMP_LIVE_RECONNECT_MAX_MS").unwrap_or(defaults.reconnect.max),
                attempts: env_parse("CAMP_LIVE_RECONNECT_ATTEMPTS")
                    .filter(|attempts| *attempts > 0)
                    .unwrap_or(defaults.reconnect.attempts),
            },
            teardown_timeout: defaults.teardown_timeout,
            ice_servers,
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|raw| raw.trim().parse().ok())
}

fn env_millis(var: &str) -> Option<Duration> {
    env_parse::<u64>(var)
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variable tests must not run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "CAMP_LIVE_API_BASE",
        "CAMP_LIVE_HEARTBEAT_MS",
        "CAMP_LIVE_HEARTBEAT_BUDGET",
        "CAMP_LIVE_LOCALHOST_ONLY",
        "CAMP_LIVE_ICE_SERVERS",
    ];

    fn clear() {
        for var in VARS {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn defaults_match_server_ttl() {
        let config = LiveConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_failure_budget, 3);
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN.to_string()]);
        assert_eq!(config.signaling_url, "ws://localhost:8080/ws/websocket");
    }

    #[test]
    fn env_overrides_and_ignores_garbage() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        unsafe {
            env::set_var("CAMP_LIVE_API_BASE", "https://camp.example.com");
            env::set_var("CAMP_LIVE_HEARTBEAT_MS", "1500");
            env::set_var("CAMP_LIVE_HEARTBEAT_BUDGET", "zero");
            env::set_var("CAMP_LIVE_ICE_SERVERS", "stun:a:1, ,turn:b:2");
        }
        let config = LiveConfig::from_env();
        assert_eq!(config.api_base, "https://camp.example.com");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(config.heartbeat_failure_budget, 3);
        assert_eq!(config.ice_servers, vec!["stun:a:1", "turn:b:2"]);
        clear();
    }

    #[test]
    fn localhost_only_disables_ice_servers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        unsafe { env::set_var("CAMP_LIVE_LOCALHOST_ONLY", "1") };
        assert!(LiveConfig::from_env().ice_servers.is_empty());
        clear();
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            attempts: 5,
        };
        let first = backoff.delay(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = backoff.delay(2);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        let capped = backoff.delay(30);
        assert!(capped >= Duration::from_millis(1000) && capped <= Duration::from_millis(1250));
    }
}
