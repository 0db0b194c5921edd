use std::env;
use std::time::Duration;

/// Pattern loaded when nothing else can supply code: no draft, no server
/// code, or degraded-mode recovery with an empty store.
pub const DEFAULT_PATTERN: &str = "s(\"bd sd\")";

/// Reef client configuration.
///
/// Timing values are fixed constants rather than computed: the reconnect
/// schedule and timeouts are part of the protocol contract with the session
/// server, not a tuning surface.
#[derive(Debug, Clone)]
pub struct Config {
    /// The session server address (defaults to "127.0.0.1:8080").
    pub session_server: String,
    /// How long a connection may sit in `Connecting` before it is forcibly
    /// closed and routed into the reconnect path.
    pub connect_timeout: Duration,
    /// How long a correlated request waits for its reply.
    pub reply_timeout: Duration,
    /// Interval between keepalive pings while connected.
    pub keepalive_interval: Duration,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay: Duration,
    /// Ceiling on the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Attempts before giving up and falling back to local storage.
    pub max_reconnect_attempts: u32,
    /// Code shown when no other source wins.
    pub default_code: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let server = env::var("REEF_SESSION_SERVER")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let server = if server.starts_with("localhost:") {
            server.replacen("localhost", "127.0.0.1", 1)
        } else {
            server
        };
        Self {
            session_server: server,
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `reconnect_max_delay`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .reconnect_base_delay
            .saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.reconnect_max_delay)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_server: "127.0.0.1:8080".to_string(),
            connect_timeout: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            default_code: DEFAULT_PATTERN.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session_server, "127.0.0.1:8080");
        assert_eq!(config.max_reconnect_attempts, 5);
    }

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let config = Config::default();
        assert_eq!(config.reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(config.reconnect_delay(3), Duration::from_secs(4));
        assert_eq!(config.reconnect_delay(5), Duration::from_secs(16));
        // Capped at the ceiling from attempt 6 onwards.
        assert_eq!(config.reconnect_delay(6), Duration::from_secs(30));
        assert_eq!(config.reconnect_delay(12), Duration::from_secs(30));
    }
}
