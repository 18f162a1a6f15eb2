use std::time::Duration;

/// Chat hub configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    pub hub: HubConfig,
    pub connection: ConnectionConfig,
    pub router: RouterConfig,
}

/// Registry, reclamation and flush-sweep tunables.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long a user with zero connections keeps their session before it
    /// is flushed and evicted.
    pub grace_period: Duration,
    /// Interval of the periodic read-cursor flush sweep.
    pub flush_interval: Duration,
    /// A flushed cursor map unchanged for this long is dropped from memory.
    pub idle_prune_after: Duration,
    /// Bound of every connection's outbound queue.
    pub outbound_capacity: usize,
}

/// Per-socket transport tunables.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Idle-read timeout. Any inbound frame (including pongs) resets it.
    pub pong_wait: Duration,
    /// Keepalive ping period; always shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Deadline for a single write batch.
    pub write_wait: Duration,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

/// Inbound dispatch policy.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Whether the sender's own connections receive the fan-out of their
    /// message. Enabled keeps the sender's other devices in sync.
    pub deliver_to_sender: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5 * 60),
            flush_interval: Duration::from_secs(60),
            idle_prune_after: Duration::from_secs(10 * 60),
            outbound_capacity: 256,
        }
    }
}

impl ConnectionConfig {
    /// Build transport settings from a read timeout; the ping period is
    /// derived as 9/10 of it.
    pub fn with_pong_wait(pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(10),
            max_message_size: 512,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::with_pong_wait(Duration::from_secs(60))
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            deliver_to_sender: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4100,
            hub: HubConfig::default(),
            connection: ConnectionConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unset or unparsable values fall back to
    /// the defaults.
    pub fn from_env() -> Self {
        let hub_defaults = HubConfig::default();
        let hub = HubConfig {
            grace_period: secs_var("HUB_GRACE_PERIOD_SECS").unwrap_or(hub_defaults.grace_period),
            flush_interval: secs_var("HUB_FLUSH_INTERVAL_SECS")
                .unwrap_or(hub_defaults.flush_interval),
            idle_prune_after: secs_var("HUB_IDLE_PRUNE_SECS")
                .unwrap_or(hub_defaults.idle_prune_after),
            outbound_capacity: parsed_var("WS_OUTBOUND_CAPACITY")
                .filter(|c: &usize| *c > 0)
                .unwrap_or(hub_defaults.outbound_capacity),
        };

        let mut connection = secs_var("WS_PONG_WAIT_SECS")
            .map(ConnectionConfig::with_pong_wait)
            .unwrap_or_default();
        if let Some(write_wait) = secs_var("WS_WRITE_WAIT_SECS") {
            connection.write_wait = write_wait;
        }
        if let Some(max) = parsed_var("WS_MAX_MESSAGE_SIZE") {
            connection.max_message_size = max;
        }

        let router = RouterConfig {
            deliver_to_sender: parsed_var("DELIVER_TO_SENDER").unwrap_or(true),
        };

        Self {
            port: parsed_var("PORT").unwrap_or(4100),
            hub,
            connection,
            router,
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn secs_var(name: &str) -> Option<Duration> {
    parsed_var::<u64>(name)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_period_is_shorter_than_read_timeout() {
        let cfg = ConnectionConfig::with_pong_wait(Duration::from_secs(60));
        assert_eq!(cfg.ping_period, Duration::from_secs(54));
        assert!(cfg.ping_period < cfg.pong_wait);
    }

    #[test]
    fn hub_defaults_match_documented_values() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.grace_period, Duration::from_secs(300));
        assert_eq!(cfg.flush_interval, Duration::from_secs(60));
        assert_eq!(cfg.idle_prune_after, Duration::from_secs(600));
        assert_eq!(cfg.outbound_capacity, 256);
    }

    #[test]
    fn router_delivers_to_sender_by_default() {
        assert!(RouterConfig::default().deliver_to_sender);
    }
}
