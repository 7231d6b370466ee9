use crate::heartbeat::HeartbeatPolicy;
use crate::status::{STATUS_CACHE_MAX, STATUS_CACHE_TTL};
use bridge_core::protocol::DEFAULT_MAX_MESSAGE_BYTES;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ADDR: &str = "127.0.0.1:47100";

#[derive(Parser, Debug, Clone)]
#[command(name = "bridge-hub", about = "Routes automation requests to browser-extension workers")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value_t = 5_000)]
    pub heartbeat_interval_ms: u64,
    #[arg(long, default_value_t = 3)]
    pub missed_heartbeats: u32,
    #[arg(long, default_value_t = 10_000)]
    pub grace_period_ms: u64,
    #[arg(long, default_value_t = 120_000)]
    pub request_timeout_ms: u64,
    #[arg(long, default_value_t = 3)]
    pub max_failover_attempts: u32,
    /// Seconds between websocket pings.
    #[arg(long, default_value_t = 10)]
    pub ping_interval: u64,
    /// Seconds allowed for a single websocket write.
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    pub queue_capacity: usize,
    #[arg(long, default_value_t = 3)]
    pub max_malformed: u32,
    #[arg(long, default_value_t = 5_000)]
    pub shutdown_drain_ms: u64,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub allow_remote: bool,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub heartbeat: HeartbeatPolicy,
    pub request_timeout: Duration,
    pub max_failover_attempts: u32,
    pub shutdown_drain: Duration,
    pub event_capacity: usize,
    pub disconnect_capacity: usize,
    pub status_cache_size: usize,
    pub status_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatPolicy::default(),
            request_timeout: Duration::from_millis(120_000),
            max_failover_attempts: 3,
            shutdown_drain: Duration::from_millis(5_000),
            event_capacity: 256,
            disconnect_capacity: 64,
            status_cache_size: STATUS_CACHE_MAX,
            status_ttl: STATUS_CACHE_TTL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_malformed: u32,
    pub max_message_bytes: usize,
    pub allow_remote: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 256,
            max_malformed: 3,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            allow_remote: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub debug: bool,
    pub log_dir: Option<PathBuf>,
    pub coordinator: CoordinatorConfig,
    pub transport: TransportSettings,
}

impl Config {
    pub fn from_args(args: &Args) -> Self {
        let coordinator = CoordinatorConfig {
            heartbeat: HeartbeatPolicy {
                interval: Duration::from_millis(args.heartbeat_interval_ms.max(1)),
                missed_threshold: args.missed_heartbeats.max(1),
                grace_period: Duration::from_millis(args.grace_period_ms),
            },
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            max_failover_attempts: args.max_failover_attempts,
            shutdown_drain: Duration::from_millis(args.shutdown_drain_ms),
            ..CoordinatorConfig::default()
        };
        let transport = TransportSettings {
            ping_interval: Duration::from_secs(args.ping_interval.max(1)),
            write_timeout: Duration::from_secs(args.write_timeout.max(1)),
            queue_capacity: args.queue_capacity.max(1),
            max_malformed: args.max_malformed.max(1),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            allow_remote: args.allow_remote,
        };
        Self {
            addr: resolve_addr(&args.addr),
            debug: args.debug || env_true("BRIDGE_HUB_DEBUG"),
            log_dir: resolve_log_dir(&args.log_dir),
            coordinator,
            transport,
        }
    }

    /// Port component of `addr`, used to name the log file.
    pub fn port(&self) -> &str {
        self.addr.rsplit(':').next().unwrap_or("0")
    }
}

pub fn load_config() -> Config {
    Config::from_args(&Args::parse())
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    env_value("BRIDGE_HUB_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string())
}

fn resolve_log_dir(log_dir_flag: &str) -> Option<PathBuf> {
    if !log_dir_flag.trim().is_empty() {
        return Some(PathBuf::from(log_dir_flag));
    }
    env_value("BRIDGE_LOG_DIR").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_onto_library_config() {
        let args = Args::parse_from([
            "bridge-hub",
            "--addr",
            "127.0.0.1:9000",
            "--heartbeat-interval-ms",
            "250",
            "--missed-heartbeats",
            "2",
            "--queue-capacity",
            "0",
            "--max-failover-attempts",
            "5",
        ]);
        let config = Config::from_args(&args);
        assert_eq!(config.addr, "127.0.0.1:9000");
        assert_eq!(config.port(), "9000");
        assert_eq!(
            config.coordinator.heartbeat.interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.coordinator.heartbeat.missed_threshold, 2);
        assert_eq!(config.coordinator.max_failover_attempts, 5);
        assert_eq!(config.transport.queue_capacity, 1);
        assert_eq!(config.transport.write_timeout, Duration::from_secs(2));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.heartbeat.unhealthy_after(), Duration::from_secs(15));
        assert_eq!(config.heartbeat.disconnect_after(), Duration::from_secs(25));
        assert_eq!(config.request_timeout, Duration::from_secs(120));
        assert_eq!(config.status_cache_size, 1024);
        let transport = TransportSettings::default();
        assert_eq!(transport.max_message_bytes, 256 * 1024);
        assert!(!transport.allow_remote);
    }
}
