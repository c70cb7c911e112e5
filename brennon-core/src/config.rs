use std::env::var;
use std::time::Duration;

use dotenvy::dotenv;

use crate::helpers::generate_origin_id;

/// Application configuration with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of this server in the topology
    /// Env: BRENNON_SERVER_NAME (default: "standalone")
    pub server_name: String,

    /// Group this server belongs to
    /// Env: BRENNON_SERVER_GROUP (default: "lobby")
    pub server_group: String,

    /// Identity used to recognise our own broadcasts
    /// Env: BRENNON_ORIGIN_ID (default: server name + random suffix)
    pub origin_id: String,

    /// Address players connect to, reported in heartbeats
    /// Env: BRENNON_SERVER_HOST (default: "127.0.0.1")
    pub server_host: String,

    /// Game port reported in heartbeats
    /// Env: BRENNON_SERVER_PORT (default: 25565)
    pub server_port: u16,

    /// Env: BRENNON_MOTD (default: "")
    pub motd: String,

    /// Player cap reported in heartbeats
    /// Env: LOCAL_MAX_PLAYERS (default: 100)
    pub local_max_players: u32,

    /// Group used for fallback routing
    /// Env: DEFAULT_GROUP (default: "lobby")
    pub default_group: String,

    /// Database file path
    /// Env: DATABASE_PATH (default: "brennon.db")
    pub database_path: String,

    /// HTTP port
    /// Env: PORT (default: 3000)
    pub port: u16,

    /// Bearer key for mutation routes; they are refused when unset
    /// Env: BRENNON_API_KEY (optional)
    pub api_key: Option<String>,

    /// Request body size limit in bytes
    /// Env: REQUEST_BODY_LIMIT (default: 65536 = 64KB)
    pub request_body_limit: usize,

    /// Request timeout in seconds
    /// Env: REQUEST_TIMEOUT_SECS (default: 30)
    pub request_timeout: Duration,

    /// Bound on every store call
    /// Env: STORE_TIMEOUT_MS (default: 2000)
    pub store_timeout: Duration,

    /// Bound on every transport publish
    /// Env: TRANSPORT_TIMEOUT_MS (default: 2000)
    pub transport_timeout: Duration,

    /// How long the relay may be disconnected before joins fail closed
    /// Env: STALENESS_THRESHOLD_SECS (default: 30)
    pub staleness_threshold: Duration,

    /// Env: HEARTBEAT_INTERVAL_SECS (default: 10)
    pub heartbeat_interval: Duration,

    /// A server not heard from for this long counts as offline
    /// Env: HEARTBEAT_TIMEOUT_SECS (default: 30)
    pub heartbeat_timeout: Duration,

    /// Env: SWEEP_INTERVAL_SECS (default: 60)
    pub sweep_interval: Duration,

    /// Offline players stay cached this long after their last quit
    /// Env: PRESENCE_RETENTION_SECS (default: 900)
    pub presence_retention: Duration,

    /// Rate limit for read endpoints (requests per second)
    /// Env: RATE_LIMIT_QUERY_PER_SEC (default: 50)
    pub rate_limit_query_per_sec: u64,

    /// Burst size for read endpoints
    /// Env: RATE_LIMIT_QUERY_BURST (default: 100)
    pub rate_limit_query_burst: u32,

    /// Rate limit for mutation endpoints (requests per second)
    /// Env: RATE_LIMIT_ADMIN_PER_SEC (default: 10)
    pub rate_limit_admin_per_sec: u64,

    /// Burst size for mutation endpoints
    /// Env: RATE_LIMIT_ADMIN_BURST (default: 20)
    pub rate_limit_admin_burst: u32,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let _ = dotenv(); //for debugging mostly
        let server_name = env_or_default_string("BRENNON_SERVER_NAME", "standalone");
        Self {
            origin_id: var("BRENNON_ORIGIN_ID").unwrap_or_else(|_| generate_origin_id(&server_name)),
            server_group: env_or_default_string("BRENNON_SERVER_GROUP", "lobby"),
            server_host: env_or_default_string("BRENNON_SERVER_HOST", "127.0.0.1"),
            server_port: env_or_default("BRENNON_SERVER_PORT", 25565),
            motd: env_or_default_string("BRENNON_MOTD", ""),
            local_max_players: env_or_default("LOCAL_MAX_PLAYERS", 100),
            default_group: env_or_default_string("DEFAULT_GROUP", "lobby"),
            database_path: env_or_default_string("DATABASE_PATH", "brennon.db"),
            port: env_or_default("PORT", 3000),
            api_key: var("BRENNON_API_KEY").ok().filter(|key| !key.is_empty()),
            request_body_limit: env_or_default("REQUEST_BODY_LIMIT", 64 * 1024),
            request_timeout: Duration::from_secs(env_or_default("REQUEST_TIMEOUT_SECS", 30)),
            store_timeout: Duration::from_millis(env_or_default("STORE_TIMEOUT_MS", 2000)),
            transport_timeout: Duration::from_millis(env_or_default("TRANSPORT_TIMEOUT_MS", 2000)),
            staleness_threshold: Duration::from_secs(env_or_default("STALENESS_THRESHOLD_SECS", 30)),
            heartbeat_interval: Duration::from_secs(env_or_default("HEARTBEAT_INTERVAL_SECS", 10)),
            heartbeat_timeout: Duration::from_secs(env_or_default("HEARTBEAT_TIMEOUT_SECS", 30)),
            sweep_interval: Duration::from_secs(env_or_default("SWEEP_INTERVAL_SECS", 60)),
            presence_retention: Duration::from_secs(env_or_default("PRESENCE_RETENTION_SECS", 900)),
            rate_limit_query_per_sec: env_or_default("RATE_LIMIT_QUERY_PER_SEC", 50),
            rate_limit_query_burst: env_or_default("RATE_LIMIT_QUERY_BURST", 100),
            rate_limit_admin_per_sec: env_or_default("RATE_LIMIT_ADMIN_PER_SEC", 10),
            rate_limit_admin_burst: env_or_default("RATE_LIMIT_ADMIN_BURST", 20),
            server_name,
        }
    }
}

impl Default for Config {
    /// Create configuration with all default values
    fn default() -> Self {
        Self {
            server_name: "standalone".to_string(),
            server_group: "lobby".to_string(),
            origin_id: generate_origin_id("standalone"),
            server_host: "127.0.0.1".to_string(),
            server_port: 25565,
            motd: String::new(),
            local_max_players: 100,
            default_group: "lobby".to_string(),
            database_path: "brennon.db".to_string(),
            port: 3000,
            api_key: None,
            request_body_limit: 64 * 1024, // 64 KB
            request_timeout: Duration::from_secs(30),
            store_timeout: Duration::from_millis(2000),
            transport_timeout: Duration::from_millis(2000),
            staleness_threshold: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            presence_retention: Duration::from_secs(900),
            rate_limit_query_per_sec: 50,
            rate_limit_query_burst: 100,
            rate_limit_admin_per_sec: 10,
            rate_limit_admin_burst: 20,
        }
    }
}

impl Config {
    /// Defaults for a named server, with a fresh origin id.
    pub fn for_server(name: &str, group: &str) -> Self {
        Self {
            server_name: name.to_string(),
            server_group: group.to_string(),
            origin_id: generate_origin_id(name),
            ..Self::default()
        }
    }
}

/// Parse environment variable or return default value
fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

/// Parse environment variable string or return default value
fn env_or_default_string(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server_name, "standalone");
        assert_eq!(config.default_group, "lobby");
        assert_eq!(config.port, 3000);
        assert_eq!(config.database_path, "brennon.db");
        assert_eq!(config.store_timeout, Duration::from_millis(2000));
        assert_eq!(config.staleness_threshold, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.presence_retention, Duration::from_secs(900));
        assert!(config.api_key.is_none());
        assert!(config.origin_id.starts_with("standalone-"));
    }

    #[test]
    fn test_for_server() {
        let a = Config::for_server("survival-1", "survival");
        let b = Config::for_server("survival-1", "survival");
        assert_eq!(a.server_group, "survival");
        assert_ne!(a.origin_id, b.origin_id);
    }
}
