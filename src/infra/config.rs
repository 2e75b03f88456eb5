//! Environment-driven configuration
//!
//! Every process (parent and per-node children) reads the same variables:
//!
//! - `REDIS_HOST` / `REDIS_PORT` - control plane endpoint
//! - `DATA_REDIS_HOST` / `DATA_REDIS_PORT` - data plane endpoint
//! - `GATEWAY_HOST` / `GATEWAY_TCP_PORT` / `GATEWAY_HTTP_PORT` - gateway reachability
//! - `NODE_NAME` - overrides node identity
//! - `HOSTNAME` - consumer-instance id (replica identity within a group)

use std::env;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_port(key: &str, default: u16) -> u16 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Process-wide settings snapshot, taken once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    redis_host: String,
    redis_port: u16,
    data_redis_host: String,
    data_redis_port: u16,
    gateway_host: String,
    gateway_tcp_port: u16,
    gateway_http_port: u16,
    node_name: Option<String>,
    hostname: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            data_redis_host: "localhost".to_string(),
            data_redis_port: 6379,
            gateway_host: "localhost".to_string(),
            gateway_tcp_port: 8080,
            gateway_http_port: 8000,
            node_name: None,
            hostname: "local".to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let redis_host = env_or("REDIS_HOST", "localhost");
        let redis_port = env_port("REDIS_PORT", 6379);
        Self {
            data_redis_host: env_or("DATA_REDIS_HOST", &redis_host),
            data_redis_port: env_port("DATA_REDIS_PORT", redis_port),
            gateway_host: env_or("GATEWAY_HOST", "localhost"),
            gateway_tcp_port: env_port("GATEWAY_TCP_PORT", 8080),
            gateway_http_port: env_port("GATEWAY_HTTP_PORT", 8000),
            node_name: env::var("NODE_NAME").ok().filter(|v| !v.is_empty()),
            hostname: env_or("HOSTNAME", "local"),
            redis_host,
            redis_port,
        }
    }

    pub fn redis_host(&self) -> &str {
        &self.redis_host
    }

    pub fn redis_port(&self) -> u16 {
        self.redis_port
    }

    pub fn data_redis_host(&self) -> &str {
        &self.data_redis_host
    }

    pub fn data_redis_port(&self) -> u16 {
        self.data_redis_port
    }

    pub fn gateway_host(&self) -> &str {
        &self.gateway_host
    }

    pub fn gateway_tcp_port(&self) -> u16 {
        self.gateway_tcp_port
    }

    pub fn gateway_http_port(&self) -> u16 {
        self.gateway_http_port
    }

    /// Node identity override, used by the bootstrap over the spec name
    pub fn node_name(&self) -> Option<&str> {
        self.node_name.as_deref()
    }

    /// Consumer-instance id. In a pod this is the pod name, so replicas of
    /// one consumer group load-balance automatically.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.redis_port(), 6379);
        assert_eq!(settings.gateway_tcp_port(), 8080);
        assert_eq!(settings.gateway_http_port(), 8000);
        assert_eq!(settings.hostname(), "local");
        assert!(settings.node_name().is_none());
    }
}
