use crate::error::{Error, Result};
use serde::Deserialize;
use time::Duration;

const DEFAULT_MAX_STREAM_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_QUEUE_SIZE: usize = 1024;
const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FLOW_TTL_SECS: u64 = 30;
const DEFAULT_TOPOLOGY_EXPIRE_SECS: u64 = 15;

/// Startup configuration for the analyzer. Fixed once the engine is
/// constructed; every section has working defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub protocols: ProtocolsConfig,
    pub passwords: PasswordsConfig,
    pub agent: AgentConfig,
    pub transactions: TransactionsConfig,
    /// Per-direction stream buffer cap; the direction is dropped beyond it.
    pub max_stream_bytes: usize,
    /// Idle flows are evicted after this many seconds without traffic.
    pub flow_ttl: u64,
    /// Capacity of the bounded publisher queue.
    pub queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocols: ProtocolsConfig::default(),
            passwords: PasswordsConfig::default(),
            agent: AgentConfig::default(),
            transactions: TransactionsConfig::default(),
            max_stream_bytes: DEFAULT_MAX_STREAM_BYTES,
            flow_ttl: DEFAULT_FLOW_TTL_SECS,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl Config {
    /// Parse a configuration document in JSON form.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut config: Config =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.normalize();
        Ok(config)
    }

    /// Lowercase the header names the HTTP parser matches against.
    pub fn normalize(&mut self) {
        let http = &mut self.protocols.http;
        http.real_ip_header = http.real_ip_header.to_ascii_lowercase();
        for name in &mut http.send_headers {
            *name = name.to_ascii_lowercase();
        }
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::seconds(self.transactions.timeout as i64)
    }

    pub fn flow_ttl(&self) -> Duration {
        Duration::seconds(self.flow_ttl as i64)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProtocolsConfig {
    pub http: HttpConfig,
    pub mysql: PortsConfig,
    pub redis: PortsConfig,
    pub thrift: PortsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Include the raw request in the emitted event.
    pub send_request: bool,
    /// Include the raw response in the emitted event.
    pub send_response: bool,
    /// Capture every header into the event.
    pub send_all_headers: bool,
    /// Whitelist of header names to capture when `send_all_headers` is off.
    /// Empty means headers are not emitted at all.
    pub send_headers: Vec<String>,
    /// Split `cookie` / `set-cookie` values into a sub-mapping.
    pub split_cookie: bool,
    /// Lowercase name of the header carrying the real client IP.
    pub real_ip_header: String,
    /// Content-Type substrings for which the body is kept in the raw.
    pub include_body_for: Vec<String>,
    pub ports: Vec<u16>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            send_request: true,
            send_response: true,
            send_all_headers: false,
            send_headers: Vec::new(),
            split_cookie: false,
            real_ip_header: String::new(),
            include_body_for: Vec::new(),
            ports: vec![80, 8080],
        }
    }
}

impl HttpConfig {
    /// Whether any headers are captured into events.
    pub fn captures_headers(&self) -> bool {
        self.send_all_headers || !self.send_headers.is_empty()
    }

    pub fn header_wanted(&self, name: &str) -> bool {
        self.send_all_headers || self.send_headers.iter().any(|h| h == name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub ports: Vec<u16>,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self { ports: Vec::new() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PasswordsConfig {
    /// Form-field names whose values are overwritten with `*` in raw
    /// urlencoded request bodies.
    pub hide_keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Name this agent reports; also the server name for loopback peers.
    pub name: String,
    /// Suppress events whose destination is another known agent.
    pub ignore_outgoing: bool,
    /// Lifetime of entries in the external topology cache, seconds.
    pub topology_expire: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            ignore_outgoing: false,
            topology_expire: DEFAULT_TOPOLOGY_EXPIRE_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransactionsConfig {
    /// Seconds an unanswered request stays correlatable.
    pub timeout: u64,
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TRANSACTION_TIMEOUT_SECS,
        }
    }
}

/// Ports for each protocol with the conventional defaults applied where
/// the configuration does not name any.
pub fn ports_or_default(config: &PortsConfig, default_ports: &[u16]) -> Vec<u16> {
    if config.ports.is_empty() {
        default_ports.to_vec()
    } else {
        config.ports.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert!(config.protocols.http.send_request);
        assert!(config.protocols.http.send_response);
        assert!(!config.protocols.http.send_all_headers);
        assert_eq!(config.protocols.http.ports, vec![80, 8080]);
        assert_eq!(config.transactions.timeout, 10);
        assert_eq!(config.agent.topology_expire, 15);
        assert_eq!(config.max_stream_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn from_json_overrides_and_normalizes() {
        let config = Config::from_json(
            r#"{
                "protocols": {
                    "http": {
                        "send_all_headers": true,
                        "real_ip_header": "X-Forwarded-For",
                        "send_headers": ["Host", "User-Agent"]
                    },
                    "mysql": {"ports": [3307]}
                },
                "passwords": {"hide_keywords": ["password"]},
                "transactions": {"timeout": 3}
            }"#,
        )
        .unwrap();
        assert!(config.protocols.http.send_all_headers);
        assert_eq!(config.protocols.http.real_ip_header, "x-forwarded-for");
        assert_eq!(config.protocols.http.send_headers, vec!["host", "user-agent"]);
        assert_eq!(config.protocols.mysql.ports, vec![3307]);
        assert_eq!(config.transactions.timeout, 3);
        assert_eq!(config.transaction_timeout(), Duration::seconds(3));
    }

    #[test]
    fn bad_json_is_a_config_error() {
        assert!(Config::from_json("{nope").is_err());
    }
}
