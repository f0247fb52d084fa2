use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Daemon configuration, decoded from one or more TOML files. Later files
/// override scalar options and extend the connection list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listen endpoints: a unix socket path, "host:port", "tcp://host:port"
    /// or "tls://host:port".
    #[serde(rename = "Listen")]
    pub listen: Vec<String>,

    /// Idle timeout between requests on a keepalive client connection.
    #[serde(rename = "ListenTimeout")]
    pub listen_timeout: u64,

    /// Prometheus exporter endpoint, consumed by the metrics exporter.
    #[serde(rename = "ListenPrometheus")]
    pub listen_prometheus: Option<String>,

    #[serde(rename = "TLSCertificate")]
    pub tls_certificate: Option<String>,
    #[serde(rename = "TLSKey")]
    pub tls_key: Option<String>,
    /// Client certificates accepted on tls:// listeners.
    #[serde(rename = "TLSClientPems")]
    pub tls_client_pems: Vec<String>,

    #[serde(rename = "Connections")]
    pub connections: Vec<Connection>,

    /// Seconds between delta refreshes.
    #[serde(rename = "Updateinterval")]
    pub update_interval: u64,

    /// Seconds between forced full refreshes; 0 means only when the peer
    /// core restarts.
    #[serde(rename = "FullUpdateInterval")]
    pub full_update_interval: u64,

    #[serde(rename = "ConnectTimeout")]
    pub connect_timeout: u64,

    #[serde(rename = "NetTimeout")]
    pub net_timeout: u64,

    /// Seconds without a successful update before a peer counts as stale.
    #[serde(rename = "StaleBackendTimeout")]
    pub stale_backend_timeout: u64,

    /// Reuse one backend connection across refresh ticks.
    #[serde(rename = "BackendKeepAlive")]
    pub backend_keepalive: bool,

    /// Queries slower than this many seconds get logged.
    #[serde(rename = "LogSlowQueryThreshold")]
    pub log_slow_query_threshold: u64,

    /// Results bigger than this many rows get logged.
    #[serde(rename = "LogHugeQueryThreshold")]
    pub log_huge_query_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            listen_timeout: 60,
            listen_prometheus: None,
            tls_certificate: None,
            tls_key: None,
            tls_client_pems: Vec::new(),
            connections: Vec::new(),
            update_interval: 5,
            full_update_interval: 0,
            connect_timeout: 5,
            net_timeout: 30,
            stale_backend_timeout: 30,
            backend_keepalive: true,
            log_slow_query_threshold: 5,
            log_huge_query_threshold: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Livestatus,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Connection {
    pub name: String,
    pub id: String,
    /// Failover sources, tried in order.
    pub source: Vec<String>,
    /// Credential for http connections.
    pub auth: Option<String>,
    /// Site name on the remote side for federated http connections.
    pub remote_name: Option<String>,
    pub section: Option<String>,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub tls_certificate: Option<String>,
    pub tls_key: Option<String>,
    pub tls_ca: Option<String>,
    pub no_config_tool: bool,
    /// Behavior flags, e.g. "Icinga2" or "MultiBackend".
    pub flags: Vec<String>,
}

impl Connection {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }
}

impl Config {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout.max(1))
    }

    pub fn net_timeout(&self) -> Duration {
        Duration::from_secs(self.net_timeout.max(1))
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_secs(self.listen_timeout.max(1))
    }

    /// Parse a single TOML document.
    pub fn parse(text: &str) -> Result<Config> {
        let config: Config =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and merge multiple config files. Merging happens on the TOML
    /// level so that only options actually present in a later file
    /// override, while connection lists concatenate.
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Config> {
        let mut merged = toml::Table::new();
        for path in paths {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("cannot read {}: {e}", path.display()))
            })?;
            let table: toml::Table = toml::from_str(&text).map_err(|e| {
                Error::Config(format!("invalid config {}: {e}", path.display()))
            })?;
            merge_tables(&mut merged, table);
        }
        let config: Config = toml::Table::try_into(merged)
            .map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for conn in &self.connections {
            if conn.id.is_empty() {
                return Err(Error::Config(format!(
                    "connection {:?} has no id",
                    conn.name
                )));
            }
            if conn.source.is_empty() {
                return Err(Error::Config(format!(
                    "connection {:?} has no source",
                    conn.id
                )));
            }
            if !seen.insert(&conn.id) {
                return Err(Error::Config(format!("duplicate connection id {:?}", conn.id)));
            }
        }
        Ok(())
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            // Arrays of tables (the connection list) concatenate.
            (Some(toml::Value::Array(dst)), toml::Value::Array(src))
                if dst.iter().all(|v| v.is_table()) && src.iter().all(|v| v.is_table()) =>
            {
                dst.extend(src);
            }
            (Some(dst), src) => *dst = src,
            (None, src) => {
                base.insert(key, src);
            }
        }
    }
}
