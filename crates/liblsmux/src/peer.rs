use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use livestatus::Value;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::catalog::Column;
use crate::config::{Connection, ConnectionType};
use crate::connector::{Connector, SourceAddr};
use crate::http_tunnel::HttpTunnel;
use crate::store::DataTable;
use crate::{Error, Result};

/// Peer health as shown in the backends table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// No successful full refresh yet.
    #[default]
    Pending,
    Up,
    /// Last refresh failed, previous data is still served.
    Warning,
    /// Repeated failures.
    Down,
    /// Protocol-level incompatibility. No retries until reload.
    Broken,
}

impl PeerState {
    pub fn name(&self) -> &'static str {
        match self {
            PeerState::Pending => "pending",
            PeerState::Up => "up",
            PeerState::Warning => "warning",
            PeerState::Down => "down",
            PeerState::Broken => "broken",
        }
    }

    /// Numeric code on the wire, fixed for client compatibility.
    pub fn code(&self) -> i64 {
        match self {
            PeerState::Up => 0,
            PeerState::Warning => 1,
            PeerState::Down => 2,
            PeerState::Broken => 3,
            PeerState::Pending => 4,
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Observable refresh bookkeeping, mutated only by the peer's updater.
#[derive(Debug, Clone, Default)]
pub struct PeerStatus {
    pub state: PeerState,
    pub last_error: String,
    pub last_update: i64,
    pub last_full_update: i64,
    pub last_online: i64,
    pub response_time: f64,
    pub program_start: i64,
    pub last_command_check: i64,
    pub last_log_rotation: i64,
    pub core_version: String,
    /// Index into `config.source` of the source currently in use.
    pub active_source: Option<usize>,
}

/// One backend site. Shared immutable identity plus locked mutable state,
/// handed around as `Arc<Peer>`; queries clone the table handles they need
/// and never block the updater beyond the swap window.
pub struct Peer {
    pub id: String,
    pub name: String,
    pub section: String,
    /// Config-file position, keeps merge order stable across reloads.
    pub ordinal: usize,
    /// Configured refresh interval in seconds, for the backends table.
    pub update_interval: u64,
    /// Set on sub-peers discovered through a federated parent.
    pub parent_id: Option<String>,
    pub config: Arc<Connection>,

    pub(crate) status: RwLock<PeerStatus>,
    tables: RwLock<HashMap<&'static str, Arc<RwLock<DataTable>>>>,

    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub queries: AtomicU64,

    /// Fired after every applied refresh; wait-condition queries listen.
    pub(crate) refresh_notify: Notify,
    pub(crate) cancel: CancellationToken,

    /// HTTP transport, shared with sub-peers.
    pub(crate) tunnel: Option<Arc<HttpTunnel>>,
    /// Socket transport for livestatus connections.
    pub(crate) connector: Option<Arc<Connector>>,
    /// Site id on the remote side, for routing through a parent tunnel.
    pub(crate) remote_id: Option<String>,
}

impl Peer {
    pub fn new(
        global: &crate::config::Config,
        config: &Connection,
        ordinal: usize,
        cancel: CancellationToken,
    ) -> Result<Arc<Peer>> {
        let (tunnel, connector) = match config.connection_type {
            ConnectionType::Http => (
                Some(Arc::new(HttpTunnel::new(
                    config,
                    global.connect_timeout(),
                    global.net_timeout(),
                )?)),
                None,
            ),
            ConnectionType::Livestatus => (
                None,
                Some(Arc::new(Connector::new(
                    global.connect_timeout(),
                    global.net_timeout(),
                    config,
                )?)),
            ),
        };
        Ok(Arc::new(Peer {
            id: config.id.clone(),
            name: config.name.clone(),
            section: config.section.clone().unwrap_or_default(),
            ordinal,
            update_interval: global.update_interval,
            parent_id: None,
            config: Arc::new(config.clone()),
            status: RwLock::new(PeerStatus::default()),
            tables: RwLock::new(HashMap::new()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            refresh_notify: Notify::new(),
            cancel,
            tunnel,
            connector,
            remote_id: None,
        }))
    }

    /// A peer discovered through a federated parent. Shares the parent's
    /// HTTP transport and dies with it.
    pub fn new_sub_peer(
        parent: &Arc<Peer>,
        remote_id: String,
        name: String,
        section: String,
        ordinal: usize,
    ) -> Arc<Peer> {
        Arc::new(Peer {
            id: format!("{}/{}", parent.id, remote_id),
            name,
            section,
            ordinal,
            update_interval: parent.update_interval,
            parent_id: Some(parent.id.clone()),
            config: parent.config.clone(),
            status: RwLock::new(PeerStatus::default()),
            tables: RwLock::new(HashMap::new()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            refresh_notify: Notify::new(),
            cancel: parent.cancel.child_token(),
            tunnel: parent.tunnel.clone(),
            connector: None,
            remote_id: Some(remote_id),
        })
    }

    pub fn is_http(&self) -> bool {
        self.tunnel.is_some()
    }

    pub fn state(&self) -> PeerState {
        self.status.read().state
    }

    pub fn status_snapshot(&self) -> PeerStatus {
        self.status.read().clone()
    }

    pub fn with_status_mut<R>(&self, f: impl FnOnce(&mut PeerStatus) -> R) -> R {
        f(&mut self.status.write())
    }

    /// The source address currently in use, for display.
    pub fn addr(&self) -> String {
        let idx = self.status.read().active_source.unwrap_or(0);
        self.config
            .source
            .get(idx)
            .or_else(|| self.config.source.first())
            .cloned()
            .unwrap_or_default()
    }

    pub fn table(&self, name: &str) -> Option<Arc<RwLock<DataTable>>> {
        self.tables.read().get(name).cloned()
    }

    /// Swap in a freshly built table. The write lock is held only for the
    /// map update; readers holding the previous Arc keep their snapshot.
    pub(crate) fn set_table(&self, name: &'static str, table: DataTable) {
        self.tables
            .write()
            .insert(name, Arc::new(RwLock::new(table)));
    }

    /// Virtual columns computed from peer identity rather than table data.
    pub fn virtual_value(&self, column: &Column, table: &DataTable) -> Option<Value> {
        match column.name {
            "peer_key" => Some(Value::Str(self.id.clone())),
            "peer_name" => Some(Value::Str(self.name.clone())),
            "lmd_last_cache_update" => Some(Value::Int(table.last_delta_update)),
            _ => None,
        }
    }

    /// The row this peer contributes to the backends table.
    pub fn backends_row(&self, columns: &[&Column]) -> Vec<Value> {
        let status = self.status_snapshot();
        columns
            .iter()
            .map(|col| match col.name {
                "peer_key" => Value::Str(self.id.clone()),
                "peer_name" => Value::Str(self.name.clone()),
                "section" => Value::Str(self.section.clone()),
                "parent" => Value::Str(self.parent_id.clone().unwrap_or_default()),
                "addr" => Value::Str(self.addr()),
                "status" => Value::Int(status.state.code()),
                "last_error" => Value::Str(status.last_error.clone()),
                "last_update" => Value::Int(status.last_update),
                "last_full_update" => Value::Int(status.last_full_update),
                "last_online" => Value::Int(status.last_online),
                "response_time" => Value::Float(status.response_time),
                "program_start" => Value::Int(status.program_start),
                "core_version" => Value::Str(status.core_version.clone()),
                "update_interval" => Value::Int(self.update_interval as i64),
                "bytes_send" => Value::Int(self.bytes_sent.load(Ordering::Relaxed) as i64),
                "bytes_received" => {
                    Value::Int(self.bytes_received.load(Ordering::Relaxed) as i64)
                }
                "queries" => Value::Int(self.queries.load(Ordering::Relaxed) as i64),
                _ => col.data_type.empty_value(),
            })
            .collect()
    }

    /// Forward one COMMAND line. Cores only speak up when the command is
    /// broken, so an empty reply means success and anything else is a
    /// diagnostic line to relay.
    pub async fn send_command(&self, line: &str) -> Result<Option<String>> {
        self.count_query();
        let raw = format!("COMMAND {line}\n");
        if let Some(tunnel) = &self.tunnel {
            let reply = tunnel.raw_query(&raw, self.remote_id.as_deref()).await?;
            self.count_sent(raw.len());
            self.count_received(reply.len());
            let text = String::from_utf8_lossy(&reply).trim().to_string();
            return Ok((!text.is_empty()).then_some(text));
        }
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let connector = self.connector.as_ref().ok_or(Error::PeerNotReady)?;
        let source = SourceAddr::parse(&self.addr());
        let mut stream = connector.connect(&source).await?;
        stream
            .write_all(raw.as_bytes())
            .await
            .map_err(Error::Write)?;
        stream.flush().await.map_err(Error::Write)?;
        self.count_sent(raw.len());
        let mut reply = Vec::new();
        match tokio::time::timeout(
            std::time::Duration::from_millis(300),
            stream.read_to_end(&mut reply),
        )
        .await
        {
            Ok(Ok(_)) | Err(_) => {}
            Ok(Err(e)) => return Err(Error::Read(e)),
        }
        self.count_received(reply.len());
        let text = String::from_utf8_lossy(&reply).trim().to_string();
        Ok((!text.is_empty()).then_some(text))
    }

    /// Forward a raw request (passthrough tables). The caller provides the
    /// request already rendered with json output and fixed16 framing.
    pub async fn passthrough_query(&self, raw: &str) -> Result<Vec<u8>> {
        self.count_query();
        if let Some(tunnel) = &self.tunnel {
            let body = tunnel.raw_query(raw, self.remote_id.as_deref()).await?;
            self.count_sent(raw.len());
            self.count_received(body.len());
            return Ok(body);
        }
        let connector = self.connector.as_ref().ok_or(Error::PeerNotReady)?;
        let source = SourceAddr::parse(&self.addr());
        let mut stream = connector.connect(&source).await?;
        let body = connector.request(&mut stream, raw).await?;
        self.count_sent(raw.len());
        self.count_received(body.len() + 16);
        Ok(body)
    }

    pub fn count_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn count_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state().name())
            .finish()
    }
}
