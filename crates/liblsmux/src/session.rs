use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use itertools::Itertools;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error_span, info, warn};

use crate::config::Config;
use crate::http_tunnel::SubPeerInfo;
use crate::peer::Peer;
use crate::spawn_utils::spawn;
use crate::updater::Updater;
use crate::Result;

/// The running daemon: peer registry, config, and task lifecycle. Created
/// once, shared as `Arc<Session>` with every listener and updater.
pub struct Session {
    config: ArcSwap<Config>,
    peers: DashMap<String, Arc<Peer>>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    next_ordinal: AtomicUsize,
    /// Serializes configuration reloads.
    reload_lock: tokio::sync::Mutex<()>,

    pub frontend_connections: std::sync::atomic::AtomicU64,
    pub frontend_bytes_sent: std::sync::atomic::AtomicU64,
    pub frontend_bytes_received: std::sync::atomic::AtomicU64,
}

impl Session {
    pub fn new(config: Config) -> Result<Arc<Session>> {
        config.validate()?;
        let session = Arc::new(Session {
            config: ArcSwap::from_pointee(config),
            peers: DashMap::new(),
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            next_ordinal: AtomicUsize::new(0),
            reload_lock: tokio::sync::Mutex::new(()),
            frontend_connections: std::sync::atomic::AtomicU64::new(0),
            frontend_bytes_sent: std::sync::atomic::AtomicU64::new(0),
            frontend_bytes_received: std::sync::atomic::AtomicU64::new(0),
        });
        Ok(session)
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Create the configured peers, start their updaters, and bind the
    /// frontend listeners.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let config = self.config();
        for connection in &config.connections {
            self.add_peer(connection)?;
        }
        let listeners = crate::listen::start_listeners(self).await?;
        self.tasks.lock().extend(listeners);
        info!(
            peers = self.peers.len(),
            endpoints = config.listen.len(),
            "session started"
        );
        Ok(())
    }

    fn add_peer(self: &Arc<Self>, connection: &crate::config::Connection) -> Result<Arc<Peer>> {
        let ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
        let peer = Peer::new(
            &self.config(),
            connection,
            ordinal,
            self.cancel.child_token(),
        )?;
        self.peers.insert(peer.id.clone(), peer.clone());
        self.spawn_updater(&peer);
        Ok(peer)
    }

    fn spawn_updater(self: &Arc<Self>, peer: &Arc<Peer>) {
        let updater = Updater::new(peer.clone(), Arc::downgrade(self), self.config());
        let handle = spawn(error_span!("peer", id = peer.id), updater.run());
        self.tasks.lock().push(handle);
    }

    pub fn peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.get(id).map(|p| p.clone())
    }

    /// All peers in stable merge order.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .map(|entry| entry.value().clone())
            .sorted_by(|a, b| a.ordinal.cmp(&b.ordinal).then_with(|| a.id.cmp(&b.id)))
            .collect()
    }

    /// Apply a new configuration: stop removed peers, start added ones,
    /// restart changed ones, leave the rest alone. A validation error
    /// leaves the running set untouched.
    pub async fn reload(self: &Arc<Self>, new_config: Config) -> Result<()> {
        let _guard = self.reload_lock.lock().await;
        new_config.validate()?;

        // Build every new peer before touching the registry, so a broken
        // connection (bad cert path, malformed url) rolls the whole reload
        // back with the running set untouched.
        let mut created: Vec<Arc<Peer>> = Vec::new();
        let mut kept = 0usize;
        for connection in &new_config.connections {
            match self.peer(&connection.id) {
                Some(existing) if existing.config.as_ref() == connection => {
                    kept += 1;
                }
                _ => {
                    let ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
                    created.push(Peer::new(
                        &new_config,
                        connection,
                        ordinal,
                        self.cancel.child_token(),
                    )?);
                }
            }
        }

        self.config.store(Arc::new(new_config.clone()));

        let old_ids: Vec<String> = self
            .peers
            .iter()
            .filter(|e| e.value().parent_id.is_none())
            .map(|e| e.key().clone())
            .collect();
        for id in old_ids {
            let still_wanted = new_config.connections.iter().any(|c| c.id == id);
            let replaced = created.iter().any(|p| p.id == id);
            if !still_wanted || replaced {
                info!(peer = id, "stopping peer");
                self.remove_peer_tree(&id);
            }
        }
        for peer in created {
            info!(peer = peer.id, "starting peer");
            self.peers.insert(peer.id.clone(), peer.clone());
            self.spawn_updater(&peer);
        }
        info!(kept, total = self.peers.len(), "configuration reloaded");
        Ok(())
    }

    /// Remove a peer and every sub-peer hanging off it. In-flight queries
    /// keep the Arcs they already cloned and finish on the old topology.
    fn remove_peer_tree(&self, id: &str) {
        let children: Vec<String> = self
            .peers
            .iter()
            .filter(|e| e.value().parent_id.as_deref() == Some(id))
            .map(|e| e.key().clone())
            .collect();
        for child in children {
            self.remove_peer_tree(&child);
        }
        if let Some((_, peer)) = self.peers.remove(id) {
            peer.cancel.cancel();
        }
    }

    /// Reconcile the sub-peers announced by a federated parent with the
    /// registry: create the new ones, drop the vanished ones.
    pub(crate) fn sync_sub_peers(
        self: &Arc<Self>,
        parent: &Arc<Peer>,
        infos: Vec<SubPeerInfo>,
    ) -> Result<()> {
        let wanted: Vec<String> = infos
            .iter()
            .map(|i| format!("{}/{}", parent.id, i.id))
            .collect();
        let existing: Vec<String> = self
            .peers
            .iter()
            .filter(|e| e.value().parent_id.as_deref() == Some(parent.id.as_str()))
            .map(|e| e.key().clone())
            .collect();

        for info in infos {
            let id = format!("{}/{}", parent.id, info.id);
            if self.peers.contains_key(&id) {
                continue;
            }
            info!(parent = parent.id, sub_peer = id, "discovered sub peer");
            let peer = Peer::new_sub_peer(
                parent,
                info.id,
                info.name,
                info.section,
                parent.ordinal,
            );
            self.peers.insert(peer.id.clone(), peer.clone());
            self.spawn_updater(&peer);
        }
        for id in existing {
            if !wanted.contains(&id) {
                info!(parent = parent.id, sub_peer = id, "sub peer vanished");
                self.remove_peer_tree(&id);
            }
        }
        Ok(())
    }

    /// SIGUSR1 handler: log a snapshot of the whole topology.
    pub fn dump_state(&self) {
        info!(peers = self.peers.len(), "state dump");
        for peer in self.peers() {
            let status = peer.status_snapshot();
            info!(
                id = peer.id,
                name = peer.name,
                state = %status.state,
                addr = peer.addr(),
                last_update = status.last_update,
                last_error = status.last_error,
                queries = peer.queries.load(Ordering::Relaxed),
                bytes_sent = peer.bytes_sent.load(Ordering::Relaxed),
                bytes_received = peer.bytes_received.load(Ordering::Relaxed),
                "peer"
            );
        }
    }

    /// Graceful shutdown: broadcast cancellation and give tasks a moment
    /// to observe it.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let joined = futures::future::join_all(tasks);
        if tokio::time::timeout(Duration::from_secs(1), joined)
            .await
            .is_err()
        {
            warn!("some tasks did not stop in time");
        }
    }

    pub(crate) fn count_frontend_connection(&self) {
        self.frontend_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_frontend_sent(&self, bytes: usize) {
        self.frontend_bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn count_frontend_received(&self, bytes: usize) {
        self.frontend_bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
