//! The engine: root component reconciling the tunnel device and the set of
//! peer connections against management snapshots, and routing signal
//! messages to the peer connection they belong to.
//!
//! The engine holds no authoritative state. Snapshots carry a strictly
//! increasing serial; anything at or below the last accepted serial is
//! discarded, which is the sole consistency mechanism.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::device::TunnelDevice;
use crate::error::EngineError;
use crate::ice::IceServers;
use crate::identity::PublicKey;
use crate::management::{
    ManagementClient, NetworkMap, PeerConfig, SyncHandler, SyncResponse,
};
use crate::peer::{PeerConnection, PeerState};
use crate::signaling::{SignalClient, SignalHandler, SignalMessage};

struct EngineState {
    started: bool,
    network_serial: u64,
    peer_config: Option<PeerConfig>,
    ice_servers: IceServers,
    peer_conns: HashMap<PublicKey, PeerConnection>,
    tasks: Vec<JoinHandle<()>>,
}

struct EngineInner {
    config: EngineConfig,
    local_key: PublicKey,
    device: Arc<dyn TunnelDevice>,
    signal: Arc<dyn SignalClient>,
    management: Arc<dyn ManagementClient>,
    cancel: CancellationToken,
    /// Single-writer domain: every mutation of the serial and the peer map
    /// happens under this lock.
    state: Mutex<EngineState>,
}

/// Cheap cloneable handle to the engine. All clones share one state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        device: Arc<dyn TunnelDevice>,
        signal: Arc<dyn SignalClient>,
        management: Arc<dyn ManagementClient>,
    ) -> Self {
        let local_key = config.private_key.public_key();
        let ice_servers = IceServers {
            stuns: config.stun_servers.clone(),
            turns: config.turn_servers.clone(),
        };

        Self {
            inner: Arc::new(EngineInner {
                config,
                local_key,
                device,
                signal,
                management,
                cancel: CancellationToken::new(),
                state: Mutex::new(EngineState {
                    started: false,
                    network_serial: 0,
                    peer_config: None,
                    ice_servers,
                    peer_conns: HashMap::new(),
                    tasks: Vec::new(),
                }),
            }),
        }
    }

    pub fn local_key(&self) -> &PublicKey {
        &self.inner.local_key
    }

    /// Create the tunnel device and start the signal and sync loops. On
    /// failure nothing stays behind.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.inner.config.validate()?;

        let mut state = self.inner.state.lock().await;
        if state.started {
            return Ok(());
        }

        self.inner.device.create(
            &self.inner.config.address,
            &self.inner.config.private_key,
            self.inner.config.listen_port,
        )?;

        let engine = self.clone();
        state.tasks.push(tokio::spawn(async move {
            let handler = Arc::new(engine.clone()) as Arc<dyn SignalHandler>;
            if let Err(e) = engine.inner.signal.run_receiver(handler).await {
                warn!("signal receiver ended: {}", e);
            }
        }));

        let engine = self.clone();
        state.tasks.push(tokio::spawn(async move {
            let handler = Arc::new(engine.clone()) as Arc<dyn SyncHandler>;
            if let Err(e) = engine.inner.management.run_sync(handler).await {
                warn!("management sync ended: {}", e);
            }
        }));

        state.started = true;
        info!(
            "engine started as {} on {}",
            self.inner.local_key.short(),
            self.inner.config.iface_name
        );
        Ok(())
    }

    /// Apply one snapshot. Serials at or below the current one are
    /// discarded, which makes application idempotent and order-insensitive.
    pub async fn update_network_map(&self, network_map: NetworkMap) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;

        if network_map.serial <= state.network_serial {
            debug!(
                "discarding snapshot with serial {} (current {})",
                network_map.serial, state.network_serial
            );
            return Ok(());
        }

        if let Some(peer_config) = &network_map.peer_config {
            if state.peer_config.as_ref() != Some(peer_config) {
                self.apply_peer_config(peer_config)?;
                state.peer_config = Some(peer_config.clone());
            }
        }

        // An empty list without the explicit flag means no membership
        // change was intended; the serial still advances.
        let apply_membership =
            network_map.remote_peers_is_empty || !network_map.remote_peers.is_empty();
        if apply_membership {
            let mut desired: HashMap<PublicKey, Vec<String>> = HashMap::new();
            for remote in &network_map.remote_peers {
                match remote.wg_pub_key.parse::<PublicKey>() {
                    Ok(key) => {
                        desired.insert(key, remote.allowed_ips.clone());
                    }
                    Err(e) => warn!(
                        "snapshot {} names unparseable key {}: {}",
                        network_map.serial, remote.wg_pub_key, e
                    ),
                }
            }

            let to_remove: Vec<PublicKey> = state
                .peer_conns
                .keys()
                .filter(|key| !desired.contains_key(key))
                .copied()
                .collect();
            let removed: Vec<PeerConnection> = to_remove
                .iter()
                .filter_map(|key| state.peer_conns.remove(key))
                .collect();
            join_all(removed.iter().map(|conn| conn.stop())).await;
            for key in &to_remove {
                info!("peer {} removed from network map", key.short());
            }

            for (key, allowed_ips) in desired {
                match state.peer_conns.get(&key) {
                    Some(existing) => {
                        if existing.allowed_ips() != allowed_ips {
                            existing.on_config_change(allowed_ips);
                        } else if existing.state() == PeerState::Failed {
                            // any snapshot naming a failed peer retries it,
                            // whether or not its configuration changed
                            info!("peer {} failed earlier, retrying", key.short());
                            existing.on_config_change(allowed_ips);
                        }
                    }
                    None => {
                        info!("peer {} added by network map", key.short());
                        let conn = PeerConnection::spawn(
                            self.inner.local_key,
                            key,
                            allowed_ips,
                            state.ice_servers.clone(),
                            Arc::clone(&self.inner.device),
                            Arc::clone(&self.inner.signal),
                            &self.inner.cancel,
                        );
                        conn.start();
                        state.peer_conns.insert(key, conn);
                    }
                }
            }
        }

        state.network_serial = network_map.serial;
        Ok(())
    }

    fn apply_peer_config(&self, peer_config: &PeerConfig) -> Result<(), EngineError> {
        let address = peer_config.address.parse().map_err(|_| {
            EngineError::Config(format!("bad overlay address {}", peer_config.address))
        })?;
        if address == self.inner.config.address {
            return Ok(());
        }
        info!("overlay address changed to {}", address);
        self.inner.device.create(
            &address,
            &self.inner.config.private_key,
            self.inner.config.listen_port,
        )?;
        Ok(())
    }

    /// Route one inbound signal message. Messages from peers the network
    /// map does not name are dropped; membership comes from management
    /// alone.
    pub async fn on_signal_message(&self, from: PublicKey, message: SignalMessage) {
        let state = self.inner.state.lock().await;
        match state.peer_conns.get(&from) {
            Some(conn) => conn.on_signal(message),
            None => debug!("dropping signal from unknown peer {}", from.short()),
        }
    }

    /// Current set of remote peers.
    pub async fn get_peers(&self) -> Vec<PublicKey> {
        let state = self.inner.state.lock().await;
        state.peer_conns.keys().copied().collect()
    }

    /// Remote peers whose connection is currently established.
    pub async fn get_connected_peers(&self) -> Vec<PublicKey> {
        let state = self.inner.state.lock().await;
        state
            .peer_conns
            .values()
            .filter(|conn| conn.is_connected())
            .map(|conn| *conn.remote_key())
            .collect()
    }

    /// Stop every peer connection, close both streams, and destroy the
    /// device. Returns only once every owned resource is released.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.inner.cancel.cancel();

        let (conns, tasks) = {
            let mut state = self.inner.state.lock().await;
            state.started = false;
            let conns: Vec<PeerConnection> = state.peer_conns.drain().map(|(_, c)| c).collect();
            let tasks: Vec<JoinHandle<()>> = state.tasks.drain(..).collect();
            (conns, tasks)
        };

        join_all(conns.iter().map(|conn| conn.stop())).await;

        self.inner.signal.close().await;
        self.inner.management.close().await;
        for task in tasks {
            let _ = task.await;
        }

        self.inner.device.close()?;
        info!("engine stopped");
        Ok(())
    }
}

#[async_trait]
impl SyncHandler for Engine {
    async fn current_serial(&self) -> u64 {
        self.inner.state.lock().await.network_serial
    }

    async fn handle_update(&self, update: SyncResponse) -> Result<(), EngineError> {
        if let Some(servers) = update.ice_servers {
            let mut state = self.inner.state.lock().await;
            if state.ice_servers != servers {
                info!("ICE servers rotated by management");
                state.ice_servers = servers.clone();
                for conn in state.peer_conns.values() {
                    conn.update_ice_servers(servers.clone());
                }
            }
        }

        if let Some(network_map) = update.network_map {
            self.update_network_map(network_map).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SignalHandler for Engine {
    async fn on_signal(&self, from: PublicKey, message: SignalMessage) {
        self.on_signal_message(from, message).await;
    }
}
