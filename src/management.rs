//! Management client: delivers versioned network-map snapshots and the
//! local peer's configuration. The service is the source of truth; this
//! side only consumes the message shapes below.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::crypto::{self, SealedEnvelope};
use crate::error::{EngineError, TransportError};
use crate::ice::IceServers;
use crate::identity::{PrivateKey, PublicKey};
use crate::wire;

const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(10);

/// The local peer's configuration as assigned by management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Overlay address with prefix length, e.g. 100.64.0.7/24.
    pub address: String,
}

/// One remote peer as named by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeerConfig {
    pub wg_pub_key: String,
    pub allowed_ips: Vec<String>,
}

/// A versioned snapshot of mesh membership.
///
/// `remote_peers_is_empty` disambiguates an intentional empty set from an
/// omitted list: an empty `remote_peers` with the flag unset means "no
/// membership change intended" while the serial still advances. This
/// mirrors the behavior of the protocol this engine talks to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMap {
    pub serial: u64,
    pub peer_config: Option<PeerConfig>,
    #[serde(default)]
    pub remote_peers: Vec<RemotePeerConfig>,
    #[serde(default)]
    pub remote_peers_is_empty: bool,
}

/// One message on the sync stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    pub network_map: Option<NetworkMap>,
    /// Refreshed STUN/TURN servers, when management rotates them.
    pub ice_servers: Option<IceServers>,
}

/// Host facts sent along with registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
}

impl SystemInfo {
    pub fn collect() -> Self {
        let hostname = std::process::Command::new("hostname")
            .output()
            .ok()
            .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let kernel = std::process::Command::new("uname")
            .arg("-r")
            .output()
            .ok()
            .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
            .unwrap_or_default();

        Self {
            hostname,
            os: std::env::consts::OS.to_string(),
            kernel,
        }
    }
}

/// Plaintext of the sealed registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub setup_key: String,
    pub pub_key: PublicKey,
    pub system_info: SystemInfo,
}

/// Frames sent to the management service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MgmtRequest {
    ServerKey,
    Register { envelope: SealedEnvelope },
    Sync { pub_key: PublicKey, since_serial: u64 },
}

/// Frames received from the management service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MgmtResponse {
    ServerKey { key: PublicKey },
    Registered { peer_config: PeerConfig },
    Update(SyncResponse),
    Error { message: String },
}

/// Consumer of the sync stream. `current_serial` lets the client
/// re-subscribe from the last accepted snapshot after a reconnect.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn current_serial(&self) -> u64;
    async fn handle_update(&self, update: SyncResponse) -> Result<(), EngineError>;
}

/// Client interface to the management service.
#[async_trait]
pub trait ManagementClient: Send + Sync {
    async fn get_server_public_key(&self) -> Result<PublicKey, TransportError>;

    /// Register this host, returning its assigned configuration. The
    /// payload is sealed to `server_key`.
    async fn register(
        &self,
        server_key: &PublicKey,
        setup_key: &str,
        system_info: &SystemInfo,
    ) -> Result<PeerConfig, TransportError>;

    /// Run the update stream, invoking `handler` per snapshot until the
    /// client is closed. Handler errors are logged, never fatal to the
    /// stream.
    async fn run_sync(&self, handler: Arc<dyn SyncHandler>) -> Result<(), TransportError>;

    async fn close(&self);
}

/// TCP implementation: one-shot request/response connections for
/// registration, a long-lived reconnecting stream for sync.
pub struct TcpManagementClient {
    addr: String,
    private_key: PrivateKey,
    closed: CancellationToken,
}

impl TcpManagementClient {
    pub fn new(addr: &str, private_key: PrivateKey) -> Self {
        Self {
            addr: addr.to_string(),
            private_key,
            closed: CancellationToken::new(),
        }
    }

    async fn request(&self, request: &MgmtRequest) -> Result<MgmtResponse, TransportError> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        wire::write_message(&mut stream, request).await?;
        let response: MgmtResponse = wire::read_message(&mut stream).await?;
        match response {
            MgmtResponse::Error { message } => Err(TransportError::Rejected(message)),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl ManagementClient for TcpManagementClient {
    async fn get_server_public_key(&self) -> Result<PublicKey, TransportError> {
        match self.request(&MgmtRequest::ServerKey).await? {
            MgmtResponse::ServerKey { key } => Ok(key),
            _ => Err(TransportError::Closed),
        }
    }

    async fn register(
        &self,
        server_key: &PublicKey,
        setup_key: &str,
        system_info: &SystemInfo,
    ) -> Result<PeerConfig, TransportError> {
        let payload = RegisterPayload {
            setup_key: setup_key.to_string(),
            pub_key: self.private_key.public_key(),
            system_info: system_info.clone(),
        };
        let plaintext = wire::encode(&payload)?;
        let envelope = crypto::seal(&plaintext, server_key, &self.private_key)?;

        match self.request(&MgmtRequest::Register { envelope }).await? {
            MgmtResponse::Registered { peer_config } => Ok(peer_config),
            _ => Err(TransportError::Closed),
        }
    }

    async fn run_sync(&self, handler: Arc<dyn SyncHandler>) -> Result<(), TransportError> {
        let mut backoff = RECONNECT_INITIAL;

        loop {
            if self.closed.is_cancelled() {
                return Ok(());
            }

            let since_serial = handler.current_serial().await;
            match TcpStream::connect(&self.addr).await {
                Ok(mut stream) => {
                    let subscribe = MgmtRequest::Sync {
                        pub_key: self.private_key.public_key(),
                        since_serial,
                    };
                    match wire::write_message(&mut stream, &subscribe).await {
                        Ok(()) => {
                            backoff = RECONNECT_INITIAL;
                            debug!(
                                "management sync stream open from serial {}",
                                since_serial
                            );

                            loop {
                                tokio::select! {
                                    _ = self.closed.cancelled() => return Ok(()),
                                    frame = wire::read_message::<_, MgmtResponse>(&mut stream) => match frame {
                                        Ok(MgmtResponse::Update(update)) => {
                                            if let Err(e) = handler.handle_update(update).await {
                                                warn!("sync update handler: {}", e);
                                            }
                                        }
                                        Ok(MgmtResponse::Error { message }) => {
                                            warn!("management stream error: {}", message);
                                        }
                                        Ok(_) => debug!("unexpected frame on sync stream"),
                                        Err(e) => {
                                            warn!("management stream broken: {}", e);
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                        Err(e) => warn!("management subscribe failed: {}", e),
                    }
                }
                Err(e) => warn!("management connect to {} failed: {}", self.addr, e),
            }

            tokio::select! {
                _ = self.closed.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    #[test]
    fn network_map_defaults() {
        let map = NetworkMap::default();
        assert_eq!(map.serial, 0);
        assert!(map.remote_peers.is_empty());
        assert!(!map.remote_peers_is_empty);
    }

    #[test]
    fn snapshot_frame_roundtrip() {
        let map = NetworkMap {
            serial: 9,
            peer_config: Some(PeerConfig {
                address: "100.64.0.1/24".to_string(),
            }),
            remote_peers: vec![RemotePeerConfig {
                wg_pub_key: "RRHf3Ma6z6mdLbriAJbqhX7+nM/B71lgw2+91q3LfhU=".to_string(),
                allowed_ips: vec!["100.64.0.10/32".to_string()],
            }],
            remote_peers_is_empty: false,
        };
        let frame = MgmtResponse::Update(SyncResponse {
            network_map: Some(map.clone()),
            ice_servers: None,
        });

        let bytes = wire::encode(&frame).unwrap();
        match wire::decode::<MgmtResponse>(&bytes).unwrap() {
            MgmtResponse::Update(update) => assert_eq!(update.network_map, Some(map)),
            _ => panic!("wrong frame"),
        }
    }

    struct RecordingHandler {
        serial: StdMutex<u64>,
        seen: StdMutex<Vec<u64>>,
    }

    #[async_trait]
    impl SyncHandler for RecordingHandler {
        async fn current_serial(&self) -> u64 {
            *self.serial.lock().unwrap()
        }

        async fn handle_update(&self, update: SyncResponse) -> Result<(), EngineError> {
            if let Some(map) = update.network_map {
                *self.serial.lock().unwrap() = map.serial;
                self.seen.lock().unwrap().push(map.serial);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn sync_resubscribes_from_last_accepted_serial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // first connection delivers serial 5 then drops; the second must
        // subscribe with since_serial == 5
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let first: MgmtRequest = wire::read_message(&mut stream).await.unwrap();
            let MgmtRequest::Sync { since_serial, .. } = first else {
                panic!("expected sync request");
            };
            assert_eq!(since_serial, 0);

            let update = MgmtResponse::Update(SyncResponse {
                network_map: Some(NetworkMap {
                    serial: 5,
                    ..Default::default()
                }),
                ice_servers: None,
            });
            wire::write_message(&mut stream, &update).await.unwrap();
            drop(stream);

            let (mut stream, _) = listener.accept().await.unwrap();
            let second: MgmtRequest = wire::read_message(&mut stream).await.unwrap();
            let MgmtRequest::Sync { since_serial, .. } = second else {
                panic!("expected sync request");
            };
            since_serial
        });

        let client = Arc::new(TcpManagementClient::new(
            &addr.to_string(),
            PrivateKey::generate(),
        ));
        let handler = Arc::new(RecordingHandler {
            serial: StdMutex::new(0),
            seen: StdMutex::new(Vec::new()),
        });

        let sync_client = Arc::clone(&client);
        let sync_handler = handler.clone() as Arc<dyn SyncHandler>;
        let sync = tokio::spawn(async move { sync_client.run_sync(sync_handler).await });

        let resubscribed_from = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resubscribed_from, 5);
        assert_eq!(*handler.seen.lock().unwrap(), vec![5]);

        client.close().await;
        let _ = sync.await;
    }

    #[tokio::test]
    async fn registration_payload_is_sealed() {
        let server_key = PrivateKey::generate();
        let client_key = PrivateKey::generate();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_private = server_key.clone();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request: MgmtRequest = wire::read_message(&mut stream).await.unwrap();
            let MgmtRequest::Register { envelope } = request else {
                panic!("expected register");
            };

            let plaintext = crypto::open(&envelope, &server_private).unwrap();
            let payload: RegisterPayload = wire::decode(&plaintext).unwrap();
            assert_eq!(payload.setup_key, "A2C8E62B-38F5-4553-B31E-DD66C696CEBB");

            let response = MgmtResponse::Registered {
                peer_config: PeerConfig {
                    address: "100.64.0.7/24".to_string(),
                },
            };
            wire::write_message(&mut stream, &response).await.unwrap();
        });

        let client = TcpManagementClient::new(&addr.to_string(), client_key);
        let peer_config = client
            .register(
                &server_key.public_key(),
                "A2C8E62B-38F5-4553-B31E-DD66C696CEBB",
                &SystemInfo::collect(),
            )
            .await
            .unwrap();

        assert_eq!(peer_config.address, "100.64.0.7/24");
        server.await.unwrap();
    }
}
