pub mod config;
pub mod crypto;
pub mod device;
pub mod engine;
pub mod error;
pub mod ice;
pub mod identity;
pub mod management;
pub mod peer;
pub mod signaling;
pub mod stun;
pub mod wire;

// Re-export key types for easier access by consumers
pub use config::{Config, EngineConfig};
pub use device::{MemoryDevice, TunnelDevice, WgCommandDevice};
pub use engine::Engine;
pub use error::{DeviceError, EngineError, TransportError};
pub use ice::{IceServers, TurnServer};
pub use identity::{Identity, PrivateKey, PublicKey};
pub use management::{
    ManagementClient, NetworkMap, PeerConfig, RemotePeerConfig, SyncHandler, SyncResponse,
    SystemInfo, TcpManagementClient,
};
pub use peer::{PeerConnection, PeerState};
pub use signaling::{SignalClient, SignalHandler, SignalKind, SignalMessage, TcpSignalClient};
