//! Tunnel device adapter. Wraps the platform WireGuard device behind a
//! narrow interface: create, peer upserts/removals, teardown. No policy
//! lives here; the engine and the peer connections decide what to install.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ipnet::IpNet;
use log::{debug, info};

use crate::error::DeviceError;
use crate::identity::{PrivateKey, PublicKey};

/// A peer row as installed in the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPeer {
    pub allowed_ips: Vec<String>,
    pub endpoint: Option<SocketAddr>,
    pub preshared_key: Option<[u8; 32]>,
}

/// Device-configuration interface shared by all peer connections. The
/// implementation serializes conflicting operations internally; all calls
/// are synchronous from the caller's view.
pub trait TunnelDevice: Send + Sync {
    /// Create or re-open the device. Idempotent when called again with
    /// identical parameters; `DeviceError::Busy` when another owner holds
    /// the name with different parameters.
    fn create(
        &self,
        address: &IpNet,
        private_key: &PrivateKey,
        listen_port: u16,
    ) -> Result<(), DeviceError>;

    /// Install or replace the peer row. Replacement is keyed by public
    /// key; allowed-IPs are set exactly, not merged.
    fn upsert_peer(
        &self,
        pub_key: &PublicKey,
        allowed_ips: &[String],
        endpoint: Option<SocketAddr>,
        preshared_key: Option<[u8; 32]>,
    ) -> Result<(), DeviceError>;

    /// Remove the peer row. Removing an absent peer is not an error.
    fn remove_peer(&self, pub_key: &PublicKey) -> Result<(), DeviceError>;

    /// Remove all peers, then destroy the device.
    fn close(&self) -> Result<(), DeviceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CreateParams {
    address: IpNet,
    listen_port: u16,
    public_key: PublicKey,
}

/// Kernel WireGuard driven through the `ip` and `wg` tools.
pub struct WgCommandDevice {
    name: String,
    state: Mutex<Option<CreateParams>>,
}

impl WgCommandDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn run(program: &str, args: &[&str], stdin: Option<&str>) -> Result<String, DeviceError> {
        debug!("running {} {}", program, args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = if let Some(input) = stdin {
            use std::io::Write;
            cmd.stdin(Stdio::piped());
            let mut child = cmd.spawn()?;
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())?;
            }
            child.wait_with_output()?
        } else {
            cmd.output()?
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(DeviceError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// Listen port of an existing interface, used to decide whether a
    /// pre-existing device is ours to adopt.
    fn current_listen_port(&self) -> Result<u16, DeviceError> {
        let out = Self::run("wg", &["show", &self.name, "listen-port"], None)?;
        out.trim()
            .parse()
            .map_err(|_| DeviceError::Command(format!("unparseable listen port: {}", out.trim())))
    }
}

impl TunnelDevice for WgCommandDevice {
    fn create(
        &self,
        address: &IpNet,
        private_key: &PrivateKey,
        listen_port: u16,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();

        let params = CreateParams {
            address: *address,
            listen_port,
            public_key: private_key.public_key(),
        };
        if state.as_ref() == Some(&params) {
            return Ok(());
        }

        if state.is_none() {
            match Self::run(
                "ip",
                &["link", "add", "dev", &self.name, "type", "wireguard"],
                None,
            ) {
                Ok(_) => {}
                Err(DeviceError::Command(stderr)) if stderr.contains("File exists") => {
                    // The name is taken. Adopt it only if it already runs
                    // with our parameters, otherwise someone else owns it.
                    match self.current_listen_port() {
                        Ok(port) if port == listen_port || port == 0 => {
                            info!("adopting existing interface {}", self.name);
                        }
                        _ => return Err(DeviceError::Busy(self.name.clone())),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Self::run(
            "wg",
            &[
                "set",
                &self.name,
                "listen-port",
                &listen_port.to_string(),
                "private-key",
                "/dev/stdin",
            ],
            Some(&private_key.to_base64()),
        )?;

        match Self::run(
            "ip",
            &["address", "add", &address.to_string(), "dev", &self.name],
            None,
        ) {
            Ok(_) => {}
            Err(DeviceError::Command(stderr)) if stderr.contains("File exists") => {}
            Err(e) => return Err(e),
        }

        Self::run("ip", &["link", "set", &self.name, "up"], None)?;

        info!(
            "interface {} up with {} on port {}",
            self.name, address, listen_port
        );
        *state = Some(params);
        Ok(())
    }

    fn upsert_peer(
        &self,
        pub_key: &PublicKey,
        allowed_ips: &[String],
        endpoint: Option<SocketAddr>,
        preshared_key: Option<[u8; 32]>,
    ) -> Result<(), DeviceError> {
        let _state = self.state.lock().unwrap();

        let key = pub_key.to_base64();
        let ips = allowed_ips.join(",");
        let mut args: Vec<&str> = vec!["set", &self.name, "peer", &key, "allowed-ips", &ips];

        let endpoint_str;
        if let Some(ep) = endpoint {
            endpoint_str = ep.to_string();
            args.push("endpoint");
            args.push(&endpoint_str);
        }

        let psk_b64;
        let mut stdin = None;
        if let Some(psk) = preshared_key {
            psk_b64 = BASE64.encode(psk);
            args.push("preshared-key");
            args.push("/dev/stdin");
            stdin = Some(psk_b64.as_str());
        }

        Self::run("wg", &args, stdin)?;
        debug!("installed peer {} endpoint {:?}", pub_key.short(), endpoint);
        Ok(())
    }

    fn remove_peer(&self, pub_key: &PublicKey) -> Result<(), DeviceError> {
        let _state = self.state.lock().unwrap();

        let key = pub_key.to_base64();
        match Self::run("wg", &["set", &self.name, "peer", &key, "remove"], None) {
            Ok(_) => Ok(()),
            // removing an unknown peer is a no-op
            Err(DeviceError::Command(stderr)) if stderr.contains("No such") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn close(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.take().is_none() {
            return Ok(());
        }

        match Self::run("ip", &["link", "del", "dev", &self.name], None) {
            Ok(_) => Ok(()),
            Err(DeviceError::Command(stderr)) if stderr.contains("Cannot find device") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    created: Option<(IpNet, u16)>,
    peers: HashMap<PublicKey, InstalledPeer>,
}

/// In-memory device used when no kernel interface is available
/// (signaling-only mode) and by the test suites.
#[derive(Debug, Default)]
pub struct MemoryDevice {
    inner: Mutex<MemoryState>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_created(&self) -> bool {
        self.inner.lock().unwrap().created.is_some()
    }

    pub fn peer(&self, pub_key: &PublicKey) -> Option<InstalledPeer> {
        self.inner.lock().unwrap().peers.get(pub_key).cloned()
    }

    pub fn peers(&self) -> HashMap<PublicKey, InstalledPeer> {
        self.inner.lock().unwrap().peers.clone()
    }
}

impl TunnelDevice for MemoryDevice {
    fn create(
        &self,
        address: &IpNet,
        _private_key: &PrivateKey,
        listen_port: u16,
    ) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.created = Some((*address, listen_port));
        Ok(())
    }

    fn upsert_peer(
        &self,
        pub_key: &PublicKey,
        allowed_ips: &[String],
        endpoint: Option<SocketAddr>,
        preshared_key: Option<[u8; 32]>,
    ) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.peers.insert(
            *pub_key,
            InstalledPeer {
                allowed_ips: allowed_ips.to_vec(),
                endpoint,
                preshared_key,
            },
        );
        Ok(())
    }

    fn remove_peer(&self, pub_key: &PublicKey) -> Result<(), DeviceError> {
        self.inner.lock().unwrap().peers.remove(pub_key);
        Ok(())
    }

    fn close(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.peers.clear();
        inner.created = None;
        Ok(())
    }
}
