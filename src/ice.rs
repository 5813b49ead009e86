//! ICE agent session. Wraps str0m's sans-I/O `IceAgent` behind a task that
//! owns one UDP socket: gathering runs up front (host plus server-reflexive
//! via STUN), then the task shuttles packets, timers, and commands until the
//! session is cancelled.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use str0m::ice::{IceAgent, IceAgentEvent, IceCreds, StunMessage, StunPacket};
use str0m::net::Protocol;
use str0m::{Candidate, IceConnectionState};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::stun;

const GATHER_TIMEOUT: Duration = Duration::from_secs(5);

/// A TURN server with long-term credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    pub uri: String,
    pub username: String,
    pub password: String,
}

/// Candidate discovery servers handed to each session. May be refreshed at
/// runtime by management updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServers {
    pub stuns: Vec<String>,
    pub turns: Vec<TurnServer>,
}

/// Events a session reports to its peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceEvent {
    /// A usable pair was nominated; `selected` is the remote address.
    Connected { selected: SocketAddr },
    /// Liveness was lost after being connected.
    Disconnected,
}

enum IceCommand {
    RemoteCredentials { ufrag: String, pass: String },
    RemoteCandidate(String),
}

/// One negotiation attempt: an agent, a socket, and the task driving them.
pub struct IceSession {
    ufrag: String,
    pass: String,
    local_candidates: Vec<String>,
    cmd_tx: mpsc::UnboundedSender<IceCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl IceSession {
    /// Bind a socket, gather local candidates, and start the drive task.
    /// The controlling side is chosen by the caller (the offerer controls).
    pub async fn start(
        controlling: bool,
        servers: &IceServers,
        parent: &CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<IceEvent>), EngineError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| EngineError::Negotiation(format!("binding ICE socket: {}", e)))?;
        let local_port = socket
            .local_addr()
            .map_err(|e| EngineError::Negotiation(e.to_string()))?
            .port();

        let mut agent = IceAgent::new();
        agent.set_controlling(controlling);

        let mut local_candidates = Vec::new();

        let host_ip = default_route_ip().await.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let host_addr = SocketAddr::new(host_ip, local_port);
        match Candidate::host(host_addr, Protocol::Udp) {
            Ok(candidate) => {
                if let Some(line) = encode_candidate(&candidate) {
                    local_candidates.push(line);
                }
                agent.add_local_candidate(candidate);
            }
            Err(e) => debug!("host candidate for {}: {}", host_addr, e),
        }

        for server in &servers.stuns {
            match stun::query(&socket, server, GATHER_TIMEOUT).await {
                Ok(mapped) => {
                    if mapped != host_addr {
                        match Candidate::server_reflexive(mapped, host_addr, Protocol::Udp) {
                            Ok(candidate) => {
                                if let Some(line) = encode_candidate(&candidate) {
                                    local_candidates.push(line);
                                }
                                agent.add_local_candidate(candidate);
                            }
                            Err(e) => debug!("reflexive candidate for {}: {}", mapped, e),
                        }
                    }
                    break;
                }
                Err(e) => debug!("STUN query to {} failed: {}", server, e),
            }
        }

        if local_candidates.is_empty() {
            return Err(EngineError::Negotiation(
                "no local candidates could be gathered".to_string(),
            ));
        }

        // TODO: allocate a relayed candidate when servers.turns is non-empty
        // (RFC 5766 Allocate with long-term credentials).
        if !servers.turns.is_empty() {
            debug!("{} TURN servers configured, relay candidates skipped", servers.turns.len());
        }

        let creds = agent.local_credentials().clone();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = parent.child_token();

        let task = tokio::spawn(drive(agent, socket, cmd_rx, event_tx, cancel.clone()));

        Ok((
            Self {
                ufrag: creds.ufrag,
                pass: creds.pass,
                local_candidates,
                cmd_tx,
                cancel,
                task,
            },
            event_rx,
        ))
    }

    pub fn ufrag(&self) -> &str {
        &self.ufrag
    }

    pub fn pass(&self) -> &str {
        &self.pass
    }

    /// Candidate lines gathered at session start, ready to signal.
    pub fn local_candidates(&self) -> &[String] {
        &self.local_candidates
    }

    pub fn set_remote_credentials(&self, ufrag: &str, pass: &str) {
        let _ = self.cmd_tx.send(IceCommand::RemoteCredentials {
            ufrag: ufrag.to_string(),
            pass: pass.to_string(),
        });
    }

    pub fn add_remote_candidate(&self, line: &str) {
        let _ = self.cmd_tx.send(IceCommand::RemoteCandidate(line.to_string()));
    }

    /// Stop the drive task and release the socket.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Serialize a candidate for the signal channel.
pub fn encode_candidate(candidate: &Candidate) -> Option<String> {
    serde_json::to_string(candidate).ok()
}

/// Parse a candidate line received over the signal channel.
pub fn decode_candidate(line: &str) -> Option<Candidate> {
    serde_json::from_str(line).ok()
}

/// Local IP the default route would use. Falls back to loopback when the
/// host has no route out, which still allows same-host meshes.
async fn default_route_ip() -> Option<IpAddr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    probe.connect("8.8.8.8:80").await.ok()?;
    probe.local_addr().ok().map(|addr| addr.ip())
}

async fn drive(
    mut agent: IceAgent,
    socket: UdpSocket,
    mut cmd_rx: mpsc::UnboundedReceiver<IceCommand>,
    event_tx: mpsc::UnboundedSender<IceEvent>,
    cancel: CancellationToken,
) {
    let local_addr = socket.local_addr().ok();
    let mut buf = vec![0u8; 2048];
    let mut connected = false;

    agent.handle_timeout(Instant::now());

    loop {
        while let Some(transmit) = agent.poll_transmit() {
            let payload = Vec::from(transmit.contents);
            if let Err(e) = socket.send_to(&payload, transmit.destination).await {
                debug!("ICE send to {} failed: {}", transmit.destination, e);
            }
        }

        while let Some(event) = agent.poll_event() {
            match event {
                IceAgentEvent::NominatedSend { destination, .. } => {
                    connected = true;
                    let _ = event_tx.send(IceEvent::Connected {
                        selected: destination,
                    });
                }
                IceAgentEvent::IceConnectionStateChange(IceConnectionState::Disconnected) => {
                    if connected {
                        connected = false;
                        let _ = event_tx.send(IceEvent::Disconnected);
                    }
                }
                _ => {}
            }
        }

        let deadline = agent
            .poll_timeout()
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = cmd_rx.recv() => match cmd {
                None => break,
                Some(IceCommand::RemoteCredentials { ufrag, pass }) => {
                    agent.set_remote_credentials(IceCreds { ufrag, pass });
                }
                Some(IceCommand::RemoteCandidate(line)) => match decode_candidate(&line) {
                    Some(candidate) => agent.add_remote_candidate(candidate),
                    None => warn!("discarding unparseable remote candidate"),
                },
            },
            result = socket.recv_from(&mut buf) => match result {
                Ok((n, from)) => {
                    if let Ok(message) = StunMessage::parse(&buf[..n]) {
                        if agent.accepts_message(&message) {
                            agent.handle_packet(
                                Instant::now(),
                                StunPacket {
                                    proto: Protocol::Udp,
                                    source: from,
                                    destination: local_addr.unwrap_or(from),
                                    message,
                                },
                            );
                        }
                    }
                }
                Err(e) => debug!("ICE socket error: {}", e),
            },
            _ = tokio::time::sleep_until(deadline) => {
                agent.handle_timeout(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_line_roundtrip() {
        let addr: SocketAddr = "192.0.2.10:51820".parse().unwrap();
        let candidate = Candidate::host(addr, Protocol::Udp).unwrap();

        let line = encode_candidate(&candidate).unwrap();
        let parsed = decode_candidate(&line).unwrap();
        assert_eq!(parsed.addr(), addr);
    }

    #[test]
    fn rejects_garbage_candidate_lines() {
        assert!(decode_candidate("not a candidate").is_none());
    }

    #[tokio::test]
    async fn gathers_at_least_a_host_candidate() {
        let cancel = CancellationToken::new();
        let (session, _events) = IceSession::start(true, &IceServers::default(), &cancel)
            .await
            .unwrap();

        assert!(!session.ufrag().is_empty());
        assert!(!session.local_candidates().is_empty());

        session.close().await;
    }
}
