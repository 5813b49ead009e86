//! Per-peer connection state machine. One instance per remote peer, owned
//! by the engine, running as its own task: drives ICE negotiation through
//! the signal channel and installs the outcome in the tunnel device.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::crypto;
use crate::device::TunnelDevice;
use crate::error::DeviceError;
use crate::ice::{IceEvent, IceServers, IceSession};
use crate::identity::PublicKey;
use crate::signaling::{parse_credentials, SignalClient, SignalKind, SignalMessage};

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(30);
const MAX_BUFFERED_CANDIDATES: usize = 32;

/// Connection lifecycle. `Failed` is reserved for unrecoverable errors;
/// everything transient cycles back through `Gathering`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Gathering,
    Negotiating,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// The offerer is the side whose public key sorts lower. Both sides apply
/// this to the same two keys, so the roles never need coordination.
pub fn is_offerer(local: &PublicKey, remote: &PublicKey) -> bool {
    local < remote
}

enum PeerInput {
    Start,
    Signal(SignalMessage),
    ConfigChange(Vec<String>),
    IceServers(IceServers),
}

enum SessionEnd {
    Stopped,
    Lost,
}

enum PeerError {
    /// Unrecoverable; park in `Failed` until the engine touches this peer.
    Fatal(DeviceError),
    /// Transient; retry with backoff.
    Retry(String),
}

/// Handle held by the engine. Dropping it does not stop the worker; the
/// engine calls `stop()` to drive the connection back to `Idle`.
pub struct PeerConnection {
    remote_key: PublicKey,
    allowed_ips: StdMutex<Vec<String>>,
    input_tx: mpsc::UnboundedSender<PeerInput>,
    state_rx: watch::Receiver<PeerState>,
    cancel: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl PeerConnection {
    pub fn spawn(
        local_key: PublicKey,
        remote_key: PublicKey,
        allowed_ips: Vec<String>,
        ice_servers: IceServers,
        device: Arc<dyn TunnelDevice>,
        signal: Arc<dyn SignalClient>,
        parent: &CancellationToken,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PeerState::Idle);
        let cancel = parent.child_token();

        let worker = PeerWorker {
            local_key,
            remote_key,
            allowed_ips: allowed_ips.clone(),
            ice_servers,
            device,
            signal,
            input_rx,
            state_tx,
            cancel: cancel.clone(),
            pending: VecDeque::new(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            remote_key,
            allowed_ips: StdMutex::new(allowed_ips),
            input_tx,
            state_rx,
            cancel,
            task: StdMutex::new(Some(task)),
        }
    }

    pub fn remote_key(&self) -> &PublicKey {
        &self.remote_key
    }

    pub fn state(&self) -> PeerState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    pub fn allowed_ips(&self) -> Vec<String> {
        self.allowed_ips.lock().unwrap().clone()
    }

    /// Begin negotiating. No-op in any state but `Idle`.
    pub fn start(&self) {
        let _ = self.input_tx.send(PeerInput::Start);
    }

    /// A signal message addressed to this peer arrived.
    pub fn on_signal(&self, message: SignalMessage) {
        let _ = self.input_tx.send(PeerInput::Signal(message));
    }

    /// The network map changed this peer's allowed-IPs.
    pub fn on_config_change(&self, allowed_ips: Vec<String>) {
        *self.allowed_ips.lock().unwrap() = allowed_ips.clone();
        let _ = self.input_tx.send(PeerInput::ConfigChange(allowed_ips));
    }

    /// Management rotated the STUN/TURN servers.
    pub fn update_ice_servers(&self, servers: IceServers) {
        let _ = self.input_tx.send(PeerInput::IceServers(servers));
    }

    /// Drive to `Idle`: cancel the worker, wait for it to quiesce, after
    /// which the tunnel holds no row for this peer.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct PeerWorker {
    local_key: PublicKey,
    remote_key: PublicKey,
    allowed_ips: Vec<String>,
    ice_servers: IceServers,
    device: Arc<dyn TunnelDevice>,
    signal: Arc<dyn SignalClient>,
    input_rx: mpsc::UnboundedReceiver<PeerInput>,
    state_tx: watch::Sender<PeerState>,
    cancel: CancellationToken,
    /// Signal messages received outside an active negotiation, replayed
    /// into the next one.
    pending: VecDeque<SignalMessage>,
}

impl PeerWorker {
    fn set_state(&self, state: PeerState) {
        let previous = *self.state_tx.borrow();
        if previous != state {
            debug!(
                "peer {} state {:?} -> {:?}",
                self.remote_key.short(),
                previous,
                state
            );
            let _ = self.state_tx.send(state);
        }
    }

    fn buffer_signal(&mut self, message: SignalMessage) {
        match message.kind {
            // only the latest credentials matter
            SignalKind::Offer | SignalKind::Answer => {
                self.pending.retain(|m| m.kind == SignalKind::Candidate);
                self.pending.push_front(message);
            }
            SignalKind::Candidate => {
                if self.pending.len() < MAX_BUFFERED_CANDIDATES {
                    self.pending.push_back(message);
                }
            }
        }
    }

    async fn run(mut self) {
        // Idle until the engine starts us.
        let started = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break false,
                input = self.input_rx.recv() => match input {
                    None => break false,
                    Some(PeerInput::Start) => break true,
                    Some(PeerInput::ConfigChange(ips)) => self.allowed_ips = ips,
                    Some(PeerInput::IceServers(servers)) => self.ice_servers = servers,
                    Some(PeerInput::Signal(_)) => {
                        debug!("peer {} dropping signal while idle", self.remote_key.short());
                    }
                }
            }
        };

        if started {
            let mut backoff = RETRY_BACKOFF_INITIAL;
            loop {
                match self.establish().await {
                    Ok(SessionEnd::Stopped) => break,
                    Ok(SessionEnd::Lost) => {
                        self.set_state(PeerState::Disconnected);
                        // keep the allowed-IPs row, clear the endpoint
                        if let Err(e) =
                            self.device
                                .upsert_peer(&self.remote_key, &self.allowed_ips, None, None)
                        {
                            warn!(
                                "peer {} clearing endpoint: {}",
                                self.remote_key.short(),
                                e
                            );
                        }
                        backoff = RETRY_BACKOFF_INITIAL;
                        if self.wait_before_retry(backoff).await {
                            break;
                        }
                    }
                    Err(PeerError::Fatal(e)) => {
                        error!("peer {} failed: {}", self.remote_key.short(), e);
                        self.set_state(PeerState::Failed);
                        if !self.wait_for_reconfiguration().await {
                            break;
                        }
                        backoff = RETRY_BACKOFF_INITIAL;
                    }
                    Err(PeerError::Retry(reason)) => {
                        debug!(
                            "peer {} negotiation attempt failed: {}",
                            self.remote_key.short(),
                            reason
                        );
                        if self.wait_before_retry(backoff).await {
                            break;
                        }
                        backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                    }
                }
            }
        }

        if let Err(e) = self.device.remove_peer(&self.remote_key) {
            warn!("peer {} removal: {}", self.remote_key.short(), e);
        }
        self.set_state(PeerState::Idle);
    }

    /// Sleep before the next attempt, staying responsive to inputs.
    /// Returns true when the connection should stop.
    async fn wait_before_retry(&mut self, delay: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return true,
                _ = tokio::time::sleep_until(deadline) => return false,
                input = self.input_rx.recv() => match input {
                    None => return true,
                    Some(PeerInput::Signal(message)) => {
                        // the remote is already negotiating; rejoin now
                        let restart = message.kind == SignalKind::Offer;
                        self.buffer_signal(message);
                        if restart {
                            return false;
                        }
                    }
                    Some(PeerInput::ConfigChange(ips)) => self.allowed_ips = ips,
                    Some(PeerInput::IceServers(servers)) => self.ice_servers = servers,
                    Some(PeerInput::Start) => {}
                }
            }
        }
    }

    /// Parked in `Failed`. Only a configuration change (the engine touching
    /// this peer on a later snapshot) restarts negotiation. Returns false
    /// when the connection should stop instead.
    async fn wait_for_reconfiguration(&mut self) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                input = self.input_rx.recv() => match input {
                    None => return false,
                    Some(PeerInput::ConfigChange(ips)) => {
                        self.allowed_ips = ips;
                        return true;
                    }
                    Some(PeerInput::IceServers(servers)) => {
                        self.ice_servers = servers;
                        return true;
                    }
                    Some(PeerInput::Signal(message)) => self.buffer_signal(message),
                    Some(PeerInput::Start) => {}
                }
            }
        }
    }

    async fn establish(&mut self) -> Result<SessionEnd, PeerError> {
        self.set_state(PeerState::Gathering);

        let offerer = is_offerer(&self.local_key, &self.remote_key);
        let (session, mut events) = IceSession::start(offerer, &self.ice_servers, &self.cancel)
            .await
            .map_err(|e| PeerError::Retry(e.to_string()))?;

        let result = self.negotiate(offerer, &session, &mut events).await;
        session.close().await;
        result
    }

    async fn negotiate(
        &mut self,
        offerer: bool,
        session: &IceSession,
        events: &mut mpsc::UnboundedReceiver<IceEvent>,
    ) -> Result<SessionEnd, PeerError> {
        self.set_state(PeerState::Negotiating);

        if offerer {
            self.send_signal(SignalMessage::offer(session.ufrag(), session.pass()))
                .await;
        }

        // Exchange credentials, replaying anything buffered first.
        let mut remote_creds = None;
        let buffered: Vec<_> = self.pending.drain(..).collect();
        for message in buffered {
            self.handle_negotiation_signal(offerer, session, message, &mut remote_creds)
                .await;
        }

        let deadline = tokio::time::Instant::now() + NEGOTIATION_TIMEOUT;
        while remote_creds.is_none() {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(SessionEnd::Stopped),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(PeerError::Retry("negotiation timed out".to_string()));
                }
                input = self.input_rx.recv() => match input {
                    None => return Ok(SessionEnd::Stopped),
                    Some(PeerInput::Signal(message)) => {
                        self.handle_negotiation_signal(offerer, session, message, &mut remote_creds)
                            .await;
                    }
                    Some(PeerInput::ConfigChange(ips)) => self.allowed_ips = ips,
                    Some(PeerInput::IceServers(servers)) => {
                        self.ice_servers = servers;
                        return Err(PeerError::Retry("ICE servers changed".to_string()));
                    }
                    Some(PeerInput::Start) => {}
                }
            }
        }
        let Some((remote_ufrag, remote_pass)) = remote_creds else {
            return Err(PeerError::Retry("credential exchange ended early".to_string()));
        };
        session.set_remote_credentials(&remote_ufrag, &remote_pass);

        self.set_state(PeerState::Connecting);
        for line in session.local_candidates() {
            self.send_signal(SignalMessage::candidate(line)).await;
        }

        let preshared = crypto::preshared_key(
            &self.local_key,
            &self.remote_key,
            session.ufrag(),
            &remote_ufrag,
        );

        let connect_deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        let mut endpoint: Option<SocketAddr> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(SessionEnd::Stopped),
                _ = tokio::time::sleep_until(connect_deadline), if endpoint.is_none() => {
                    return Err(PeerError::Retry("connectivity checks timed out".to_string()));
                }
                event = events.recv() => match event {
                    None => return Err(PeerError::Retry("ICE session ended".to_string())),
                    Some(IceEvent::Connected { selected }) => {
                        // install (or re-install after renomination)
                        self.device
                            .upsert_peer(
                                &self.remote_key,
                                &self.allowed_ips,
                                Some(selected),
                                Some(preshared),
                            )
                            .map_err(PeerError::Fatal)?;
                        endpoint = Some(selected);
                        self.set_state(PeerState::Connected);
                    }
                    Some(IceEvent::Disconnected) => {
                        if endpoint.is_some() {
                            return Ok(SessionEnd::Lost);
                        }
                    }
                },
                input = self.input_rx.recv() => match input {
                    None => return Ok(SessionEnd::Stopped),
                    Some(PeerInput::Signal(message)) => match message.kind {
                        SignalKind::Candidate => session.add_remote_candidate(&message.payload),
                        SignalKind::Offer if !offerer => {
                            // the remote restarted; renegotiate with its new
                            // credentials
                            self.buffer_signal(message);
                            if endpoint.is_some() {
                                return Ok(SessionEnd::Lost);
                            }
                            return Err(PeerError::Retry("remote restarted negotiation".to_string()));
                        }
                        SignalKind::Offer | SignalKind::Answer => {
                            debug!(
                                "peer {} ignoring duplicate {:?}",
                                self.remote_key.short(),
                                message.kind
                            );
                        }
                    },
                    Some(PeerInput::ConfigChange(ips)) => {
                        self.allowed_ips = ips;
                        if let Some(selected) = endpoint {
                            self.device
                                .upsert_peer(
                                    &self.remote_key,
                                    &self.allowed_ips,
                                    Some(selected),
                                    Some(preshared),
                                )
                                .map_err(PeerError::Fatal)?;
                        }
                    }
                    Some(PeerInput::IceServers(servers)) => {
                        self.ice_servers = servers;
                        if endpoint.is_none() {
                            return Err(PeerError::Retry("ICE servers changed".to_string()));
                        }
                    }
                    Some(PeerInput::Start) => {}
                }
            }
        }
    }

    async fn handle_negotiation_signal(
        &mut self,
        offerer: bool,
        session: &IceSession,
        message: SignalMessage,
        remote_creds: &mut Option<(String, String)>,
    ) {
        match message.kind {
            SignalKind::Offer => {
                if offerer {
                    debug!(
                        "peer {} sent an offer but we are the offerer, ignoring",
                        self.remote_key.short()
                    );
                    return;
                }
                match parse_credentials(&message.payload) {
                    Some(creds) => {
                        *remote_creds = Some(creds);
                        self.send_signal(SignalMessage::answer(session.ufrag(), session.pass()))
                            .await;
                    }
                    None => warn!(
                        "peer {} sent malformed offer payload",
                        self.remote_key.short()
                    ),
                }
            }
            SignalKind::Answer => {
                if !offerer {
                    debug!(
                        "peer {} sent an answer but we are the answerer, ignoring",
                        self.remote_key.short()
                    );
                    return;
                }
                match parse_credentials(&message.payload) {
                    Some(creds) => *remote_creds = Some(creds),
                    None => warn!(
                        "peer {} sent malformed answer payload",
                        self.remote_key.short()
                    ),
                }
            }
            SignalKind::Candidate => session.add_remote_candidate(&message.payload),
        }
    }

    /// Signal delivery is best-effort: one retry, then the message is
    /// dropped and ICE recovers on the next candidate.
    async fn send_signal(&self, message: SignalMessage) {
        if let Err(e) = self.signal.send(&self.remote_key, message.clone()).await {
            debug!(
                "signal send to {} failed, retrying once: {}",
                self.remote_key.short(),
                e
            );
            if let Err(e) = self.signal.send(&self.remote_key, message).await {
                warn!("signal send to {} dropped: {}", self.remote_key.short(), e);
            }
        }
    }
}
