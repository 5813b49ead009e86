//! Signal client: short addressed messages (offer/answer/candidate) relayed
//! between peers during negotiation. The service routes purely on the
//! from/to keys; payloads are opaque to it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::identity::PublicKey;
use crate::wire;

const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// One negotiation message. For offers and answers the payload carries the
/// ICE credentials; for candidates, a single candidate line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub kind: SignalKind,
    pub payload: String,
}

impl SignalMessage {
    pub fn offer(ufrag: &str, pass: &str) -> Self {
        Self {
            kind: SignalKind::Offer,
            payload: encode_credentials(ufrag, pass),
        }
    }

    pub fn answer(ufrag: &str, pass: &str) -> Self {
        Self {
            kind: SignalKind::Answer,
            payload: encode_credentials(ufrag, pass),
        }
    }

    pub fn candidate(line: &str) -> Self {
        Self {
            kind: SignalKind::Candidate,
            payload: line.to_string(),
        }
    }
}

/// Credentials payload: ufrag and password joined with a single colon.
/// ICE credentials never contain a colon themselves.
pub fn encode_credentials(ufrag: &str, pass: &str) -> String {
    format!("{}:{}", ufrag, pass)
}

pub fn parse_credentials(payload: &str) -> Option<(String, String)> {
    let (ufrag, pass) = payload.split_once(':')?;
    if ufrag.is_empty() || pass.is_empty() {
        return None;
    }
    Some((ufrag.to_string(), pass.to_string()))
}

/// The frames exchanged with the signal service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignalFrame {
    /// First frame on every connection: who this stream belongs to.
    Hello { pub_key: PublicKey },
    /// A routed message.
    Envelope {
        from: PublicKey,
        to: PublicKey,
        body: SignalMessage,
    },
}

/// Receiver side of the signal stream.
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn on_signal(&self, from: PublicKey, message: SignalMessage);
}

/// Client interface to the signal service. `send` must be safe for
/// concurrent callers; delivery is best-effort.
#[async_trait]
pub trait SignalClient: Send + Sync {
    async fn send(&self, to: &PublicKey, message: SignalMessage) -> Result<(), TransportError>;

    /// Run the inbound stream, delivering each message to `handler`.
    /// Returns when the client is closed.
    async fn run_receiver(&self, handler: Arc<dyn SignalHandler>) -> Result<(), TransportError>;

    async fn close(&self);
}

/// TCP implementation: one long-lived stream, CBOR frames, reconnect with
/// capped exponential backoff.
pub struct TcpSignalClient {
    addr: String,
    local_key: PublicKey,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: CancellationToken,
}

impl TcpSignalClient {
    pub fn new(addr: &str, local_key: PublicKey) -> Self {
        Self {
            addr: addr.to_string(),
            local_key,
            writer: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl SignalClient for TcpSignalClient {
    async fn send(&self, to: &PublicKey, message: SignalMessage) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        let frame = SignalFrame::Envelope {
            from: self.local_key,
            to: *to,
            body: message,
        };
        if let Err(e) = wire::write_message(stream, &frame).await {
            // the receiver loop will reconnect; drop the dead writer now
            *writer = None;
            return Err(e);
        }
        Ok(())
    }

    async fn run_receiver(&self, handler: Arc<dyn SignalHandler>) -> Result<(), TransportError> {
        let mut backoff = RECONNECT_INITIAL;

        loop {
            if self.closed.is_cancelled() {
                return Ok(());
            }

            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    let (mut reader, mut writer) = stream.into_split();

                    let hello = SignalFrame::Hello {
                        pub_key: self.local_key,
                    };
                    if let Err(e) = wire::write_message(&mut writer, &hello).await {
                        warn!("signal hello failed: {}", e);
                    } else {
                        *self.writer.lock().await = Some(writer);
                        backoff = RECONNECT_INITIAL;
                        debug!("signal stream to {} established", self.addr);

                        loop {
                            tokio::select! {
                                _ = self.closed.cancelled() => {
                                    *self.writer.lock().await = None;
                                    return Ok(());
                                }
                                frame = wire::read_message::<_, SignalFrame>(&mut reader) => match frame {
                                    Ok(SignalFrame::Envelope { from, to, body }) => {
                                        if to != self.local_key {
                                            debug!("discarding misrouted signal for {}", to.short());
                                            continue;
                                        }
                                        handler.on_signal(from, body).await;
                                    }
                                    Ok(SignalFrame::Hello { .. }) => {
                                        debug!("unexpected hello frame from signal service");
                                    }
                                    Err(e) => {
                                        warn!("signal stream broken: {}", e);
                                        break;
                                    }
                                }
                            }
                        }
                        *self.writer.lock().await = None;
                    }
                }
                Err(e) => warn!("signal connect to {} failed: {}", self.addr, e),
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
        *self.writer.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PrivateKey;

    #[test]
    fn credentials_payload_roundtrip() {
        let payload = encode_credentials("uf", "pass123");
        assert_eq!(
            parse_credentials(&payload),
            Some(("uf".to_string(), "pass123".to_string()))
        );
    }

    #[test]
    fn rejects_malformed_credentials() {
        assert_eq!(parse_credentials("nodceolon"), None);
        assert_eq!(parse_credentials(":pass"), None);
        assert_eq!(parse_credentials("ufrag:"), None);
    }

    #[test]
    fn envelope_frame_roundtrip() {
        let from = PrivateKey::generate().public_key();
        let to = PrivateKey::generate().public_key();
        let frame = SignalFrame::Envelope {
            from,
            to,
            body: SignalMessage::offer("uf", "pw"),
        };

        let bytes = wire::encode(&frame).unwrap();
        let decoded: SignalFrame = wire::decode(&bytes).unwrap();
        match decoded {
            SignalFrame::Envelope {
                from: f,
                to: t,
                body,
            } => {
                assert_eq!(f, from);
                assert_eq!(t, to);
                assert_eq!(body.kind, SignalKind::Offer);
                assert_eq!(parse_credentials(&body.payload).unwrap().0, "uf");
            }
            _ => panic!("wrong frame"),
        }
    }

    #[tokio::test]
    async fn send_without_connection_errors() {
        let client =
            TcpSignalClient::new("127.0.0.1:1", PrivateKey::generate().public_key());
        let to = PrivateKey::generate().public_key();
        let result = client.send(&to, SignalMessage::candidate("x")).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }
}
