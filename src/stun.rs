//! Minimal STUN binding support (RFC 5389) for server-reflexive candidate
//! discovery during ICE gathering.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use log::debug;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Reliable public STUN servers to use as ultimate fallback.
pub const STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Build a STUN Binding Request with the given transaction ID.
pub fn build_binding_request(tx_id: &[u8; 12]) -> [u8; 20] {
    let mut request = [0u8; 20];
    request[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // message length stays zero: no attributes
    request[4..8].copy_from_slice(&MAGIC_COOKIE);
    request[8..20].copy_from_slice(tx_id);
    request
}

/// Parse the mapped address out of a Binding Success Response. Prefers
/// XOR-MAPPED-ADDRESS, falls back to the legacy MAPPED-ADDRESS.
pub fn parse_mapped_address(response: &[u8]) -> Option<SocketAddr> {
    if response.len() < 20 {
        return None;
    }
    let msg_type = u16::from_be_bytes([response[0], response[1]]);
    if msg_type != BINDING_SUCCESS {
        return None;
    }
    let msg_len = u16::from_be_bytes([response[2], response[3]]) as usize;
    let body = response.get(20..20 + msg_len)?;

    let mut plain: Option<SocketAddr> = None;
    let mut offset = 0;
    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let value = body.get(offset + 4..offset + 4 + attr_len)?;

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_address(value, true, &response[4..20]) {
                    return Some(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => {
                if plain.is_none() {
                    plain = decode_address(value, false, &response[4..20]);
                }
            }
            _ => {}
        }

        // attributes are padded to 4-byte boundaries
        offset += 4 + (attr_len + 3) / 4 * 4;
    }

    plain
}

fn decode_address(value: &[u8], xored: bool, cookie_and_tx: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xored {
        port ^= u16::from_be_bytes([MAGIC_COOKIE[0], MAGIC_COOKIE[1]]);
    }

    match family {
        0x01 => {
            let mut octets = [value[4], value[5], value[6], value[7]];
            if xored {
                for (octet, mask) in octets.iter_mut().zip(MAGIC_COOKIE.iter()) {
                    *octet ^= mask;
                }
            }
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            let raw = value.get(4..20)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            if xored {
                for (octet, mask) in octets.iter_mut().zip(cookie_and_tx.iter()) {
                    *octet ^= mask;
                }
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// Send one Binding Request over `socket` and wait for the mapped address.
pub async fn query(
    socket: &UdpSocket,
    server: &str,
    wait: Duration,
) -> Result<SocketAddr, std::io::Error> {
    let tx_id: [u8; 12] = rand::random();
    let request = build_binding_request(&tx_id);

    socket.send_to(&request, server).await?;

    let mut buf = [0u8; 1024];
    let (n, from) = timeout(wait, socket.recv_from(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "STUN query timed out"))??;

    if n < 20 || buf[8..20] != tx_id {
        debug!("discarding unexpected packet from {} during STUN query", from);
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unexpected STUN response",
        ));
    }

    parse_mapped_address(&buf[..n]).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "no mapped address in STUN response",
        )
    })
}
