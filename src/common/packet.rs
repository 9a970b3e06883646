// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

//! Datagram connection plumbing, including the packet-address adapter used
//! when a session's destination is the reserved sentinel FQDN: each payload
//! then carries its own destination in a small address prefix.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use futures::future::BoxFuture;
use futures::FutureExt;

use super::address::TunnelAddress;

/// One datagram of a logical packet connection, paired with the address it
/// is destined to (service to router direction) or originates from (reply
/// direction).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
  pub payload: Vec<u8>,
  pub address: TunnelAddress,
}

/// An established logical datagram flow.
pub trait PacketConn: Send + Unpin {
  fn recv(&mut self) -> BoxFuture<'_, io::Result<Packet>>;

  fn send(&mut self, packet: Packet) -> BoxFuture<'_, io::Result<()>>;

  fn close(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

pub type BoxedPacketConn = Box<dyn PacketConn>;

// Address kind octets of the per-packet prefix, following the v2ray
// serialization the sentinel convention comes from.
const ADDR_KIND_IPV4: u8 = 0x01;
const ADDR_KIND_NAMED: u8 = 0x02;
const ADDR_KIND_IPV6: u8 = 0x03;

fn invalid(message: &str) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, message.to_owned())
}

/// Split a per-packet address prefix off `buffer`, returning the decoded
/// destination and the remaining payload.
fn decode_prefixed(buffer: &[u8]) -> io::Result<(TunnelAddress, Vec<u8>)> {
  let (&kind, rest) = buffer
    .split_first()
    .ok_or_else(|| invalid("empty packet-addr payload"))?;
  let (address, rest) = match kind {
    ADDR_KIND_IPV4 => {
      if rest.len() < 4 {
        return Err(invalid("truncated ipv4 packet address"));
      }
      let octets: [u8; 4] = rest[..4].try_into().expect("length checked");
      (IpAddr::V4(Ipv4Addr::from(octets)), &rest[4..])
    }
    ADDR_KIND_IPV6 => {
      if rest.len() < 16 {
        return Err(invalid("truncated ipv6 packet address"));
      }
      let octets: [u8; 16] = rest[..16].try_into().expect("length checked");
      (IpAddr::V6(Ipv6Addr::from(octets)), &rest[16..])
    }
    ADDR_KIND_NAMED => {
      let (&length, rest) = rest
        .split_first()
        .ok_or_else(|| invalid("truncated named packet address"))?;
      let length = usize::from(length);
      if rest.len() < length {
        return Err(invalid("truncated named packet address"));
      }
      let host = std::str::from_utf8(&rest[..length])
        .map_err(|_| invalid("packet address is not utf-8"))?
        .to_owned();
      let rest = &rest[length..];
      if rest.len() < 2 {
        return Err(invalid("missing packet address port"));
      }
      let port = u16::from_be_bytes([rest[0], rest[1]]);
      return Ok((TunnelAddress::named(host, port), rest[2..].to_vec()));
    }
    other => {
      return Err(invalid(&format!("unknown packet address kind {other:#04x}")));
    }
  };
  if rest.len() < 2 {
    return Err(invalid("missing packet address port"));
  }
  let port = u16::from_be_bytes([rest[0], rest[1]]);
  Ok((
    TunnelAddress::Socket(SocketAddr::new(address, port)),
    rest[2..].to_vec(),
  ))
}

fn encode_prefixed(address: &TunnelAddress, payload: &[u8]) -> io::Result<Vec<u8>> {
  let mut buffer = Vec::with_capacity(payload.len() + 32);
  match address {
    TunnelAddress::Socket(SocketAddr::V4(socket)) => {
      buffer.push(ADDR_KIND_IPV4);
      buffer.extend_from_slice(&socket.ip().octets());
      buffer.extend_from_slice(&socket.port().to_be_bytes());
    }
    TunnelAddress::Socket(SocketAddr::V6(socket)) => {
      buffer.push(ADDR_KIND_IPV6);
      buffer.extend_from_slice(&socket.ip().octets());
      buffer.extend_from_slice(&socket.port().to_be_bytes());
    }
    TunnelAddress::Named { host, port } => {
      let length = u8::try_from(host.len())
        .map_err(|_| invalid("packet address name exceeds 255 bytes"))?;
      buffer.push(ADDR_KIND_NAMED);
      buffer.push(length);
      buffer.extend_from_slice(host.as_bytes());
      buffer.extend_from_slice(&port.to_be_bytes());
    }
    TunnelAddress::Unspecified => {
      return Err(invalid("cannot encode an unspecified packet address"));
    }
  }
  buffer.extend_from_slice(payload);
  Ok(buffer)
}

/// Adapter for datagram sessions that carry per-packet addressing.
///
/// Wraps a connection whose payloads are address-prefixed; `recv` surfaces
/// the true destination decoded from the prefix, `send` frames the reply's
/// origin address back in. The sentinel destination itself never passes
/// through this adapter.
pub struct PacketAddrConn {
  inner: BoxedPacketConn,
}

impl PacketAddrConn {
  pub fn new(inner: BoxedPacketConn) -> Self {
    Self { inner }
  }
}

impl PacketConn for PacketAddrConn {
  fn recv(&mut self) -> BoxFuture<'_, io::Result<Packet>> {
    async move {
      let raw = self.inner.recv().await?;
      let (address, payload) = decode_prefixed(&raw.payload)?;
      Ok(Packet { payload, address })
    }
    .boxed()
  }

  fn send(&mut self, packet: Packet) -> BoxFuture<'_, io::Result<()>> {
    async move {
      let payload = encode_prefixed(&packet.address, &packet.payload)?;
      self
        .inner
        .send(Packet {
          payload,
          address: TunnelAddress::Unspecified,
        })
        .await
    }
    .boxed()
  }

  fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
    self.inner.close()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::VecDeque;

  use std::sync::{Arc, Mutex};

  /// In-memory packet connection backed by queues, standing in for a
  /// decoded protocol datagram flow. Sent packets land in a shared buffer
  /// the test keeps a handle to.
  pub(crate) struct QueuePacketConn {
    incoming: VecDeque<Packet>,
    sent: Arc<Mutex<Vec<Packet>>>,
  }

  impl QueuePacketConn {
    pub fn with_incoming(incoming: Vec<Packet>) -> (Self, Arc<Mutex<Vec<Packet>>>) {
      let sent = Arc::new(Mutex::new(Vec::new()));
      (
        Self {
          incoming: incoming.into(),
          sent: Arc::clone(&sent),
        },
        sent,
      )
    }
  }

  impl PacketConn for QueuePacketConn {
    fn recv(&mut self) -> BoxFuture<'_, io::Result<Packet>> {
      let next = self.incoming.pop_front();
      async move {
        next.ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "queue drained"))
      }
      .boxed()
    }

    fn send(&mut self, packet: Packet) -> BoxFuture<'_, io::Result<()>> {
      self.sent.lock().unwrap().push(packet);
      async move { Ok(()) }.boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
      async move { Ok(()) }.boxed()
    }
  }

  #[tokio::test]
  async fn recv_decodes_the_address_prefix() {
    let mut framed = vec![0x01, 10, 0, 0, 1, 0x1f, 0x90]; // 10.0.0.1:8080
    framed.extend_from_slice(b"hello");
    let (inner, _sent) = QueuePacketConn::with_incoming(vec![Packet {
      payload: framed,
      address: TunnelAddress::Unspecified,
    }]);
    let mut conn = PacketAddrConn::new(Box::new(inner));

    let packet = conn.recv().await.unwrap();
    assert_eq!(packet.payload, b"hello");
    assert_eq!(
      packet.address,
      TunnelAddress::Socket("10.0.0.1:8080".parse().unwrap())
    );
  }

  #[tokio::test]
  async fn recv_decodes_named_addresses() {
    let mut framed = vec![0x02, 11];
    framed.extend_from_slice(b"example.com");
    framed.extend_from_slice(&443u16.to_be_bytes());
    framed.extend_from_slice(b"payload");
    let (inner, _sent) = QueuePacketConn::with_incoming(vec![Packet {
      payload: framed,
      address: TunnelAddress::Unspecified,
    }]);
    let mut conn = PacketAddrConn::new(Box::new(inner));

    let packet = conn.recv().await.unwrap();
    assert_eq!(packet.payload, b"payload");
    assert_eq!(packet.address, TunnelAddress::named("example.com", 443));
  }

  #[tokio::test]
  async fn truncated_prefixes_are_rejected() {
    let (inner, _sent) = QueuePacketConn::with_incoming(vec![Packet {
      payload: vec![0x01, 10, 0],
      address: TunnelAddress::Unspecified,
    }]);
    let mut conn = PacketAddrConn::new(Box::new(inner));
    let error = conn.recv().await.unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::InvalidData);
  }

  #[tokio::test]
  async fn send_frames_the_origin_address() {
    let (inner, sent) = QueuePacketConn::with_incoming(Vec::new());
    let mut conn = PacketAddrConn::new(Box::new(inner));
    let origin = TunnelAddress::Socket("10.0.0.1:8080".parse().unwrap());
    conn
      .send(Packet {
        payload: b"pong".to_vec(),
        address: origin.clone(),
      })
      .await
      .unwrap();

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (address, payload) = decode_prefixed(&sent[0].payload).unwrap();
    assert_eq!(payload, b"pong");
    assert_eq!(address, origin);
  }

  #[tokio::test]
  async fn unspecified_origins_cannot_be_framed() {
    let (inner, _sent) = QueuePacketConn::with_incoming(Vec::new());
    let mut conn = PacketAddrConn::new(Box::new(inner));
    let error = conn
      .send(Packet {
        payload: Vec::new(),
        address: TunnelAddress::Unspecified,
      })
      .await
      .unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::InvalidData);
  }
}
