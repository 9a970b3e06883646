// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

use std::fmt;
use std::net::SocketAddr;

/// The reserved placeholder FQDN a datagram session presents as its
/// destination to signal that addressing is carried per-packet inside the
/// payload framing rather than in the connection metadata.
///
/// The value is fixed by the wire protocol and must be matched exactly.
pub const PACKET_ADDR_FQDN: &str = "sp.packet-addr.v2fly.arpa";

/// A connection endpoint as understood by the dispatch pipeline.
///
/// Tunneled protocols address destinations either by socket address or by
/// name; a freshly accepted connection has no destination at all until the
/// protocol layer decodes one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum TunnelAddress {
  /// No address is known (or the address was deliberately cleared).
  #[default]
  Unspecified,
  Socket(SocketAddr),
  Named {
    host: String,
    port: u16,
  },
}

impl TunnelAddress {
  pub fn is_unspecified(&self) -> bool {
    matches!(self, TunnelAddress::Unspecified)
  }

  /// The fully qualified domain name, when this address is name-based.
  pub fn fqdn(&self) -> Option<&str> {
    match self {
      TunnelAddress::Named { host, .. } => Some(host.as_str()),
      _ => None,
    }
  }

  /// Whether this destination is the reserved per-packet-addressing sentinel.
  pub fn is_packet_addr_sentinel(&self) -> bool {
    self.fqdn() == Some(PACKET_ADDR_FQDN)
  }

  pub fn named(host: impl Into<String>, port: u16) -> Self {
    TunnelAddress::Named {
      host: host.into(),
      port,
    }
  }
}

impl From<SocketAddr> for TunnelAddress {
  fn from(addr: SocketAddr) -> Self {
    TunnelAddress::Socket(addr)
  }
}

impl fmt::Display for TunnelAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TunnelAddress::Unspecified => f.write_str("unspecified"),
      TunnelAddress::Socket(addr) => write!(f, "{}", addr),
      TunnelAddress::Named { host, port } => write!(f, "{}:{}", host, port),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{TunnelAddress, PACKET_ADDR_FQDN};

  #[test]
  fn sentinel_matches_exactly() {
    assert!(TunnelAddress::named(PACKET_ADDR_FQDN, 0).is_packet_addr_sentinel());
    // Near-misses must not trigger the per-packet addressing path
    assert!(!TunnelAddress::named("SP.PACKET-ADDR.V2FLY.ARPA", 0).is_packet_addr_sentinel());
    assert!(!TunnelAddress::named("sp.packet-addr.v2fly.arpa.", 0).is_packet_addr_sentinel());
    assert!(!TunnelAddress::Unspecified.is_packet_addr_sentinel());
  }

  #[test]
  fn display_renders_each_form() {
    assert_eq!(TunnelAddress::Unspecified.to_string(), "unspecified");
    assert_eq!(
      TunnelAddress::Socket("127.0.0.1:8080".parse().unwrap()).to_string(),
      "127.0.0.1:8080"
    );
    assert_eq!(
      TunnelAddress::named("example.com", 443).to_string(),
      "example.com:443"
    );
  }
}
