// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

use super::address::TunnelAddress;
use super::listener::InboundFlags;

/// Per-connection record the dispatcher enriches before handing the
/// connection downstream.
///
/// Created fresh for every accepted connection and never shared between
/// connections; the accept layer fills in the addresses it knows, the
/// protocol layer supplies the decoded destination, and the dispatcher
/// stamps the inbound identity fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionMetadata {
  pub source: TunnelAddress,
  pub destination: TunnelAddress,
  /// Tag of the inbound instance that accepted the connection.
  pub inbound_tag: String,
  /// Protocol type of the accepting inbound.
  pub inbound_type: String,
  /// Outbound detour the configuration pins this inbound's traffic to.
  pub inbound_detour: Option<String>,
  pub inbound_options: InboundFlags,
  /// Resolved display name of the authenticated principal, when the
  /// configuration assigns one.
  pub user: Option<String>,
}

impl ConnectionMetadata {
  /// Metadata for a connection of which only the endpoint addresses are
  /// known yet.
  pub fn with_addresses(source: TunnelAddress, destination: TunnelAddress) -> Self {
    Self {
      source,
      destination,
      ..Self::default()
    }
  }
}
