// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

//! Pluggable wire-transport seam: an alternate framing layer (for example
//! an HTTP-upgrade style listener) that subsumes raw listening and, when
//! configured, TLS termination, redelivering fully negotiated connections
//! to the dispatcher.

use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, UdpSocket};

use super::address::TunnelAddress;
use super::context::{CloseNotifier, DispatchContext};
use super::error::ClosedOrCanceled;
use super::tls::TlsTerminator;
use crate::util::stream::BoxedStream;

/// Which of the two network kinds a transport serves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkSet {
  pub stream: bool,
  pub datagram: bool,
}

impl NetworkSet {
  pub fn stream_only() -> Self {
    Self {
      stream: true,
      datagram: false,
    }
  }

  pub fn datagram_only() -> Self {
    Self {
      stream: false,
      datagram: true,
    }
  }

  pub fn serves_stream(&self) -> bool {
    self.stream
  }

  pub fn serves_datagram(&self) -> bool {
    self.datagram
  }
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  /// The transport's listen socket was closed; expected during shutdown.
  #[error("transport closed")]
  Closed,
  #[error("transport negotiation failure: {0}")]
  Negotiation(String),
  #[error("unknown transport type: {0}")]
  UnknownType(String),
  #[error(transparent)]
  Io(#[from] io::Error),
}

impl ClosedOrCanceled for TransportError {
  fn is_closed_or_canceled(&self) -> bool {
    match self {
      TransportError::Closed => true,
      TransportError::Io(source) => source.is_closed_or_canceled(),
      _ => false,
    }
  }
}

/// The `transport` options block: a type tag plus whatever settings that
/// type understands.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TransportOptions {
  #[serde(rename = "type")]
  pub transport_type: String,
  #[serde(default)]
  pub settings: serde_json::Value,
}

/// A live transport negotiator serving one inbound.
pub trait TransportNegotiator: Send + Sync {
  /// Which networks this transport wants sockets for.
  fn network(&self) -> NetworkSet;

  /// Whether the transport performs TLS termination itself when TLS is
  /// configured. A transport that serves traffic without terminating
  /// configured TLS is a configuration error at inbound construction;
  /// the dispatcher never double-wraps.
  fn terminates_tls(&self) -> bool;

  /// Run the stream serve loop over a listener provided by the inbound's
  /// socket layer. Resolves when the listener closes or the transport
  /// fails terminally.
  fn serve(&self, listener: TcpListener) -> BoxFuture<'_, Result<(), TransportError>>;

  /// Datagram counterpart of [`serve`](Self::serve).
  fn serve_packet(&self, socket: UdpSocket) -> BoxFuture<'_, Result<(), TransportError>>;

  fn close(&self) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// What a transport calls with each fully negotiated connection; the
/// dispatcher's adapter implements this and feeds the regular stream
/// pipeline (without re-running TLS).
pub trait TransportHandler: Send + Sync {
  fn handle_negotiated(
    &self,
    context: DispatchContext,
    stream: BoxedStream,
    source: TunnelAddress,
    destination: TunnelAddress,
    on_close: CloseNotifier,
  ) -> BoxFuture<'_, ()>;
}

/// Builds a transport negotiator from its options block. The terminator is
/// handed over when TLS is configured so the transport can terminate it
/// during negotiation; `handler` receives every negotiated connection.
pub trait TransportFactory: Send + Sync {
  fn create(
    &self,
    options: &TransportOptions,
    tls: Option<Arc<dyn TlsTerminator>>,
    handler: Arc<dyn TransportHandler>,
  ) -> Result<Arc<dyn TransportNegotiator>, TransportError>;
}
