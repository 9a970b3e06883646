// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

//! Error taxonomy and the closed-or-canceled classification shared by the
//! dispatch paths and the transport serve loops.
//!
//! Classification never alters control flow; it only decides the log
//! severity of a terminal error. Inner layers wrap errors with operation
//! context and return them; only the outermost per-connection wrapper logs.

use std::fmt;
use std::io;

use super::address::TunnelAddress;
use super::mux::MuxError;
use super::router::RouteError;
use super::service::ServiceError;
use super::tls::TlsError;
use super::transport::TransportError;

/// Errors produced by the inbound construction and dispatch pipeline.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
  /// Construction-time misconfiguration; fatal, never retried.
  #[error("invalid inbound configuration: {0}")]
  Configuration(String),
  /// The configured wire transport could not be built.
  #[error("create server transport: {transport_type}")]
  TransportConstruction {
    transport_type: String,
    #[source]
    source: TransportError,
  },
  /// The protocol service invoked a dispatch callback without an attached
  /// user index. This indicates a collaborator contract violation, not a
  /// recoverable connection fault.
  #[error("connection dispatched without an authenticated user")]
  InvalidIdentity,
  /// The authenticated index no longer resolves to a configured user.
  #[error("authenticated user index {0} is not present in the user table")]
  UnknownUser(usize),
  #[error("tls terminator")]
  Tls(#[source] TlsError),
  #[error("tls server handshake with {peer}")]
  TlsHandshake {
    peer: TunnelAddress,
    #[source]
    source: TlsError,
  },
  #[error(transparent)]
  Service(#[from] ServiceError),
  #[error("transport")]
  Transport(#[source] TransportError),
  #[error("route connection")]
  Route(#[source] RouteError),
  #[error(transparent)]
  Mux(#[from] MuxError),
  #[error(transparent)]
  Io(#[from] io::Error),
  #[error("operation canceled")]
  Canceled,
  /// Aggregate of the failures encountered while tearing components down.
  #[error("close: {0}")]
  Close(CloseErrors),
}

/// Collected teardown failures; `Close()` continues past individual
/// component failures and reports them all at once.
#[derive(Debug, Default)]
pub struct CloseErrors(pub Vec<DispatchError>);

impl CloseErrors {
  pub fn push(&mut self, error: DispatchError) {
    self.0.push(error);
  }

  pub fn into_result(self) -> Result<(), DispatchError> {
    if self.0.is_empty() {
      Ok(())
    } else {
      Err(DispatchError::Close(self))
    }
  }
}

impl fmt::Display for CloseErrors {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (position, error) in self.0.iter().enumerate() {
      if position > 0 {
        f.write_str("; ")?;
      }
      write!(f, "{}", error)?;
    }
    Ok(())
  }
}

impl std::error::Error for CloseErrors {}

/// Classification of an error as an expected teardown signal.
///
/// Closed-or-canceled errors are logged at debug severity and never
/// escalated; everything else logs at error severity with peer context.
pub trait ClosedOrCanceled {
  fn is_closed_or_canceled(&self) -> bool;
}

impl ClosedOrCanceled for io::Error {
  fn is_closed_or_canceled(&self) -> bool {
    matches!(
      self.kind(),
      io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof
    )
  }
}

impl ClosedOrCanceled for DispatchError {
  fn is_closed_or_canceled(&self) -> bool {
    match self {
      DispatchError::Canceled => true,
      DispatchError::Io(source) => source.is_closed_or_canceled(),
      DispatchError::Service(source) => source.is_closed_or_canceled(),
      DispatchError::Route(source) => source.is_closed_or_canceled(),
      DispatchError::Transport(source) => source.is_closed_or_canceled(),
      DispatchError::TlsHandshake { source, .. } => source.is_closed_or_canceled(),
      _ => false,
    }
  }
}
