// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

//! Contract of the opaque protocol service: the collaborator that decodes
//! the tunneled protocol's framing and authenticates the connecting
//! principal against the user table.

use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use uuid::Uuid;

use super::authentication::AuthenticationResult;
use super::context::DispatchContext;
use super::error::{ClosedOrCanceled, DispatchError};
use super::metadata::ConnectionMetadata;
use super::packet::BoxedPacketConn;
use crate::util::stream::BoxedStream;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
  #[error("protocol decode failure: {0}")]
  Protocol(String),
  #[error("authentication rejected")]
  AuthenticationRejected,
  /// The per-user parameter lists handed to `update_users` disagree in
  /// length; accepting them would let indices drift from secrets.
  #[error("user table mismatch: {indices} indices for {secrets} secrets")]
  UserTableMismatch { indices: usize, secrets: usize },
  #[error(transparent)]
  Io(#[from] io::Error),
}

impl ClosedOrCanceled for ServiceError {
  fn is_closed_or_canceled(&self) -> bool {
    match self {
      ServiceError::Io(source) => source.is_closed_or_canceled(),
      _ => false,
    }
  }
}

/// Tuning the inbound applies to the protocol service at construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceOptions {
  /// Set when a non-raw wire transport is configured: the transport already
  /// guarantees framing integrity, so the protocol's own header protection
  /// must be switched off.
  pub disable_header_protection: bool,
}

/// The two callbacks the inbound injects into the protocol service.
///
/// After a successful decode the service classifies the logical connection
/// and invokes exactly one of these, passing the metadata it enriched with
/// the decoded destination and the outcome of authentication.
pub trait StreamDelegate: Send + Sync {
  fn handle_stream(
    &self,
    context: DispatchContext,
    stream: BoxedStream,
    metadata: ConnectionMetadata,
    authentication: AuthenticationResult,
  ) -> BoxFuture<'_, Result<(), DispatchError>>;

  fn handle_packets(
    &self,
    context: DispatchContext,
    connection: BoxedPacketConn,
    metadata: ConnectionMetadata,
    authentication: AuthenticationResult,
  ) -> BoxFuture<'_, Result<(), DispatchError>>;
}

/// Handle to a live protocol service instance.
///
/// Owns the decode/authentication state and the currently active view of
/// the user table. The table view is only ever updated through
/// [`update_users`](Self::update_users), in lock-step with the inbound's
/// own table, so an index handed back by the service is valid against the
/// table that was current when it authenticated.
pub trait ServiceHandle: Send + Sync {
  fn start(&self) -> BoxFuture<'_, Result<(), ServiceError>>;

  fn close(&self) -> BoxFuture<'_, Result<(), ServiceError>>;

  /// Atomically replace the service's whole user view. No partial updates:
  /// the parameter lists are positionally aligned and replace everything.
  fn update_users(
    &self,
    indices: Vec<usize>,
    secrets: Vec<Uuid>,
    alter_ids: Vec<u16>,
  ) -> Result<(), ServiceError>;

  /// Decode and authenticate one inbound stream.
  ///
  /// `identity_hint` carries the upstream-facing metadata known before any
  /// protocol bytes are read; the service passes an enriched copy to the
  /// delegate callback it selects. The callback's result is propagated
  /// unchanged.
  fn new_connection(
    &self,
    context: DispatchContext,
    stream: BoxedStream,
    identity_hint: ConnectionMetadata,
  ) -> BoxFuture<'_, Result<(), DispatchError>>;
}

/// Builds the protocol service around the inbound's delegate, letting the
/// composition root supply the concrete protocol implementation.
pub trait ServiceFactory: Send + Sync {
  fn create(
    &self,
    options: ServiceOptions,
    delegate: Arc<dyn StreamDelegate>,
  ) -> Result<Arc<dyn ServiceHandle>, ServiceError>;
}
