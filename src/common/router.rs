// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

use std::io;

use futures::future::BoxFuture;

use super::context::DispatchContext;
use super::error::ClosedOrCanceled;
use super::metadata::ConnectionMetadata;
use super::packet::BoxedPacketConn;
use crate::util::stream::BoxedStream;

#[derive(thiserror::Error, Debug)]
pub enum RouteError {
  #[error("no route accepts the connection")]
  NoRoute,
  #[error("routing rejected: {0}")]
  Rejected(String),
  #[error(transparent)]
  Io(#[from] io::Error),
}

impl ClosedOrCanceled for RouteError {
  fn is_closed_or_canceled(&self) -> bool {
    match self {
      RouteError::Io(source) => source.is_closed_or_canceled(),
      _ => false,
    }
  }
}

/// The downstream traffic router: takes a fully dispatched connection plus
/// its metadata and performs the actual forwarding.
///
/// Rule matching, outbound selection, and the copy loops all live behind
/// this seam, outside the dispatcher's concern.
pub trait ConnectionRouter: Send + Sync {
  fn route_connection(
    &self,
    context: DispatchContext,
    stream: BoxedStream,
    metadata: ConnectionMetadata,
  ) -> BoxFuture<'_, Result<(), RouteError>>;

  fn route_packet_connection(
    &self,
    context: DispatchContext,
    connection: BoxedPacketConn,
    metadata: ConnectionMetadata,
  ) -> BoxFuture<'_, Result<(), RouteError>>;
}
