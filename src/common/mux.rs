// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

//! Multiplex wrapping of the downstream router.
//!
//! When enabled, stream connections addressed to the multiplex sentinel
//! destination are handed to a session service (a collaborator; its stream
//! demultiplexing internals are out of scope here) instead of being routed
//! directly. Everything else passes through untouched.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::context::DispatchContext;
use super::metadata::ConnectionMetadata;
use super::packet::BoxedPacketConn;
use super::router::{ConnectionRouter, RouteError};
use crate::util::stream::BoxedStream;

/// Destination FQDN by which a client marks a connection as a multiplex
/// session rather than ordinary traffic. Fixed by the wire protocol.
pub const MUX_FQDN: &str = "sp.mux.sing-box.arpa";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MuxOptions {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub max_connections: Option<usize>,
  #[serde(default)]
  pub min_streams: Option<usize>,
  #[serde(default)]
  pub max_streams: Option<usize>,
}

#[derive(thiserror::Error, Debug)]
pub enum MuxError {
  #[error("max_streams is mutually exclusive with max_connections and min_streams")]
  ConflictingStreamLimits,
  #[error("multiplex is enabled but no session service is available")]
  MissingSessionService,
}

/// The collaborator that owns a multiplex session: it demultiplexes logical
/// streams off the physical connection and delivers each to the router it
/// was created around.
pub trait MuxService: Send + Sync {
  fn new_session(
    &self,
    context: DispatchContext,
    stream: BoxedStream,
    metadata: ConnectionMetadata,
  ) -> BoxFuture<'_, Result<(), RouteError>>;
}

/// Builds the session service around the router the demultiplexed streams
/// should land on.
pub trait MuxServiceFactory: Send + Sync {
  fn create(
    &self,
    router: Arc<dyn ConnectionRouter>,
    options: &MuxOptions,
  ) -> Result<Arc<dyn MuxService>, MuxError>;
}

/// Wrap `router` per `options`. Disabled (or absent) multiplex settings
/// return the router unchanged; enabled settings require a session service
/// factory and validate the stream-limit combination first.
pub fn new_router(
  router: Arc<dyn ConnectionRouter>,
  factory: Option<&dyn MuxServiceFactory>,
  options: Option<&MuxOptions>,
) -> Result<Arc<dyn ConnectionRouter>, MuxError> {
  let options = match options {
    Some(options) if options.enabled => options,
    _ => return Ok(router),
  };
  if options.max_streams.is_some()
    && (options.max_connections.is_some() || options.min_streams.is_some())
  {
    return Err(MuxError::ConflictingStreamLimits);
  }
  let factory = factory.ok_or(MuxError::MissingSessionService)?;
  let service = factory.create(Arc::clone(&router), options)?;
  Ok(Arc::new(MuxRouter {
    inner: router,
    service,
  }))
}

struct MuxRouter {
  inner: Arc<dyn ConnectionRouter>,
  service: Arc<dyn MuxService>,
}

impl ConnectionRouter for MuxRouter {
  fn route_connection(
    &self,
    context: DispatchContext,
    stream: BoxedStream,
    metadata: ConnectionMetadata,
  ) -> BoxFuture<'_, Result<(), RouteError>> {
    if metadata.destination.fqdn() == Some(MUX_FQDN) {
      self.service.new_session(context, stream, metadata)
    } else {
      self.inner.route_connection(context, stream, metadata)
    }
  }

  fn route_packet_connection(
    &self,
    context: DispatchContext,
    connection: BoxedPacketConn,
    metadata: ConnectionMetadata,
  ) -> BoxFuture<'_, Result<(), RouteError>> {
    self.inner.route_packet_connection(context, connection, metadata)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::address::TunnelAddress;
  use futures::FutureExt;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio_util::sync::CancellationToken;

  #[derive(Default)]
  struct CountingRouter {
    connections: AtomicUsize,
  }

  impl ConnectionRouter for CountingRouter {
    fn route_connection(
      &self,
      _context: DispatchContext,
      _stream: BoxedStream,
      _metadata: ConnectionMetadata,
    ) -> BoxFuture<'_, Result<(), RouteError>> {
      self.connections.fetch_add(1, Ordering::SeqCst);
      async move { Ok(()) }.boxed()
    }

    fn route_packet_connection(
      &self,
      _context: DispatchContext,
      _connection: BoxedPacketConn,
      _metadata: ConnectionMetadata,
    ) -> BoxFuture<'_, Result<(), RouteError>> {
      async move { Ok(()) }.boxed()
    }
  }

  #[derive(Default)]
  struct CountingMuxService {
    sessions: AtomicUsize,
  }

  impl MuxService for CountingMuxService {
    fn new_session(
      &self,
      _context: DispatchContext,
      _stream: BoxedStream,
      _metadata: ConnectionMetadata,
    ) -> BoxFuture<'_, Result<(), RouteError>> {
      self.sessions.fetch_add(1, Ordering::SeqCst);
      async move { Ok(()) }.boxed()
    }
  }

  struct FixedFactory(Arc<CountingMuxService>);

  impl MuxServiceFactory for FixedFactory {
    fn create(
      &self,
      _router: Arc<dyn ConnectionRouter>,
      _options: &MuxOptions,
    ) -> Result<Arc<dyn MuxService>, MuxError> {
      Ok(Arc::clone(&self.0) as Arc<dyn MuxService>)
    }
  }

  fn context() -> DispatchContext {
    DispatchContext::new(CancellationToken::new())
  }

  fn stream() -> BoxedStream {
    Box::new(tokio::io::duplex(8).0)
  }

  #[test]
  fn disabled_options_return_the_router_unchanged() {
    let inner: Arc<dyn ConnectionRouter> = Arc::new(CountingRouter::default());
    let wrapped = new_router(Arc::clone(&inner), None, None).unwrap();
    assert!(Arc::ptr_eq(&inner, &wrapped));

    let disabled = MuxOptions::default();
    let wrapped = new_router(Arc::clone(&inner), None, Some(&disabled)).unwrap();
    assert!(Arc::ptr_eq(&inner, &wrapped));
  }

  #[test]
  fn conflicting_stream_limits_are_rejected() {
    let inner: Arc<dyn ConnectionRouter> = Arc::new(CountingRouter::default());
    let options = MuxOptions {
      enabled: true,
      max_connections: Some(4),
      max_streams: Some(8),
      ..MuxOptions::default()
    };
    let service = Arc::new(CountingMuxService::default());
    let result = new_router(inner, Some(&FixedFactory(service)), Some(&options));
    assert!(matches!(result, Err(MuxError::ConflictingStreamLimits)));
  }

  #[test]
  fn enabled_options_require_a_session_service() {
    let inner: Arc<dyn ConnectionRouter> = Arc::new(CountingRouter::default());
    let options = MuxOptions {
      enabled: true,
      ..MuxOptions::default()
    };
    let result = new_router(inner, None, Some(&options));
    assert!(matches!(result, Err(MuxError::MissingSessionService)));
  }

  #[tokio::test]
  async fn sentinel_destinations_open_sessions_and_others_pass_through() {
    let inner = Arc::new(CountingRouter::default());
    let service = Arc::new(CountingMuxService::default());
    let options = MuxOptions {
      enabled: true,
      ..MuxOptions::default()
    };
    let wrapped = new_router(
      Arc::clone(&inner) as Arc<dyn ConnectionRouter>,
      Some(&FixedFactory(Arc::clone(&service))),
      Some(&options),
    )
    .unwrap();

    let mux_bound = ConnectionMetadata::with_addresses(
      TunnelAddress::Unspecified,
      TunnelAddress::named(MUX_FQDN, 0),
    );
    wrapped
      .route_connection(context(), stream(), mux_bound)
      .await
      .unwrap();
    assert_eq!(service.sessions.load(Ordering::SeqCst), 1);
    assert_eq!(inner.connections.load(Ordering::SeqCst), 0);

    let direct = ConnectionMetadata::with_addresses(
      TunnelAddress::Unspecified,
      TunnelAddress::named("example.com", 80),
    );
    wrapped
      .route_connection(context(), stream(), direct)
      .await
      .unwrap();
    assert_eq!(inner.connections.load(Ordering::SeqCst), 1);
  }
}
