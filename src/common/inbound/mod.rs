// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

//! The inbound itself: lifecycle controller, per-connection dispatch
//! pipeline, and the adapter that feeds transport-negotiated connections
//! into the same pipeline.

pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use super::address::TunnelAddress;
use super::authentication::AuthenticationResult;
use super::context::{CloseNotifier, DispatchContext};
use super::error::{CloseErrors, ClosedOrCanceled, DispatchError};
use super::listener::{ConnectionHandler, InboundFlags, ListenOptions, Listener};
use super::metadata::ConnectionMetadata;
use super::mux::{self, MuxOptions, MuxServiceFactory};
use super::packet::{BoxedPacketConn, PacketAddrConn};
use super::router::ConnectionRouter;
use super::service::{ServiceFactory, ServiceHandle, ServiceOptions, StreamDelegate};
use super::tls::{RustlsFactory, TlsFactory, TlsOptions, TlsTerminator};
use super::transport::{
  TransportError, TransportFactory, TransportHandler, TransportNegotiator, TransportOptions,
};
use super::user::{SharedUserTable, UserOptions, UserTable};
use crate::util::stream::BoxedStream;

/// The full recognized configuration surface of one inbound.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct InboundOptions {
  #[serde(default)]
  pub users: Vec<UserOptions>,
  #[serde(default)]
  pub tls: Option<TlsOptions>,
  #[serde(default)]
  pub transport: Option<TransportOptions>,
  #[serde(default)]
  pub multiplex: Option<MuxOptions>,
  #[serde(flatten)]
  pub listen: ListenOptions,
}

/// The collaborators an inbound is composed against. Only the router and
/// the protocol service factory are mandatory; the rest are engaged when
/// the corresponding options block is present.
pub struct InboundComponents {
  pub router: Arc<dyn ConnectionRouter>,
  pub service_factory: Arc<dyn ServiceFactory>,
  pub tls_factory: Option<Arc<dyn TlsFactory>>,
  pub transport_factory: Option<Arc<dyn TransportFactory>>,
  pub mux_factory: Option<Arc<dyn MuxServiceFactory>>,
}

impl InboundComponents {
  pub fn new(router: Arc<dyn ConnectionRouter>, service_factory: Arc<dyn ServiceFactory>) -> Self {
    Self {
      router,
      service_factory,
      tls_factory: None,
      transport_factory: None,
      mux_factory: None,
    }
  }
}

/// Per-connection dispatch state shared by the protocol service callbacks.
///
/// Implements the two callbacks the service invokes after authentication:
/// stamping inbound identity into the metadata, resolving the principal,
/// and forwarding to the (possibly multiplex-wrapped) router.
struct Dispatcher {
  tag: String,
  inbound_type: String,
  detour: Option<String>,
  flags: InboundFlags,
  users: SharedUserTable,
  router: Arc<dyn ConnectionRouter>,
}

impl Dispatcher {
  /// Steps 4 and 5 of the stream path: stamp identity fields and resolve
  /// the authenticated principal's display name.
  fn stamp(
    &self,
    metadata: &mut ConnectionMetadata,
    authentication: AuthenticationResult,
  ) -> Result<String, DispatchError> {
    metadata.inbound_tag = self.tag.clone();
    metadata.inbound_type = self.inbound_type.clone();
    metadata.inbound_detour = self.detour.clone();
    metadata.inbound_options = self.flags.clone();
    let index = authentication
      .user_index()
      .ok_or(DispatchError::InvalidIdentity)?;
    let table = self.users.snapshot();
    let display = table
      .display_name(index)
      .ok_or(DispatchError::UnknownUser(index))?
      .into_owned();
    if let Some(user) = table.get(index).filter(|user| !user.name.is_empty()) {
      metadata.user = Some(user.name.clone());
    }
    Ok(display)
  }
}

impl StreamDelegate for Dispatcher {
  fn handle_stream(
    &self,
    context: DispatchContext,
    stream: BoxedStream,
    mut metadata: ConnectionMetadata,
    authentication: AuthenticationResult,
  ) -> BoxFuture<'_, Result<(), DispatchError>> {
    async move {
      let user = self.stamp(&mut metadata, authentication)?;
      tracing::info!(
        connection_id = %context.id(),
        "[{}] inbound connection to {}",
        user,
        metadata.destination
      );
      self
        .router
        .route_connection(context, stream, metadata)
        .await
        .map_err(DispatchError::Route)
    }
    .boxed()
  }

  fn handle_packets(
    &self,
    context: DispatchContext,
    connection: BoxedPacketConn,
    mut metadata: ConnectionMetadata,
    authentication: AuthenticationResult,
  ) -> BoxFuture<'_, Result<(), DispatchError>> {
    async move {
      let user = self.stamp(&mut metadata, authentication)?;
      let connection = if metadata.destination.is_packet_addr_sentinel() {
        // The sentinel means addressing travels per-packet; it must never
        // reach the router as a destination.
        metadata.destination = TunnelAddress::Unspecified;
        tracing::info!(
          connection_id = %context.id(),
          "[{}] inbound packet addr connection",
          user
        );
        Box::new(PacketAddrConn::new(connection)) as BoxedPacketConn
      } else {
        tracing::info!(
          connection_id = %context.id(),
          "[{}] inbound packet connection to {}",
          user,
          metadata.destination
        );
        connection
      };
      self
        .router
        .route_packet_connection(context, connection, metadata)
        .await
        .map_err(DispatchError::Route)
    }
    .boxed()
  }
}

/// The externally facing stream entry: optional local TLS termination,
/// protocol service handoff, and the single place that decides terminal
/// log severity for a connection.
struct StreamPipeline {
  tag: String,
  service: Arc<dyn ServiceHandle>,
  /// Present only when TLS is configured and no transport is; a transport
  /// performs its own termination and must not be double-wrapped.
  local_tls: Option<Arc<dyn TlsTerminator>>,
}

impl StreamPipeline {
  async fn process(
    &self,
    context: DispatchContext,
    stream: BoxedStream,
    metadata: ConnectionMetadata,
  ) -> Result<(), DispatchError> {
    let stream = match &self.local_tls {
      Some(tls) => tls
        .server_handshake(stream)
        .await
        .map_err(|source| DispatchError::TlsHandshake {
          peer: metadata.source.clone(),
          source,
        })?,
      None => stream,
    };
    self.service.new_connection(context, stream, metadata).await
  }
}

impl ConnectionHandler for StreamPipeline {
  fn handle_connection(
    &self,
    context: DispatchContext,
    stream: BoxedStream,
    metadata: ConnectionMetadata,
    on_close: CloseNotifier,
  ) -> BoxFuture<'_, ()> {
    async move {
      match self.process(context.clone(), stream, metadata.clone()).await {
        Ok(()) => on_close.notify(None),
        Err(error) => {
          if error.is_closed_or_canceled() {
            tracing::debug!(
              inbound = %self.tag,
              connection_id = %context.id(),
              error = %error,
              "connection closed"
            );
          } else {
            tracing::error!(
              inbound = %self.tag,
              connection_id = %context.id(),
              source = %metadata.source,
              error = %error,
              "process connection"
            );
          }
          on_close.notify(Some(&error));
        }
      }
    }
    .boxed()
  }
}

/// Feeds connections a transport negotiated (framing and, when configured,
/// TLS already handled) into the regular stream pipeline. Holds a plain
/// reference to the shared pipeline state; implements nothing else.
struct TransportConnectionHandler {
  pipeline: Arc<StreamPipeline>,
}

impl TransportHandler for TransportConnectionHandler {
  fn handle_negotiated(
    &self,
    context: DispatchContext,
    stream: BoxedStream,
    source: TunnelAddress,
    destination: TunnelAddress,
    on_close: CloseNotifier,
  ) -> BoxFuture<'_, ()> {
    let metadata = ConnectionMetadata::with_addresses(source, destination);
    tracing::info!(connection_id = %context.id(), "inbound connection from {}", metadata.source);
    self
      .pipeline
      .handle_connection(context, stream, metadata, on_close)
  }
}

/// One configured inbound: the lifecycle controller over the protocol
/// service, the optional TLS terminator, the optional wire transport, and
/// the socket listener, around the dispatch pipeline.
pub struct Inbound {
  tag: String,
  dispatcher: Arc<Dispatcher>,
  service: Arc<dyn ServiceHandle>,
  tls: Option<Arc<dyn TlsTerminator>>,
  transport: Option<Arc<dyn TransportNegotiator>>,
  listener: Listener,
}

impl std::fmt::Debug for Inbound {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Inbound")
      .field("tag", &self.tag)
      .finish_non_exhaustive()
  }
}

impl Inbound {
  pub fn new(
    type_tag: impl Into<String>,
    tag: impl Into<String>,
    options: InboundOptions,
    components: InboundComponents,
  ) -> Result<Arc<Self>, DispatchError> {
    let type_tag = type_tag.into();
    let tag = tag.into();

    let router = mux::new_router(
      components.router,
      components.mux_factory.as_deref(),
      options.multiplex.as_ref(),
    )?;

    let dispatcher = Arc::new(Dispatcher {
      tag: tag.clone(),
      inbound_type: type_tag,
      detour: options.listen.detour.clone(),
      flags: options.listen.inbound.clone(),
      users: SharedUserTable::new(UserTable::from_options(&options.users)),
      router,
    });

    if let Some(transport) = &options.transport {
      if transport.transport_type.is_empty() {
        return Err(DispatchError::Configuration(
          "transport type must not be empty".to_owned(),
        ));
      }
    }
    let has_transport = options.transport.is_some();

    let service = components.service_factory.create(
      ServiceOptions {
        // A non-raw framing guarantees integrity itself; the protocol's
        // own header protection must then stay off.
        disable_header_protection: has_transport,
      },
      Arc::clone(&dispatcher) as Arc<dyn StreamDelegate>,
    )?;
    // Seed the service's user view in lock-step with the table it will be
    // asked to resolve indices against.
    {
      let table = dispatcher.users.snapshot();
      service.update_users(
        table.indices(),
        table.secrets(),
        options.users.iter().map(|user| user.alter_id).collect(),
      )?;
    }

    let tls = match &options.tls {
      Some(tls_options) => {
        let factory = components
          .tls_factory
          .unwrap_or_else(|| Arc::new(RustlsFactory));
        Some(factory.create(tls_options).map_err(DispatchError::Tls)?)
      }
      None => None,
    };

    let pipeline = Arc::new(StreamPipeline {
      tag: tag.clone(),
      service: Arc::clone(&service),
      local_tls: if has_transport { None } else { tls.clone() },
    });

    let transport = match &options.transport {
      Some(transport_options) => {
        let factory = components.transport_factory.as_ref().ok_or_else(|| {
          DispatchError::Configuration(format!(
            "no transport factory registered for type {}",
            transport_options.transport_type
          ))
        })?;
        let handler = Arc::new(TransportConnectionHandler {
          pipeline: Arc::clone(&pipeline),
        });
        let transport = factory
          .create(transport_options, tls.clone(), handler)
          .map_err(|source| DispatchError::TransportConstruction {
            transport_type: transport_options.transport_type.clone(),
            source,
          })?;
        if tls.is_some() && !transport.terminates_tls() {
          return Err(DispatchError::Configuration(format!(
            "transport type {} serves traffic without terminating the configured tls",
            transport_options.transport_type
          )));
        }
        Some(transport)
      }
      None => None,
    };

    let listener = Listener::new(
      options.listen,
      Arc::clone(&pipeline) as Arc<dyn ConnectionHandler>,
    );

    Ok(Arc::new(Self {
      tag,
      dispatcher,
      service,
      tls,
      transport,
      listener,
    }))
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  /// The bound stream socket address, once started.
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.listener.local_addr()
  }

  /// The bound datagram socket address, when a datagram-serving transport
  /// is running.
  pub fn packet_addr(&self) -> Option<SocketAddr> {
    self.listener.packet_addr()
  }

  /// Bring the inbound up: protocol service, then TLS terminator, then
  /// either the local accept loop or the transport's serve loops over
  /// listener-provided sockets.
  ///
  /// The first failing step aborts the sequence and returns its error;
  /// already-started components are not rolled back here. [`close`]
  /// (Self::close) cleans up a partially started inbound.
  pub async fn start(&self) -> Result<(), DispatchError> {
    self.service.start().await?;
    if let Some(tls) = &self.tls {
      tls.start().await.map_err(DispatchError::Tls)?;
    }
    let transport = match &self.transport {
      Some(transport) => transport,
      None => return self.listener.start().await.map_err(DispatchError::from),
    };
    let network = transport.network();
    if network.serves_stream() {
      let listener = self.listener.bind_stream().await?;
      let transport = Arc::clone(transport);
      let tag = self.tag.clone();
      tokio::spawn(async move {
        log_serve_exit(&tag, transport.serve(listener).await);
      });
    }
    if network.serves_datagram() {
      let socket = self.listener.bind_packet().await?;
      let transport = Arc::clone(transport);
      let tag = self.tag.clone();
      tokio::spawn(async move {
        log_serve_exit(&tag, transport.serve_packet(socket).await);
      });
    }
    Ok(())
  }

  /// Tear down in fixed order: protocol service, socket listener, TLS
  /// terminator, transport. Continues past individual failures and
  /// aggregates them; absent components are no-ops. Safe to call on an
  /// inbound in any partially-started state.
  pub async fn close(&self) -> Result<(), DispatchError> {
    let mut failures = CloseErrors::default();
    if let Err(error) = self.service.close().await {
      failures.push(error.into());
    }
    self.listener.close();
    if let Some(tls) = &self.tls {
      if let Err(error) = tls.close().await {
        failures.push(DispatchError::Tls(error));
      }
    }
    if let Some(transport) = &self.transport {
      if let Err(error) = transport.close().await {
        failures.push(DispatchError::Transport(error));
      }
    }
    failures.into_result()
  }

  /// Atomically replace the whole user table, keeping the protocol
  /// service's view and the dispatcher's table in lock-step. No partial
  /// updates: either both move to the new table or neither does.
  pub fn update_users(&self, users: &[UserOptions]) -> Result<(), DispatchError> {
    let table = UserTable::from_options(users);
    self.service.update_users(
      table.indices(),
      table.secrets(),
      users.iter().map(|user| user.alter_id).collect(),
    )?;
    self.dispatcher.users.replace(table);
    Ok(())
  }
}

fn log_serve_exit(tag: &str, result: Result<(), TransportError>) {
  if let Err(error) = result {
    if error.is_closed_or_canceled() {
      tracing::debug!(inbound = %tag, error = %error, "transport serve loop closed");
    } else {
      tracing::error!(inbound = %tag, error = %error, "transport serve error");
    }
  }
}
