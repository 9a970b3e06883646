// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

//! The socket layer: owns the raw listening sockets, runs the stream accept
//! loop, and hands raw sockets over when a wire transport subsumes
//! listening instead.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, UdpSocket};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::address::TunnelAddress;
use super::context::{CloseNotifier, DispatchContext};
use super::error::ClosedOrCanceled;
use super::metadata::ConnectionMetadata;
use crate::util::stream::BoxedStream;

/// Inbound-specific behavior flags, stamped into every connection's
/// metadata for downstream routing to consult.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct InboundFlags {
  #[serde(default)]
  pub sniff: bool,
  #[serde(default)]
  pub sniff_override_destination: bool,
}

/// The `listen` options block. Read-only after construction.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ListenOptions {
  #[serde(default = "default_listen_address")]
  pub listen: IpAddr,
  #[serde(default)]
  pub listen_port: u16,
  /// Tag of the outbound this inbound's traffic detours to.
  #[serde(default)]
  pub detour: Option<String>,
  #[serde(flatten)]
  pub inbound: InboundFlags,
}

fn default_listen_address() -> IpAddr {
  IpAddr::V4(Ipv4Addr::LOCALHOST)
}

impl Default for ListenOptions {
  fn default() -> Self {
    Self {
      listen: default_listen_address(),
      listen_port: 0,
      detour: None,
      inbound: InboundFlags::default(),
    }
  }
}

impl ListenOptions {
  pub fn socket_addr(&self) -> SocketAddr {
    SocketAddr::new(self.listen, self.listen_port)
  }
}

/// Receives each connection the accept loop takes off the socket.
pub trait ConnectionHandler: Send + Sync {
  fn handle_connection(
    &self,
    context: DispatchContext,
    stream: BoxedStream,
    metadata: ConnectionMetadata,
    on_close: CloseNotifier,
  ) -> BoxFuture<'_, ()>;
}

/// Owner of the inbound's raw sockets.
///
/// Either [`start`](Self::start) runs the local accept loop, or a wire
/// transport takes the sockets via [`bind_stream`](Self::bind_stream) /
/// [`bind_packet`](Self::bind_packet) and serves them itself. Closing
/// cancels the accept loop; in-flight connection tasks are left to observe
/// their own stream's closure and unwind naturally.
pub struct Listener {
  options: ListenOptions,
  handler: Arc<dyn ConnectionHandler>,
  shutdown: CancellationToken,
  bound_stream: Mutex<Option<SocketAddr>>,
  bound_packet: Mutex<Option<SocketAddr>>,
}

impl Listener {
  pub fn new(options: ListenOptions, handler: Arc<dyn ConnectionHandler>) -> Self {
    Self {
      options,
      handler,
      shutdown: CancellationToken::new(),
      bound_stream: Mutex::new(None),
      bound_packet: Mutex::new(None),
    }
  }

  /// The stream address actually bound, once a socket exists. Differs from
  /// the configured address when the configuration asked for port 0.
  pub fn local_addr(&self) -> Option<SocketAddr> {
    *self
      .bound_stream
      .lock()
      .expect("listener bound-address lock poisoned")
  }

  /// The datagram address actually bound, when a transport asked for one.
  /// Tracked separately from the stream binding; a transport serving both
  /// networks gets two sockets.
  pub fn packet_addr(&self) -> Option<SocketAddr> {
    *self
      .bound_packet
      .lock()
      .expect("listener bound-address lock poisoned")
  }

  pub async fn bind_stream(&self) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(self.options.socket_addr()).await?;
    let local = listener.local_addr()?;
    *self
      .bound_stream
      .lock()
      .expect("listener bound-address lock poisoned") = Some(local);
    Ok(listener)
  }

  pub async fn bind_packet(&self) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(self.options.socket_addr()).await?;
    let local = socket.local_addr()?;
    *self
      .bound_packet
      .lock()
      .expect("listener bound-address lock poisoned") = Some(local);
    Ok(socket)
  }

  /// Bind and run the local stream accept loop as a background task.
  pub async fn start(&self) -> io::Result<()> {
    let listener = self.bind_stream().await?;
    let local = listener.local_addr()?;
    tracing::info!(address = %local, "inbound listener started");
    let handler = Arc::clone(&self.handler);
    let shutdown = self.shutdown.clone();
    tokio::spawn(
      accept_loop(listener, handler, shutdown)
        .instrument(tracing::debug_span!("accept_loop", address = %local)),
    );
    Ok(())
  }

  pub fn close(&self) {
    self.shutdown.cancel();
  }
}

async fn accept_loop(
  listener: TcpListener,
  handler: Arc<dyn ConnectionHandler>,
  shutdown: CancellationToken,
) {
  let incoming = TcpListenerStream::new(listener).take_until(shutdown.clone().cancelled_owned());
  incoming
    .for_each(|accepted| {
      let handler = Arc::clone(&handler);
      let shutdown = shutdown.clone();
      async move {
        match accepted {
          Ok(stream) => {
            let source = stream
              .peer_addr()
              .map(TunnelAddress::from)
              .unwrap_or_default();
            let context = DispatchContext::new(shutdown.child_token());
            let metadata =
              ConnectionMetadata::with_addresses(source, TunnelAddress::Unspecified);
            // One task per accepted connection; no connection's handshake
            // may stall another's.
            tokio::spawn(async move {
              handler
                .handle_connection(context, Box::new(stream), metadata, CloseNotifier::noop())
                .await;
            });
          }
          Err(error) => {
            if error.is_closed_or_canceled() {
              tracing::debug!(error = %error, "accept interrupted");
            } else {
              tracing::error!(error = %error, "accept failure");
            }
          }
        }
      }
    })
    .await;
  tracing::debug!("accept loop stopped");
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::FutureExt;
  use tokio::io::AsyncWriteExt;
  use tokio::sync::mpsc;

  struct RecordingHandler {
    delivered: mpsc::UnboundedSender<ConnectionMetadata>,
  }

  impl ConnectionHandler for RecordingHandler {
    fn handle_connection(
      &self,
      _context: DispatchContext,
      _stream: BoxedStream,
      metadata: ConnectionMetadata,
      on_close: CloseNotifier,
    ) -> BoxFuture<'_, ()> {
      let _ = self.delivered.send(metadata);
      on_close.notify(None);
      async move {}.boxed()
    }
  }

  #[tokio::test]
  async fn accepted_connections_reach_the_handler_with_their_source() {
    let (delivered, mut received) = mpsc::unbounded_channel();
    let listener = Listener::new(
      ListenOptions::default(),
      Arc::new(RecordingHandler { delivered }),
    );
    listener.start().await.unwrap();
    let address = listener.local_addr().expect("listener must be bound");

    let mut client = tokio::net::TcpStream::connect(address).await.unwrap();
    client.write_all(b"x").await.unwrap();

    let metadata = received.recv().await.expect("handler must be invoked");
    match metadata.source {
      TunnelAddress::Socket(source) => assert_eq!(source.ip(), address.ip()),
      other => panic!("expected socket source, got {other:?}"),
    }
    assert!(metadata.destination.is_unspecified());
    listener.close();
  }

  #[tokio::test]
  async fn close_stops_the_accept_loop() {
    let (delivered, mut received) = mpsc::unbounded_channel();
    let listener = Listener::new(
      ListenOptions::default(),
      Arc::new(RecordingHandler { delivered }),
    );
    listener.start().await.unwrap();
    let address = listener.local_addr().unwrap();
    listener.close();
    // Give the loop a moment to observe cancellation.
    tokio::task::yield_now().await;

    // A post-close connect may still succeed at the OS level, but no
    // handler delivery may happen once the loop has stopped.
    let _ = tokio::net::TcpStream::connect(address).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(received.try_recv().is_err());
  }

  #[tokio::test]
  async fn stream_and_packet_bindings_are_tracked_independently() {
    let (delivered, _received) = mpsc::unbounded_channel();
    let listener = Listener::new(
      ListenOptions::default(),
      Arc::new(RecordingHandler { delivered }),
    );
    let tcp = listener.bind_stream().await.unwrap();
    let udp = listener.bind_packet().await.unwrap();

    assert_eq!(listener.local_addr(), tcp.local_addr().ok());
    assert_eq!(listener.packet_addr(), udp.local_addr().ok());
  }

  #[test]
  fn listen_options_deserialize_with_defaults() {
    let options: ListenOptions =
      serde_json::from_value(serde_json::json!({ "listen_port": 8443 })).unwrap();
    assert_eq!(options.listen, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(options.listen_port, 8443);
    assert!(options.detour.is_none());
    assert!(!options.inbound.sniff);
  }
}
