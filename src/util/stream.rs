// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

use tokio::io::{AsyncRead, AsyncWrite};

/// An inbound byte stream: anything bidirectional, asynchronous, and
/// relocatable across tasks.
///
/// Accepted sockets, TLS-wrapped sockets, and in-memory duplex pipes all
/// qualify, which lets the dispatch pipeline treat "raw connection" and
/// "terminated connection" uniformly.
pub trait InboundStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> InboundStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// The boxed form handed between pipeline stages.
pub type BoxedStream = Box<dyn InboundStream>;

#[cfg(test)]
mod tests {
  use super::BoxedStream;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn boxed_streams_remain_usable_as_streams() {
    let (a, b) = tokio::io::duplex(64);
    let mut a: BoxedStream = Box::new(a);
    let mut b: BoxedStream = Box::new(b);
    a.write_all(b"ping").await.unwrap();
    a.shutdown().await.unwrap();
    let mut read = Vec::new();
    b.read_to_end(&mut read).await.unwrap();
    assert_eq!(read, b"ping");
  }
}
