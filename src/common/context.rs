// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

use super::error::DispatchError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for one accepted connection, used to correlate
/// log events across the pipeline stages that touch it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
  fn next() -> Self {
    ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Per-connection call context threaded through every dispatch stage.
///
/// Carries the connection's log-correlation id and the shutdown token whose
/// cancellation the stage may observe. Cloning is cheap; clones refer to the
/// same logical connection.
#[derive(Clone, Debug)]
pub struct DispatchContext {
  id: ConnectionId,
  shutdown: CancellationToken,
}

impl DispatchContext {
  /// Create a context for a newly accepted connection, assigning a fresh id.
  pub fn new(shutdown: CancellationToken) -> Self {
    Self {
      id: ConnectionId::next(),
      shutdown,
    }
  }

  pub fn id(&self) -> ConnectionId {
    self.id
  }

  pub fn shutdown(&self) -> &CancellationToken {
    &self.shutdown
  }

  pub fn is_canceled(&self) -> bool {
    self.shutdown.is_cancelled()
  }
}

/// One-shot notification that a connection's handshake phase has concluded.
///
/// The accept layer hands one of these alongside each connection so its
/// resource tracking learns about handshake failure exactly once; consuming
/// `notify` makes a second invocation unrepresentable.
pub struct CloseNotifier {
  callback: Option<Box<dyn FnOnce(Option<&DispatchError>) + Send>>,
}

impl CloseNotifier {
  pub fn new(callback: impl FnOnce(Option<&DispatchError>) + Send + 'static) -> Self {
    Self {
      callback: Some(Box::new(callback)),
    }
  }

  /// A notifier with no observer attached.
  pub fn noop() -> Self {
    Self { callback: None }
  }

  /// Report the handshake outcome, `None` meaning the handshake succeeded.
  pub fn notify(mut self, failure: Option<&DispatchError>) {
    if let Some(callback) = self.callback.take() {
      callback(failure);
    }
  }
}

impl fmt::Debug for CloseNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CloseNotifier")
      .field("attached", &self.callback.is_some())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  #[test]
  fn context_ids_are_unique() {
    let a = DispatchContext::new(CancellationToken::new());
    let b = DispatchContext::new(CancellationToken::new());
    assert_ne!(a.id(), b.id());
  }

  #[test]
  fn close_notifier_fires_exactly_once() {
    let count = Arc::new(AtomicUsize::new(0));
    let notifier = {
      let count = Arc::clone(&count);
      CloseNotifier::new(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
      })
    };
    notifier.notify(None);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    // `notify` consumes the notifier; a second call cannot be expressed.
  }
}
