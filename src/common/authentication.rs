// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

/// Outcome of the protocol layer's authentication step, passed positionally
/// to the dispatch callbacks.
///
/// A correctly wired protocol service only ever invokes its callbacks after
/// authenticating, so `user_index` is expected to be present; an absent
/// index is a contract violation the dispatcher rejects as
/// [`DispatchError::InvalidIdentity`](super::error::DispatchError::InvalidIdentity).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AuthenticationResult {
  user_index: Option<usize>,
}

impl AuthenticationResult {
  /// The principal at `index` in the user table authenticated successfully.
  pub fn for_user(index: usize) -> Self {
    Self {
      user_index: Some(index),
    }
  }

  /// No principal was resolved. Only a misbehaving protocol service
  /// produces this on the dispatch path.
  pub fn unauthenticated() -> Self {
    Self { user_index: None }
  }

  pub fn user_index(&self) -> Option<usize> {
    self.user_index
  }
}
