// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

use std::borrow::Cow;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One configured principal, as declared in the inbound's `users` list.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct UserOptions {
  /// Display name; may be empty, in which case the user is identified by
  /// its position in the list.
  #[serde(default)]
  pub name: String,
  /// The protocol credential.
  pub uuid: Uuid,
  #[serde(default)]
  pub alter_id: u16,
}

/// A resolved principal. The index is the user's 0-based position in the
/// configuration and doubles as the identity the protocol service hands
/// back after authentication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
  pub index: usize,
  pub name: String,
  pub secret: Uuid,
}

/// An immutable snapshot of the configured principals.
///
/// Tables are never edited in place; updates construct a new table and swap
/// it in wholesale through [`SharedUserTable::replace`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserTable {
  users: Vec<User>,
}

impl UserTable {
  pub fn from_options(options: &[UserOptions]) -> Self {
    Self {
      users: options
        .iter()
        .enumerate()
        .map(|(index, user)| User {
          index,
          name: user.name.clone(),
          secret: user.uuid,
        })
        .collect(),
    }
  }

  pub fn len(&self) -> usize {
    self.users.len()
  }

  pub fn is_empty(&self) -> bool {
    self.users.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<&User> {
    self.users.get(index)
  }

  /// The indices handed to the protocol service; by construction these are
  /// exactly the valid positions of this table.
  pub fn indices(&self) -> Vec<usize> {
    (0..self.users.len()).collect()
  }

  pub fn secrets(&self) -> Vec<Uuid> {
    self.users.iter().map(|user| user.secret).collect()
  }

  /// Display name for the principal at `index`: the configured name, or the
  /// decimal rendering of the index when the name is empty. `None` when the
  /// index is not (any longer) part of the table.
  pub fn display_name(&self, index: usize) -> Option<Cow<'_, str>> {
    self.get(index).map(|user| {
      if user.name.is_empty() {
        Cow::Owned(index.to_string())
      } else {
        Cow::Borrowed(user.name.as_str())
      }
    })
  }
}

/// The live user table, shared between the dispatcher and whoever performs
/// configuration reloads.
///
/// Readers take a full snapshot; a concurrent [`replace`](Self::replace)
/// leaves them on the table they started with, so a reader observes either
/// the old or the new configuration in full, never a mix.
#[derive(Debug, Default)]
pub struct SharedUserTable {
  inner: ArcSwap<UserTable>,
}

impl SharedUserTable {
  pub fn new(table: UserTable) -> Self {
    Self {
      inner: ArcSwap::from_pointee(table),
    }
  }

  pub fn snapshot(&self) -> Arc<UserTable> {
    self.inner.load_full()
  }

  /// Atomically swap in a replacement table.
  pub fn replace(&self, table: UserTable) {
    self.inner.store(Arc::new(table));
  }
}
