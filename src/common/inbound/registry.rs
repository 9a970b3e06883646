// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

//! Explicit construction-time registry mapping protocol type tags to
//! inbound constructors. Owned by the composition root and consulted once
//! per configured inbound; nothing global, nothing registered as a side
//! effect of linking.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Inbound, InboundComponents, InboundOptions};
use crate::common::error::DispatchError;

pub type InboundConstructor =
  Box<dyn Fn(&str, InboundOptions, InboundComponents) -> Result<Arc<Inbound>, DispatchError> + Send + Sync>;

#[derive(Default)]
pub struct InboundRegistry {
  constructors: HashMap<String, InboundConstructor>,
}

impl InboundRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register the standard [`Inbound`] constructor under `type_tag`.
  /// Replaces any previous registration for the same tag.
  pub fn register(&mut self, type_tag: impl Into<String>) {
    let type_tag = type_tag.into();
    let constructor_tag = type_tag.clone();
    self.constructors.insert(
      type_tag,
      Box::new(move |tag, options, components| {
        Inbound::new(constructor_tag.clone(), tag, options, components)
      }),
    );
  }

  /// Register a custom constructor, for protocol types that need to wrap
  /// or replace the standard construction path.
  pub fn register_with(&mut self, type_tag: impl Into<String>, constructor: InboundConstructor) {
    self.constructors.insert(type_tag.into(), constructor);
  }

  pub fn create(
    &self,
    type_tag: &str,
    tag: &str,
    options: InboundOptions,
    components: InboundComponents,
  ) -> Result<Arc<Inbound>, DispatchError> {
    let constructor = self
      .constructors
      .get(type_tag)
      .ok_or_else(|| DispatchError::Configuration(format!("unknown inbound type: {type_tag}")))?;
    constructor(tag, options, components)
  }

  pub fn contains(&self, type_tag: &str) -> bool {
    self.constructors.contains_key(type_tag)
  }

  pub fn types(&self) -> impl Iterator<Item = &str> {
    self.constructors.keys().map(String::as_str)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  use futures::future::BoxFuture;
  use futures::FutureExt;

  use crate::common::context::DispatchContext;
  use crate::common::metadata::ConnectionMetadata;
  use crate::common::packet::BoxedPacketConn;
  use crate::common::router::{ConnectionRouter, RouteError};
  use crate::common::service::{
    ServiceError, ServiceFactory, ServiceHandle, ServiceOptions, StreamDelegate,
  };
  use crate::common::user::UserOptions;
  use crate::util::stream::BoxedStream;
  use uuid::Uuid;

  struct NullRouter;

  impl ConnectionRouter for NullRouter {
    fn route_connection(
      &self,
      _context: DispatchContext,
      _stream: BoxedStream,
      _metadata: ConnectionMetadata,
    ) -> BoxFuture<'_, Result<(), RouteError>> {
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

  struct NullService;

  impl ServiceHandle for NullService {
    fn start(&self) -> BoxFuture<'_, Result<(), ServiceError>> {
      async move { Ok(()) }.boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ServiceError>> {
      async move { Ok(()) }.boxed()
    }

    fn update_users(
      &self,
      _indices: Vec<usize>,
      _secrets: Vec<Uuid>,
      _alter_ids: Vec<u16>,
    ) -> Result<(), ServiceError> {
      Ok(())
    }

    fn new_connection(
      &self,
      _context: DispatchContext,
      _stream: BoxedStream,
      _identity_hint: ConnectionMetadata,
    ) -> BoxFuture<'_, Result<(), DispatchError>> {
      async move { Ok(()) }.boxed()
    }
  }

  struct NullServiceFactory {
    created: Mutex<Vec<ServiceOptions>>,
  }

  impl ServiceFactory for NullServiceFactory {
    fn create(
      &self,
      options: ServiceOptions,
      _delegate: Arc<dyn StreamDelegate>,
    ) -> Result<Arc<dyn ServiceHandle>, ServiceError> {
      self.created.lock().unwrap().push(options);
      Ok(Arc::new(NullService))
    }
  }

  fn components() -> InboundComponents {
    InboundComponents::new(
      Arc::new(NullRouter),
      Arc::new(NullServiceFactory {
        created: Mutex::new(Vec::new()),
      }),
    )
  }

  #[test]
  fn registered_types_construct_inbounds() {
    let mut registry = InboundRegistry::new();
    registry.register("stp");
    assert!(registry.contains("stp"));

    let options = InboundOptions {
      users: vec![UserOptions {
        name: "alice".to_owned(),
        uuid: Uuid::from_u128(1),
        alter_id: 0,
      }],
      ..Default::default()
    };
    let inbound = registry
      .create("stp", "in-main", options, components())
      .unwrap();
    assert_eq!(inbound.tag(), "in-main");
  }

  #[test]
  fn unknown_types_are_a_configuration_error() {
    let registry = InboundRegistry::new();
    let error = registry
      .create("stp", "in-main", InboundOptions::default(), components())
      .unwrap_err();
    assert!(matches!(error, DispatchError::Configuration(_)));
  }

  #[test]
  fn re_registration_replaces_the_constructor() {
    let mut registry = InboundRegistry::new();
    registry.register("stp");
    registry.register_with(
      "stp",
      Box::new(|_tag, _options, _components| {
        Err(DispatchError::Configuration("replaced".to_owned()))
      }),
    );

    let error = registry
      .create("stp", "in-main", InboundOptions::default(), components())
      .unwrap_err();
    assert!(matches!(error, DispatchError::Configuration(message) if message == "replaced"));
  }
}
