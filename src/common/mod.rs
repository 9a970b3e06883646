// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

pub mod address;
pub mod authentication;
pub mod context;
pub mod error;
pub mod inbound;
pub mod listener;
pub mod metadata;
pub mod mux;
pub mod packet;
pub mod router;
pub mod service;
pub mod tls;
pub mod transport;
pub mod user;
