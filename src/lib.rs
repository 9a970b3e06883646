// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

//! Inbound negotiation and dispatch for stream tunneling protocols:
//! listening sockets, optional TLS termination and wire transports, an
//! opaque protocol service seam, and per-connection routing with stamped
//! inbound identity.

pub mod common;
pub mod util;
