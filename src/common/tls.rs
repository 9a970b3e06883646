// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

//! TLS termination seam, plus the rustls-backed default terminator.
//!
//! The dispatcher only drives the terminator through [`TlsTerminator`];
//! when a wire transport is configured, termination belongs to the
//! transport instead and this seam is bypassed entirely.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use super::error::ClosedOrCanceled;
use crate::util::stream::BoxedStream;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TlsOptions {
  pub certificate_path: PathBuf,
  pub key_path: PathBuf,
  #[serde(default)]
  pub alpn: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum TlsError {
  #[error("read certificate material from {path}")]
  CertificateLoad {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("no private key found in {path}")]
  NoPrivateKey { path: PathBuf },
  #[error("invalid certificate or key material")]
  InvalidKeyMaterial(#[source] rustls::Error),
  #[error("tls server handshake")]
  Handshake(#[source] io::Error),
}

impl ClosedOrCanceled for TlsError {
  fn is_closed_or_canceled(&self) -> bool {
    match self {
      TlsError::Handshake(source) => source.is_closed_or_canceled(),
      _ => false,
    }
  }
}

/// Server-side TLS termination of a raw inbound stream.
pub trait TlsTerminator: Send + Sync {
  fn start(&self) -> BoxFuture<'_, Result<(), TlsError>>;

  fn close(&self) -> BoxFuture<'_, Result<(), TlsError>>;

  /// Run the server handshake, yielding the decrypted stream.
  fn server_handshake(&self, stream: BoxedStream) -> BoxFuture<'_, Result<BoxedStream, TlsError>>;
}

/// Builds a terminator from the inbound's `tls` options block.
pub trait TlsFactory: Send + Sync {
  fn create(&self, options: &TlsOptions) -> Result<Arc<dyn TlsTerminator>, TlsError>;
}

fn load_certificates(path: &Path) -> Result<Vec<rustls::Certificate>, TlsError> {
  let file = File::open(path).map_err(|source| TlsError::CertificateLoad {
    path: path.to_owned(),
    source,
  })?;
  let mut reader = BufReader::new(file);
  let certs = rustls_pemfile::certs(&mut reader).map_err(|source| TlsError::CertificateLoad {
    path: path.to_owned(),
    source,
  })?;
  if certs.is_empty() {
    return Err(TlsError::CertificateLoad {
      path: path.to_owned(),
      source: io::Error::new(io::ErrorKind::InvalidData, "no certificates found"),
    });
  }
  Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<rustls::PrivateKey, TlsError> {
  let file = File::open(path).map_err(|source| TlsError::CertificateLoad {
    path: path.to_owned(),
    source,
  })?;
  let mut reader = BufReader::new(file);
  loop {
    let item = rustls_pemfile::read_one(&mut reader).map_err(|source| {
      TlsError::CertificateLoad {
        path: path.to_owned(),
        source,
      }
    })?;
    match item {
      Some(rustls_pemfile::Item::RSAKey(key))
      | Some(rustls_pemfile::Item::PKCS8Key(key))
      | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(rustls::PrivateKey(key)),
      Some(_) => continue,
      None => {
        return Err(TlsError::NoPrivateKey {
          path: path.to_owned(),
        })
      }
    }
  }
}

/// Rustls-backed [`TlsTerminator`] loading a PEM certificate chain and key.
pub struct RustlsTerminator {
  acceptor: tokio_rustls::TlsAcceptor,
}

impl RustlsTerminator {
  pub fn new(options: &TlsOptions) -> Result<Self, TlsError> {
    let certificates = load_certificates(&options.certificate_path)?;
    let key = load_private_key(&options.key_path)?;
    let mut config = rustls::ServerConfig::builder()
      .with_safe_defaults()
      .with_no_client_auth()
      .with_single_cert(certificates, key)
      .map_err(TlsError::InvalidKeyMaterial)?;
    config.alpn_protocols = options
      .alpn
      .iter()
      .map(|protocol| protocol.as_bytes().to_vec())
      .collect();
    Ok(Self {
      acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
    })
  }
}

impl TlsTerminator for RustlsTerminator {
  fn start(&self) -> BoxFuture<'_, Result<(), TlsError>> {
    async move { Ok(()) }.boxed()
  }

  fn close(&self) -> BoxFuture<'_, Result<(), TlsError>> {
    async move { Ok(()) }.boxed()
  }

  fn server_handshake(&self, stream: BoxedStream) -> BoxFuture<'_, Result<BoxedStream, TlsError>> {
    let acceptor = self.acceptor.clone();
    async move {
      let stream = acceptor
        .accept(stream)
        .await
        .map_err(TlsError::Handshake)?;
      Ok(Box::new(stream) as BoxedStream)
    }
    .boxed()
  }
}

/// Default [`TlsFactory`] producing [`RustlsTerminator`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustlsFactory;

impl TlsFactory for RustlsFactory {
  fn create(&self, options: &TlsOptions) -> Result<Arc<dyn TlsTerminator>, TlsError> {
    Ok(Arc::new(RustlsTerminator::new(options)?))
  }
}
