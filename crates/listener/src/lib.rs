// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Element-Commercial
// Please see LICENSE files in the repository root for full details.

#![deny(rustdoc::missing_crate_level_docs)]
#![allow(clippy::module_name_repetitions)]

//! A [`hyper`] listener which serves plaintext HTTP and HTTPS on a single
//! port.
//!
//! Each accepted connection is classified on its first read: if the first
//! byte is a TLS handshake record marker, a TLS handshake is performed,
//! else the connection is served as plaintext. The bytes read for the
//! detection are replayed to whichever protocol ends up reading the
//! connection.

use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
};

use chrono::{DateTime, Utc};

use self::tls::TlsStreamInfo;

mod error;
pub mod listener;
pub mod rewind;
pub mod server;
pub mod stream;
pub mod tls;

#[cfg(test)]
mod test_utils;

pub use self::{
    error::{DetectError, ServeError, ShutdownError},
    listener::MuxListener,
    server::Server,
    stream::{DetectionState, MuxStream, Timeouts},
};

/// The first byte of a TLS record carrying a handshake message
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// The application protocol detected on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    /// Plaintext HTTP
    #[default]
    Http,

    /// HTTP over TLS
    Https,
}

impl Protocol {
    /// Classify a connection from the first byte it sent
    #[must_use]
    pub const fn classify(first_byte: u8) -> Self {
        if first_byte == TLS_HANDSHAKE_RECORD {
            Self::Https
        } else {
            Self::Http
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Informations about a connection, gathered while detecting its protocol
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    protocol: Protocol,
    tls: Option<TlsStreamInfo>,
    net_peer_addr: Option<SocketAddr>,
    detected_at: DateTime<Utc>,
}

impl ConnectionInfo {
    pub(crate) fn new(net_peer_addr: Option<SocketAddr>) -> Self {
        Self {
            protocol: Protocol::default(),
            tls: None,
            net_peer_addr,
            detected_at: Utc::now(),
        }
    }

    pub(crate) fn set_protocol(&mut self, protocol: Protocol) {
        self.protocol = protocol;
    }

    pub(crate) fn set_tls(&mut self, tls: TlsStreamInfo) {
        self.tls = Some(tls);
    }

    /// Look up the informations of the connection a request was received on
    ///
    /// Returns [`None`] if the request was not served by a [`Server`], or if
    /// the detection on its connection did not complete.
    #[must_use]
    pub fn from_request<B>(request: &http::Request<B>) -> Option<&Self> {
        connection_info(request.extensions())
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Returns informations about the TLS connection. Returns [`None`] if the
    /// connection was not TLS.
    #[must_use]
    pub fn get_tls_ref(&self) -> Option<&TlsStreamInfo> {
        self.tls.as_ref()
    }

    /// The negotiated TLS version, like `TLS 1.3`
    #[must_use]
    pub fn tls_version(&self) -> Option<&str> {
        self.tls.as_ref().map(TlsStreamInfo::version_name)
    }

    /// The IANA name of the negotiated cipher suite
    #[must_use]
    pub fn cipher_suite(&self) -> Option<&str> {
        self.tls.as_ref().map(TlsStreamInfo::cipher_suite_name)
    }

    /// Returns the remote peer address. Returns [`None`] if the transport
    /// doesn't have one.
    #[must_use]
    pub fn get_peer_addr(&self) -> Option<SocketAddr> {
        self.net_peer_addr
    }

    /// When the connection was accepted and handed to the protocol detection
    #[must_use]
    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }
}

/// A read-only handle on the [`ConnectionInfo`] of a connection.
///
/// The informations are published once the protocol detection, and for TLS
/// connections the handshake, completed. Before that, [`Self::get`] returns
/// [`None`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfoHandle {
    inner: Arc<OnceLock<ConnectionInfo>>,
}

impl ConnectionInfoHandle {
    #[must_use]
    pub fn get(&self) -> Option<&ConnectionInfo> {
        self.inner.get()
    }

    pub(crate) fn publish(&self, info: ConnectionInfo) {
        if self.inner.set(info).is_err() {
            tracing::error!("Connection informations were published twice, this is a bug!");
        }
    }
}

/// Get the [`ConnectionInfo`] of the connection a request was received on,
/// from the request extensions
#[must_use]
pub fn connection_info(extensions: &http::Extensions) -> Option<&ConnectionInfo> {
    extensions
        .get::<ConnectionInfoHandle>()
        .and_then(ConnectionInfoHandle::get)
}
