// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Element-Commercial
// Please see LICENSE files in the repository root for full details.

use std::{net::SocketAddr, sync::Arc};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_rustls::{TlsAcceptor, rustls::ServerConfig};

use crate::stream::{MuxStream, Timeouts};

/// A TCP listener which yields [`MuxStream`]s.
///
/// Accepting a connection does not read anything from it: the protocol
/// detection happens when the connection is first read, in the task serving
/// it.
pub struct MuxListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    timeouts: Timeouts,
}

impl MuxListener {
    #[must_use]
    pub fn new(listener: TcpListener, config: Arc<ServerConfig>) -> Self {
        Self {
            listener,
            acceptor: TlsAcceptor::from(config),
            timeouts: Timeouts::default(),
        }
    }

    /// Bind a new TCP listener
    ///
    /// # Errors
    ///
    /// Returns an error if the address could not be bound
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: Arc<ServerConfig>,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(listener, config))
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Returns the local address this listener is bound to
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying socket has no local address
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    fn wrap(&self, stream: TcpStream, peer_addr: SocketAddr) -> MuxStream<TcpStream> {
        MuxStream::new(stream, self.acceptor.clone(), self.timeouts, Some(peer_addr))
    }

    /// Wait for the next connection
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying listener as-is
    pub async fn accept(&self) -> Result<MuxStream<TcpStream>, std::io::Error> {
        let (stream, peer_addr) = self.listener.accept().await?;
        Ok(self.wrap(stream, peer_addr))
    }
}
