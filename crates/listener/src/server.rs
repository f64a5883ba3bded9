// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Element-Commercial
// Please see LICENSE files in the repository root for full details.

use std::{
    net::{IpAddr, Ipv6Addr, SocketAddr},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use hyper::{Request, Response};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Connection,
    service::TowerToHyperService,
};
use pin_project_lite::pin_project;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::OnceCell,
    task::JoinSet,
};
use tokio_rustls::rustls::ServerConfig;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tower::Service;
use tower_http::add_extension::AddExtension;
use tracing::Instrument;

use crate::{
    ConnectionInfoHandle,
    error::{DetectError, ServeError, ShutdownError},
    listener::MuxListener,
    stream::{MuxStream, Timeouts},
};

/// The port used when no address is configured
pub const DEFAULT_PORT: u16 = 8443;

/// An HTTP server which serves both plaintext HTTP and HTTPS on a single
/// port.
///
/// Every request served carries a [`ConnectionInfoHandle`] in its extensions,
/// see [`crate::connection_info`].
pub struct Server<S> {
    service: S,
    tls: Arc<ServerConfig>,
    address: SocketAddr,
    timeouts: Timeouts,
    name: Option<String>,
    started: AtomicBool,
    hard_shutdown_token: CancellationToken,
    soft_shutdown_token: CancellationToken,
    stopped_token: CancellationToken,
    shutdown: OnceCell<Result<(), ShutdownError>>,
}

impl<S> Server<S> {
    #[must_use]
    pub fn new(service: S, tls: Arc<ServerConfig>) -> Self {
        let hard_shutdown_token = CancellationToken::new();
        let soft_shutdown_token = hard_shutdown_token.child_token();

        Self {
            service,
            tls,
            address: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_PORT),
            timeouts: Timeouts::default(),
            name: None,
            started: AtomicBool::new(false),
            hard_shutdown_token,
            soft_shutdown_token,
            stopped_token: CancellationToken::new(),
            shutdown: OnceCell::new(),
        }
    }

    /// Set the address [`Server::listen_and_serve`] binds to
    #[must_use]
    pub const fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set a name for this server, recorded on the connection spans
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// Gracefully shut down the server.
    ///
    /// This stops accepting new connections, asks the active connections to
    /// finish their in-flight requests, and waits for them to close. If they
    /// are still around after `deadline`, they are aborted.
    ///
    /// Only the first call has an effect. Concurrent and later calls wait for
    /// that first shutdown and get the same result.
    ///
    /// # Errors
    ///
    /// Returns an error if the connections had to be aborted
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        self.shutdown
            .get_or_init(async || {
                tracing::info!(name = self.name.as_deref(), "Shutting down server");
                self.soft_shutdown_token.cancel();

                if !self.started.load(Ordering::Acquire) {
                    return Ok(());
                }

                if tokio::time::timeout(deadline, self.stopped_token.cancelled())
                    .await
                    .is_ok()
                {
                    return Ok(());
                }

                self.hard_shutdown_token.cancel();
                self.stopped_token.cancelled().await;
                Err(ShutdownError::DeadlineElapsed { deadline })
            })
            .await
            .clone()
    }
}

impl<S, B> Server<S>
where
    S: Service<Request<hyper::body::Incoming>, Response = Response<B>>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    /// Bind the configured address and serve connections on it until the
    /// server is shut down
    ///
    /// # Errors
    ///
    /// Returns an error if the address could not be bound, or if accepting
    /// connections failed
    pub async fn listen_and_serve(&self) -> Result<(), ServeError> {
        let listener = TcpListener::bind(self.address)
            .await
            .map_err(|source| ServeError::Bind {
                address: self.address,
                source,
            })?;

        self.serve(listener).await
    }

    /// Serve connections from the given listener until the server is shut
    /// down.
    ///
    /// Returns immediately if the server was already shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the server was already started, or if accepting
    /// connections failed
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServeError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServeError::AlreadyStarted);
        }

        // Mark the server as stopped even if this future is dropped or panics
        let _stopped = self.stopped_token.clone().drop_guard();

        let listener = MuxListener::new(listener, self.tls.clone()).with_timeouts(self.timeouts);
        if let Ok(address) = listener.local_addr() {
            tracing::info!(name = self.name.as_deref(), %address, "Listening for HTTP and HTTPS");
        }

        self.run(&listener).await
    }

    #[allow(clippy::too_many_lines)]
    async fn run(&self, listener: &MuxListener) -> Result<(), ServeError> {
        // This guard on the shutdown token is to ensure that if this task crashes for
        // any reason, the server will shut down
        let _guard = self.soft_shutdown_token.clone().drop_guard();

        // A JoinSet which collects connections that are being served
        let mut connection_tasks = JoinSet::new();

        let result = loop {
            tokio::select! {
                biased;

                // First look for the shutdown signal
                () = self.soft_shutdown_token.cancelled() => {
                    tracing::debug!("Shutting down listener");
                    break Ok(());
                },

                // Poll on the JoinSet to collect finished connections
                res = connection_tasks.join_next(), if !connection_tasks.is_empty() => {
                    match res {
                        Some(Ok(())) => { /* Connection finished, any errors should be logged in in the spawned task */ },
                        Some(Err(e)) => tracing::error!(error = &e as &dyn std::error::Error, "Join error"),
                        None => tracing::error!("Join set was polled even though it was empty"),
                    }
                },

                // Look for connections to accept
                res = listener.accept() => {
                    match res {
                        Ok(stream) => {
                            // The protocol detection happens in the connection task, so that a
                            // slow client doesn't hold up the accept loop
                            connection_tasks.spawn(self.connection_task(stream));
                        }
                        Err(e) if is_connection_error(&e) => {
                            tracing::warn!(error = &e as &dyn std::error::Error, "Failed to accept connection from the underlying socket");
                        }
                        Err(source) => break Err(ServeError::Accept { source }),
                    }
                },
            };
        };

        // Ask the active connections to finish, in case we stopped because of an
        // accept error
        self.soft_shutdown_token.cancel();

        // Wait for connections to cleanup
        if !connection_tasks.is_empty() {
            tracing::info!(
                "There are {active} active connections, performing a graceful shutdown",
                active = connection_tasks.len(),
            );

            while !connection_tasks.is_empty() {
                tokio::select! {
                    biased;

                    // Poll on the JoinSet to collect finished connections
                    res = connection_tasks.join_next() => {
                        match res {
                            Some(Ok(())) => { /* Connection finished, any errors should be logged in in the spawned task */ },
                            Some(Err(e)) => tracing::error!(error = &e as &dyn std::error::Error, "Join error"),
                            None => tracing::error!("Join set was polled even though it was empty"),
                        }
                    },

                    // Handle when we are asked to hard shutdown
                    () = self.hard_shutdown_token.cancelled() => {
                        tracing::warn!(
                            "Forcing shutdown ({active} active connections)",
                            active = connection_tasks.len(),
                        );
                        break;
                    },
                }
            }
        }

        connection_tasks.shutdown().await;
        result
    }

    /// Build the task serving a single connection
    fn connection_task(
        &self,
        stream: MuxStream<TcpStream>,
    ) -> impl Future<Output = ()> + Send + 'static {
        let span = tracing::info_span!(
            "http.connection",
            server.name = self.name.as_deref(),
            network.peer.address = tracing::field::Empty,
            network.peer.port = tracing::field::Empty,
            network.protocol.name = tracing::field::Empty,
        );

        if let Some(addr) = stream.connection_info().get_peer_addr() {
            span.record("network.peer.address", tracing::field::display(addr.ip()));
            span.record("network.peer.port", addr.port());
        }

        let info = stream.connection_info_handle();

        let mut builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
        builder.http1().keep_alive(true);

        // Attach the connection informations to every request served on it
        let service = TowerToHyperService::new(AddExtension::new(self.service.clone(), info));

        let connection = builder
            .serve_connection(TokioIo::new(stream), service)
            .into_owned();

        let token = self.soft_shutdown_token.child_token();

        async move {
            tracing::debug!("Accepted connection");
            if let Err(e) = AbortableConnection::new(connection, token).await {
                log_connection_error(&*e);
            }
        }
        .instrument(span)
    }
}

/// Errors which only affect the connection being accepted, and not the
/// listener itself
fn is_connection_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
    )
}

fn log_connection_error(e: &(dyn std::error::Error + 'static)) {
    match DetectError::find(e) {
        Some(detect) if detect.is_handshake_failure() => {
            tracing::warn!(
                error = detect as &dyn std::error::Error,
                "Failed to upgrade connection to TLS"
            );
        }
        Some(detect) => {
            tracing::debug!(
                error = detect as &dyn std::error::Error,
                "Failed to detect the connection protocol"
            );
        }
        None => tracing::warn!(error = e, "Failed to serve connection"),
    }
}

pin_project! {
    /// A wrapper around a connection that can be aborted when a shutdown signal is received.
    ///
    /// When the cancellation token fires, the connection starts a graceful shutdown: it
    /// stops accepting new requests, finishes the in-flight ones and closes.
    struct AbortableConnection<C> {
        #[pin]
        connection: C,
        #[pin]
        cancellation_future: WaitForCancellationFutureOwned,
        did_start_shutdown: bool,
    }
}

impl<C> AbortableConnection<C> {
    fn new(connection: C, cancellation_token: CancellationToken) -> Self {
        Self {
            connection,
            cancellation_future: cancellation_token.cancelled_owned(),
            did_start_shutdown: false,
        }
    }
}

impl<T, S, B> Future
    for AbortableConnection<Connection<'static, T, TowerToHyperService<S>, TokioExecutor>>
where
    Connection<'static, T, TowerToHyperService<S>, TokioExecutor>: Future,
    S: Service<Request<hyper::body::Incoming>, Response = Response<B>> + Send + Clone + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync,
    T: hyper::rt::Read + hyper::rt::Write + Unpin,
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Output = <Connection<'static, T, TowerToHyperService<S>, TokioExecutor> as Future>::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        if let Poll::Ready(()) = this.cancellation_future.poll(cx) {
            if !*this.did_start_shutdown {
                *this.did_start_shutdown = true;
                this.connection.as_mut().graceful_shutdown();
            }
        }

        this.connection.poll(cx)
    }
}
