// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Element-Commercial
// Please see LICENSE files in the repository root for full details.

use std::{
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll, ready},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{Sleep, Timeout},
};
use tokio_rustls::{Accept, TlsAcceptor, server::TlsStream};

use crate::{
    ConnectionInfo, ConnectionInfoHandle, Protocol, error::DetectError, rewind::Rewind,
    tls::TlsStreamInfo,
};

/// The default time a client has to send its first byte
pub const DEFAULT_DETECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// The default time a client has to complete the TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The two independent timeouts applied to a new connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// How long to wait for the first byte of the connection
    pub detection: Duration,

    /// How long the TLS handshake may take, once the connection was detected
    /// as TLS
    pub handshake: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            detection: DEFAULT_DETECTION_TIMEOUT,
            handshake: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Where a [`MuxStream`] is in its protocol detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionState {
    /// Nothing was read from the connection yet
    Undetected,

    /// The connection is served as plaintext
    PlaintextDetected,

    /// The connection was detected as TLS and the handshake is in progress
    TlsHandshaking,

    /// The TLS handshake completed
    TlsEstablished,

    /// The detection or the handshake failed, and the connection was closed
    Failed,
}

type Handshake<T> = Pin<Box<Timeout<Accept<Rewind<T>>>>>;

enum State<T> {
    Undetected {
        stream: Rewind<T>,
        deadline: Option<Pin<Box<Sleep>>>,
    },
    PlaintextDetected(Rewind<T>),
    TlsHandshaking(Handshake<T>),
    TlsEstablished(Box<TlsStream<Rewind<T>>>),
    Failed,
}

/// A connection which detects on its first read whether the client speaks
/// TLS or plaintext, and upgrades itself to TLS if needed.
///
/// The bytes read to detect the protocol are replayed, so the reader of this
/// stream sees exactly what the client sent, decrypted if it is TLS.
pub struct MuxStream<T> {
    state: State<T>,
    info: ConnectionInfo,
    handle: ConnectionInfoHandle,
    acceptor: TlsAcceptor,
    timeouts: Timeouts,
}

impl<T> MuxStream<T> {
    /// Wrap a freshly accepted connection. No I/O happens until the stream is
    /// first read.
    #[must_use]
    pub fn new(
        stream: T,
        acceptor: TlsAcceptor,
        timeouts: Timeouts,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            state: State::Undetected {
                stream: Rewind::new(stream),
                deadline: None,
            },
            info: ConnectionInfo::new(peer_addr),
            handle: ConnectionInfoHandle::default(),
            acceptor,
            timeouts,
        }
    }

    #[must_use]
    pub fn detection_state(&self) -> DetectionState {
        match self.state {
            State::Undetected { .. } => DetectionState::Undetected,
            State::PlaintextDetected(_) => DetectionState::PlaintextDetected,
            State::TlsHandshaking(_) => DetectionState::TlsHandshaking,
            State::TlsEstablished(_) => DetectionState::TlsEstablished,
            State::Failed => DetectionState::Failed,
        }
    }

    /// The informations gathered so far about this connection
    #[must_use]
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// A handle on the informations of this connection, filled once the
    /// detection completed
    #[must_use]
    pub fn connection_info_handle(&self) -> ConnectionInfoHandle {
        self.handle.clone()
    }
}

impl<T> MuxStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Drive the detection, and the TLS handshake if needed, until the stream
    /// is either ready to be read from or failed.
    fn poll_detect(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), DetectError>> {
        loop {
            match std::mem::replace(&mut self.state, State::Failed) {
                State::Undetected {
                    mut stream,
                    deadline,
                } => {
                    let mut deadline = deadline
                        .unwrap_or_else(|| Box::pin(tokio::time::sleep(self.timeouts.detection)));

                    let mut byte = [0; 1];
                    let mut buf = ReadBuf::new(&mut byte);
                    match Pin::new(&mut stream).poll_read(cx, &mut buf) {
                        Poll::Ready(Ok(())) => {
                            if buf.filled().is_empty() {
                                return Poll::Ready(Err(DetectError::UnexpectedEof));
                            }
                        }

                        Poll::Ready(Err(e)) => return Poll::Ready(Err(DetectError::read(e))),

                        Poll::Pending => {
                            if deadline.as_mut().poll(cx).is_ready() {
                                return Poll::Ready(Err(DetectError::DetectionTimeout {
                                    timeout: self.timeouts.detection,
                                }));
                            }

                            self.state = State::Undetected {
                                stream,
                                deadline: Some(deadline),
                            };
                            return Poll::Pending;
                        }
                    }

                    // Put the byte back so that the next reader sees it, and drop the
                    // detection deadline
                    let first_byte = byte[0];
                    stream.rewind(Bytes::copy_from_slice(&byte));
                    drop(deadline);

                    let protocol = Protocol::classify(first_byte);
                    self.info.set_protocol(protocol);
                    tracing::Span::current().record("network.protocol.name", protocol.as_str());

                    match protocol {
                        Protocol::Http => {
                            tracing::debug!(first_byte, "Detected plaintext connection");
                            self.handle.publish(self.info.clone());
                            self.state = State::PlaintextDetected(stream);
                            return Poll::Ready(Ok(()));
                        }

                        Protocol::Https => {
                            tracing::debug!("Detected TLS connection, starting handshake");
                            let accept = self.acceptor.accept(stream);
                            self.state = State::TlsHandshaking(Box::pin(tokio::time::timeout(
                                self.timeouts.handshake,
                                accept,
                            )));
                        }
                    }
                }

                State::TlsHandshaking(mut handshake) => match handshake.as_mut().poll(cx) {
                    Poll::Pending => {
                        self.state = State::TlsHandshaking(handshake);
                        return Poll::Pending;
                    }

                    Poll::Ready(Err(_elapsed)) => {
                        return Poll::Ready(Err(DetectError::HandshakeTimeout {
                            timeout: self.timeouts.handshake,
                        }));
                    }

                    Poll::Ready(Ok(Err(e))) => return Poll::Ready(Err(DetectError::handshake(e))),

                    Poll::Ready(Ok(Ok(stream))) => {
                        let (_, connection) = stream.get_ref();
                        if let Some(tls) = TlsStreamInfo::from_connection(connection) {
                            tracing::debug!(
                                tls.version = tls.version_name(),
                                tls.cipher_suite = tls.cipher_suite_name(),
                                "TLS handshake completed"
                            );
                            self.info.set_tls(tls);
                        }

                        self.handle.publish(self.info.clone());
                        self.state = State::TlsEstablished(Box::new(stream));
                        return Poll::Ready(Ok(()));
                    }
                },

                State::Failed => return Poll::Ready(Err(DetectError::Closed)),

                state @ (State::PlaintextDetected(_) | State::TlsEstablished(_)) => {
                    self.state = state;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<T> AsyncRead for MuxStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_detect(cx))?;

        match &mut this.state {
            State::PlaintextDetected(stream) => Pin::new(stream).poll_read(cx, buf),
            State::TlsEstablished(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            _ => Poll::Ready(Err(DetectError::Closed.into())),
        }
    }
}

impl<T> AsyncWrite for MuxStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match &mut this.state {
            // Writing doesn't trigger the detection, it goes straight to the socket
            State::Undetected { stream, .. } | State::PlaintextDetected(stream) => {
                Pin::new(stream).poll_write(cx, buf)
            }
            State::TlsEstablished(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            State::TlsHandshaking(_) | State::Failed => {
                ready!(this.poll_detect(cx))?;
                Pin::new(this).poll_write(cx, buf)
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match &mut this.state {
            State::Undetected { stream, .. } | State::PlaintextDetected(stream) => {
                Pin::new(stream).poll_flush(cx)
            }
            State::TlsEstablished(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            State::TlsHandshaking(_) => Poll::Ready(Ok(())),
            State::Failed => Poll::Ready(Err(DetectError::Closed.into())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match &mut this.state {
            State::Undetected { stream, .. } | State::PlaintextDetected(stream) => {
                Pin::new(stream).poll_shutdown(cx)
            }
            State::TlsEstablished(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            State::TlsHandshaking(_) => {
                // Abandon the handshake, which closes the socket
                this.state = State::Failed;
                Poll::Ready(Ok(()))
            }
            State::Failed => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tracing::{
        Instrument, Subscriber,
        field::{Field, Visit},
        span::{Id, Record},
    };
    use tracing_subscriber::{Layer, layer::SubscriberExt};

    use super::*;
    use crate::test_utils::TestCertificate;

    /// Keeps the last protocol recorded on a span
    #[derive(Clone, Default)]
    struct RecordedProtocol(Arc<Mutex<Option<String>>>);

    impl Visit for RecordedProtocol {
        fn record_str(&mut self, field: &Field, value: &str) {
            if field.name() == "network.protocol.name" {
                *self.0.lock().unwrap() = Some(value.to_owned());
            }
        }

        fn record_debug(&mut self, _field: &Field, _value: &dyn std::fmt::Debug) {}
    }

    impl<S: Subscriber> Layer<S> for RecordedProtocol {
        fn on_record(
            &self,
            _id: &Id,
            values: &Record<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            values.record(&mut self.clone());
        }
    }

    fn wrap(stream: DuplexStream, certificate: &TestCertificate) -> MuxStream<DuplexStream> {
        MuxStream::new(
            stream,
            TlsAcceptor::from(certificate.server_config()),
            Timeouts::default(),
            Some("192.0.2.1:4242".parse().unwrap()),
        )
    }

    #[tokio::test]
    async fn plaintext_bytes_are_replayed() {
        let certificate = TestCertificate::generate();
        let (mut client, server) = tokio::io::duplex(1024);
        let mut stream = wrap(server, &certificate);
        let handle = stream.connection_info_handle();
        assert_eq!(stream.detection_state(), DetectionState::Undetected);

        let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, request);
        assert_eq!(stream.detection_state(), DetectionState::PlaintextDetected);

        let info = handle.get().unwrap();
        assert_eq!(info.protocol(), Protocol::Http);
        assert!(!info.is_tls());
        assert!(info.tls_version().is_none());
        assert!(info.cipher_suite().is_none());
        assert_eq!(info.get_peer_addr(), Some("192.0.2.1:4242".parse().unwrap()));
    }

    #[tokio::test]
    async fn detected_protocol_is_recorded_on_the_span() {
        let recorded = RecordedProtocol::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(recorded.clone()));

        let certificate = TestCertificate::generate();
        let (mut client, server) = tokio::io::duplex(1024);
        let mut stream = wrap(server, &certificate);

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        drop(client);

        let span = tracing::info_span!(
            "http.connection",
            network.protocol.name = tracing::field::Empty
        );
        let mut received = Vec::new();
        stream.read_to_end(&mut received).instrument(span).await.unwrap();

        assert_eq!(recorded.0.lock().unwrap().as_deref(), Some("HTTP"));
    }

    #[tokio::test]
    async fn single_byte_connection_is_not_lost() {
        let certificate = TestCertificate::generate();
        let (mut client, server) = tokio::io::duplex(1024);
        let mut stream = wrap(server, &certificate);

        client.write_all(b"x").await.unwrap();
        drop(client);

        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"x");
    }

    #[tokio::test]
    async fn tls_connection_is_decrypted() {
        let certificate = TestCertificate::generate();
        let (client, server) = tokio::io::duplex(16 * 1024);
        let mut stream = wrap(server, &certificate);
        let handle = stream.connection_info_handle();

        let client = tokio::spawn({
            let connector = certificate.connector();
            async move {
                let mut tls = connector
                    .connect(TestCertificate::server_name(), client)
                    .await
                    .unwrap();
                tls.write_all(b"hello over TLS").await.unwrap();
                tls.flush().await.unwrap();

                let mut reply = [0; 4];
                tls.read_exact(&mut reply).await.unwrap();
                reply
            }
        });

        let mut received = [0; 14];
        stream.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"hello over TLS");
        assert_eq!(stream.detection_state(), DetectionState::TlsEstablished);

        stream.write_all(b"pong").await.unwrap();
        stream.flush().await.unwrap();
        assert_eq!(&client.await.unwrap(), b"pong");

        let info = handle.get().unwrap();
        assert_eq!(info.protocol(), Protocol::Https);
        assert!(info.is_tls());
        assert!(!info.tls_version().unwrap().is_empty());
        assert!(!info.cipher_suite().unwrap().is_empty());
        assert_eq!(
            info.get_tls_ref().unwrap().sni_hostname.as_deref(),
            Some("localhost")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_hits_the_detection_timeout() {
        let certificate = TestCertificate::generate();
        let (_client, server) = tokio::io::duplex(1024);
        let mut stream = wrap(server, &certificate);

        let mut buf = [0; 16];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        let err = DetectError::find(&err).unwrap();
        assert!(matches!(err, DetectError::DetectionTimeout { .. }));
        assert_eq!(stream.detection_state(), DetectionState::Failed);
        assert!(stream.connection_info_handle().get().is_none());

        // The connection stays failed
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(
            DetectError::find(&err),
            Some(DetectError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshake_hits_the_handshake_timeout() {
        let certificate = TestCertificate::generate();
        let (mut client, server) = tokio::io::duplex(1024);
        let mut stream = wrap(server, &certificate);

        // Send the handshake record marker well within the detection timeout, then
        // stall for longer than the detection timeout
        client.write_all(&[0x16]).await.unwrap();

        let start = tokio::time::Instant::now();
        let mut buf = [0; 16];
        let err = stream.read(&mut buf).await.unwrap_err();
        let err = DetectError::find(&err).unwrap();
        assert!(
            matches!(err, DetectError::HandshakeTimeout { timeout } if *timeout == DEFAULT_HANDSHAKE_TIMEOUT)
        );
        assert!(err.is_handshake_failure());
        assert!(start.elapsed() >= DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(stream.detection_state(), DetectionState::Failed);
    }

    #[tokio::test]
    async fn eof_before_first_byte_fails_detection() {
        let certificate = TestCertificate::generate();
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = wrap(server, &certificate);
        drop(client);

        let mut buf = [0; 16];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        assert!(DetectError::find(&err).unwrap().is_detection_failure());
    }

    #[tokio::test]
    async fn garbage_after_handshake_marker_fails_the_handshake() {
        let certificate = TestCertificate::generate();
        let (mut client, server) = tokio::io::duplex(1024);
        let mut stream = wrap(server, &certificate);

        // A handshake record announcing a payload larger than TLS allows
        client.write_all(&[0x16, 0x03, 0x01, 0xff, 0xff]).await.unwrap();
        drop(client);

        let mut buf = [0; 16];
        let err = stream.read(&mut buf).await.unwrap_err();
        let err = DetectError::find(&err).unwrap();
        assert!(matches!(err, DetectError::Handshake { .. }));
        assert_eq!(stream.detection_state(), DetectionState::Failed);
    }

    #[tokio::test]
    async fn writes_before_detection_go_to_the_socket() {
        let certificate = TestCertificate::generate();
        let (mut client, server) = tokio::io::duplex(1024);
        let mut stream = MuxStream::new(
            server,
            TlsAcceptor::from(certificate.server_config()),
            Timeouts::default(),
            None,
        );

        stream.write_all(b"banner").await.unwrap();
        assert_eq!(stream.detection_state(), DetectionState::Undetected);

        let mut buf = [0; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"banner");
    }
}
