// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Element-Commercial
// Please see LICENSE files in the repository root for full details.

use std::{net::SocketAddr, time::Duration};

use thiserror::Error;

/// An error which happened while detecting the protocol of a connection or
/// while upgrading it to TLS.
///
/// Those errors are fatal to the connection they happened on. They reach the
/// serving stack wrapped in an [`std::io::Error`]; use [`DetectError::find`]
/// to get them back.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DetectError {
    #[error("no data received within {timeout:?} to detect the protocol")]
    DetectionTimeout { timeout: Duration },

    #[error("connection closed before any data was received")]
    UnexpectedEof,

    #[error("failed to read from the connection while detecting the protocol")]
    Read {
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake did not complete within {timeout:?}")]
    HandshakeTimeout { timeout: Duration },

    #[error("failed to complete the TLS handshake")]
    Handshake {
        #[source]
        source: std::io::Error,
    },

    #[error("connection is closed after a failed protocol detection")]
    Closed,
}

impl DetectError {
    pub(crate) fn read(source: std::io::Error) -> Self {
        Self::Read { source }
    }

    pub(crate) fn handshake(source: std::io::Error) -> Self {
        Self::Handshake { source }
    }

    /// Whether the error happened before the protocol could be detected
    #[must_use]
    pub fn is_detection_failure(&self) -> bool {
        matches!(
            self,
            Self::DetectionTimeout { .. } | Self::UnexpectedEof | Self::Read { .. }
        )
    }

    /// Whether the error happened during the TLS handshake
    #[must_use]
    pub fn is_handshake_failure(&self) -> bool {
        matches!(self, Self::HandshakeTimeout { .. } | Self::Handshake { .. })
    }

    /// Look for a [`DetectError`] in an error and its sources
    #[must_use]
    pub fn find<'a>(error: &'a (dyn std::error::Error + 'static)) -> Option<&'a Self> {
        let mut current = Some(error);
        while let Some(error) = current {
            if let Some(detect) = error.downcast_ref::<Self>() {
                return Some(detect);
            }

            // `std::io::Error` skips its inner error when walking the sources, so we
            // have to look into it explicitly
            if let Some(detect) = error
                .downcast_ref::<std::io::Error>()
                .and_then(std::io::Error::get_ref)
                .and_then(|inner| inner.downcast_ref::<Self>())
            {
                return Some(detect);
            }

            current = error.source();
        }

        None
    }

    fn kind(&self) -> std::io::ErrorKind {
        match self {
            Self::DetectionTimeout { .. } | Self::HandshakeTimeout { .. } => {
                std::io::ErrorKind::TimedOut
            }
            Self::UnexpectedEof => std::io::ErrorKind::UnexpectedEof,
            Self::Read { source } => source.kind(),
            Self::Handshake { .. } => std::io::ErrorKind::InvalidData,
            Self::Closed => std::io::ErrorKind::NotConnected,
        }
    }
}

impl From<DetectError> for std::io::Error {
    fn from(error: DetectError) -> Self {
        Self::new(error.kind(), error)
    }
}

/// An error which stopped a [`Server`](crate::Server) from serving
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServeError {
    #[error("failed to bind to {address}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to accept a connection")]
    Accept {
        #[source]
        source: std::io::Error,
    },

    #[error("the server was already started")]
    AlreadyStarted,
}

/// An error returned by [`Server::shutdown`](crate::Server::shutdown)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ShutdownError {
    #[error("connections did not finish within {deadline:?}, they were aborted")]
    DeadlineElapsed { deadline: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_through_io_errors() {
        let error: std::io::Error = DetectError::HandshakeTimeout {
            timeout: Duration::from_secs(10),
        }
        .into();
        assert_eq!(error.kind(), std::io::ErrorKind::TimedOut);

        let found = DetectError::find(&error).unwrap();
        assert!(found.is_handshake_failure());
        assert!(!found.is_detection_failure());

        // Wrapped once more, like hyper does with IO errors
        #[derive(Debug, Error)]
        #[error("outer")]
        struct Outer(#[source] std::io::Error);

        let outer = Outer(DetectError::UnexpectedEof.into());
        let found = DetectError::find(&outer).unwrap();
        assert!(found.is_detection_failure());
    }

    #[test]
    fn plain_io_errors_are_not_detection_errors() {
        let error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken");
        assert!(DetectError::find(&error).is_none());
    }
}
