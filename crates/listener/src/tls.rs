// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Element-Commercial
// Please see LICENSE files in the repository root for full details.

use tokio_rustls::rustls::{
    CipherSuite, ProtocolVersion, ServerConnection, pki_types::CertificateDer,
};

/// Informations about a TLS session, captured once its handshake completed
#[derive(Debug, Clone)]
pub struct TlsStreamInfo {
    pub protocol_version: ProtocolVersion,
    pub cipher_suite: CipherSuite,
    pub sni_hostname: Option<String>,
    pub alpn_protocol: Option<Vec<u8>>,
    pub peer_certificates: Option<Vec<CertificateDer<'static>>>,
    cipher_suite_name: String,
}

impl TlsStreamInfo {
    /// Capture the negotiated parameters of a server connection.
    ///
    /// Returns [`None`] if the handshake is not complete yet.
    pub(crate) fn from_connection(connection: &ServerConnection) -> Option<Self> {
        let protocol_version = connection.protocol_version()?;
        let cipher_suite = connection.negotiated_cipher_suite()?.suite();

        Some(Self {
            protocol_version,
            cipher_suite,
            sni_hostname: connection.server_name().map(ToOwned::to_owned),
            alpn_protocol: connection.alpn_protocol().map(ToOwned::to_owned),
            peer_certificates: connection.peer_certificates().map(<[_]>::to_vec),
            // The Debug representation of known suites is their IANA name
            cipher_suite_name: format!("{cipher_suite:?}"),
        })
    }

    /// Returns a human readable name of the negotiated protocol version
    #[must_use]
    pub fn version_name(&self) -> &'static str {
        match self.protocol_version {
            ProtocolVersion::SSLv2 => "SSL 2.0",
            ProtocolVersion::SSLv3 => "SSL 3.0",
            ProtocolVersion::TLSv1_0 => "TLS 1.0",
            ProtocolVersion::TLSv1_1 => "TLS 1.1",
            ProtocolVersion::TLSv1_2 => "TLS 1.2",
            ProtocolVersion::TLSv1_3 => "TLS 1.3",
            _ => "unknown",
        }
    }

    #[must_use]
    pub fn cipher_suite_name(&self) -> &str {
        &self.cipher_suite_name
    }

    /// Whether HTTP/2 was negotiated through ALPN
    #[must_use]
    pub fn is_alpn_h2(&self) -> bool {
        matches!(self.alpn_protocol.as_deref(), Some(b"h2"))
    }
}
