// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Element-Commercial
// Please see LICENSE files in the repository root for full details.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    time::Duration,
};

use anyhow::bail;
use camino::Utf8PathBuf;
use figment::Figment;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};

use crate::{ConfigurationSection, util::field_error};

const PATH: &str = "listener";

fn default_port() -> u16 {
    8443
}

fn default_detection_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Configuration of the listener serving both HTTP and HTTPS
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Host or IP address to bind to. Binds on all interfaces if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Port to bind to. Defaults to 8443.
    #[serde(default = "default_port")]
    pub port: u16,

    /// A name for the listener, used in the logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// How long to wait for the first byte of a connection, in seconds.
    /// Defaults to 5 seconds.
    #[serde(default = "default_detection_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub detection_timeout: Duration,

    /// How long the TLS handshake can take once a client started it, in
    /// seconds. Defaults to 10 seconds.
    #[serde(default = "default_handshake_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub handshake_timeout: Duration,

    /// How long to wait for the active connections to finish when shutting
    /// down, in seconds. Defaults to 60 seconds.
    #[serde(default = "default_shutdown_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub shutdown_timeout: Duration,

    /// TLS certificate and key used for the HTTPS connections
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            name: None,
            detection_timeout: default_detection_timeout(),
            handshake_timeout: default_handshake_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            tls: TlsConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// The addresses to try binding to, in order
    ///
    /// Without a host, this is the IPv6 wildcard address followed by the
    /// IPv4 one, for systems without IPv6.
    ///
    /// # Errors
    ///
    /// Returns an error if the host could not be resolved
    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>, std::io::Error> {
        let Some(host) = &self.host else {
            return Ok(vec![
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), self.port),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port),
            ]);
        };

        Ok((host.as_str(), self.port).to_socket_addrs()?.collect())
    }
}

impl ConfigurationSection for ListenerConfig {
    const PATH: Option<&'static str> = Some(PATH);

    fn validate(
        &self,
        figment: &Figment,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        for (field, value) in [
            ("detection_timeout", self.detection_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
        ] {
            if value.is_zero() {
                return Err(field_error(figment, PATH, field, "must be greater than zero").into());
            }
        }

        self.tls.validate(figment)?;

        Ok(())
    }
}

/// Configuration of the TLS certificate chain and private key
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM-encoded X509 certificate chain
    ///
    /// Exactly one of `certificate` or `certificate_file` must be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,

    /// File containing the PEM-encoded X509 certificate chain
    ///
    /// Exactly one of `certificate` or `certificate_file` must be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_file: Option<Utf8PathBuf>,

    /// PEM-encoded private key
    ///
    /// Exactly one of `key` or `key_file` must be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// File containing a PEM-encoded private key
    ///
    /// Exactly one of `key` or `key_file` must be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<Utf8PathBuf>,
}

impl TlsConfig {
    fn validate(&self, figment: &Figment) -> Result<(), figment::Error> {
        let section = "listener.tls";

        match (&self.certificate, &self.certificate_file) {
            (Some(_), Some(_)) => {
                return Err(field_error(
                    figment,
                    section,
                    "certificate",
                    "Cannot specify both `certificate` and `certificate_file`",
                ));
            }
            (None, None) => {
                return Err(field_error(
                    figment,
                    section,
                    "certificate",
                    "Either `certificate` or `certificate_file` must be set",
                ));
            }
            _ => {}
        }

        match (&self.key, &self.key_file) {
            (Some(_), Some(_)) => Err(field_error(
                figment,
                section,
                "key",
                "Cannot specify both `key` and `key_file`",
            )),
            (None, None) => Err(field_error(
                figment,
                section,
                "key",
                "Either `key` or `key_file` must be set",
            )),
            _ => Ok(()),
        }
    }

    /// Load the TLS private key and certificate chain
    ///
    /// # Errors
    ///
    /// Returns an error if one of the files could not be read, or if the
    /// certificate chain or the key could not be parsed
    pub fn load(
        &self,
    ) -> Result<(PrivateKeyDer<'static>, Vec<CertificateDer<'static>>), anyhow::Error> {
        // Read the key either embedded in the config file or on disk
        let key = match (&self.key, &self.key_file) {
            (None, None) => bail!("Either `key` or `key_file` must be set"),
            (Some(_), Some(_)) => bail!("Cannot specify both `key` and `key_file`"),
            (Some(key), None) => key.clone().into_bytes(),
            (None, Some(path)) => std::fs::read(path)?,
        };

        let Some(key) = rustls_pemfile::private_key(&mut key.as_slice())? else {
            bail!("No private key found in the TLS key");
        };

        // Read the certificate chain either embedded in the config file or on disk
        let certificate_chain_pem = match (&self.certificate, &self.certificate_file) {
            (None, None) => bail!("Either `certificate` or `certificate_file` must be set"),
            (Some(_), Some(_)) => {
                bail!("Cannot specify both `certificate` and `certificate_file`")
            }
            (Some(certificate), None) => certificate.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)?,
        };

        let certificate_chain = rustls_pemfile::certs(&mut certificate_chain_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()?;

        if certificate_chain.is_empty() {
            bail!("TLS certificate chain is empty (or invalid)")
        }

        Ok((key, certificate_chain))
    }
}
