// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Element-Commercial
// Please see LICENSE files in the repository root for full details.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::Request,
    http::{StatusCode, Version, header::USER_AGENT},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use protomux_config::TlsConfig;
use protomux_listener::ConnectionInfo;
use rustls::ServerConfig;
use serde::Serialize;

#[inline]
fn http_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _other => "_OTHER",
    }
}

async fn log_response_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_owned();
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let version = http_version(request.version());
    let protocol = ConnectionInfo::from_request(&request).map_or("-", |info| info.protocol().as_str());
    let start = Instant::now();

    let response = next.run(request).await;

    let elapsed = start.elapsed();
    let status_code = response.status();
    match status_code.as_u16() {
        100..=399 => tracing::info!(
            name: "http.server.response",
            "{protocol} \"{method} {path} HTTP/{version}\" {status_code} {user_agent:?} [{elapsed:?}]",
        ),
        400..=499 => tracing::warn!(
            name: "http.server.response",
            "{protocol} \"{method} {path} HTTP/{version}\" {status_code} {user_agent:?} [{elapsed:?}]",
        ),
        500..=599 => tracing::error!(
            name: "http.server.response",
            "{protocol} \"{method} {path} HTTP/{version}\" {status_code} {user_agent:?} [{elapsed:?}]",
        ),
        _ => { /* This shouldn't happen */ }
    }

    response
}

/// What the `/connection-info` route replies with
#[derive(Debug, Serialize)]
struct ConnectionInfoResponse {
    protocol: &'static str,
    tls: Option<TlsInfoResponse>,
    peer_address: Option<SocketAddr>,
    detected_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct TlsInfoResponse {
    version: String,
    cipher_suite: String,
    server_name: Option<String>,
    alpn_protocol: Option<String>,
    http2: bool,
}

impl From<&ConnectionInfo> for ConnectionInfoResponse {
    fn from(info: &ConnectionInfo) -> Self {
        Self {
            protocol: info.protocol().as_str(),
            tls: info.get_tls_ref().map(|tls| TlsInfoResponse {
                version: tls.version_name().to_owned(),
                cipher_suite: tls.cipher_suite_name().to_owned(),
                server_name: tls.sni_hostname.clone(),
                alpn_protocol: tls
                    .alpn_protocol
                    .as_deref()
                    .map(|alpn| String::from_utf8_lossy(alpn).into_owned()),
                http2: tls.is_alpn_h2(),
            }),
            peer_address: info.get_peer_addr(),
            detected_at: info.detected_at(),
        }
    }
}

fn missing_connection_info() -> Response {
    tracing::error!("Missing connection informations for request, this is a bug!");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Missing connection informations",
    )
        .into_response()
}

async fn index(request: Request) -> Response {
    let Some(info) = ConnectionInfo::from_request(&request) else {
        return missing_connection_info();
    };

    format!("Hello! You are connected over {}\n", info.protocol()).into_response()
}

async fn connection_info(request: Request) -> Response {
    let Some(info) = ConnectionInfo::from_request(&request) else {
        return missing_connection_info();
    };

    Json(ConnectionInfoResponse::from(info)).into_response()
}

async fn health() -> &'static str {
    "ok"
}

pub fn build_router() -> Router<()> {
    Router::new()
        .route("/", get(index))
        .route("/connection-info", get(connection_info))
        .route("/health", get(health))
        .layer(axum::middleware::from_fn(log_response_middleware))
}

pub fn build_tls_server_config(config: &TlsConfig) -> Result<Arc<ServerConfig>, anyhow::Error> {
    let (key, chain) = config.load()?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("failed to build TLS server config")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
