// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Element-Commercial
// Please see LICENSE files in the repository root for full details.

use std::{process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Parser;
use figment::Figment;
use protomux_config::{ConfigurationSectionExt, ListenerConfig};
use protomux_listener::{Server, Timeouts};
use tokio::net::TcpListener;
use tracing::{info, info_span};

use crate::lifecycle::LifecycleManager;

#[derive(Parser, Debug, Default)]
pub(super) struct Options {}

impl Options {
    pub async fn run(self, figment: &Figment) -> anyhow::Result<ExitCode> {
        let span = info_span!("cli.run.init").entered();
        let config =
            ListenerConfig::extract_or_default(figment).map_err(anyhow::Error::from_boxed)?;

        info!(version = crate::VERSION, "Starting up");

        let lifecycle = LifecycleManager::new(config.shutdown_timeout)?;

        let tls = crate::server::build_tls_server_config(&config.tls)
            .context("could not load the TLS certificate and key")?;

        let addresses = config
            .socket_addrs()
            .context("could not resolve the listener address")?;
        let listener = TcpListener::bind(addresses.as_slice())
            .await
            .with_context(|| format!("could not bind to any of {addresses:?}"))?;

        let mut server = Server::new(crate::server::build_router(), tls).with_timeouts(Timeouts {
            detection: config.detection_timeout,
            handshake: config.handshake_timeout,
        });
        if let Some(name) = &config.name {
            server = server.with_name(name.clone());
        }
        let server = Arc::new(server);

        span.exit();

        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(listener).await }
        });

        let exit_code = lifecycle
            .run(serving, |timeout| async move { server.shutdown(timeout).await })
            .await;

        Ok(exit_code)
    }
}
