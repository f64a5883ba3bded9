// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Element-Commercial
// Please see LICENSE files in the repository root for full details.

use std::{process::ExitCode, time::Duration};

use protomux_listener::{ServeError, ShutdownError};
use tokio::{
    signal::unix::{Signal, SignalKind},
    task::JoinHandle,
};

/// A helper to manage the lifecycle of the server, handling graceful
/// shutdowns.
///
/// It listens for SIGTERM and SIGINT signals, and starts a graceful shutdown
/// on the first one. Connections still active after the shutdown timeout are
/// aborted.
pub struct LifecycleManager {
    sigterm: Signal,
    sigint: Signal,
    timeout: Duration,
}

impl LifecycleManager {
    /// Create a new lifecycle manager, installing the signal handlers
    ///
    /// # Errors
    ///
    /// Returns an error if the signal handler could not be installed
    pub fn new(timeout: Duration) -> Result<Self, std::io::Error> {
        let sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
        let sigint = tokio::signal::unix::signal(SignalKind::interrupt())?;

        Ok(Self {
            sigterm,
            sigint,
            timeout,
        })
    }

    /// Run until the server completely shut down.
    ///
    /// `shutdown` is called with the shutdown timeout once a signal is
    /// received, and `serving` is the task running the server.
    pub async fn run<F, Fut>(
        mut self,
        mut serving: JoinHandle<Result<(), ServeError>>,
        shutdown: F,
    ) -> ExitCode
    where
        F: FnOnce(Duration) -> Fut,
        Fut: Future<Output = Result<(), ShutdownError>>,
    {
        // Wait for a first shutdown signal, or for the server to stop by itself
        tokio::select! {
            res = &mut serving => {
                match res {
                    Ok(Ok(())) => tracing::warn!("The server stopped unexpectedly"),
                    Ok(Err(e)) => tracing::error!(error = &e as &dyn std::error::Error, "The server crashed"),
                    Err(e) => tracing::error!(error = &e as &dyn std::error::Error, "The server task panicked"),
                }
                return ExitCode::FAILURE;
            },

            _ = self.sigterm.recv() => {
                tracing::info!("Shutdown signal received (SIGTERM), shutting down");
            },

            _ = self.sigint.recv() => {
                tracing::info!("Shutdown signal received (SIGINT), shutting down");
            },
        }

        let shutdown = shutdown(self.timeout);
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                res = &mut shutdown => break res,

                _ = self.sigterm.recv() => {
                    tracing::warn!(timeout = ?self.timeout, "Second shutdown signal received (SIGTERM), already shutting down");
                },

                _ = self.sigint.recv() => {
                    tracing::warn!(timeout = ?self.timeout, "Second shutdown signal received (SIGINT), already shutting down");
                },
            }
        };

        if let Err(e) = result {
            tracing::warn!(error = &e as &dyn std::error::Error, "Shutdown timeout reached");
        }

        match serving.await {
            Ok(Ok(())) => {
                tracing::info!("All connections are done, exiting");
                ExitCode::SUCCESS
            }
            Ok(Err(e)) => {
                tracing::error!(error = &e as &dyn std::error::Error, "The server crashed");
                ExitCode::FAILURE
            }
            Err(e) => {
                tracing::error!(error = &e as &dyn std::error::Error, "The server task panicked");
                ExitCode::FAILURE
            }
        }
    }
}
