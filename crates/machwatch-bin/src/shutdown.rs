// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Graceful shutdown coordination.
//!
//! Listens for SIGINT/SIGTERM (Ctrl+C on Windows) and notifies every
//! subscriber once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::error::{BinError, BinResult};

// =============================================================================
// ShutdownCoordinator
// =============================================================================

/// Coordinates graceful shutdown of long-running commands.
///
/// # Example
///
/// ```ignore
/// let coordinator = ShutdownCoordinator::new();
/// let token = coordinator.token();
///
/// tokio::spawn(async move { coordinator.wait_for_signal().await });
/// token.cancelled().await;
/// ```
#[derive(Clone)]
pub struct ShutdownCoordinator {
    sender: Arc<watch::Sender<bool>>,
    initiated: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    /// Creates a new shutdown coordinator.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a token that resolves once shutdown starts.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.sender.subscribe(),
        }
    }

    /// Initiates shutdown. Only the first call notifies.
    pub fn initiate_shutdown(&self) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Shutdown initiated");
            self.sender.send_replace(true);
        }
    }

    /// Returns true if shutdown has been initiated.
    pub fn is_shutdown_initiated(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Waits for an OS signal, then initiates shutdown.
    pub async fn wait_for_signal(&self) -> BinResult<()> {
        if self.is_shutdown_initiated() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())
                .map_err(|e| BinError::init(format!("failed to register SIGTERM handler: {e}")))?;
            let mut sigint = signal(SignalKind::interrupt())
                .map_err(|e| BinError::init(format!("failed to register SIGINT handler: {e}")))?;

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| BinError::init(format!("failed to register Ctrl+C handler: {e}")))?;
            info!("Received Ctrl+C");
        }

        self.initiate_shutdown();
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// ShutdownToken
// =============================================================================

/// Cloneable handle that observes shutdown.
#[derive(Clone)]
pub struct ShutdownToken {
    receiver: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Returns true once shutdown has started.
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves when shutdown starts.
    pub async fn cancelled(&mut self) {
        // A closed channel means the coordinator is gone, which also ends the run.
        let _ = self.receiver.wait_for(|stop| *stop).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
