//! Shutdown coordination and teardown of a running node.

use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::startup::Running;
use crate::store::StoreKind;

/// Coordinator for graceful shutdown.
///
/// Every background loop selects on the token and exits when it fires.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle background tasks wait on.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await
    }
}

impl Running {
    /// Release everything startup acquired. Only the first call does work.
    ///
    /// The final log flush and the ephemeral logout run alongside the
    /// ordered teardown, each bounded by `flush_timeout`.
    pub(crate) async fn close(&self, ephemeral: bool, flush_timeout: Duration) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let logout = async {
            if !ephemeral || self.store.kind() != StoreKind::Memory {
                return;
            }
            match tokio::time::timeout(flush_timeout, self.backend.logout()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Ephemeral logout failed"),
                Err(_) => tracing::warn!(timeout = ?flush_timeout, "Ephemeral logout timed out"),
            }
        };

        let flush = async {
            match tokio::time::timeout(flush_timeout, self.shipper.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Final log flush failed"),
                Err(_) => {
                    tracing::warn!(timeout = ?flush_timeout, "Final log flush timed out");
                    self.shipper.abort();
                }
            }
            self.log.detach();
        };

        // Polled after `logout`, so a logout that completes without waiting
        // still lands before the backend shuts down.
        let teardown = async {
            self.stack.close();
            self.engine.close();
            self.shutdown.trigger();
            self.backend.shutdown();
            self.link.close();
            self.dialer.close();
            self.local_api.cancel();
            self.gateway.close();
        };

        tokio::join!(flush, logout, teardown);
        tracing::info!(dir = %self.dir.display(), "Node closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_waiters() {
        let shutdown = Shutdown::new();
        let token = shutdown.token();
        let waiter = tokio::spawn(async move { token.cancelled().await });

        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        waiter.await.unwrap();
        assert!(shutdown.is_triggered());
        shutdown.triggered().await;
    }
}
