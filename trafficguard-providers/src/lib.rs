use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

use trafficguard_common::{ApiError, Server, ServerStatus, ServerTypeInfo};

/// Control-plane operations the orchestrator needs from a cloud provider.
///
/// The power and tier actions are asynchronous on the provider side: success
/// means the action was *accepted*, not that the server reached the target
/// state. Callers compose [`ServerProvider::wait_for_status`] for every
/// convergence wait.
#[async_trait]
pub trait ServerProvider: Send + Sync {
    async fn list_servers(&self) -> Result<Vec<Server>, ApiError>;
    async fn get_server(&self, server_id: u64) -> Result<Server, ApiError>;

    async fn power_on(&self, server_id: u64) -> Result<(), ApiError>;
    async fn power_off(&self, server_id: u64) -> Result<(), ApiError>;

    /// Request a tier change. `upgrade_disk = false` keeps the change
    /// reversible (a grown disk cannot be shrunk back).
    async fn change_server_type(
        &self,
        server_id: u64,
        server_type: &str,
        upgrade_disk: bool,
    ) -> Result<(), ApiError>;

    async fn list_server_types(&self) -> Result<Vec<ServerTypeInfo>, ApiError>;

    /// Poll the server until it reports `target`, re-fetching up to
    /// `max_attempts` times spaced `poll_interval` apart.
    ///
    /// Returns `false` when the window is exhausted; the caller decides
    /// whether that is fatal. Fetch errors during a poll are tolerated and
    /// count as a non-matching attempt, so a flaky read cannot abort a wait.
    async fn wait_for_status(
        &self,
        server_id: u64,
        target: &ServerStatus,
        max_attempts: u32,
        poll_interval: Duration,
    ) -> bool {
        for attempt in 0..max_attempts {
            match self.get_server(server_id).await {
                Ok(server) if server.status == *target => {
                    tracing::info!(
                        "server {} reached status {} after {} poll(s)",
                        server_id,
                        target,
                        attempt + 1
                    );
                    return true;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("poll failed for server {}: {}", server_id, e);
                }
            }
            sleep(poll_interval).await;
        }
        tracing::warn!("server {} did not reach {} in time", server_id, target);
        false
    }
}

#[cfg(feature = "hetzner")]
pub mod hetzner;

#[cfg(feature = "mock")]
pub mod mock;
