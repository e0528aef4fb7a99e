use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::ServerProvider;
use trafficguard_common::{ApiError, Server, ServerStatus, ServerTypeInfo};

enum Change {
    Status(ServerStatus),
    Tier(String),
}

struct PendingChange {
    server_id: u64,
    polls_remaining: u32,
    change: Change,
}

#[derive(Default)]
struct MockState {
    servers: HashMap<u64, Server>,
    server_types: Vec<ServerTypeInfo>,
    pending: Vec<PendingChange>,
    /// Polls of `get_server` before an accepted action becomes visible.
    transition_lag: u32,
    /// Servers whose accepted actions never take effect (stuck provider).
    frozen: HashSet<u64>,
    /// Per-server set of operations whose accepted actions never take effect,
    /// while everything else behaves normally.
    frozen_ops: HashMap<u64, HashSet<&'static str>>,
    /// Operations that answer with a provider error instead of accepting.
    /// `None` denies every call, `Some(n)` only the n-th (1-based).
    deny: HashMap<&'static str, (Option<u32>, u16, String)>,
    op_counts: HashMap<&'static str, u32>,
    calls: Vec<String>,
}

/// In-memory provider double for orchestrator tests.
///
/// Mirrors the provider's accepted-vs-applied split: power and tier actions
/// are accepted immediately but only become visible after `transition_lag`
/// subsequent `get_server` polls, so convergence waits are exercised for real.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_server(&self, server: Server) {
        self.lock().servers.insert(server.id, server);
    }

    pub fn set_server_types(&self, types: Vec<ServerTypeInfo>) {
        self.lock().server_types = types;
    }

    pub fn set_transition_lag(&self, polls: u32) {
        self.lock().transition_lag = polls;
    }

    /// Accepted actions for this server will never be applied.
    pub fn freeze(&self, server_id: u64) {
        self.lock().frozen.insert(server_id);
    }

    /// Accepted `op` ("power_on" | "power_off" | "change_type") actions for
    /// this server are never applied; other operations proceed normally.
    pub fn freeze_op(&self, server_id: u64, op: &'static str) {
        self.lock().frozen_ops.entry(server_id).or_default().insert(op);
    }

    /// Answer `op` ("power_on" | "power_off" | "change_type") with a provider
    /// error instead of accepting it.
    pub fn deny(&self, op: &'static str, status: u16, message: impl Into<String>) {
        self.lock().deny.insert(op, (None, status, message.into()));
    }

    /// Deny only the `nth` call (1-based) of `op`; earlier and later calls
    /// are accepted. Lets tests fail one half of a workflow.
    pub fn deny_nth(&self, op: &'static str, nth: u32, status: u16, message: impl Into<String>) {
        self.lock().deny.insert(op, (Some(nth), status, message.into()));
    }

    /// Every call recorded in order, e.g. "power_off:1" or "change_type:1:cx33".
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Only the mutating calls (power and tier actions).
    pub fn action_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| {
                c.starts_with("power_on:")
                    || c.starts_with("power_off:")
                    || c.starts_with("change_type:")
            })
            .collect()
    }

    /// Current snapshot of a server, for end-state assertions.
    pub fn server(&self, server_id: u64) -> Option<Server> {
        self.lock().servers.get(&server_id).cloned()
    }

    fn accept(&self, server_id: u64, op: &'static str, change: Change) -> Result<(), ApiError> {
        let mut state = self.lock();
        state.calls.push(match &change {
            Change::Tier(tier) => format!("{op}:{server_id}:{tier}"),
            Change::Status(_) => format!("{op}:{server_id}"),
        });
        let count = state.op_counts.entry(op).or_insert(0);
        *count += 1;
        let count = *count;
        if let Some((nth, status, message)) = state.deny.get(op) {
            if nth.map_or(true, |n| n == count) {
                return Err(ApiError::Provider {
                    status: *status,
                    message: message.clone(),
                });
            }
        }
        if !state.servers.contains_key(&server_id) {
            return Err(ApiError::not_found(format!("server {server_id} not found")));
        }
        let stalled = state.frozen.contains(&server_id)
            || state
                .frozen_ops
                .get(&server_id)
                .map_or(false, |ops| ops.contains(op));
        if !stalled {
            let polls_remaining = state.transition_lag;
            state.pending.push(PendingChange {
                server_id,
                polls_remaining,
                change,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ServerProvider for MockProvider {
    async fn list_servers(&self) -> Result<Vec<Server>, ApiError> {
        let mut state = self.lock();
        state.calls.push("list_servers".to_string());
        let mut servers: Vec<Server> = state.servers.values().cloned().collect();
        servers.sort_by_key(|s| s.id);
        Ok(servers)
    }

    async fn get_server(&self, server_id: u64) -> Result<Server, ApiError> {
        let mut state = self.lock();
        state.calls.push(format!("get_server:{server_id}"));

        // Apply due transitions for this server, age the rest.
        let mut due = Vec::new();
        let mut remaining = Vec::new();
        for mut p in state.pending.drain(..) {
            if p.server_id == server_id {
                if p.polls_remaining == 0 {
                    due.push(p.change);
                    continue;
                }
                p.polls_remaining -= 1;
            }
            remaining.push(p);
        }
        state.pending = remaining;
        if let Some(server) = state.servers.get_mut(&server_id) {
            for change in due {
                match change {
                    Change::Status(status) => server.status = status,
                    Change::Tier(tier) => server.server_type = tier,
                }
            }
        }

        state
            .servers
            .get(&server_id)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("server {server_id} not found")))
    }

    async fn power_on(&self, server_id: u64) -> Result<(), ApiError> {
        self.accept(server_id, "power_on", Change::Status(ServerStatus::Running))
    }

    async fn power_off(&self, server_id: u64) -> Result<(), ApiError> {
        self.accept(server_id, "power_off", Change::Status(ServerStatus::Off))
    }

    async fn change_server_type(
        &self,
        server_id: u64,
        server_type: &str,
        _upgrade_disk: bool,
    ) -> Result<(), ApiError> {
        self.accept(
            server_id,
            "change_type",
            Change::Tier(server_type.to_string()),
        )
    }

    async fn list_server_types(&self) -> Result<Vec<ServerTypeInfo>, ApiError> {
        let mut state = self.lock();
        state.calls.push("list_server_types".to_string());
        Ok(state.server_types.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn running_server(id: u64, tier: &str) -> Server {
        Server {
            id,
            name: format!("srv-{id}"),
            status: ServerStatus::Running,
            server_type: tier.to_string(),
            outgoing_traffic: 0,
            included_traffic: None,
        }
    }

    #[tokio::test]
    async fn actions_apply_after_lag_polls() {
        let mock = MockProvider::new();
        mock.add_server(running_server(1, "cx23"));
        mock.set_transition_lag(2);

        mock.power_off(1).await.unwrap();
        assert_eq!(
            mock.get_server(1).await.unwrap().status,
            ServerStatus::Running
        );
        assert_eq!(
            mock.get_server(1).await.unwrap().status,
            ServerStatus::Running
        );
        assert_eq!(mock.get_server(1).await.unwrap().status, ServerStatus::Off);
    }

    #[tokio::test]
    async fn frozen_server_never_converges() {
        let mock = MockProvider::new();
        mock.add_server(running_server(1, "cx23"));
        mock.freeze(1);

        mock.power_off(1).await.unwrap();
        let converged = mock
            .wait_for_status(1, &ServerStatus::Off, 3, Duration::from_millis(1))
            .await;
        assert!(!converged);
    }

    #[tokio::test]
    async fn frozen_op_only_stalls_that_op() {
        let mock = MockProvider::new();
        mock.add_server(running_server(1, "cx23"));
        mock.freeze_op(1, "change_type");

        mock.change_server_type(1, "cx33", false).await.unwrap();
        mock.power_off(1).await.unwrap();

        let server = mock.get_server(1).await.unwrap();
        assert_eq!(server.status, ServerStatus::Off);
        assert_eq!(server.server_type, "cx23");
    }

    #[tokio::test]
    async fn denied_op_returns_provider_error() {
        let mock = MockProvider::new();
        mock.add_server(running_server(1, "cx23"));
        mock.deny("change_type", 423, "server is locked");

        let err = mock.change_server_type(1, "cx33", false).await.unwrap_err();
        assert!(matches!(err, ApiError::Provider { status: 423, .. }));
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let mock = MockProvider::new();
        let err = mock.get_server(99).await.unwrap_err();
        assert!(matches!(err, ApiError::Provider { status: 404, .. }));
    }
}
