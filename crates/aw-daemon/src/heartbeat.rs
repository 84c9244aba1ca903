use std::time::Duration;

use aw_core::store::{self, TaskStore};
use aw_core::types::BuildAgentInstance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An agent that has not sent a heartbeat within the staleness threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleAgent {
    pub instance_id: Uuid,
    pub task_id: Uuid,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Time since the last heartbeat when the check ran.
    pub silent_ms: u64,
}

/// Detects agents whose heartbeats stopped.
///
/// Only non-terminal instances are considered: rows that reached
/// `completed`, `failed` or `stuck` are never revisited.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    staleness_threshold: Duration,
}

impl HeartbeatMonitor {
    pub fn new(staleness_threshold: Duration) -> Self {
        Self {
            staleness_threshold,
        }
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.staleness_threshold
    }

    /// Agents in `agents` that went silent for longer than the threshold,
    /// relative to `now`.
    pub fn find_stale(&self, agents: &[BuildAgentInstance], now: DateTime<Utc>) -> Vec<StaleAgent> {
        agents
            .iter()
            .filter(|a| !a.status.is_terminal())
            .filter_map(|a| {
                let silent = now
                    .signed_duration_since(a.last_heartbeat_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                (silent > self.staleness_threshold).then(|| StaleAgent {
                    instance_id: a.id,
                    task_id: a.task_id,
                    last_heartbeat_at: a.last_heartbeat_at,
                    silent_ms: silent.as_millis() as u64,
                })
            })
            .collect()
    }

    /// Check every agent of a run against the store.
    pub async fn check_run(
        &self,
        store: &dyn TaskStore,
        run_id: Uuid,
    ) -> store::Result<Vec<StaleAgent>> {
        let agents = store.list_agents(run_id).await?;
        let stale = self.find_stale(&agents, Utc::now());
        for agent in &stale {
            tracing::warn!(
                instance = %agent.instance_id,
                task_id = %agent.task_id,
                silent_ms = agent.silent_ms,
                "agent heartbeat is stale"
            );
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aw_core::types::AgentStatus;
    use chrono::Duration as ChronoDuration;

    fn agent(status: AgentStatus, silent_secs: i64, now: DateTime<Utc>) -> BuildAgentInstance {
        let mut a = BuildAgentInstance::new(Uuid::new_v4(), 0, Uuid::new_v4(), 1);
        a.status = status;
        a.last_heartbeat_at = now - ChronoDuration::seconds(silent_secs);
        a
    }

    #[test]
    fn only_live_and_silent_agents_are_stale() {
        let now = Utc::now();
        let monitor = HeartbeatMonitor::new(Duration::from_secs(60));
        let agents = vec![
            agent(AgentStatus::Running, 90, now),
            agent(AgentStatus::Running, 10, now),
            agent(AgentStatus::Idle, 61, now),
            agent(AgentStatus::Stuck, 500, now),
            agent(AgentStatus::Completed, 500, now),
        ];
        let stale = monitor.find_stale(&agents, now);
        let ids: Vec<Uuid> = stale.iter().map(|s| s.instance_id).collect();
        assert_eq!(ids, vec![agents[0].id, agents[2].id]);
        assert_eq!(stale[0].silent_ms, 90_000);
    }

    #[test]
    fn heartbeat_in_the_future_is_not_stale() {
        let now = Utc::now();
        let monitor = HeartbeatMonitor::new(Duration::from_millis(1));
        let agents = vec![agent(AgentStatus::Running, -5, now)];
        assert!(monitor.find_stale(&agents, now).is_empty());
    }
}
