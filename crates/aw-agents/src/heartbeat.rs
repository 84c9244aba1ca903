use std::sync::Arc;
use std::time::Duration;

use aw_bridge::event_bus::EventBus;
use aw_bridge::protocol::WaveEvent;
use aw_core::store::TaskStore;
use aw_core::types::AgentStatus;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Periodic liveness beacon for one agent instance.
///
/// Runs on its own tokio task so that a long executor or validator call does
/// not delay it. A beat only goes out while the agent is making progress: a
/// running agent that has not called [`touch`](Self::touch) or changed
/// status within `stall_after` is left to go stale, so the patrol can claim
/// it. Beats stop when the handle is dropped or once the reported status is
/// terminal.
pub struct HeartbeatEmitter {
    status: watch::Sender<AgentStatus>,
    progress: watch::Sender<Instant>,
    handle: JoinHandle<()>,
}

impl HeartbeatEmitter {
    pub fn spawn(
        store: Arc<dyn TaskStore>,
        bus: EventBus,
        instance_id: Uuid,
        task_id: Uuid,
        interval: Duration,
        stall_after: Duration,
    ) -> Self {
        let (status, mut rx) = watch::channel(AgentStatus::Initializing);
        let (progress, last_progress) = watch::channel(Instant::now());
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut stalled = false;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        // Status changes are beaten right away.
                    }
                }
                let current = *rx.borrow_and_update();
                let quiet = last_progress.borrow().elapsed();
                if current == AgentStatus::Running && quiet > stall_after {
                    if !stalled {
                        tracing::warn!(
                            instance = %instance_id,
                            quiet_ms = quiet.as_millis() as u64,
                            "agent made no progress, withholding heartbeat"
                        );
                        stalled = true;
                    }
                    continue;
                }
                stalled = false;

                let at = Utc::now();
                if let Err(e) = store.record_heartbeat(instance_id, at).await {
                    tracing::warn!(instance = %instance_id, error = %e, "heartbeat not recorded");
                }
                bus.publish(WaveEvent::AgentHeartbeat {
                    instance_id,
                    status: current,
                    current_task_id: Some(task_id),
                    at,
                });
                if current.is_terminal() {
                    break;
                }
            }
        });
        Self {
            status,
            progress,
            handle,
        }
    }

    pub fn set_status(&self, status: AgentStatus) {
        self.touch();
        self.status.send_replace(status);
    }

    /// Record that the agent got past a step boundary.
    pub fn touch(&self) {
        self.progress.send_replace(Instant::now());
    }
}

impl Drop for HeartbeatEmitter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aw_core::store::SqliteStore;

    fn beats(events: &flume::Receiver<aw_bridge::protocol::Envelope>) -> usize {
        events
            .drain()
            .filter(|e| matches!(e.event, WaveEvent::AgentHeartbeat { .. }))
            .count()
    }

    #[tokio::test]
    async fn a_running_agent_without_progress_stops_beating() {
        let store = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        let bus = EventBus::new();
        let events = bus.subscribe();
        let hb = HeartbeatEmitter::spawn(
            store,
            bus,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Duration::from_millis(10),
            Duration::from_millis(80),
        );
        hb.set_status(AgentStatus::Running);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(beats(&events) >= 2);

        // Past the stall window: nothing goes out any more.
        tokio::time::sleep(Duration::from_millis(100)).await;
        beats(&events);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(beats(&events), 0);

        hb.touch();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(beats(&events) >= 1);
    }

    #[tokio::test]
    async fn idle_agents_keep_beating_while_they_wait() {
        let store = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        let bus = EventBus::new();
        let events = bus.subscribe();
        let hb = HeartbeatEmitter::spawn(
            store,
            bus,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Duration::from_millis(10),
            Duration::from_millis(20),
        );
        hb.set_status(AgentStatus::Idle);

        tokio::time::sleep(Duration::from_millis(80)).await;
        beats(&events);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(beats(&events) >= 2);
    }
}
