use std::cmp::Reverse;
use std::sync::Arc;

use aw_core::types::Task;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Default maximum number of concurrent agents when none is specified.
const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Orders ready tasks and gates how many agents run at once.
///
/// Priority rules (highest to lowest):
/// 1. Higher `priority` field wins.
/// 2. Ties broken by `created_at` (oldest first), then `display_id`.
///
/// A permit from [`try_permit`](Self::try_permit) must be held for as long as
/// the agent runs; dropping it frees the slot.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    concurrency_gate: Arc<Semaphore>,
    max_concurrent: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let limit = if max_concurrent == 0 {
            warn!("max_concurrent was 0, defaulting to {DEFAULT_MAX_CONCURRENT}");
            DEFAULT_MAX_CONCURRENT
        } else {
            max_concurrent
        };
        Self {
            concurrency_gate: Arc::new(Semaphore::new(limit)),
            max_concurrent: limit,
        }
    }

    pub fn available_slots(&self) -> usize {
        self.concurrency_gate.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// A slot for one more agent, or `None` when all are taken. Never waits.
    pub fn try_permit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.concurrency_gate).try_acquire_owned().ok()
    }

    /// Sort `tasks` into launch order.
    pub fn order(&self, tasks: &mut [Task]) {
        tasks.sort_by(|a, b| {
            Reverse(a.priority)
                .cmp(&Reverse(b.priority))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.display_id.cmp(&b.display_id))
        });
        if let Some(first) = tasks.first() {
            debug!(task = %first.display_id, priority = first.priority, candidates = tasks.len(), "next task selected");
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    #[test]
    fn zero_falls_back_to_default() {
        let s = TaskScheduler::new(0);
        assert_eq!(s.max_concurrent(), DEFAULT_MAX_CONCURRENT);
        assert_eq!(s.available_slots(), DEFAULT_MAX_CONCURRENT);
    }

    #[test]
    fn permits_are_bounded_and_returned_on_drop() {
        let s = TaskScheduler::new(2);
        let a = s.try_permit().unwrap();
        let _b = s.try_permit().unwrap();
        assert!(s.try_permit().is_none());
        drop(a);
        assert_eq!(s.available_slots(), 1);
        assert!(s.try_permit().is_some());
    }

    #[test]
    fn priority_then_age() {
        let list = Uuid::new_v4();
        let old = Task::new(list, "T-1", "old");
        let mut young = Task::new(list, "T-2", "young");
        young.created_at = old.created_at + Duration::seconds(1);
        let urgent = Task::new(list, "T-3", "urgent").with_priority(5);

        let mut tasks = vec![young, urgent, old];
        TaskScheduler::new(1).order(&mut tasks);
        let order: Vec<_> = tasks.iter().map(|t| t.display_id.as_str()).collect();
        assert_eq!(order, vec!["T-3", "T-1", "T-2"]);
    }
}
