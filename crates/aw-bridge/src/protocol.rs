use aw_core::types::{AgentStatus, QaStatus, RunStatus, ValidationLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything the orchestrator, agents and QA engine announce. The `type`
/// tag is the dotted event name consumers subscribe to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WaveEvent {
    #[serde(rename = "agent.spawned")]
    AgentSpawned {
        run_id: Uuid,
        instance_id: Uuid,
        task_id: Uuid,
        wave: u32,
        attempt: u32,
    },
    #[serde(rename = "agent.heartbeat")]
    AgentHeartbeat {
        instance_id: Uuid,
        status: AgentStatus,
        current_task_id: Option<Uuid>,
        at: DateTime<Utc>,
    },
    #[serde(rename = "build.stuck")]
    BuildStuck {
        task_id: Uuid,
        display_id: String,
        instance_id: Uuid,
        consecutive_failures: u32,
        error_signature: String,
        log_tail: Vec<String>,
    },
    #[serde(rename = "task.deferred")]
    TaskDeferred {
        task_id: Uuid,
        path: String,
        holder: Option<Uuid>,
    },
    #[serde(rename = "task.completed")]
    TaskCompleted {
        task_id: Uuid,
        display_id: String,
        attempts: u32,
        commit: Option<String>,
    },
    #[serde(rename = "task.failed")]
    TaskFailed {
        task_id: Uuid,
        display_id: String,
        attempts: u32,
        reason: String,
    },
    #[serde(rename = "task.blocked")]
    TaskBlocked {
        task_id: Uuid,
        display_id: String,
        blocked_by: Uuid,
    },
    #[serde(rename = "qa.passed")]
    QaPassed {
        task_id: Uuid,
        report_id: Uuid,
        level: ValidationLevel,
        status: QaStatus,
    },
    #[serde(rename = "qa.failed")]
    QaFailed {
        task_id: Uuid,
        report_id: Uuid,
        level: ValidationLevel,
        failed_checks: Vec<String>,
    },
    #[serde(rename = "fix.created")]
    FixCreated {
        original_task_id: Uuid,
        fix_task_id: Uuid,
        report_id: Uuid,
        generation: u32,
    },
    #[serde(rename = "wave.started")]
    WaveStarted {
        run_id: Uuid,
        wave: u32,
        task_ids: Vec<Uuid>,
    },
    #[serde(rename = "wave.completed")]
    WaveCompleted { run_id: Uuid, wave: u32 },
    #[serde(rename = "run.finished")]
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
    },
}

impl WaveEvent {
    /// The dotted name, identical to the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            WaveEvent::AgentSpawned { .. } => "agent.spawned",
            WaveEvent::AgentHeartbeat { .. } => "agent.heartbeat",
            WaveEvent::BuildStuck { .. } => "build.stuck",
            WaveEvent::TaskDeferred { .. } => "task.deferred",
            WaveEvent::TaskCompleted { .. } => "task.completed",
            WaveEvent::TaskFailed { .. } => "task.failed",
            WaveEvent::TaskBlocked { .. } => "task.blocked",
            WaveEvent::QaPassed { .. } => "qa.passed",
            WaveEvent::QaFailed { .. } => "qa.failed",
            WaveEvent::FixCreated { .. } => "fix.created",
            WaveEvent::WaveStarted { .. } => "wave.started",
            WaveEvent::WaveCompleted { .. } => "wave.completed",
            WaveEvent::RunFinished { .. } => "run.finished",
        }
    }

    /// Task the event is about, if any.
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            WaveEvent::AgentSpawned { task_id, .. }
            | WaveEvent::BuildStuck { task_id, .. }
            | WaveEvent::TaskDeferred { task_id, .. }
            | WaveEvent::TaskCompleted { task_id, .. }
            | WaveEvent::TaskFailed { task_id, .. }
            | WaveEvent::TaskBlocked { task_id, .. }
            | WaveEvent::QaPassed { task_id, .. }
            | WaveEvent::QaFailed { task_id, .. } => Some(*task_id),
            WaveEvent::AgentHeartbeat {
                current_task_id, ..
            } => *current_task_id,
            WaveEvent::FixCreated {
                original_task_id, ..
            } => Some(*original_task_id),
            WaveEvent::WaveStarted { .. }
            | WaveEvent::WaveCompleted { .. }
            | WaveEvent::RunFinished { .. } => None,
        }
    }
}

/// A published event with its bus sequence number and publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: WaveEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_the_dotted_name() {
        let ev = WaveEvent::BuildStuck {
            task_id: Uuid::nil(),
            display_id: "T-4".into(),
            instance_id: Uuid::nil(),
            consecutive_failures: 3,
            error_signature: "error ts#".into(),
            log_tail: vec!["line".into()],
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "build.stuck");
        assert_eq!(json["type"], ev.name());
        assert_eq!(json["payload"]["consecutive_failures"], 3);

        let back: WaveEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn envelope_flattens_event() {
        let env = Envelope {
            seq: 9,
            at: Utc::now(),
            event: WaveEvent::WaveCompleted {
                run_id: Uuid::nil(),
                wave: 2,
            },
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["seq"], 9);
        assert_eq!(json["type"], "wave.completed");
        assert_eq!(json["payload"]["wave"], 2);
    }
}
