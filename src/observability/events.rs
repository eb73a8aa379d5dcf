//! 执行事件
//!
//! 追加写入、从不修改；payload 为结构化 JSON，便于事后按任务 / 类型检索。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::{StepId, TaskId};

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PlanChosen,
    ToolInvoked,
    Latency,
    Cost,
    Failure,
    Retry,
    PermissionDenied,
    EmergencyStop,
    ConfirmationRequested,
    StepSucceeded,
    StepSkipped,
    Replanned,
    TaskFinished,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PlanChosen => "plan_chosen",
            EventKind::ToolInvoked => "tool_invoked",
            EventKind::Latency => "latency",
            EventKind::Cost => "cost",
            EventKind::Failure => "failure",
            EventKind::Retry => "retry",
            EventKind::PermissionDenied => "permission_denied",
            EventKind::EmergencyStop => "emergency_stop",
            EventKind::ConfirmationRequested => "confirmation_requested",
            EventKind::StepSucceeded => "step_succeeded",
            EventKind::StepSkipped => "step_skipped",
            EventKind::Replanned => "replanned",
            EventKind::TaskFinished => "task_finished",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "plan_chosen" => EventKind::PlanChosen,
            "tool_invoked" => EventKind::ToolInvoked,
            "latency" => EventKind::Latency,
            "cost" => EventKind::Cost,
            "failure" => EventKind::Failure,
            "retry" => EventKind::Retry,
            "permission_denied" => EventKind::PermissionDenied,
            "emergency_stop" => EventKind::EmergencyStop,
            "confirmation_requested" => EventKind::ConfirmationRequested,
            "step_succeeded" => EventKind::StepSucceeded,
            "step_skipped" => EventKind::StepSkipped,
            "replanned" => EventKind::Replanned,
            "task_finished" => EventKind::TaskFinished,
            _ => return None,
        };
        Some(kind)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一条执行事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: String,
    pub task_id: TaskId,
    pub step_id: Option<StepId>,
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(task_id: impl Into<String>, kind: EventKind, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            step_id: None,
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}
