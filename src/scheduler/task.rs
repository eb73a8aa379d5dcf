//! 任务与任务报告

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::StepError;
use crate::plan::{PlanDocument, StepId, StepRecord, StepStatus, TaskId, UserId};
use crate::tools::PermissionScope;

/// 任务状态：Planning -> Executing -> {Completed, Failed, Cancelled}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planning,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Planning => "planning",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planning" => Some(TaskStatus::Planning),
            "executing" => Some(TaskStatus::Executing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一个用户目标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub user_id: UserId,
    pub goal: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub plan_version: u32,
    pub replan_count: u32,
}

impl Task {
    pub fn new(user_id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            user_id: user_id.into(),
            goal: goal.into(),
            status: TaskStatus::Planning,
            created_at: Utc::now(),
            completed_at: None,
            plan_version: 0,
            replan_count: 0,
        }
    }
}

/// 发给外部应用的确认请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub task_id: TaskId,
    pub step_id: StepId,
    pub scope: PermissionScope,
    pub prompt_token: String,
}

/// 任务结束后的报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: Task,
    /// 当前（最终）计划版本
    pub plan: PlanDocument,
    /// 全部计划版本，按版本号升序
    pub plan_versions: Vec<PlanDocument>,
    /// 当前计划中的步骤记录，按计划顺序
    pub steps: Vec<StepRecord>,
    /// 被修订移除的步骤记录
    pub superseded: Vec<StepRecord>,
    pub failed_step: Option<StepId>,
    pub error: Option<StepError>,
    /// 计划顺序中最后一个成功步骤的结果
    pub response: Option<Value>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

impl TaskReport {
    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.id() == step_id)
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step(step_id).map(|s| s.status)
    }
}
