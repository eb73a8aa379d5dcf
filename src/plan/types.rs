//! 计划类型定义
//!
//! PlanDocument / StepDefinition 是与规划器交换的结构化文档；
//! Plan 是某一版本的不可变计划，步骤定义以 Arc 共享，修订时未受影响的步骤按引用复用；
//! StepRecord 是调度器持有的运行时状态（状态、尝试次数、结果、最近错误、状态迁移历史）。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::StepError;
use crate::plan::graph::PlanGraph;
use crate::tools::PermissionScope;

pub type TaskId = String;
pub type StepId = String;
pub type PlanId = String;
pub type UserId = String;

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// 规划器产出的计划文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanDocument {
    pub plan_id: PlanId,
    #[serde(default = "default_version")]
    pub version: u32,
    /// 整体目标的简述
    #[serde(default)]
    pub goal: String,
    /// 规划器给出的理由
    #[serde(default)]
    pub reasoning: String,
    pub steps: Vec<StepDefinition>,
}

/// 依赖失败时的放行标注：依赖方拿到 value 作为该步骤的结果继续执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PassThrough {
    #[serde(default)]
    pub value: Value,
}

/// 单个步骤的定义（不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub step_id: StepId,
    pub tool_id: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// 关键步骤失败会导致任务失败
    #[serde(default = "default_true")]
    pub critical: bool,
    #[serde(default)]
    pub description: String,
    /// 覆盖配置中的默认最大尝试次数
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// 覆盖工具契约的默认超时
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 请求的权限范围；缺省时使用工具契约中的范围
    #[serde(default)]
    pub requested_scope: Option<PermissionScope>,
    /// 仅对非关键步骤生效
    #[serde(default)]
    pub pass_through: Option<PassThrough>,
}

impl StepDefinition {
    pub fn new(step_id: impl Into<String>, tool_id: impl Into<String>, arguments: Value) -> Self {
        Self {
            step_id: step_id.into(),
            tool_id: tool_id.into(),
            arguments,
            depends_on: Vec::new(),
            critical: true,
            description: String::new(),
            max_attempts: None,
            timeout_ms: None,
            requested_scope: None,
            pass_through: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    /// 非关键且带放行标注
    pub fn passes_through(&self) -> bool {
        !self.critical && self.pass_through.is_some()
    }
}

/// 计划校验错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("cycle: {}", .0.join(" -> "))]
    Cycle(Vec<StepId>),
    #[error("dangling reference: step '{step}' depends on missing '{missing}'")]
    DanglingReference { step: StepId, missing: StepId },
    #[error("duplicate step id: {0}")]
    DuplicateStep(StepId),
    #[error("empty step id")]
    EmptyStepId,
    #[error("too many steps: {count} > {max}")]
    TooManySteps { count: usize, max: usize },
    #[error("invalid revision: {0}")]
    InvalidRevision(String),
}

impl PlanError {
    /// 简短的错误类别（cycle / dangling-ref / ...）
    pub fn code(&self) -> &'static str {
        match self {
            PlanError::Cycle(_) => "cycle",
            PlanError::DanglingReference { .. } => "dangling-ref",
            PlanError::DuplicateStep(_) => "duplicate-step",
            PlanError::EmptyStepId => "empty-step-id",
            PlanError::TooManySteps { .. } => "too-many-steps",
            PlanError::InvalidRevision(_) => "invalid-revision",
        }
    }
}

/// 某一版本的不可变计划
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub task_id: TaskId,
    pub version: u32,
    pub goal: String,
    pub steps: Vec<Arc<StepDefinition>>,
}

impl Plan {
    /// 从文档构建并校验（重复 id、悬空引用、环、步骤数上限）
    pub fn from_document(task_id: impl Into<String>, doc: PlanDocument, max_steps: usize) -> Result<Self, PlanError> {
        let plan = Self {
            id: doc.plan_id,
            task_id: task_id.into(),
            version: doc.version,
            goal: doc.goal,
            steps: doc.steps.into_iter().map(Arc::new).collect(),
        };
        plan.validate(max_steps)?;
        Ok(plan)
    }

    pub fn validate(&self, max_steps: usize) -> Result<(), PlanError> {
        if self.steps.len() > max_steps {
            return Err(PlanError::TooManySteps {
                count: self.steps.len(),
                max: max_steps,
            });
        }
        PlanGraph::validate(&self.steps)
    }

    pub fn step(&self, step_id: &str) -> Option<&Arc<StepDefinition>> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.step_id.clone()).collect()
    }

    pub fn to_document(&self) -> PlanDocument {
        PlanDocument {
            plan_id: self.id.clone(),
            version: self.version,
            goal: self.goal.clone(),
            reasoning: String::new(),
            steps: self.steps.iter().map(|s| (**s).clone()).collect(),
        }
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Ready => "ready",
            StepStatus::Running => "running",
            StepStatus::Retrying => "retrying",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StepStatus::Pending),
            "ready" => Some(StepStatus::Ready),
            "running" => Some(StepStatus::Running),
            "retrying" => Some(StepStatus::Retrying),
            "succeeded" => Some(StepStatus::Succeeded),
            "failed" => Some(StepStatus::Failed),
            "skipped" => Some(StepStatus::Skipped),
            _ => None,
        }
    }

    /// 是否尚未开始执行
    pub fn is_unstarted(&self) -> bool {
        matches!(self, StepStatus::Pending | StepStatus::Ready)
    }

    /// 正在占用执行资源
    pub fn is_in_flight(&self) -> bool {
        matches!(self, StepStatus::Running | StepStatus::Retrying)
    }
}

/// 一次状态迁移及其时间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTransition {
    pub status: StepStatus,
    pub at: DateTime<Utc>,
}

/// 步骤运行时记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub definition: Arc<StepDefinition>,
    /// 引入该步骤的计划版本
    pub plan_version: u32,
    pub status: StepStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub result: Option<Value>,
    pub last_error: Option<StepError>,
    pub history: Vec<StepTransition>,
    /// Failed 是否已是最终状态（修订请求进行中时为 false）
    #[serde(default)]
    pub finalized: bool,
}

impl StepRecord {
    pub fn new(definition: Arc<StepDefinition>, plan_version: u32, default_max_attempts: u32) -> Self {
        let max_attempts = definition.max_attempts.unwrap_or(default_max_attempts).max(1);
        Self {
            definition,
            plan_version,
            status: StepStatus::Pending,
            attempt_count: 0,
            max_attempts,
            result: None,
            last_error: None,
            history: vec![StepTransition {
                status: StepStatus::Pending,
                at: Utc::now(),
            }],
            finalized: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.step_id
    }

    pub fn transition(&mut self, status: StepStatus) {
        self.status = status;
        self.history.push(StepTransition {
            status,
            at: Utc::now(),
        });
    }

    /// 是否已到达不会再变化的状态
    pub fn is_terminal(&self) -> bool {
        match self.status {
            StepStatus::Succeeded | StepStatus::Skipped => true,
            StepStatus::Failed => self.finalized,
            _ => false,
        }
    }

    /// 依赖方是否可以把本步骤视为已满足
    pub fn satisfies_dependents(&self) -> bool {
        match self.status {
            StepStatus::Succeeded => true,
            StepStatus::Skipped => self.definition.passes_through(),
            StepStatus::Failed => self.finalized && self.definition.passes_through(),
            _ => false,
        }
    }

    /// 依赖方在参数模板里拿到的值
    pub fn output_for_dependents(&self) -> Option<Value> {
        match self.status {
            StepStatus::Succeeded => self.result.clone(),
            _ if self.satisfies_dependents() => self.definition.pass_through.as_ref().map(|p| p.value.clone()),
            _ => None,
        }
    }

    /// 第一次进入 Running 的时间
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.history
            .iter()
            .find(|t| t.status == StepStatus::Running)
            .map(|t| t.at)
    }

    /// 最近一次进入某状态的时间
    pub fn last_entered(&self, status: StepStatus) -> Option<DateTime<Utc>> {
        self.history.iter().rev().find(|t| t.status == status).map(|t| t.at)
    }

    /// 进入 Running 的次数（即派发次数）
    pub fn dispatch_count(&self) -> usize {
        self.history.iter().filter(|t| t.status == StepStatus::Running).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_defaults() {
        let doc: PlanDocument = serde_json::from_value(json!({
            "plan_id": "p1",
            "steps": [
                { "step_id": "a", "tool_id": "echo" },
                { "step_id": "b", "tool_id": "echo", "depends_on": ["a"], "critical": false,
                  "pass_through": { "value": "n/a" } }
            ]
        }))
        .unwrap();
        assert_eq!(doc.version, 1);
        assert!(doc.steps[0].critical);
        assert_eq!(doc.steps[0].arguments, json!({}));
        assert!(doc.steps[1].passes_through());
    }

    #[test]
    fn test_from_document_rejects_too_many_steps() {
        let doc = PlanDocument {
            plan_id: "p".into(),
            version: 1,
            goal: String::new(),
            reasoning: String::new(),
            steps: (0..3).map(|i| StepDefinition::new(format!("s{i}"), "echo", json!({}))).collect(),
        };
        let err = Plan::from_document("t", doc, 2).unwrap_err();
        assert_eq!(err, PlanError::TooManySteps { count: 3, max: 2 });
        assert_eq!(err.code(), "too-many-steps");
    }

    #[test]
    fn test_record_pass_through_only_when_final() {
        let def = Arc::new(StepDefinition {
            pass_through: Some(PassThrough { value: json!("default") }),
            ..StepDefinition::new("a", "echo", json!({})).non_critical()
        });
        let mut rec = StepRecord::new(def, 1, 3);
        rec.transition(StepStatus::Running);
        rec.transition(StepStatus::Failed);
        assert!(!rec.satisfies_dependents());
        rec.finalized = true;
        assert!(rec.satisfies_dependents());
        assert_eq!(rec.output_for_dependents(), Some(json!("default")));
    }

    #[test]
    fn test_record_max_attempts_floor() {
        let def = Arc::new(StepDefinition::new("a", "echo", json!({})).with_max_attempts(0));
        let rec = StepRecord::new(def, 1, 3);
        assert_eq!(rec.max_attempts, 1);
        assert_eq!(rec.status, StepStatus::Pending);
        assert!(rec.started_at().is_none());
    }
}
