//! 规划器接口
//!
//! 计划如何生成不在本核心范围内：规划器只是一个能力接口，
//! 对 InitialPlan 请求返回计划文档，对 SubtreeRevision 请求返回修订或 NoRevision。

pub mod parse;
pub mod scripted;

pub use parse::{parse_plan_text, parse_revision_text};
pub use scripted::ScriptedOracle;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::StepError;
use crate::plan::{PlanDocument, PlanId, PlanRevision, StepDefinition, StepId, TaskId, UserId};
use crate::tools::ToolSpec;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("Oracle unavailable: {0}")]
    Unavailable(String),
    #[error("Malformed oracle output: {0}")]
    Malformed(String),
    #[error("Unexpected oracle response: {0}")]
    UnexpectedResponse(String),
}

/// 初始规划请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub goal: String,
    /// 可用工具契约
    pub tools: Vec<ToolSpec>,
    /// 长期记忆等上下文
    #[serde(default)]
    pub context: String,
}

/// 失败子树修订请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionRequest {
    pub task_id: TaskId,
    pub plan_id: PlanId,
    pub plan_version: u32,
    pub failed_step: StepId,
    /// 失败步骤及其尚未运行的后代
    pub subtree: Vec<StepDefinition>,
    pub error: StepError,
    /// 已渲染的短期历史
    pub history: String,
    /// 已成功步骤的结果，修订步骤可以引用
    pub completed: Vec<(StepId, Value)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OracleRequest {
    InitialPlan(PlanRequest),
    SubtreeRevision(RevisionRequest),
}

impl OracleRequest {
    pub fn task_id(&self) -> &str {
        match self {
            OracleRequest::InitialPlan(r) => &r.task_id,
            OracleRequest::SubtreeRevision(r) => &r.task_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OracleResponse {
    Plan(PlanDocument),
    Revision(PlanRevision),
    /// 无法给出修订
    NoRevision,
}

/// 规划器
#[async_trait]
pub trait PlanOracle: Send + Sync {
    async fn respond(&self, request: OracleRequest) -> Result<OracleResponse, OracleError>;
}

/// 不提供修订的规划器：自纠请求一律 NoRevision
pub struct NoRevisionOracle;

#[async_trait]
impl PlanOracle for NoRevisionOracle {
    async fn respond(&self, request: OracleRequest) -> Result<OracleResponse, OracleError> {
        match request {
            OracleRequest::InitialPlan(_) => Err(OracleError::Unavailable("no planner configured".into())),
            OracleRequest::SubtreeRevision(_) => Ok(OracleResponse::NoRevision),
        }
    }
}
