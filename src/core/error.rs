//! 错误分类与门面错误类型
//!
//! 步骤级失败是数据（StepError），随 Outcome 与 StepRecord 流转，不跨调度器边界抛出；
//! AgentError 只用于门面层 API（计划非法、工具注册冲突、任务不存在等）。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::MemoryError;
use crate::observability::SinkError;
use crate::oracle::OracleError;
use crate::permissions::GateError;
use crate::persistence::PersistenceError;
use crate::plan::PlanError;
use crate::tools::RegistryError;

/// 步骤失败的类型（对应错误分类表）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 计划存在环或悬空引用，执行前拒绝
    InvalidPlan,
    /// 参数或结果与 schema 不符
    SchemaViolation,
    /// 注册表中不存在该工具
    UnknownTool,
    PermissionDenied,
    RateLimited,
    EmergencyStopped,
    /// 超时（幂等工具可重试）
    Timeout,
    /// 非幂等工具超时，完成状态不明，交由规划器决定补偿动作
    AmbiguousOutcome,
    /// 网络 / 后端等瞬时错误
    Transient,
    /// 工具明确拒绝
    Permanent,
    /// 紧急停止导致的中止
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidPlan => "invalid_plan",
            ErrorKind::SchemaViolation => "schema_violation",
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::EmergencyStopped => "emergency_stopped",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AmbiguousOutcome => "ambiguous_outcome",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 步骤的最近一次错误：类型 + 人类可读说明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// 门面层错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("Plan oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Event sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task aborted: {0}")]
    Aborted(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}
