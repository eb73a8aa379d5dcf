//! 持久化：任务、计划版本与步骤记录
//!
//! 调度器在计划版本变化、任务状态变化与任务结束时写入仓库；写入失败只记录日志，不影响任务本身。

pub mod sqlite;

pub use sqlite::SqliteStore;

use thiserror::Error;

use crate::plan::{Plan, PlanDocument, StepRecord};
use crate::scheduler::Task;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// 任务仓库
pub trait TaskRepository: Send + Sync {
    /// 插入或覆盖任务（按 id）
    fn save_task(&self, task: &Task) -> Result<(), PersistenceError>;

    /// 保存一个计划版本；同一 (task, version) 重复保存时覆盖
    fn save_plan(&self, plan: &Plan) -> Result<(), PersistenceError>;

    /// 保存步骤记录，按 (task, step, plan_version) 去重
    fn save_steps(&self, task_id: &str, steps: &[StepRecord]) -> Result<(), PersistenceError>;

    fn load_task(&self, task_id: &str) -> Result<Option<Task>, PersistenceError>;

    /// 按版本号升序
    fn load_plan_versions(&self, task_id: &str) -> Result<Vec<PlanDocument>, PersistenceError>;

    fn load_steps(&self, task_id: &str) -> Result<Vec<StepRecord>, PersistenceError>;
}
