//! 记忆存储：短期（任务内）与长期（用户级）两层
//!
//! 短期记录按插入顺序返回，随任务释放（或按保留策略保留）；
//! 长期记录按用户分区，带可选 embedding，按余弦相似度取 top-k。

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::plan::{StepId, TaskId, UserId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Owner mismatch: record owned by {record}, appended under {owner}")]
    OwnerMismatch { record: String, owner: String },
    #[error("Tier mismatch: expected {0}")]
    TierMismatch(&'static str),
    #[error("Memory backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    ShortTerm,
    LongTerm,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::ShortTerm => "short_term",
            MemoryTier::LongTerm => "long_term",
        }
    }
}

/// 一条记忆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub tier: MemoryTier,
    /// 短期为 task_id，长期为 user_id
    pub owner: String,
    pub content: Value,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub source_step_id: Option<StepId>,
}

impl MemoryRecord {
    pub fn short_term(task_id: impl Into<String>, content: Value) -> Self {
        Self::new(MemoryTier::ShortTerm, task_id.into(), content)
    }

    pub fn long_term(user_id: impl Into<String>, content: Value) -> Self {
        Self::new(MemoryTier::LongTerm, user_id.into(), content)
    }

    fn new(tier: MemoryTier, owner: String, content: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tier,
            owner,
            content,
            embedding: None,
            created_at: Utc::now(),
            source_step_id: None,
        }
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.source_step_id = Some(step_id.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// 记忆存储接口
pub trait MemoryStore: Send + Sync {
    fn append_short_term(&self, task_id: &str, record: MemoryRecord) -> Result<(), MemoryError>;

    fn append_long_term(&self, user_id: &str, record: MemoryRecord) -> Result<(), MemoryError>;

    /// 按插入顺序
    fn query_short_term(&self, task_id: &str) -> Result<Vec<MemoryRecord>, MemoryError>;

    /// 相似度最高的 k 条；没有 embedding 的记录不参与
    fn query_long_term(&self, user_id: &str, query_embedding: &[f32], k: usize) -> Result<Vec<MemoryRecord>, MemoryError>;

    /// 释放任务的短期记录
    fn release_task(&self, task_id: &str) -> Result<(), MemoryError>;
}

pub(crate) fn check_owner(record: &MemoryRecord, owner: &str, tier: MemoryTier) -> Result<(), MemoryError> {
    if record.tier != tier {
        return Err(MemoryError::TierMismatch(tier.as_str()));
    }
    if record.owner != owner {
        return Err(MemoryError::OwnerMismatch {
            record: record.owner.clone(),
            owner: owner.to_string(),
        });
    }
    Ok(())
}

/// 余弦相似度；维度不同或零向量返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// 在记录上按相似度取 top-k
pub(crate) fn top_k(records: impl IntoIterator<Item = MemoryRecord>, query: &[f32], k: usize) -> Vec<MemoryRecord> {
    let mut scored: Vec<(f32, MemoryRecord)> = records
        .into_iter()
        .filter_map(|r| {
            let score = cosine_similarity(r.embedding.as_deref()?, query);
            Some((score, r))
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(k).map(|(_, r)| r).collect()
}

/// 进程内实现
pub struct InMemoryMemoryStore {
    short_term: RwLock<HashMap<TaskId, Vec<MemoryRecord>>>,
    long_term: RwLock<HashMap<UserId, Vec<MemoryRecord>>>,
    max_long_term_per_user: usize,
}

impl InMemoryMemoryStore {
    pub fn new(max_long_term_per_user: usize) -> Self {
        Self {
            short_term: RwLock::new(HashMap::new()),
            long_term: RwLock::new(HashMap::new()),
            max_long_term_per_user: max_long_term_per_user.max(1),
        }
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl MemoryStore for InMemoryMemoryStore {
    fn append_short_term(&self, task_id: &str, record: MemoryRecord) -> Result<(), MemoryError> {
        check_owner(&record, task_id, MemoryTier::ShortTerm)?;
        self.short_term
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(task_id.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    fn append_long_term(&self, user_id: &str, record: MemoryRecord) -> Result<(), MemoryError> {
        check_owner(&record, user_id, MemoryTier::LongTerm)?;
        let mut store = self.long_term.write().unwrap_or_else(|e| e.into_inner());
        let records = store.entry(user_id.to_string()).or_default();
        records.push(record);
        let n = records.len();
        if n > self.max_long_term_per_user {
            records.drain(0..n - self.max_long_term_per_user);
        }
        Ok(())
    }

    fn query_short_term(&self, task_id: &str) -> Result<Vec<MemoryRecord>, MemoryError> {
        Ok(self
            .short_term
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }

    fn query_long_term(&self, user_id: &str, query_embedding: &[f32], k: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        let store = self.long_term.read().unwrap_or_else(|e| e.into_inner());
        let records = store.get(user_id).cloned().unwrap_or_default();
        Ok(top_k(records, query_embedding, k))
    }

    fn release_task(&self, task_id: &str) -> Result<(), MemoryError> {
        self.short_term
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
        Ok(())
    }
}
