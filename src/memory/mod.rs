//! 记忆层：短期（任务内步骤结果）、长期（用户级，向量检索）

pub mod context;
pub mod store;

pub use context::render_context;
pub use store::{cosine_similarity, InMemoryMemoryStore, MemoryError, MemoryRecord, MemoryStore, MemoryTier};
