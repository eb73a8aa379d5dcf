//! SQLite 存储
//!
//! 同一个库文件承载任务、计划版本、步骤记录、记忆与执行事件。
//! 计划文档、步骤记录与事件负载以 JSON 文本存放；连接由 Mutex 串行化。

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::memory::store::{check_owner, top_k};
use crate::memory::{MemoryError, MemoryRecord, MemoryStore, MemoryTier};
use crate::observability::{EventKind, EventSink, ExecutionEvent, SinkError};
use crate::persistence::{PersistenceError, TaskRepository};
use crate::plan::{Plan, PlanDocument, StepRecord};
use crate::scheduler::{Task, TaskStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    goal TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    plan_version INTEGER NOT NULL,
    replan_count INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS plans (
    task_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    plan_id TEXT NOT NULL,
    document TEXT NOT NULL,
    PRIMARY KEY (task_id, version)
);
CREATE TABLE IF NOT EXISTS steps (
    task_id TEXT NOT NULL,
    step_id TEXT NOT NULL,
    plan_version INTEGER NOT NULL,
    status TEXT NOT NULL,
    record TEXT NOT NULL,
    PRIMARY KEY (task_id, step_id, plan_version)
);
CREATE TABLE IF NOT EXISTS memories (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    tier TEXT NOT NULL,
    owner TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding TEXT,
    created_at TEXT NOT NULL,
    source_step_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_memories_owner ON memories(tier, owner);
CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    task_id TEXT NOT NULL,
    step_id TEXT,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    max_long_term_per_user: usize,
}

impl SqliteStore {
    /// 打开（或创建）库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PersistenceError::Corrupt(format!("create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "Opened SQLite store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_long_term_per_user: 1000,
        })
    }

    pub fn with_long_term_limit(mut self, max: usize) -> Self {
        self.max_long_term_per_user = max.max(1);
        self
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 某任务的全部事件，按写入顺序
    pub fn events_for_task(&self, task_id: &str) -> Result<Vec<ExecutionEvent>, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, step_id, kind, payload, timestamp FROM events WHERE task_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, DateTime<Utc>>(5)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, task_id, step_id, kind, payload, timestamp) = row?;
            let kind = EventKind::parse(&kind).ok_or_else(|| PersistenceError::Corrupt(format!("event kind {kind}")))?;
            events.push(ExecutionEvent {
                id,
                task_id,
                step_id,
                kind,
                payload: serde_json::from_str(&payload)?,
                timestamp,
            });
        }
        Ok(events)
    }

    fn insert_memory(&self, record: &MemoryRecord) -> Result<(), PersistenceError> {
        let embedding = record.embedding.as_ref().map(serde_json::to_string).transpose()?;
        self.conn().execute(
            "INSERT INTO memories (id, tier, owner, content, embedding, created_at, source_step_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.tier.as_str(),
                record.owner,
                serde_json::to_string(&record.content)?,
                embedding,
                record.created_at,
                record.source_step_id,
            ],
        )?;
        Ok(())
    }

    fn select_memories(&self, tier: MemoryTier, owner: &str) -> Result<Vec<MemoryRecord>, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, content, embedding, created_at, source_step_id FROM memories
             WHERE tier = ?1 AND owner = ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![tier.as_str(), owner], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, DateTime<Utc>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, content, embedding, created_at, source_step_id) = row?;
            records.push(MemoryRecord {
                id,
                tier,
                owner: owner.to_string(),
                content: serde_json::from_str(&content)?,
                embedding: embedding.as_deref().map(serde_json::from_str).transpose()?,
                created_at,
                source_step_id,
            });
        }
        Ok(records)
    }

    fn trim_long_term(&self, user_id: &str) -> Result<(), PersistenceError> {
        self.conn().execute(
            "DELETE FROM memories WHERE tier = ?1 AND owner = ?2 AND seq NOT IN (
                SELECT seq FROM memories WHERE tier = ?1 AND owner = ?2 ORDER BY seq DESC LIMIT ?3
             )",
            params![MemoryTier::LongTerm.as_str(), user_id, self.max_long_term_per_user as i64],
        )?;
        Ok(())
    }
}

impl From<PersistenceError> for MemoryError {
    fn from(e: PersistenceError) -> Self {
        MemoryError::Backend(e.to_string())
    }
}

impl MemoryStore for SqliteStore {
    fn append_short_term(&self, task_id: &str, record: MemoryRecord) -> Result<(), MemoryError> {
        check_owner(&record, task_id, MemoryTier::ShortTerm)?;
        Ok(self.insert_memory(&record)?)
    }

    fn append_long_term(&self, user_id: &str, record: MemoryRecord) -> Result<(), MemoryError> {
        check_owner(&record, user_id, MemoryTier::LongTerm)?;
        self.insert_memory(&record)?;
        Ok(self.trim_long_term(user_id)?)
    }

    fn query_short_term(&self, task_id: &str) -> Result<Vec<MemoryRecord>, MemoryError> {
        Ok(self.select_memories(MemoryTier::ShortTerm, task_id)?)
    }

    fn query_long_term(&self, user_id: &str, query_embedding: &[f32], k: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        let records = self.select_memories(MemoryTier::LongTerm, user_id)?;
        Ok(top_k(records, query_embedding, k))
    }

    fn release_task(&self, task_id: &str) -> Result<(), MemoryError> {
        self.conn()
            .execute(
                "DELETE FROM memories WHERE tier = ?1 AND owner = ?2",
                params![MemoryTier::ShortTerm.as_str(), task_id],
            )
            .map_err(|e| MemoryError::Backend(e.to_string()))?;
        Ok(())
    }
}

impl EventSink for SqliteStore {
    fn append(&self, event: &ExecutionEvent) -> Result<(), SinkError> {
        let payload = serde_json::to_string(&event.payload).map_err(|e| SinkError::Storage(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO events (id, task_id, step_id, kind, payload, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.id,
                    event.task_id,
                    event.step_id,
                    event.kind.as_str(),
                    payload,
                    event.timestamp,
                ],
            )
            .map_err(|e| SinkError::Storage(e.to_string()))?;
        Ok(())
    }
}

impl TaskRepository for SqliteStore {
    fn save_task(&self, task: &Task) -> Result<(), PersistenceError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO tasks (id, user_id, goal, status, created_at, completed_at, plan_version, replan_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.id,
                task.user_id,
                task.goal,
                task.status.as_str(),
                task.created_at,
                task.completed_at,
                task.plan_version,
                task.replan_count,
            ],
        )?;
        Ok(())
    }

    fn save_plan(&self, plan: &Plan) -> Result<(), PersistenceError> {
        let document = serde_json::to_string(&plan.to_document())?;
        self.conn().execute(
            "INSERT OR REPLACE INTO plans (task_id, version, plan_id, document) VALUES (?1, ?2, ?3, ?4)",
            params![plan.task_id, plan.version, plan.id, document],
        )?;
        Ok(())
    }

    fn save_steps(&self, task_id: &str, steps: &[StepRecord]) -> Result<(), PersistenceError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO steps (task_id, step_id, plan_version, status, record) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for step in steps {
                stmt.execute(params![
                    task_id,
                    step.id(),
                    step.plan_version,
                    step.status.as_str(),
                    serde_json::to_string(step)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_task(&self, task_id: &str) -> Result<Option<Task>, PersistenceError> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, user_id, goal, status, created_at, completed_at, plan_version, replan_count
                 FROM tasks WHERE id = ?1",
                params![task_id],
                |row| {
                    Ok((
                        Task {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            goal: row.get(2)?,
                            status: TaskStatus::Planning,
                            created_at: row.get(4)?,
                            completed_at: row.get(5)?,
                            plan_version: row.get(6)?,
                            replan_count: row.get(7)?,
                        },
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(mut task, status)| {
            task.status =
                TaskStatus::parse(&status).ok_or_else(|| PersistenceError::Corrupt(format!("task status {status}")))?;
            Ok(task)
        })
        .transpose()
    }

    fn load_plan_versions(&self, task_id: &str) -> Result<Vec<PlanDocument>, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT document FROM plans WHERE task_id = ?1 ORDER BY version ASC")?;
        let rows = stmt.query_map(params![task_id], |row| row.get::<_, String>(0))?;
        let mut plans = Vec::new();
        for row in rows {
            plans.push(serde_json::from_str(&row?)?);
        }
        Ok(plans)
    }

    fn load_steps(&self, task_id: &str) -> Result<Vec<StepRecord>, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT record FROM steps WHERE task_id = ?1 ORDER BY plan_version ASC, rowid ASC")?;
        let rows = stmt.query_map(params![task_id], |row| row.get::<_, String>(0))?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(serde_json::from_str(&row?)?);
        }
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanBuilder, StepStatus};
    use serde_json::json;
    use std::sync::Arc;

    fn sample_plan(task_id: &str) -> Plan {
        let doc = PlanBuilder::new("notify the team")
            .plan_id("p1")
            .step("a", "echo", json!({"text": "hi"}))
            .step("b", "echo", json!({"text": "{step_a_output}"}))
            .sequential("a", "b")
            .build();
        Plan::from_document(task_id, doc, 32).unwrap()
    }

    #[test]
    fn test_task_round_trip_with_status() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut task = Task::new("user_1", "notify the team");
        store.save_task(&task).unwrap();

        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.replan_count = 1;
        store.save_task(&task).unwrap();

        let loaded = store.load_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.replan_count, 1);
        assert!(loaded.completed_at.is_some());
        assert!(store.load_task("missing").unwrap().is_none());
    }

    #[test]
    fn test_plan_versions_in_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut plan = sample_plan("t1");
        plan.version = 2;
        store.save_plan(&plan).unwrap();
        plan.version = 1;
        store.save_plan(&plan).unwrap();

        let versions = store.load_plan_versions("t1").unwrap();
        assert_eq!(versions.iter().map(|p| p.version).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(versions[0].steps.len(), 2);
    }

    #[test]
    fn test_steps_keyed_by_plan_version() {
        let store = SqliteStore::open_in_memory().unwrap();
        let plan = sample_plan("t1");
        let mut a = StepRecord::new(Arc::clone(&plan.steps[0]), 1, 3);
        a.transition(StepStatus::Running);
        a.transition(StepStatus::Failed);
        let mut a2 = StepRecord::new(Arc::clone(&plan.steps[0]), 2, 3);
        a2.transition(StepStatus::Succeeded);

        store.save_steps("t1", &[a.clone(), a2]).unwrap();
        // 重复保存覆盖同一键
        store.save_steps("t1", &[a]).unwrap();

        let steps = store.load_steps("t1").unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[1].status, StepStatus::Succeeded);
    }

    #[test]
    fn test_memory_owner_isolation_and_release() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .append_short_term("t1", MemoryRecord::short_term("t1", json!({"status": "succeeded"})).with_step("a"))
            .unwrap();
        store
            .append_short_term("t2", MemoryRecord::short_term("t2", json!({"status": "failed"})))
            .unwrap();
        assert!(store
            .append_short_term("t1", MemoryRecord::short_term("t2", json!({})))
            .is_err());

        let t1 = store.query_short_term("t1").unwrap();
        assert_eq!(t1.len(), 1);
        assert_eq!(t1[0].source_step_id.as_deref(), Some("a"));

        store.release_task("t1").unwrap();
        assert!(store.query_short_term("t1").unwrap().is_empty());
        assert_eq!(store.query_short_term("t2").unwrap().len(), 1);
    }

    #[test]
    fn test_long_term_top_k_and_limit() {
        let store = SqliteStore::open_in_memory().unwrap().with_long_term_limit(2);
        for (text, emb) in [("old", vec![1.0, 0.0]), ("near", vec![0.9, 0.1]), ("far", vec![0.0, 1.0])] {
            store
                .append_long_term("u1", MemoryRecord::long_term("u1", json!(text)).with_embedding(emb))
                .unwrap();
        }

        let hits = store.query_long_term("u1", &[1.0, 0.0], 5).unwrap();
        // 超出上限时最旧的 "old" 被淘汰
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, json!("near"));
        assert!(store.query_long_term("u2", &[1.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_event_sink_append() {
        let store = SqliteStore::open_in_memory().unwrap();
        let event = ExecutionEvent::new("t1", EventKind::Retry, json!({"attempt": 1})).with_step("a");
        store.append(&event).unwrap();
        store
            .append(&ExecutionEvent::new("t2", EventKind::Cost, json!({})))
            .unwrap();

        let events = store.events_for_task("t1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id);
        assert_eq!(events[0].kind, EventKind::Retry);
        assert_eq!(events[0].step_id.as_deref(), Some("a"));
        assert_eq!(events[0].payload, json!({"attempt": 1}));
    }

    #[test]
    fn test_open_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hive.db");
        let store = SqliteStore::open(&path).unwrap();
        store.save_task(&Task::new("u", "g")).unwrap();
        assert!(path.exists());
    }
}
