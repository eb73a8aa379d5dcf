//! Agent 门面
//!
//! AgentBuilder 组装工具注册表、权限闸门、调用器、记忆、记录器与规划器；
//! Agent 对外提供提交计划、按目标规划执行、确认回调、紧急停止与状态查询。
//! 每个提交的任务由一个独立的 TaskRun 协调者驱动。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::{AgentError, RecoveryEngine, RetryPolicy};
use crate::memory::{InMemoryMemoryStore, MemoryStore};
use crate::observability::{BufferedRecorder, EventKind, EventSink, ExecutionEvent, Recorder, TracingSink};
use crate::oracle::{NoRevisionOracle, OracleError, OracleRequest, OracleResponse, PlanOracle, PlanRequest};
use crate::permissions::{GatePolicy, PermissionGate};
use crate::persistence::{SqliteStore, TaskRepository};
use crate::plan::{Plan, PlanDocument, TaskId};
use crate::scheduler::{ConfirmationRequest, Services, Task, TaskReport, TaskRun, TaskStatus};
use crate::tools::{
    builtin_tools, load_definitions, register_builtins, register_definitions, PermissionScope, Tool, ToolInvoker,
    ToolRegistry, ToolSpec,
};

const CONFIRMATION_CHANNEL: usize = 64;

/// Agent 构建器
pub struct AgentBuilder {
    config: AppConfig,
    registry: ToolRegistry,
    implementations: HashMap<String, Arc<dyn Tool>>,
    builtins: bool,
    oracle: Option<Arc<dyn PlanOracle>>,
    memory: Option<Arc<dyn MemoryStore>>,
    sink: Option<Arc<dyn EventSink>>,
    repository: Option<Arc<dyn TaskRepository>>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: ToolRegistry::new(),
            implementations: HashMap::new(),
            builtins: true,
            oracle: None,
            memory: None,
            sink: None,
            repository: None,
        }
    }

    /// 注册一个工具（契约取自工具自身）
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Result<Self, AgentError> {
        self.registry.register(tool)?;
        Ok(self)
    }

    /// 以显式契约注册工具
    pub fn with_tool_spec(mut self, spec: ToolSpec, tool: Arc<dyn Tool>) -> Result<Self, AgentError> {
        self.registry.register_with_spec(spec, tool)?;
        Ok(self)
    }

    /// 提供给工具定义文件绑定的实现
    pub fn with_implementation(mut self, name: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        self.implementations.insert(name.into(), tool);
        self
    }

    /// 是否注册内置工具（echo / wait），默认注册
    pub fn with_builtins(mut self, enabled: bool) -> Self {
        self.builtins = enabled;
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn PlanOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn TaskRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// 用同一个 SQLite 库承载记忆、事件与任务仓库
    pub fn with_sqlite(self, store: Arc<SqliteStore>) -> Self {
        self.with_memory(store.clone())
            .with_event_sink(store.clone())
            .with_repository(store)
    }

    pub fn build(mut self) -> Result<Agent, AgentError> {
        let cfg = self.config.clone();

        if self.builtins {
            register_builtins(&mut self.registry)?;
        }
        if let Some(path) = &cfg.tools.definitions_path {
            let definitions = load_definitions(path).map_err(|e| AgentError::ConfigError(e.to_string()))?;
            let mut implementations = builtin_tools();
            implementations.extend(self.implementations.drain());
            let n = register_definitions(
                &mut self.registry,
                &definitions,
                &implementations,
                cfg.permissions.sensitivity_threshold,
            )
            .map_err(|e| AgentError::ConfigError(e.to_string()))?;
            tracing::info!(path = %path.display(), registered = n, "Loaded tool definitions");
        }

        if let Some(path) = &cfg.persistence.sqlite_path {
            if self.memory.is_none() || self.sink.is_none() || self.repository.is_none() {
                let store = Arc::new(
                    SqliteStore::open(path)?.with_long_term_limit(cfg.memory.max_long_term_per_user),
                );
                if self.memory.is_none() {
                    self.memory = Some(store.clone());
                }
                if self.sink.is_none() {
                    self.sink = Some(store.clone());
                }
                if self.repository.is_none() {
                    self.repository = Some(store);
                }
            }
        }

        // 未配置落地时事件直接写日志，不再重复镜像
        let mirror = self.sink.is_some() && cfg.observability.log_events;
        let sink: Arc<dyn EventSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(TracingSink),
        };
        let recorder = Arc::new(
            BufferedRecorder::new(sink, cfg.observability.buffer_capacity).with_log_mirror(mirror),
        );
        let invoker = ToolInvoker::new(recorder.clone())
            .with_cancel_grace(Duration::from_millis(cfg.scheduler.cancel_grace_ms))
            .with_cost_per_million(cfg.observability.cost_per_million_tokens);
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(InMemoryMemoryStore::new(cfg.memory.max_long_term_per_user)));
        let (confirmations, _) = broadcast::channel(CONFIRMATION_CHANNEL);

        tracing::info!(
            tools = self.registry.len(),
            max_concurrency = cfg.scheduler.max_concurrency,
            replan_ceiling = cfg.scheduler.replan_ceiling,
            "Agent built"
        );

        let services = Services {
            registry: Arc::new(self.registry),
            gate: Arc::new(PermissionGate::new(GatePolicy::from_config(&cfg.permissions))),
            invoker: Arc::new(invoker),
            recorder: recorder.clone(),
            memory,
            oracle: self.oracle.unwrap_or_else(|| Arc::new(NoRevisionOracle)),
            repository: self.repository,
            confirmations,
            recovery: RecoveryEngine::new(RetryPolicy::from_config(&cfg.retry)),
            scheduler: cfg.scheduler.clone(),
            memory_policy: cfg.memory.clone(),
        };

        Ok(Agent {
            services: Arc::new(services),
            recorder,
            tasks: Arc::new(TaskTable::new(cfg.scheduler.finished_task_retention)),
        })
    }
}

/// 任务 id -> 状态订阅；结束的任务只保留最近 retention 个
struct TaskTable {
    live: DashMap<TaskId, watch::Receiver<TaskStatus>>,
    finished: Mutex<VecDeque<TaskId>>,
    retention: usize,
}

impl TaskTable {
    fn new(retention: usize) -> Self {
        Self {
            live: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            retention,
        }
    }

    fn insert(&self, task_id: TaskId, status: watch::Receiver<TaskStatus>) {
        self.live.insert(task_id, status);
    }

    fn get(&self, task_id: &str) -> Option<watch::Receiver<TaskStatus>> {
        self.live.get(task_id).map(|rx| rx.clone())
    }

    fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.live.get(task_id).map(|rx| *rx.borrow())
    }

    fn mark_finished(&self, task_id: &str) {
        let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        finished.push_back(task_id.to_string());
        while finished.len() > self.retention {
            if let Some(evicted) = finished.pop_front() {
                self.live.remove(&evicted);
            }
        }
    }

    fn len(&self) -> usize {
        self.live.len()
    }
}

/// 已提交任务的句柄
pub struct TaskHandle {
    task_id: TaskId,
    status: watch::Receiver<TaskStatus>,
    join: JoinHandle<TaskReport>,
    recorder: Arc<BufferedRecorder>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.borrow()
    }

    /// 状态变化的订阅
    pub fn watch(&self) -> watch::Receiver<TaskStatus> {
        self.status.clone()
    }

    /// 等待任务结束并取回报告；返回前把缓冲中的事件交给落地
    pub async fn wait(self) -> Result<TaskReport, AgentError> {
        let report = self
            .join
            .await
            .map_err(|e| AgentError::Aborted(format!("{}: {e}", self.task_id)))?;
        let recorder = self.recorder;
        if let Err(e) = tokio::task::spawn_blocking(move || recorder.flush()).await {
            tracing::warn!(task_id = %self.task_id, error = %e, "Event flush task failed");
        }
        Ok(report)
    }
}

/// 执行核心门面
pub struct Agent {
    services: Arc<Services>,
    recorder: Arc<BufferedRecorder>,
    tasks: Arc<TaskTable>,
}

impl Agent {
    pub fn builder(config: AppConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.services.registry
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.services.gate
    }

    pub fn memory(&self) -> &Arc<dyn MemoryStore> {
        &self.services.memory
    }

    pub fn recorder(&self) -> &BufferedRecorder {
        &self.recorder
    }

    /// 提交一个已有计划；非法计划在执行前被拒绝
    pub fn submit(&self, user_id: &str, plan: PlanDocument) -> Result<TaskHandle, AgentError> {
        let task = Task::new(user_id, plan.goal.clone());
        self.launch(task, plan)
    }

    /// 提交并等待结束
    pub async fn run(&self, user_id: &str, plan: PlanDocument) -> Result<TaskReport, AgentError> {
        self.submit(user_id, plan)?.wait().await
    }

    /// 由规划器为目标生成初始计划后执行
    pub async fn submit_goal(&self, user_id: &str, goal: &str) -> Result<TaskHandle, AgentError> {
        let task = Task::new(user_id, goal);
        self.persist_task(&task);
        let request = PlanRequest {
            task_id: task.id.clone(),
            user_id: user_id.to_string(),
            goal: goal.to_string(),
            tools: self.services.registry.describe(),
            context: String::new(),
        };
        tracing::info!(task_id = %task.id, goal, "Requesting initial plan");

        let plan = match self.services.oracle.respond(OracleRequest::InitialPlan(request)).await {
            Ok(OracleResponse::Plan(plan)) => plan,
            Ok(other) => {
                let e = OracleError::UnexpectedResponse(format!("{other:?}"));
                self.reject_task(task, &e.to_string());
                return Err(e.into());
            }
            Err(e) => {
                self.reject_task(task, &e.to_string());
                return Err(e.into());
            }
        };
        self.launch(task, plan)
    }

    pub async fn plan_and_run(&self, user_id: &str, goal: &str) -> Result<TaskReport, AgentError> {
        self.submit_goal(user_id, goal).await?.wait().await
    }

    fn launch(&self, mut task: Task, doc: PlanDocument) -> Result<TaskHandle, AgentError> {
        let plan = match Plan::from_document(task.id.clone(), doc, self.services.scheduler.max_steps) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(task_id = %task.id, code = e.code(), error = %e, "Rejected invalid plan");
                self.reject_task(task, &e.to_string());
                return Err(e.into());
            }
        };
        task.plan_version = plan.version;

        let (status_tx, status_rx) = watch::channel(TaskStatus::Planning);
        let task_id = task.id.clone();
        self.tasks.insert(task_id.clone(), status_rx.clone());

        let run = TaskRun::new(Arc::clone(&self.services), task, plan, status_tx);
        let tasks = Arc::clone(&self.tasks);
        let join = tokio::spawn(async move {
            let report = run.run().await;
            tasks.mark_finished(&report.task.id);
            report
        });
        Ok(TaskHandle {
            task_id,
            status: status_rx,
            join,
            recorder: Arc::clone(&self.recorder),
        })
    }

    /// 规划阶段即失败的任务：记为 Failed 并留下事件
    fn reject_task(&self, mut task: Task, reason: &str) {
        task.status = TaskStatus::Failed;
        task.completed_at = Some(chrono::Utc::now());
        self.persist_task(&task);
        self.services.recorder.record(ExecutionEvent::new(
            task.id.clone(),
            EventKind::TaskFinished,
            serde_json::json!({ "status": TaskStatus::Failed, "error": reason }),
        ));
    }

    fn persist_task(&self, task: &Task) {
        if let Some(repo) = &self.services.repository {
            if let Err(e) = repo.save_task(task) {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to persist task");
            }
        }
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.status(task_id)
    }

    /// 仍可查询状态的任务数（进行中 + 保留的已结束任务）
    pub fn tracked_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// 确认请求的订阅；每个需要交互确认的范围推送一次
    pub fn subscribe_confirmations(&self) -> broadcast::Receiver<ConfirmationRequest> {
        self.services.confirmations.subscribe()
    }

    pub fn resolve_confirmation(&self, prompt_token: &str, granted: bool) -> Result<(), AgentError> {
        Ok(self.services.gate.resolve_confirmation(prompt_token, granted)?)
    }

    /// 用户级长期授权
    pub fn grant_standing(&self, user_id: &str, scope: PermissionScope, ttl: Duration) {
        self.services.gate.grant_standing(user_id, scope, ttl);
    }

    /// 紧急停止：撤销授权、取消在途步骤，等待任务进入终态后返回该状态
    pub async fn emergency_stop(&self, task_id: &str) -> Result<TaskStatus, AgentError> {
        let mut rx = self
            .tasks
            .get(task_id)
            .ok_or_else(|| AgentError::TaskNotFound(task_id.to_string()))?;
        let current = *rx.borrow();
        if current.is_terminal() {
            return Ok(current);
        }

        self.services.gate.emergency_stop(task_id);
        let status = rx
            .wait_for(|s| s.is_terminal())
            .await
            .map(|s| *s)
            .map_err(|_| AgentError::Aborted(task_id.to_string()))?;
        Ok(status)
    }

    /// 把缓冲中的事件写入落地，返回写入条数
    pub fn flush_events(&self) -> usize {
        self.recorder.flush()
    }
}
