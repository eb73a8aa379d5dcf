//! 任务协调者（agent loop）
//!
//! 每个任务一个 TaskRun，独占该任务的计划、依赖图与步骤记录（单写者）。
//! 派发出去的尝试、重试计时器、修订请求都是独立的 tokio 任务，完成后把消息发回协调者；
//! 协调者在每次状态迁移后重新派发并判断是否结束，从不按固定节拍轮询。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{MemorySection, SchedulerSection};
use crate::core::{AttemptFailure, ConcurrencyLimiter, DispatchPermit, ErrorKind, RecoveryAction, RecoveryEngine, StepError};
use crate::memory::{render_context, MemoryRecord, MemoryStore};
use crate::observability::{EventKind, ExecutionEvent, Recorder};
use crate::oracle::{OracleError, OracleRequest, OracleResponse, PlanOracle, RevisionRequest};
use crate::permissions::{effective_scope, Authorization, DenyReason, PermissionGate};
use crate::persistence::TaskRepository;
use crate::plan::{
    failed_subtree, resolve_arguments, splice, Plan, PlanGraph, SplicedPlan, StepId, StepRecord, StepStatus,
};
use crate::scheduler::task::{ConfirmationRequest, Task, TaskReport, TaskStatus};
use crate::tools::{Cost, Outcome, RegisteredTool, StepCall, ToolInvoker, ToolRegistry};

/// 协调者依赖的共享服务
pub struct Services {
    pub registry: Arc<ToolRegistry>,
    pub gate: Arc<PermissionGate>,
    pub invoker: Arc<ToolInvoker>,
    pub recorder: Arc<dyn Recorder>,
    pub memory: Arc<dyn MemoryStore>,
    pub oracle: Arc<dyn PlanOracle>,
    pub repository: Option<Arc<dyn TaskRepository>>,
    pub confirmations: broadcast::Sender<ConfirmationRequest>,
    pub recovery: RecoveryEngine,
    pub scheduler: SchedulerSection,
    pub memory_policy: MemorySection,
}

/// 工作单元发回协调者的消息
enum RunMessage {
    AttemptFinished {
        step_id: StepId,
        outcome: Outcome,
        permit: DispatchPermit,
    },
    RetryDue {
        step_id: StepId,
        permit: DispatchPermit,
        cancelled: bool,
    },
    RevisionReady {
        step_id: StepId,
        result: Result<OracleResponse, OracleError>,
    },
}

pub struct TaskRun {
    services: Arc<Services>,
    task: Task,
    plan: Plan,
    history: Vec<Plan>,
    graph: PlanGraph,
    records: HashMap<StepId, StepRecord>,
    superseded: Vec<StepRecord>,
    /// 本次派发绑定的工具（授权一次，重试复用）
    bound: HashMap<StepId, RegisteredTool>,
    limiter: ConcurrencyLimiter,
    cancel: CancellationToken,
    resolutions: watch::Receiver<u64>,
    resolutions_open: bool,
    status_tx: watch::Sender<TaskStatus>,
    tx: mpsc::UnboundedSender<RunMessage>,
    rx: mpsc::UnboundedReceiver<RunMessage>,
    /// 尚未回报的工作单元（尝试、重试计时、修订请求）
    in_flight: usize,
    /// 等待外部确认的步骤 -> 令牌
    awaiting: HashMap<StepId, String>,
    announced: HashSet<String>,
    halted: bool,
    cancelled: bool,
    failed_step: Option<StepId>,
    error: Option<StepError>,
    cost: Cost,
    total_cost_usd: f64,
    started: Instant,
}

impl TaskRun {
    /// plan 必须已经通过校验
    pub fn new(services: Arc<Services>, mut task: Task, plan: Plan, status_tx: watch::Sender<TaskStatus>) -> Self {
        let default_max = services.scheduler.default_max_attempts;
        let records = plan
            .steps
            .iter()
            .map(|s| (s.step_id.clone(), StepRecord::new(Arc::clone(s), plan.version, default_max)))
            .collect();
        let graph = PlanGraph::new(&plan.steps);
        let limiter = ConcurrencyLimiter::from_config(&services.scheduler);
        let cancel = services.gate.cancellation_token(&task.id);
        let resolutions = services.gate.subscribe_resolutions();
        let (tx, rx) = mpsc::unbounded_channel();
        task.plan_version = plan.version;

        Self {
            services,
            task,
            plan,
            history: Vec::new(),
            graph,
            records,
            superseded: Vec::new(),
            bound: HashMap::new(),
            limiter,
            cancel,
            resolutions,
            resolutions_open: true,
            status_tx,
            tx,
            rx,
            in_flight: 0,
            awaiting: HashMap::new(),
            announced: HashSet::new(),
            halted: false,
            cancelled: false,
            failed_step: None,
            error: None,
            cost: Cost::default(),
            total_cost_usd: 0.0,
            started: Instant::now(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    /// 驱动任务直到 Completed / Failed / Cancelled
    pub async fn run(mut self) -> TaskReport {
        self.start();
        loop {
            self.dispatch_ready();
            if let Some(status) = self.evaluate() {
                return self.finish(status);
            }
            tokio::select! {
                Some(msg) = self.rx.recv() => self.handle(msg),
                _ = self.cancel.cancelled(), if !self.cancelled => self.on_cancel(),
                changed = self.resolutions.changed(), if self.resolutions_open => {
                    if changed.is_err() {
                        self.resolutions_open = false;
                    }
                }
            }
        }
    }

    fn start(&mut self) {
        self.task.status = TaskStatus::Executing;
        self.status_tx.send_replace(TaskStatus::Executing);
        tracing::info!(
            task_id = %self.task.id,
            plan_id = %self.plan.id,
            steps = self.plan.steps.len(),
            "Task executing"
        );
        self.emit_plan_chosen();
        self.persist_task();
        self.persist_plan();
    }

    // ---- 派发 ----

    fn dispatch_ready(&mut self) {
        if self.halted || self.cancelled {
            return;
        }
        self.awaiting.clear();
        for step_id in self.graph.ready_steps(&self.records) {
            // 同一轮里前面的拒绝可能已经跳过了它，或停止了派发
            if self.halted {
                break;
            }
            self.try_dispatch(&step_id);
        }
    }

    fn try_dispatch(&mut self, step_id: &str) {
        let Some(definition) = self
            .records
            .get(step_id)
            .filter(|r| r.status.is_unstarted())
            .map(|r| Arc::clone(&r.definition))
        else {
            return;
        };

        let tool = match self.services.registry.resolve(&definition.tool_id) {
            Ok(tool) => tool,
            Err(e) => {
                self.reject(step_id, StepError::new(ErrorKind::UnknownTool, e.to_string()), None);
                return;
            }
        };

        let Some(permit) = self.limiter.try_acquire(tool.spec.permission_scope.category) else {
            return;
        };

        match self
            .services
            .gate
            .authorize(&self.task.id, &self.task.user_id, &tool.spec, definition.requested_scope)
        {
            Authorization::Granted => {
                if let Some(record) = self.records.get_mut(step_id) {
                    record.transition(StepStatus::Ready);
                    record.transition(StepStatus::Running);
                    record.attempt_count += 1;
                }
                self.bound.insert(step_id.to_string(), tool);
                self.spawn_attempt(step_id, permit);
            }
            Authorization::Denied(reason) => {
                drop(permit);
                let kind = match reason {
                    DenyReason::RateLimited => ErrorKind::RateLimited,
                    DenyReason::EmergencyStopped => ErrorKind::EmergencyStopped,
                    DenyReason::ConfirmationRejected | DenyReason::PolicyBlocked => ErrorKind::PermissionDenied,
                };
                let detail = format!("{} denied for {}: {}", tool.spec.id, tool.spec.permission_scope, reason.as_str());
                self.reject(step_id, StepError::new(kind, detail), Some(reason));
            }
            Authorization::ConfirmationRequired(token) => {
                drop(permit);
                self.awaiting.insert(step_id.to_string(), token.clone());
                if self.announced.insert(token.clone()) {
                    let scope = effective_scope(&tool.spec, definition.requested_scope);
                    self.emit(
                        EventKind::ConfirmationRequested,
                        Some(step_id),
                        json!({ "tool": tool.spec.id, "scope": scope, "prompt_token": token }),
                    );
                    // 没有订阅者时发送失败，确认仍可通过 pending 令牌完成
                    let _ = self.services.confirmations.send(ConfirmationRequest {
                        task_id: self.task.id.clone(),
                        step_id: step_id.to_string(),
                        scope,
                        prompt_token: token,
                    });
                }
            }
        }
    }

    /// 派发前失败（未知工具 / 被拒绝）：步骤终止失败并进入自纠
    fn reject(&mut self, step_id: &str, error: StepError, reason: Option<DenyReason>) {
        if let Some(reason) = reason {
            self.emit(
                EventKind::PermissionDenied,
                Some(step_id),
                json!({ "reason": reason.as_str(), "detail": error.detail }),
            );
        }
        self.remember(step_id, json!({ "status": "failed", "error": error }));
        if let Some(record) = self.records.get_mut(step_id) {
            record.transition(StepStatus::Ready);
            record.transition(StepStatus::Failed);
            record.last_error = Some(error);
        }
        self.self_correct(step_id);
    }

    fn spawn_attempt(&mut self, step_id: &str, permit: DispatchPermit) {
        let (Some(record), Some(tool)) = (self.records.get(step_id), self.bound.get(step_id)) else {
            return;
        };
        let definition = &record.definition;
        // 只有声明的依赖可以被占位符引用
        let outputs: HashMap<StepId, Value> = definition
            .depends_on
            .iter()
            .filter_map(|id| {
                let output = self.records.get(id)?.output_for_dependents()?;
                Some((id.clone(), output))
            })
            .collect();
        let call = StepCall {
            task_id: self.task.id.clone(),
            step_id: step_id.to_string(),
            tool_id: definition.tool_id.clone(),
            arguments: resolve_arguments(&definition.arguments, &outputs),
            attempt: record.attempt_count,
        };
        let deadline = Duration::from_millis(match (definition.timeout_ms, tool.spec.default_timeout_ms) {
            (Some(ms), _) => ms,
            (None, 0) => self.services.scheduler.default_timeout_ms,
            (None, ms) => ms,
        });

        tracing::debug!(task_id = %call.task_id, step_id = %call.step_id, attempt = call.attempt, "Dispatching step");
        let tool = tool.clone();
        let invoker = Arc::clone(&self.services.invoker);
        let cancel = self.cancel.clone();
        let tx = self.tx.clone();
        let step_id = step_id.to_string();
        self.in_flight += 1;
        tokio::spawn(async move {
            let outcome = invoker.invoke(&call, &tool, deadline, &cancel).await;
            let _ = tx.send(RunMessage::AttemptFinished {
                step_id,
                outcome,
                permit,
            });
        });
    }

    // ---- 消息处理 ----

    fn handle(&mut self, msg: RunMessage) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match msg {
            RunMessage::AttemptFinished {
                step_id,
                outcome,
                permit,
            } => self.on_attempt_finished(&step_id, outcome, permit),
            RunMessage::RetryDue {
                step_id,
                permit,
                cancelled,
            } => self.on_retry_due(&step_id, permit, cancelled),
            RunMessage::RevisionReady { step_id, result } => self.on_revision(&step_id, result),
        }
    }

    fn on_attempt_finished(&mut self, step_id: &str, outcome: Outcome, permit: DispatchPermit) {
        let Some(record) = self.records.get(step_id) else {
            return;
        };
        let attempt = record.attempt_count;
        let max_attempts = record.max_attempts;
        let tool_id = record.definition.tool_id.clone();

        let failure = match outcome {
            Outcome::Success { value, cost } => {
                drop(permit);
                if let Some(cost) = cost {
                    self.cost.tokens_used += cost.tokens_used;
                    self.total_cost_usd += cost.cost_usd.unwrap_or(0.0);
                }
                self.remember(
                    step_id,
                    json!({ "status": "succeeded", "attempt": attempt, "tool": tool_id, "result": value }),
                );
                if let Some(record) = self.records.get_mut(step_id) {
                    record.result = Some(value);
                    record.last_error = None;
                    record.finalized = true;
                    record.transition(StepStatus::Succeeded);
                }
                self.emit(EventKind::StepSucceeded, Some(step_id), json!({ "attempts": attempt }));
                return;
            }
            Outcome::Failure { kind, detail, retryable } => AttemptFailure {
                error: StepError::new(kind, detail),
                retryable,
            },
            Outcome::Timeout { after } => {
                let (idempotent, retryable) = self
                    .bound
                    .get(step_id)
                    .map(|t| (t.spec.idempotent, t.spec.retryable))
                    .unwrap_or((false, false));
                AttemptFailure::timeout(&tool_id, idempotent, retryable, after)
            }
        };

        self.remember(
            step_id,
            json!({ "status": "failed", "attempt": attempt, "tool": tool_id, "error": failure.error }),
        );
        if let Some(record) = self.records.get_mut(step_id) {
            record.last_error = Some(failure.error.clone());
            record.transition(StepStatus::Failed);
        }

        let action = if self.cancelled || self.halted {
            RecoveryAction::Abort
        } else {
            self.services.recovery.handle(&failure, attempt, max_attempts)
        };
        match action {
            RecoveryAction::Retry { delay } => {
                if let Some(record) = self.records.get_mut(step_id) {
                    record.transition(StepStatus::Retrying);
                }
                self.emit(
                    EventKind::Retry,
                    Some(step_id),
                    json!({
                        "attempt": attempt,
                        "next_attempt": attempt + 1,
                        "delay_ms": delay.as_millis() as u64,
                        "error": failure.error,
                    }),
                );
                self.spawn_retry_timer(step_id, permit, delay);
            }
            RecoveryAction::SelfCorrect => {
                drop(permit);
                self.self_correct(step_id);
            }
            RecoveryAction::Abort => {
                drop(permit);
                self.finalize_failure(step_id);
            }
        }
    }

    fn spawn_retry_timer(&mut self, step_id: &str, permit: DispatchPermit, delay: Duration) {
        let cancel = self.cancel.clone();
        let tx = self.tx.clone();
        let step_id = step_id.to_string();
        self.in_flight += 1;
        tokio::spawn(async move {
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = cancel.cancelled() => true,
            };
            let _ = tx.send(RunMessage::RetryDue {
                step_id,
                permit,
                cancelled,
            });
        });
    }

    fn on_retry_due(&mut self, step_id: &str, permit: DispatchPermit, cancelled: bool) {
        if cancelled || self.cancelled {
            drop(permit);
            if let Some(record) = self.records.get_mut(step_id) {
                record.last_error = Some(StepError::new(ErrorKind::Cancelled, "cancelled during retry backoff"));
                record.transition(StepStatus::Failed);
            }
            self.finalize_failure(step_id);
            return;
        }
        if self.halted {
            drop(permit);
            if let Some(record) = self.records.get_mut(step_id) {
                record.transition(StepStatus::Failed);
            }
            self.finalize_failure(step_id);
            return;
        }
        if let Some(record) = self.records.get_mut(step_id) {
            record.transition(StepStatus::Running);
            record.attempt_count += 1;
        }
        self.spawn_attempt(step_id, permit);
    }

    // ---- 自纠 ----

    /// 请求修订失败子树；达到上限或任务已取消时直接终止失败
    fn self_correct(&mut self, step_id: &str) {
        let ceiling = self.services.scheduler.replan_ceiling;
        if self.cancelled || self.halted || self.task.replan_count >= ceiling {
            if !self.cancelled && !self.halted {
                tracing::info!(task_id = %self.task.id, step_id, ceiling, "Replan ceiling reached");
            }
            self.finalize_failure(step_id);
            return;
        }
        let Some(record) = self.records.get(step_id) else {
            return;
        };
        let error = record
            .last_error
            .clone()
            .unwrap_or_else(|| StepError::new(ErrorKind::Permanent, "unknown failure"));

        self.task.replan_count += 1;
        let subtree = failed_subtree(&self.graph, &self.records, step_id);
        let history = match self.services.memory.query_short_term(&self.task.id) {
            Ok(records) => render_context(&records, self.services.memory_policy.context_max_chars),
            Err(e) => {
                tracing::warn!(task_id = %self.task.id, error = %e, "Failed to read short-term memory");
                String::new()
            }
        };
        let completed = self
            .plan
            .steps
            .iter()
            .filter_map(|s| {
                let r = self.records.get(&s.step_id)?;
                match (r.status, &r.result) {
                    (StepStatus::Succeeded, Some(v)) => Some((s.step_id.clone(), v.clone())),
                    _ => None,
                }
            })
            .collect();
        let request = RevisionRequest {
            task_id: self.task.id.clone(),
            plan_id: self.plan.id.clone(),
            plan_version: self.plan.version,
            failed_step: step_id.to_string(),
            subtree: subtree
                .iter()
                .filter_map(|id| self.records.get(id).map(|r| (*r.definition).clone()))
                .collect(),
            error,
            history,
            completed,
        };

        tracing::info!(
            task_id = %self.task.id,
            step_id,
            replan_count = self.task.replan_count,
            subtree = ?subtree,
            "Requesting plan revision"
        );
        let oracle = Arc::clone(&self.services.oracle);
        let cancel = self.cancel.clone();
        let tx = self.tx.clone();
        let step_id = step_id.to_string();
        self.in_flight += 1;
        tokio::spawn(async move {
            let result = tokio::select! {
                r = oracle.respond(OracleRequest::SubtreeRevision(request)) => r,
                _ = cancel.cancelled() => Err(OracleError::Unavailable("task cancelled".into())),
            };
            let _ = tx.send(RunMessage::RevisionReady { step_id, result });
        });
    }

    fn on_revision(&mut self, step_id: &str, result: Result<OracleResponse, OracleError>) {
        if !self.records.contains_key(step_id) {
            return;
        }
        if self.cancelled || self.halted {
            self.finalize_failure(step_id);
            return;
        }
        match result {
            Ok(OracleResponse::Revision(revision)) => {
                let subtree = failed_subtree(&self.graph, &self.records, step_id);
                match splice(
                    &self.plan,
                    &self.records,
                    &subtree,
                    revision,
                    self.services.scheduler.max_steps,
                ) {
                    Ok(spliced) => self.apply_revision(step_id, spliced),
                    Err(e) => {
                        tracing::warn!(task_id = %self.task.id, step_id, error = %e, "Rejected plan revision");
                        self.emit(
                            EventKind::Failure,
                            Some(step_id),
                            json!({ "error_kind": ErrorKind::InvalidPlan, "detail": e.to_string(), "revision": true }),
                        );
                        self.finalize_failure(step_id);
                    }
                }
            }
            Ok(OracleResponse::NoRevision) => {
                tracing::info!(task_id = %self.task.id, step_id, "Oracle produced no revision");
                self.finalize_failure(step_id);
            }
            Ok(OracleResponse::Plan(_)) => {
                tracing::warn!(task_id = %self.task.id, step_id, "Oracle answered a revision request with a full plan");
                self.finalize_failure(step_id);
            }
            Err(e) => {
                tracing::warn!(task_id = %self.task.id, step_id, error = %e, "Plan revision failed");
                self.finalize_failure(step_id);
            }
        }
    }

    fn apply_revision(&mut self, step_id: &str, spliced: SplicedPlan) {
        let SplicedPlan {
            plan,
            removed,
            added,
            preserved,
        } = spliced;
        let default_max = self.services.scheduler.default_max_attempts;

        for id in &removed {
            self.bound.remove(id);
            if let Some(record) = self.records.remove(id) {
                self.superseded.push(record);
            }
        }
        for id in &added {
            if let Some(def) = plan.step(id) {
                self.records
                    .insert(id.clone(), StepRecord::new(Arc::clone(def), plan.version, default_max));
            }
        }

        let from_version = self.plan.version;
        let previous = std::mem::replace(&mut self.plan, plan);
        self.history.push(previous);
        self.graph = PlanGraph::new(&self.plan.steps);
        self.task.plan_version = self.plan.version;

        tracing::info!(
            task_id = %self.task.id,
            step_id,
            from_version,
            to_version = self.plan.version,
            "Plan revised"
        );
        self.emit(
            EventKind::Replanned,
            Some(step_id),
            json!({
                "from_version": from_version,
                "to_version": self.plan.version,
                "removed": removed,
                "added": added,
                "preserved": preserved,
            }),
        );
        self.emit_plan_chosen();
        self.persist_plan();
        self.persist_task();
    }

    // ---- 终止与跳过 ----

    /// 步骤终止失败：通知依赖方（放行或跳过），关键步骤失败时停止派发
    fn finalize_failure(&mut self, step_id: &str) {
        let Some(record) = self.records.get_mut(step_id) else {
            return;
        };
        record.finalized = true;
        let error = record.last_error.clone();
        let critical = record.definition.critical;
        let passes_through = record.definition.passes_through();
        let attempts = record.attempt_count;

        tracing::warn!(
            task_id = %self.task.id,
            step_id,
            critical,
            error = %error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
            "Step failed"
        );
        self.emit(
            EventKind::Failure,
            Some(step_id),
            json!({ "error": error, "attempts": attempts, "critical": critical }),
        );

        if self.cancelled {
            return;
        }
        if critical {
            self.halt(step_id, error);
        } else if !passes_through {
            self.skip_dependents(step_id, error);
        }
    }

    fn halt(&mut self, step_id: &str, error: Option<StepError>) {
        if !self.halted {
            self.halted = true;
            self.failed_step = Some(step_id.to_string());
            self.error = error;
        }
        self.skip_all_unstarted("critical step failed");
    }

    /// 沿依赖边跳过尚未开始的后代；带放行标注的步骤被跳过后不再向下传递
    fn skip_dependents(&mut self, step_id: &str, error: Option<StepError>) {
        let mut queue: VecDeque<StepId> = self.graph.dependents_of(step_id).iter().cloned().collect();
        let mut skipped_critical = false;
        while let Some(id) = queue.pop_front() {
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            if !record.status.is_unstarted() {
                continue;
            }
            record.transition(StepStatus::Skipped);
            record.finalized = true;
            let critical = record.definition.critical;
            let passes_through = record.definition.passes_through();
            self.emit(
                EventKind::StepSkipped,
                Some(&id),
                json!({ "reason": "dependency failed", "upstream": step_id }),
            );
            skipped_critical |= critical;
            if !passes_through {
                queue.extend(self.graph.dependents_of(&id).iter().cloned());
            }
        }
        if skipped_critical {
            self.halt(step_id, error);
        }
    }

    fn skip_all_unstarted(&mut self, reason: &str) {
        let ids: Vec<StepId> = self
            .plan
            .steps
            .iter()
            .map(|s| s.step_id.clone())
            .filter(|id| self.records.get(id).map(|r| r.status.is_unstarted()).unwrap_or(false))
            .collect();
        for id in ids {
            if let Some(record) = self.records.get_mut(&id) {
                record.transition(StepStatus::Skipped);
                record.finalized = true;
            }
            self.emit(EventKind::StepSkipped, Some(&id), json!({ "reason": reason }));
        }
        self.awaiting.clear();
    }

    fn on_cancel(&mut self) {
        self.cancelled = true;
        let in_flight: Vec<StepId> = self
            .plan
            .steps
            .iter()
            .map(|s| s.step_id.clone())
            .filter(|id| self.records.get(id).map(|r| r.status.is_in_flight()).unwrap_or(false))
            .collect();
        tracing::warn!(task_id = %self.task.id, in_flight = in_flight.len(), "Task cancelled by emergency stop");
        self.emit(EventKind::EmergencyStop, None, json!({ "in_flight": in_flight }));
        self.skip_all_unstarted("emergency stop");
    }

    /// 在没有未回报工作单元时判断任务是否结束
    fn evaluate(&mut self) -> Option<TaskStatus> {
        if self.in_flight > 0 {
            return None;
        }
        if self.cancelled {
            return Some(TaskStatus::Cancelled);
        }
        if self.halted {
            return Some(TaskStatus::Failed);
        }

        let unstarted = self.records.values().any(|r| r.status.is_unstarted());
        if unstarted {
            if !self.awaiting.is_empty() {
                return None;
            }
            tracing::warn!(task_id = %self.task.id, "No step can make progress, skipping remaining steps");
            self.skip_all_unstarted("unsatisfiable dependencies");
        }

        let completed = self
            .records
            .values()
            .all(|r| r.status == StepStatus::Succeeded || (!r.definition.critical && r.is_terminal()));
        if completed {
            Some(TaskStatus::Completed)
        } else {
            if self.failed_step.is_none() {
                if let Some(r) = self
                    .plan
                    .steps
                    .iter()
                    .filter_map(|s| self.records.get(&s.step_id))
                    .find(|r| r.definition.critical && r.status != StepStatus::Succeeded)
                {
                    self.failed_step = Some(r.id().to_string());
                    self.error = r.last_error.clone();
                }
            }
            Some(TaskStatus::Failed)
        }
    }

    fn finish(mut self, status: TaskStatus) -> TaskReport {
        self.task.status = status;
        self.task.completed_at = Some(chrono::Utc::now());
        if status == TaskStatus::Cancelled && self.error.is_none() {
            self.error = Some(StepError::new(ErrorKind::Cancelled, "task cancelled by emergency stop"));
        }
        let elapsed_ms = self.started.elapsed().as_millis() as u64;

        self.emit(
            EventKind::Cost,
            None,
            json!({ "tokens_used": self.cost.tokens_used, "cost_usd": self.total_cost_usd }),
        );
        self.emit(EventKind::Latency, None, json!({ "task_ms": elapsed_ms }));
        self.emit(
            EventKind::TaskFinished,
            None,
            json!({
                "status": status,
                "plan_version": self.plan.version,
                "replan_count": self.task.replan_count,
                "failed_step": self.failed_step,
                "error": self.error,
            }),
        );
        tracing::info!(
            task_id = %self.task.id,
            status = %status,
            replans = self.task.replan_count,
            elapsed_ms,
            "Task finished"
        );

        let steps: Vec<StepRecord> = self
            .plan
            .steps
            .iter()
            .filter_map(|s| self.records.get(&s.step_id).cloned())
            .collect();
        self.persist_task();
        if let Some(repo) = &self.services.repository {
            let mut all = self.superseded.clone();
            all.extend(steps.iter().cloned());
            if let Err(e) = repo.save_steps(&self.task.id, &all) {
                tracing::warn!(task_id = %self.task.id, error = %e, "Failed to persist steps");
            }
        }

        self.services.gate.release_task(&self.task.id);
        if !self.services.memory_policy.retain_short_term {
            if let Err(e) = self.services.memory.release_task(&self.task.id) {
                tracing::warn!(task_id = %self.task.id, error = %e, "Failed to release short-term memory");
            }
        }
        self.status_tx.send_replace(status);

        let response = steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Succeeded)
            .and_then(|s| s.result.clone());
        let mut plan_versions: Vec<_> = self.history.iter().map(Plan::to_document).collect();
        plan_versions.push(self.plan.to_document());

        TaskReport {
            task: self.task,
            plan: self.plan.to_document(),
            plan_versions,
            steps,
            superseded: self.superseded,
            failed_step: self.failed_step,
            error: self.error,
            response,
            total_tokens: self.cost.tokens_used,
            total_cost_usd: self.total_cost_usd,
        }
    }

    // ---- 记录 ----

    fn emit(&self, kind: EventKind, step_id: Option<&str>, payload: Value) {
        let mut event = ExecutionEvent::new(self.task.id.clone(), kind, payload);
        if let Some(step_id) = step_id {
            event = event.with_step(step_id);
        }
        self.services.recorder.record(event);
    }

    fn emit_plan_chosen(&self) {
        self.emit(
            EventKind::PlanChosen,
            None,
            json!({
                "plan_id": self.plan.id,
                "version": self.plan.version,
                "goal": self.plan.goal,
                "steps": self.plan.step_ids(),
            }),
        );
    }

    /// 每个步骤结果写一条短期记忆；失败只记日志
    fn remember(&self, step_id: &str, content: Value) {
        let record = MemoryRecord::short_term(self.task.id.clone(), content).with_step(step_id);
        if let Err(e) = self.services.memory.append_short_term(&self.task.id, record) {
            tracing::warn!(task_id = %self.task.id, step_id, error = %e, "Failed to write short-term memory");
        }
    }

    fn persist_task(&self) {
        if let Some(repo) = &self.services.repository {
            if let Err(e) = repo.save_task(&self.task) {
                tracing::warn!(task_id = %self.task.id, error = %e, "Failed to persist task");
            }
        }
    }

    fn persist_plan(&self) {
        if let Some(repo) = &self.services.repository {
            if let Err(e) = repo.save_plan(&self.plan) {
                tracing::warn!(task_id = %self.task.id, error = %e, "Failed to persist plan");
            }
        }
    }
}
