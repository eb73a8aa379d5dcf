//! 工具调用器
//!
//! 对单个步骤的一次尝试：先按 input_schema 校验参数（失败即 SchemaViolation，不可重试），
//! 再在截止时间内调用工具；超时取消底层动作并返回 Timeout，任务取消时给工具一个宽限期后返回
//! Failure(Cancelled)。工具错误经 工具分类器 -> 工具提示 -> 默认启发式 归为瞬时/永久。
//! 每次尝试输出一条 tool_invoked 事件（含延迟与成本）和一条 JSON 审计日志。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::ErrorKind;
use crate::observability::{EventKind, ExecutionEvent, Recorder};
use crate::plan::{StepId, TaskId};
use crate::tools::registry::{Cost, ErrorClass, RegisteredTool, Tool, ToolContext, ToolError, ToolOutput};
use crate::tools::schema::validate_value;

/// 一次步骤调用（参数已完成模板替换）
#[derive(Debug, Clone)]
pub struct StepCall {
    pub task_id: TaskId,
    pub step_id: StepId,
    pub tool_id: String,
    pub arguments: Value,
    /// 第几次尝试（从 1 开始）
    pub attempt: u32,
}

/// 一次尝试的结构化结果
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { value: Value, cost: Option<Cost> },
    Failure { kind: ErrorKind, detail: String, retryable: bool },
    Timeout { after: Duration },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::Failure { .. } => "failure",
            Outcome::Timeout { .. } => "timeout",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    fn failure(kind: ErrorKind, detail: impl Into<String>, retryable: bool) -> Self {
        Outcome::Failure {
            kind,
            detail: detail.into(),
            retryable,
        }
    }
}

/// 工具调用器：截止时间、取消宽限、错误分类、每次尝试一条事件
pub struct ToolInvoker {
    recorder: Arc<dyn Recorder>,
    cancel_grace: Duration,
    cost_per_million_tokens: f64,
}

impl ToolInvoker {
    pub fn new(recorder: Arc<dyn Recorder>) -> Self {
        Self {
            recorder,
            cancel_grace: Duration::from_millis(2_000),
            cost_per_million_tokens: 0.10,
        }
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_cost_per_million(mut self, price: f64) -> Self {
        self.cost_per_million_tokens = price;
        self
    }

    /// 执行一次尝试；从不返回 Err，所有结果都折叠为 Outcome
    pub async fn invoke(
        &self,
        call: &StepCall,
        tool: &RegisteredTool,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Outcome {
        let start = Instant::now();
        let outcome = self.run(call, tool, deadline, cancel).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        self.report(call, tool, &outcome, latency_ms);
        outcome
    }

    async fn run(
        &self,
        call: &StepCall,
        tool: &RegisteredTool,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Outcome {
        let spec = &tool.spec;

        if let Err(detail) = validate_value(&spec.input_schema, &call.arguments)
            .and_then(|_| tool.tool.validate(&call.arguments))
        {
            return Outcome::failure(ErrorKind::SchemaViolation, format!("arguments: {detail}"), false);
        }
        if cancel.is_cancelled() {
            return Outcome::failure(ErrorKind::Cancelled, "task cancelled before dispatch", false);
        }

        let ctx = ToolContext {
            task_id: call.task_id.clone(),
            step_id: call.step_id.clone(),
            attempt: call.attempt,
            cancel: cancel.child_token(),
        };

        enum Race {
            Done(Result<ToolOutput, ToolError>),
            Cancelled,
            Deadline,
        }

        let fut = tool.tool.invoke(call.arguments.clone(), &ctx);
        tokio::pin!(fut);
        let race = tokio::select! {
            biased;
            _ = cancel.cancelled() => Race::Cancelled,
            _ = tokio::time::sleep(deadline) => Race::Deadline,
            r = &mut fut => Race::Done(r),
        };

        match race {
            Race::Done(Ok(output)) => {
                if let Err(detail) = validate_value(&spec.output_schema, &output.value) {
                    return Outcome::failure(ErrorKind::SchemaViolation, format!("result: {detail}"), false);
                }
                Outcome::Success {
                    value: output.value,
                    cost: output.cost.map(|c| self.price(c)),
                }
            }
            Race::Done(Err(err)) => {
                let class = classify(tool.tool.as_ref(), &err);
                let kind = match class {
                    ErrorClass::Transient => ErrorKind::Transient,
                    ErrorClass::Permanent => ErrorKind::Permanent,
                };
                Outcome::failure(kind, err.message, class == ErrorClass::Transient && spec.retryable)
            }
            Race::Cancelled => {
                // 子令牌已随任务令牌取消，给工具一个宽限期收尾
                if tokio::time::timeout(self.cancel_grace, &mut fut).await.is_err() {
                    tracing::warn!(
                        task_id = %call.task_id,
                        step_id = %call.step_id,
                        tool = %spec.id,
                        "Tool did not acknowledge cancellation within grace period, dropping"
                    );
                }
                Outcome::failure(ErrorKind::Cancelled, "cancelled by emergency stop", false)
            }
            Race::Deadline => {
                ctx.cancel.cancel();
                Outcome::Timeout { after: deadline }
            }
        }
    }

    /// 只上报 token 时按单价估算费用
    fn price(&self, cost: Cost) -> Cost {
        match cost.cost_usd {
            Some(_) => cost,
            None => Cost {
                tokens_used: cost.tokens_used,
                cost_usd: Some(cost.tokens_used as f64 / 1_000_000.0 * self.cost_per_million_tokens),
            },
        }
    }

    fn report(&self, call: &StepCall, tool: &RegisteredTool, outcome: &Outcome, latency_ms: u64) {
        let mut payload = json!({
            "tool": tool.spec.id,
            "version": tool.spec.version,
            "attempt": call.attempt,
            "outcome": outcome.label(),
            "latency_ms": latency_ms,
        });
        match outcome {
            Outcome::Success { cost: Some(cost), .. } => {
                payload["tokens_used"] = json!(cost.tokens_used);
                payload["cost_usd"] = json!(cost.cost_usd);
            }
            Outcome::Failure { kind, detail, retryable } => {
                payload["error_kind"] = json!(kind.as_str());
                payload["detail"] = json!(detail);
                payload["retryable"] = json!(retryable);
            }
            Outcome::Timeout { after } => {
                payload["deadline_ms"] = json!(after.as_millis() as u64);
            }
            _ => {}
        }

        let audit = json!({
            "event": "tool_audit",
            "task_id": call.task_id,
            "step_id": call.step_id,
            "tool": tool.spec.id,
            "ok": outcome.is_success(),
            "outcome": outcome.label(),
            "duration_ms": latency_ms,
            "args_preview": args_preview(&call.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        self.recorder.record(
            ExecutionEvent::new(call.task_id.clone(), EventKind::ToolInvoked, payload).with_step(call.step_id.clone()),
        );
    }
}

/// 工具分类器优先，其次是工具给出的提示，最后是默认启发式
pub fn classify(tool: &dyn Tool, err: &ToolError) -> ErrorClass {
    tool.classify_error(err)
        .or(err.hint)
        .unwrap_or_else(|| default_classify(&err.message))
}

/// 默认启发式：网络 / 限流 / 锁忙 / 暂时不可用视为瞬时错误
pub fn default_classify(message: &str) -> ErrorClass {
    const TRANSIENT: &[&str] = &[
        "timeout",
        "timed out",
        "network",
        "connection",
        "rate limit",
        "too many requests",
        "429",
        "503",
        "unavailable",
        "busy",
        "locked",
        "temporarily",
        "try again",
    ];
    let lower = message.to_lowercase();
    if TRANSIENT.iter().any(|k| lower.contains(k)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
