//! 计划构建器
//!
//! 提供流畅的API在代码中构建计划文档

use serde_json::Value;

use crate::plan::types::*;
use crate::tools::PermissionScope;

/// 计划构建器
pub struct PlanBuilder {
    plan_id: PlanId,
    goal: String,
    reasoning: String,
    steps: Vec<StepDefinition>,
}

impl PlanBuilder {
    /// 创建新的计划构建器
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            plan_id: format!("plan_{}", uuid::Uuid::new_v4()),
            goal: goal.into(),
            reasoning: String::new(),
            steps: Vec::new(),
        }
    }

    /// 指定计划 ID
    pub fn plan_id(mut self, id: impl Into<String>) -> Self {
        self.plan_id = id.into();
        self
    }

    /// 设置规划理由
    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    /// 添加步骤
    pub fn step(mut self, id: impl Into<String>, tool_id: impl Into<String>, arguments: Value) -> Self {
        self.steps.push(StepDefinition::new(id, tool_id, arguments));
        self
    }

    /// 设置依赖（所有前置步骤）
    pub fn depends_on<I, S>(mut self, step_id: &str, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(step) = self.find(step_id) {
            step.depends_on = deps.into_iter().map(Into::into).collect();
        }
        self
    }

    /// 设置顺序依赖
    pub fn sequential(self, from: &str, to: &str) -> Self {
        let from = from.to_string();
        self.depends_on(to, [from])
    }

    /// 标记为非关键步骤
    pub fn non_critical(mut self, step_id: &str) -> Self {
        if let Some(step) = self.find(step_id) {
            step.critical = false;
        }
        self
    }

    /// 非关键步骤失败时，依赖方拿到 value 继续执行
    pub fn pass_through(mut self, step_id: &str, value: Value) -> Self {
        if let Some(step) = self.find(step_id) {
            step.critical = false;
            step.pass_through = Some(PassThrough { value });
        }
        self
    }

    /// 设置最大尝试次数
    pub fn max_attempts(mut self, step_id: &str, n: u32) -> Self {
        if let Some(step) = self.find(step_id) {
            step.max_attempts = Some(n);
        }
        self
    }

    /// 设置超时
    pub fn timeout_ms(mut self, step_id: &str, ms: u64) -> Self {
        if let Some(step) = self.find(step_id) {
            step.timeout_ms = Some(ms);
        }
        self
    }

    /// 设置请求的权限范围
    pub fn scope(mut self, step_id: &str, scope: PermissionScope) -> Self {
        if let Some(step) = self.find(step_id) {
            step.requested_scope = Some(scope);
        }
        self
    }

    /// 设置描述
    pub fn describe(mut self, step_id: &str, description: impl Into<String>) -> Self {
        if let Some(step) = self.find(step_id) {
            step.description = description.into();
        }
        self
    }

    fn find(&mut self, step_id: &str) -> Option<&mut StepDefinition> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// 构建计划文档（不校验；校验在提交执行时进行）
    pub fn build(self) -> PlanDocument {
        PlanDocument {
            plan_id: self.plan_id,
            version: 1,
            goal: self.goal,
            reasoning: self.reasoning,
            steps: self.steps,
        }
    }
}
