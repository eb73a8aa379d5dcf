//! 权限闸门
//!
//! 规则：
//! - 敏感度低于阈值的范围，在限流窗口内自动放行；
//! - 达到阈值的范围需要一条未过期、范围完全一致的授权（任务级或用户常驻授权），
//!   否则返回 ConfirmationRequired，调用方完成外部确认后再次授权；
//! - 限流按 (task, category) 滑动窗口，DashMap entry 保证同一键上的原子更新；
//! - emergency_stop 撤销任务的全部授权、挂起确认与限流窗口，并取消任务令牌，
//!   之后该任务的授权一律 Denied(EmergencyStopped)，直到显式清除。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::PermissionsSection;
use crate::plan::{TaskId, UserId};
use crate::tools::{PermissionScope, Sensitivity, ToolCategory, ToolSpec};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("Unknown confirmation token: {0}")]
    UnknownToken(String),
}

/// 授权主体：任务，或任务所属用户（常驻授权）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Subject {
    Task(TaskId),
    User(UserId),
}

/// 一条授权：在过期前允许 (scope, subject) 这一对
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionGrant {
    pub scope: PermissionScope,
    pub subject: Subject,
    pub expiry: Instant,
    /// 仅交互确认得到的授权带有令牌
    pub confirmation_token: Option<String>,
}

impl PermissionGrant {
    pub fn is_valid(&self, now: Instant) -> bool {
        now < self.expiry
    }
}

/// 拒绝原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    RateLimited,
    EmergencyStopped,
    ConfirmationRejected,
    PolicyBlocked,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::RateLimited => "rate_limited",
            DenyReason::EmergencyStopped => "emergency_stopped",
            DenyReason::ConfirmationRejected => "confirmation_rejected",
            DenyReason::PolicyBlocked => "policy_blocked",
        }
    }
}

/// 授权结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Granted,
    Denied(DenyReason),
    ConfirmationRequired(String),
}

#[derive(Debug, Clone)]
struct PendingConfirmation {
    task_id: TaskId,
    scope: PermissionScope,
}

/// 闸门配置
#[derive(Debug, Clone)]
pub struct GatePolicy {
    pub sensitivity_threshold: Sensitivity,
    pub rate_window: Duration,
    pub rate_max_calls: usize,
    pub confirmation_ttl: Duration,
    pub blocked_categories: HashSet<ToolCategory>,
}

impl GatePolicy {
    pub fn from_config(cfg: &PermissionsSection) -> Self {
        let mut blocked = HashSet::new();
        for name in &cfg.blocked_categories {
            match name.parse::<ToolCategory>() {
                Ok(c) => {
                    blocked.insert(c);
                }
                Err(_) => tracing::warn!(category = %name, "Unknown tool category in blocked_categories"),
            }
        }
        Self {
            sensitivity_threshold: cfg.sensitivity_threshold,
            rate_window: Duration::from_secs(cfg.rate_limit_window_secs),
            rate_max_calls: cfg.rate_limit_max_calls.max(1),
            confirmation_ttl: Duration::from_secs(cfg.confirmation_ttl_secs),
            blocked_categories: blocked,
        }
    }
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self::from_config(&PermissionsSection::default())
    }
}

/// 权限闸门；进程内共享，所有状态按 task / user / (task, category) 分键
pub struct PermissionGate {
    policy: GatePolicy,
    grants: DashMap<Subject, Vec<PermissionGrant>>,
    pending: DashMap<String, PendingConfirmation>,
    pending_index: DashMap<(TaskId, PermissionScope), String>,
    rejections: DashMap<(TaskId, PermissionScope), ()>,
    windows: DashMap<(TaskId, ToolCategory), VecDeque<Instant>>,
    stopped: DashMap<TaskId, ()>,
    cancel_tokens: Mutex<HashMap<TaskId, CancellationToken>>,
    resolutions: watch::Sender<u64>,
}

impl PermissionGate {
    pub fn new(policy: GatePolicy) -> Self {
        let (resolutions, _) = watch::channel(0);
        Self {
            policy,
            grants: DashMap::new(),
            pending: DashMap::new(),
            pending_index: DashMap::new(),
            rejections: DashMap::new(),
            windows: DashMap::new(),
            stopped: DashMap::new(),
            cancel_tokens: Mutex::new(HashMap::new()),
            resolutions,
        }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// 对一次工具调用授权；requested_scope 缺省时使用工具契约中的范围
    pub fn authorize(
        &self,
        task_id: &str,
        user_id: &str,
        spec: &ToolSpec,
        requested_scope: Option<PermissionScope>,
    ) -> Authorization {
        let scope = effective_scope(spec, requested_scope);

        if self.stopped.contains_key(task_id) {
            return Authorization::Denied(DenyReason::EmergencyStopped);
        }
        if self.policy.blocked_categories.contains(&scope.category) {
            return Authorization::Denied(DenyReason::PolicyBlocked);
        }

        if scope.sensitivity < self.policy.sensitivity_threshold || self.has_grant(task_id, user_id, &scope) {
            return self.admit(task_id, scope.category);
        }

        let key = (task_id.to_string(), scope);
        if self.rejections.contains_key(&key) {
            return Authorization::Denied(DenyReason::ConfirmationRejected);
        }

        let token = self
            .pending_index
            .entry(key)
            .or_insert_with(|| {
                let token = format!("confirm_{}", uuid::Uuid::new_v4());
                self.pending.insert(
                    token.clone(),
                    PendingConfirmation {
                        task_id: task_id.to_string(),
                        scope,
                    },
                );
                tracing::info!(task_id, scope = %scope, token = %token, "Confirmation required");
                token
            })
            .clone();
        Authorization::ConfirmationRequired(token)
    }

    fn has_grant(&self, task_id: &str, user_id: &str, scope: &PermissionScope) -> bool {
        let now = Instant::now();
        [Subject::Task(task_id.to_string()), Subject::User(user_id.to_string())]
            .iter()
            .any(|subject| {
                self.grants
                    .get(subject)
                    .map(|grants| grants.iter().any(|g| g.scope == *scope && g.is_valid(now)))
                    .unwrap_or(false)
            })
    }

    /// 滑动窗口限流：在 entry 锁内完成清理、判断与计数
    fn admit(&self, task_id: &str, category: ToolCategory) -> Authorization {
        let now = Instant::now();
        let window = self.policy.rate_window;
        let mut calls = self.windows.entry((task_id.to_string(), category)).or_default();
        while calls.front().map(|t| now.duration_since(*t) >= window).unwrap_or(false) {
            calls.pop_front();
        }
        if calls.len() >= self.policy.rate_max_calls {
            tracing::warn!(task_id, category = %category, calls = calls.len(), "Rate limit exceeded");
            return Authorization::Denied(DenyReason::RateLimited);
        }
        calls.push_back(now);
        Authorization::Granted
    }

    /// 外部确认回调：同意则生成任务级授权（有效期 confirmation_ttl），拒绝则记住
    pub fn resolve_confirmation(&self, token: &str, granted: bool) -> Result<(), GateError> {
        let (_, pending) = self
            .pending
            .remove(token)
            .ok_or_else(|| GateError::UnknownToken(token.to_string()))?;
        let key = (pending.task_id.clone(), pending.scope);
        self.pending_index.remove(&key);

        if granted {
            self.grants
                .entry(Subject::Task(pending.task_id.clone()))
                .or_default()
                .push(PermissionGrant {
                    scope: pending.scope,
                    subject: Subject::Task(pending.task_id.clone()),
                    expiry: Instant::now() + self.policy.confirmation_ttl,
                    confirmation_token: Some(token.to_string()),
                });
        } else {
            self.rejections.insert(key, ());
        }
        tracing::info!(task_id = %pending.task_id, scope = %pending.scope, granted, "Confirmation resolved");
        self.resolutions.send_modify(|epoch| *epoch += 1);
        Ok(())
    }

    /// 用户常驻授权
    pub fn grant_standing(&self, user_id: &str, scope: PermissionScope, ttl: Duration) {
        let subject = Subject::User(user_id.to_string());
        self.grants.entry(subject.clone()).or_default().push(PermissionGrant {
            scope,
            subject,
            expiry: Instant::now() + ttl,
            confirmation_token: None,
        });
        self.resolutions.send_modify(|epoch| *epoch += 1);
    }

    /// 紧急停止：撤销任务的授权、挂起确认与限流窗口，发出取消信号
    pub fn emergency_stop(&self, task_id: &str) {
        self.stopped.insert(task_id.to_string(), ());
        self.grants.remove(&Subject::Task(task_id.to_string()));
        self.pending.retain(|_, p| p.task_id != task_id);
        self.pending_index.retain(|(t, _), _| t != task_id);
        self.windows.retain(|(t, _), _| t != task_id);
        self.cancellation_token(task_id).cancel();
        tracing::warn!(task_id, "Emergency stop");
        self.resolutions.send_modify(|epoch| *epoch += 1);
    }

    pub fn clear_emergency_stop(&self, task_id: &str) {
        self.stopped.remove(task_id);
        let mut tokens = self.cancel_tokens.lock().unwrap_or_else(|e| e.into_inner());
        if tokens.get(task_id).map(|t| t.is_cancelled()).unwrap_or(false) {
            tokens.remove(task_id);
        }
    }

    pub fn is_stopped(&self, task_id: &str) -> bool {
        self.stopped.contains_key(task_id)
    }

    /// 任务的取消令牌（首次请求时创建）
    pub fn cancellation_token(&self, task_id: &str) -> CancellationToken {
        self.cancel_tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(task_id.to_string())
            .or_default()
            .clone()
    }

    /// 任务结束后清理其键；停止标记保留，直到显式清除
    pub fn release_task(&self, task_id: &str) {
        self.grants.remove(&Subject::Task(task_id.to_string()));
        self.pending.retain(|_, p| p.task_id != task_id);
        self.pending_index.retain(|(t, _), _| t != task_id);
        self.rejections.retain(|(t, _), _| t != task_id);
        self.windows.retain(|(t, _), _| t != task_id);
        if !self.is_stopped(task_id) {
            self.cancel_tokens
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(task_id);
        }
    }

    /// 确认结果 / 授权变化的通知；值为单调递增的纪元
    pub fn subscribe_resolutions(&self) -> watch::Receiver<u64> {
        self.resolutions.subscribe()
    }

    pub fn pending_confirmations(&self, task_id: &str) -> Vec<String> {
        self.pending
            .iter()
            .filter(|e| e.value().task_id == task_id)
            .map(|e| e.key().clone())
            .collect()
    }
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::new(GatePolicy::default())
    }
}

/// 请求范围缺省时取工具契约范围；请求的敏感度不得低于契约
pub fn effective_scope(spec: &ToolSpec, requested: Option<PermissionScope>) -> PermissionScope {
    let declared = spec.permission_scope;
    match requested {
        Some(r) => PermissionScope::new(declared.category, r.sensitivity.max(declared.sensitivity)),
        None => declared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn policy(max_calls: usize) -> GatePolicy {
        GatePolicy {
            sensitivity_threshold: Sensitivity::High,
            rate_window: Duration::from_secs(60),
            rate_max_calls: max_calls,
            confirmation_ttl: Duration::from_secs(60),
            blocked_categories: HashSet::new(),
        }
    }

    fn low_spec() -> ToolSpec {
        ToolSpec::new("echo", ToolCategory::Custom)
    }

    fn email_spec() -> ToolSpec {
        ToolSpec::new("send_email", ToolCategory::Communication).with_sensitivity(Sensitivity::High)
    }

    #[test]
    fn test_low_sensitivity_auto_granted_until_rate_limit() {
        let gate = PermissionGate::new(policy(2));
        assert_eq!(gate.authorize("t1", "u", &low_spec(), None), Authorization::Granted);
        assert_eq!(gate.authorize("t1", "u", &low_spec(), None), Authorization::Granted);
        assert_eq!(
            gate.authorize("t1", "u", &low_spec(), None),
            Authorization::Denied(DenyReason::RateLimited)
        );
        // 其他任务不受影响
        assert_eq!(gate.authorize("t2", "u", &low_spec(), None), Authorization::Granted);
    }

    #[test]
    fn test_confirmation_flow() {
        let gate = PermissionGate::new(policy(10));
        let token = match gate.authorize("t1", "u", &email_spec(), None) {
            Authorization::ConfirmationRequired(token) => token,
            other => panic!("expected confirmation, got {other:?}"),
        };
        // 同一 (task, scope) 复用令牌
        assert_eq!(
            gate.authorize("t1", "u", &email_spec(), None),
            Authorization::ConfirmationRequired(token.clone())
        );

        let mut rx = gate.subscribe_resolutions();
        gate.resolve_confirmation(&token, true).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(gate.authorize("t1", "u", &email_spec(), None), Authorization::Granted);
        assert_eq!(
            gate.resolve_confirmation(&token, true),
            Err(GateError::UnknownToken(token))
        );
    }

    #[test]
    fn test_rejected_confirmation_denies() {
        let gate = PermissionGate::new(policy(10));
        let Authorization::ConfirmationRequired(token) = gate.authorize("t1", "u", &email_spec(), None) else {
            panic!("expected confirmation");
        };
        gate.resolve_confirmation(&token, false).unwrap();
        assert_eq!(
            gate.authorize("t1", "u", &email_spec(), None),
            Authorization::Denied(DenyReason::ConfirmationRejected)
        );
    }

    #[test]
    fn test_standing_grant_must_match_exactly() {
        let gate = PermissionGate::new(policy(10));
        gate.grant_standing(
            "u",
            PermissionScope::new(ToolCategory::Communication, Sensitivity::High),
            Duration::from_secs(60),
        );
        assert_eq!(gate.authorize("t1", "u", &email_spec(), None), Authorization::Granted);

        let critical = email_spec().with_sensitivity(Sensitivity::Critical);
        assert!(matches!(
            gate.authorize("t1", "u", &critical, None),
            Authorization::ConfirmationRequired(_)
        ));
        // 其他用户没有该授权
        assert!(matches!(
            gate.authorize("t2", "other", &email_spec(), None),
            Authorization::ConfirmationRequired(_)
        ));
    }

    #[test]
    fn test_expired_grant_ignored() {
        let gate = PermissionGate::new(policy(10));
        gate.grant_standing(
            "u",
            PermissionScope::new(ToolCategory::Communication, Sensitivity::High),
            Duration::ZERO,
        );
        assert!(matches!(
            gate.authorize("t1", "u", &email_spec(), None),
            Authorization::ConfirmationRequired(_)
        ));
    }

    #[test]
    fn test_requested_scope_cannot_lower_sensitivity() {
        let requested = PermissionScope::new(ToolCategory::Custom, Sensitivity::Low);
        let scope = effective_scope(&email_spec(), Some(requested));
        assert_eq!(scope.category, ToolCategory::Communication);
        assert_eq!(scope.sensitivity, Sensitivity::High);
    }

    #[test]
    fn test_emergency_stop_revokes_and_cancels() {
        let gate = PermissionGate::new(policy(10));
        let token = gate.cancellation_token("t1");
        let Authorization::ConfirmationRequired(prompt) = gate.authorize("t1", "u", &email_spec(), None) else {
            panic!("expected confirmation");
        };
        gate.resolve_confirmation(&prompt, true).unwrap();

        gate.emergency_stop("t1");
        assert!(token.is_cancelled());
        assert_eq!(
            gate.authorize("t1", "u", &low_spec(), None),
            Authorization::Denied(DenyReason::EmergencyStopped)
        );

        gate.clear_emergency_stop("t1");
        // 授权已被撤销，需要重新确认
        assert!(matches!(
            gate.authorize("t1", "u", &email_spec(), None),
            Authorization::ConfirmationRequired(_)
        ));
        assert!(!gate.cancellation_token("t1").is_cancelled());
    }

    #[test]
    fn test_blocked_category() {
        let mut p = policy(10);
        p.blocked_categories.insert(ToolCategory::Browser);
        let gate = PermissionGate::new(p);
        let spec = ToolSpec::new("open_page", ToolCategory::Browser);
        assert_eq!(
            gate.authorize("t1", "u", &spec, None),
            Authorization::Denied(DenyReason::PolicyBlocked)
        );
    }

    #[test]
    fn test_rate_limit_is_atomic_across_threads() {
        let gate = Arc::new(PermissionGate::new(policy(50)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| gate.authorize("t1", "u", &low_spec(), None) == Authorization::Granted)
                        .count()
                })
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50);
    }
}
