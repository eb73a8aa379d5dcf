//! 重试与自纠决策
//!
//! 根据一次失败尝试的错误类型、是否可重试与已用次数，返回 RecoveryAction：
//! 指数退避后重试 / 请求规划器修订失败子树 / 直接终止。

use std::time::Duration;

use rand::Rng;

use crate::config::RetrySection;
use crate::core::{ErrorKind, StepError};

/// 指数退避：base * 2^(attempt-1)，封顶 max，再加 [0, jitter] 的随机抖动
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetrySection) -> Self {
        Self {
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            jitter: Duration::from_millis(cfg.jitter_ms),
        }
    }

    /// 不含抖动的退避时长；attempt 从 1 开始
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let delay_ms = base_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.base_backoff(attempt) + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetrySection::default())
    }
}

/// 恢复引擎根据失败给出的动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 等待 delay 后再次运行同一步骤
    Retry { delay: Duration },
    /// 步骤终止失败，请求规划器修订失败子树
    SelfCorrect,
    /// 不重试也不修订（紧急停止）
    Abort,
}

/// 一次失败尝试的归一化结果
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub error: StepError,
    pub retryable: bool,
}

impl AttemptFailure {
    /// 超时：幂等且声明可重试的工具才会重试；非幂等工具无法判断是否已生效，升级为 AmbiguousOutcome
    pub fn timeout(tool_id: &str, idempotent: bool, retryable: bool, deadline: Duration) -> Self {
        if idempotent {
            Self {
                error: StepError::new(
                    ErrorKind::Timeout,
                    format!("{tool_id} exceeded deadline of {}ms", deadline.as_millis()),
                ),
                retryable,
            }
        } else {
            Self {
                error: StepError::new(
                    ErrorKind::AmbiguousOutcome,
                    format!(
                        "{tool_id} is not idempotent and timed out after {}ms; completion state unknown",
                        deadline.as_millis()
                    ),
                ),
                retryable: false,
            }
        }
    }
}

/// 语义化恢复：将失败映射为重试 / 自纠 / 终止
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine {
    policy: RetryPolicy,
}

impl RecoveryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// attempts 为已完成的尝试次数（含本次）
    pub fn handle(&self, failure: &AttemptFailure, attempts: u32, max_attempts: u32) -> RecoveryAction {
        if failure.error.kind == ErrorKind::Cancelled {
            return RecoveryAction::Abort;
        }
        if failure.retryable && attempts < max_attempts {
            return RecoveryAction::Retry {
                delay: self.policy.backoff(attempts),
            };
        }
        RecoveryAction::SelfCorrect
    }
}
