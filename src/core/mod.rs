//! 核心层：错误分类、重试与自纠决策、并发限制

pub mod concurrency;
pub mod error;
pub mod retry;

pub use concurrency::{ConcurrencyLimiter, DispatchPermit};
pub use error::{AgentError, ErrorKind, StepError};
pub use retry::{AttemptFailure, RecoveryAction, RecoveryEngine, RetryPolicy};
