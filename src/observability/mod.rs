//! 可观测性
//!
//! - events: 执行事件模型
//! - recorder: 有界缓冲记录器与事件落地
//! - init: tracing 订阅器初始化（EnvFilter + fmt，可选 JSON 输出）

pub mod events;
pub mod recorder;

pub use events::{EventKind, ExecutionEvent};
pub use recorder::{BufferedRecorder, EventSink, InMemoryEventLog, Recorder, SinkError, TracingSink};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::ObservabilitySection;

/// 安装全局 tracing 订阅器；RUST_LOG 优先，默认 info。重复调用时静默忽略
pub fn init(cfg: &ObservabilitySection) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let result = if cfg.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
