//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SCHEDULER__MAX_CONCURRENCY=8`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::tools::Sensitivity;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerSection,
    pub retry: RetrySection,
    pub permissions: PermissionsSection,
    pub memory: MemorySection,
    pub observability: ObservabilitySection,
    pub tools: ToolsSection,
    pub persistence: PersistenceSection,
}

/// [scheduler] 段：并发、重试次数、重规划上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// 单个任务内同时执行的步骤上限
    pub max_concurrency: usize,
    /// 按工具类别的额外并发上限（如 device = 1，设备 UI 控制天然串行）
    pub category_limits: HashMap<String, usize>,
    /// 计划未指定时每个步骤的最大尝试次数
    pub default_max_attempts: u32,
    /// 单个任务允许的计划修订次数
    pub replan_ceiling: u32,
    /// 单个计划允许的最大步骤数
    pub max_steps: usize,
    /// 紧急停止后等待工具自行退出的宽限期（毫秒）
    pub cancel_grace_ms: u64,
    /// 工具未声明超时时的兜底值（毫秒）
    pub default_timeout_ms: u64,
    /// 结束后仍可按 id 查询状态的任务数，超出后淘汰最早结束的
    pub finished_task_retention: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            category_limits: HashMap::from([("device".to_string(), 1)]),
            default_max_attempts: 3,
            replan_ceiling: 2,
            max_steps: 32,
            cancel_grace_ms: 2000,
            default_timeout_ms: 30_000,
            finished_task_retention: 256,
        }
    }
}

/// [retry] 段：指数退避参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter_ms: 100,
        }
    }
}

/// [permissions] 段：敏感度阈值、限流窗口、确认授权有效期
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PermissionsSection {
    /// 达到或超过该敏感度的动作需要显式授权
    pub sensitivity_threshold: Sensitivity,
    pub rate_limit_window_secs: u64,
    /// 每个 (task, category) 在窗口内允许的调用次数
    pub rate_limit_max_calls: usize,
    /// 交互确认后生成的授权有效期（秒）
    pub confirmation_ttl_secs: u64,
    /// 策略上直接拒绝的工具类别
    pub blocked_categories: Vec<String>,
}

impl Default for PermissionsSection {
    fn default() -> Self {
        Self {
            sensitivity_threshold: Sensitivity::High,
            rate_limit_window_secs: 60,
            rate_limit_max_calls: 30,
            confirmation_ttl_secs: 900,
            blocked_categories: Vec::new(),
        }
    }
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// 任务结束后是否保留短期记录（供外部晋升策略读取）
    pub retain_short_term: bool,
    pub max_long_term_per_user: usize,
    /// 发给规划器的历史上下文字符上限
    pub context_max_chars: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            retain_short_term: true,
            max_long_term_per_user: 1000,
            context_max_chars: 3000,
        }
    }
}

/// [observability] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    /// 事件接收端不可用时的缓冲上限，超出后丢弃最旧事件
    pub buffer_capacity: usize,
    /// 是否把执行事件同时写入 tracing 日志
    pub log_events: bool,
    pub json_logs: bool,
    /// 工具只报告 token 数时的估算单价（美元 / 百万 token）
    pub cost_per_million_tokens: f64,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
            log_events: true,
            json_logs: false,
            cost_per_million_tokens: 0.10,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsSection {
    /// 工具能力契约定义文件（TOML，`[[tool]]` 数组）
    pub definitions_path: Option<PathBuf>,
}

/// [persistence] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PersistenceSection {
    /// 设置后任务、计划、记忆与事件写入该 SQLite 文件
    pub sqlite_path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.scheduler.max_concurrency, 4);
        assert_eq!(cfg.scheduler.category_limits.get("device"), Some(&1));
        assert_eq!(cfg.permissions.sensitivity_threshold, Sensitivity::High);
        assert!(cfg.memory.retain_short_term);
        assert!(cfg.tools.definitions_path.is_none());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[scheduler]\nmax_concurrency = 9\nreplan_ceiling = 5\n\n[permissions]\nsensitivity_threshold = \"critical\"\nblocked_categories = [\"browser\"]"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.scheduler.max_concurrency, 9);
        assert_eq!(cfg.scheduler.replan_ceiling, 5);
        // 未出现的键保留默认值
        assert_eq!(cfg.scheduler.default_max_attempts, 3);
        assert_eq!(cfg.permissions.sensitivity_threshold, Sensitivity::Critical);
        assert_eq!(cfg.permissions.blocked_categories, vec!["browser".to_string()]);
    }
}
