//! Hive - 自主任务智能体执行核心
//!
//! 模块划分：
//! - **agent**: 门面（构建、提交计划、确认回调、紧急停止）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、重试与恢复决策、并发限制
//! - **memory**: 短期 / 长期记忆
//! - **observability**: 执行事件、有界缓冲记录器、tracing 初始化
//! - **oracle**: 规划器接口与脚本化实现
//! - **permissions**: 权限闸门（授权、确认、限流、紧急停止）
//! - **persistence**: 任务仓库与 SQLite 存储
//! - **plan**: 计划文档、依赖图、参数模板、子树修订
//! - **scheduler**: 任务与单任务协调者
//! - **tools**: 工具契约、注册表、调用器、定义文件加载

pub mod agent;
pub mod config;
pub mod core;
pub mod memory;
pub mod observability;
pub mod oracle;
pub mod permissions;
pub mod persistence;
pub mod plan;
pub mod scheduler;
pub mod tools;

pub use agent::{Agent, AgentBuilder, TaskHandle};
pub use scheduler::{TaskReport, TaskStatus};
