//! 工具层
//!
//! - registry: 能力契约与工具注册表
//! - schema: 参数 / 结果 Schema 校验
//! - invoker: 截止时间内执行单次尝试
//! - loader: TOML 工具定义
//! - builtin: echo / wait

pub mod builtin;
pub mod invoker;
pub mod loader;
pub mod registry;
pub mod schema;

pub use builtin::{builtin_tools, register_builtins, EchoTool, WaitTool};
pub use invoker::{classify, default_classify, Outcome, StepCall, ToolInvoker};
pub use loader::{load_definitions, parse_definitions, register_definitions, LoaderError, ToolDefinition};
pub use registry::{
    Cost, ErrorClass, PermissionScope, RegisteredTool, RegistryError, Sensitivity, Tool, ToolCategory, ToolContext,
    ToolError, ToolId, ToolOutput, ToolRegistry, ToolSpec,
};
pub use schema::{plan_schema_json, validate_value};
