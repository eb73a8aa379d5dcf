//! 工具注册表
//!
//! 每个工具是实现 Tool trait 的一个变体（validate / invoke / classify_error），
//! 连同静态能力契约 ToolSpec 一起按 id 注册；注册表只做查找与参数校验，不执行工具。
//! 启动阶段注册完成后只读，可被多个派发任务并发读取。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::plan::{StepId, TaskId};
use crate::tools::schema::validate_value;

pub type ToolId = String;

/// 工具类别，也是限流与按类别并发控制的键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Llm,
    Vision,
    Communication,
    FileSystem,
    Browser,
    /// 设备 UI 控制，天然串行
    Device,
    System,
    Custom,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Llm => "llm",
            ToolCategory::Vision => "vision",
            ToolCategory::Communication => "communication",
            ToolCategory::FileSystem => "file_system",
            ToolCategory::Browser => "browser",
            ToolCategory::Device => "device",
            ToolCategory::System => "system",
            ToolCategory::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "llm" => Ok(ToolCategory::Llm),
            "vision" => Ok(ToolCategory::Vision),
            "communication" => Ok(ToolCategory::Communication),
            "file_system" | "filesystem" => Ok(ToolCategory::FileSystem),
            "browser" => Ok(ToolCategory::Browser),
            "device" => Ok(ToolCategory::Device),
            "system" => Ok(ToolCategory::System),
            "custom" => Ok(ToolCategory::Custom),
            other => Err(format!("unknown tool category: {other}")),
        }
    }
}

/// 敏感度等级，可比较大小
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
    Critical,
}

/// 权限范围：类别 + 敏感度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct PermissionScope {
    pub category: ToolCategory,
    pub sensitivity: Sensitivity,
}

impl PermissionScope {
    pub fn new(category: ToolCategory, sensitivity: Sensitivity) -> Self {
        Self {
            category,
            sensitivity,
        }
    }
}

impl std::fmt::Display for PermissionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:?}", self.category, self.sensitivity)
    }
}

/// 静态能力契约；同一 id + version 注册后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub id: ToolId,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub permission_scope: PermissionScope,
    pub idempotent: bool,
    pub retryable: bool,
    pub default_timeout_ms: u64,
}

impl ToolSpec {
    /// 宽松契约：任意对象输入 / 任意输出，低敏感度，幂等可重试
    pub fn new(id: impl Into<String>, category: ToolCategory) -> Self {
        Self {
            id: id.into(),
            version: "1".to_string(),
            description: String::new(),
            input_schema: serde_json::json!({ "type": "object" }),
            output_schema: serde_json::json!({}),
            permission_scope: PermissionScope::new(category, Sensitivity::Low),
            idempotent: true,
            retryable: true,
            default_timeout_ms: 30_000,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn with_sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.permission_scope.sensitivity = sensitivity;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.default_timeout_ms = ms;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// 工具上报的成本元数据
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub tokens_used: u64,
    /// 未提供时按配置单价估算
    pub cost_usd: Option<f64>,
}

/// 工具执行成功的输出
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub value: Value,
    pub cost: Option<Cost>,
}

impl ToolOutput {
    pub fn new(value: Value) -> Self {
        Self { value, cost: None }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Value::String(text.into()))
    }

    pub fn with_cost(mut self, cost: Cost) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// 错误可重试性分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 网络、限流、锁忙等瞬时错误
    Transient,
    /// 非法状态、执行中权限被撤销、输出畸形、明确拒绝等
    Permanent,
}

/// 工具实现返回的错误；hint 为工具自身给出的分类（可缺省）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolError {
    pub message: String,
    pub hint: Option<ErrorClass>,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: Some(ErrorClass::Transient),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: Some(ErrorClass::Permanent),
        }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// 单次调用的上下文：所属任务/步骤、第几次尝试、取消信号
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub task_id: TaskId,
    pub step_id: StepId,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// 工具能力契约：validate（可选的额外校验）、invoke、classify_error
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具 id（与 ToolSpec.id 一致）
    fn name(&self) -> &str;

    /// 工具自带的静态契约；由外部定义文件提供契约时可不覆盖
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(self.name(), ToolCategory::Custom)
    }

    /// schema 之外的业务校验
    fn validate(&self, _args: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;

    /// 工具自定义的错误分类器；返回 None 时交给默认启发式
    fn classify_error(&self, _err: &ToolError) -> Option<ErrorClass> {
        None
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate tool: {0}@{1}")]
    DuplicateTool(ToolId, String),
    #[error("Unknown tool: {0}")]
    UnknownTool(ToolId),
    #[error("Schema violation: {0}")]
    SchemaViolation(String),
}

/// 已注册的工具：契约 + 实现
#[derive(Clone)]
pub struct RegisteredTool {
    pub spec: ToolSpec,
    pub tool: Arc<dyn Tool>,
}

/// 工具注册表：id -> 按注册顺序排列的各版本，最后一个为当前版本
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<ToolId, Vec<RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以工具自带契约注册
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        let spec = tool.spec();
        self.register_with_spec(spec, Arc::new(tool))
    }

    /// 以外部契约注册；id + version 已存在时返回 DuplicateTool
    pub fn register_with_spec(&mut self, spec: ToolSpec, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let versions = self.tools.entry(spec.id.clone()).or_default();
        if versions.iter().any(|t| t.spec.version == spec.version) {
            return Err(RegistryError::DuplicateTool(spec.id, spec.version));
        }
        tracing::info!(
            tool = %spec.id,
            version = %spec.version,
            category = %spec.permission_scope.category,
            "Registered tool"
        );
        versions.push(RegisteredTool { spec, tool });
        Ok(())
    }

    /// 当前版本的契约
    pub fn lookup(&self, tool_id: &str) -> Result<ToolSpec, RegistryError> {
        self.resolve(tool_id).map(|t| t.spec)
    }

    /// 当前版本的契约 + 实现
    pub fn resolve(&self, tool_id: &str) -> Result<RegisteredTool, RegistryError> {
        self.tools
            .get(tool_id)
            .and_then(|v| v.last())
            .cloned()
            .ok_or_else(|| RegistryError::UnknownTool(tool_id.to_string()))
    }

    /// 指定版本的契约
    pub fn lookup_version(&self, tool_id: &str, version: &str) -> Result<ToolSpec, RegistryError> {
        self.tools
            .get(tool_id)
            .and_then(|v| v.iter().find(|t| t.spec.version == version))
            .map(|t| t.spec.clone())
            .ok_or_else(|| RegistryError::UnknownTool(format!("{tool_id}@{version}")))
    }

    /// 按 input_schema 与工具自定义校验检查参数
    pub fn validate_arguments(&self, tool_id: &str, args: &Value) -> Result<(), RegistryError> {
        let entry = self.resolve(tool_id)?;
        validate_value(&entry.spec.input_schema, args).map_err(RegistryError::SchemaViolation)?;
        entry.tool.validate(args).map_err(RegistryError::SchemaViolation)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 所有当前版本契约，按 id 排序（供规划提示词使用）
    pub fn describe(&self) -> Vec<ToolSpec> {
        self.tool_names()
            .iter()
            .filter_map(|name| self.lookup(name).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop(&'static str);

    #[async_trait]
    impl Tool for Noop {
        fn name(&self) -> &str {
            self.0
        }

        fn validate(&self, args: &Value) -> Result<(), String> {
            match args.get("to").and_then(|v| v.as_str()) {
                Some(to) if !to.contains('@') => Err(format!("invalid address: {to}")),
                _ => Ok(()),
            }
        }

        async fn invoke(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text("ok"))
        }
    }

    fn email_spec(version: &str) -> ToolSpec {
        ToolSpec::new("send_email", ToolCategory::Communication)
            .with_version(version)
            .with_input_schema(json!({
                "type": "object",
                "properties": { "to": { "type": "string" }, "body": { "type": "string" } },
                "required": ["to"]
            }))
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register_with_spec(email_spec("1"), Arc::new(Noop("send_email"))).unwrap();
        let err = registry
            .register_with_spec(email_spec("1"), Arc::new(Noop("send_email")))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateTool("send_email".into(), "1".into()));
        // 新版本可注册，并成为 lookup 的当前版本
        registry.register_with_spec(email_spec("2"), Arc::new(Noop("send_email"))).unwrap();
        assert_eq!(registry.lookup("send_email").unwrap().version, "2");
        assert_eq!(registry.lookup_version("send_email", "1").unwrap().version, "1");
    }

    #[test]
    fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        assert_eq!(
            registry.lookup("nope").unwrap_err(),
            RegistryError::UnknownTool("nope".into())
        );
    }

    #[test]
    fn test_validate_arguments() {
        let mut registry = ToolRegistry::new();
        registry.register_with_spec(email_spec("1"), Arc::new(Noop("send_email"))).unwrap();

        assert!(registry
            .validate_arguments("send_email", &json!({"to": "a@b.c", "body": "hi"}))
            .is_ok());
        assert!(matches!(
            registry.validate_arguments("send_email", &json!({"body": "hi"})),
            Err(RegistryError::SchemaViolation(_))
        ));
        // 工具自定义校验
        assert!(matches!(
            registry.validate_arguments("send_email", &json!({"to": "nobody"})),
            Err(RegistryError::SchemaViolation(msg)) if msg.contains("invalid address")
        ));
    }

    #[test]
    fn test_category_parse_and_sensitivity_order() {
        assert_eq!("file_system".parse::<ToolCategory>().unwrap(), ToolCategory::FileSystem);
        assert_eq!("Device".parse::<ToolCategory>().unwrap(), ToolCategory::Device);
        assert!("teleport".parse::<ToolCategory>().is_err());
        assert!(Sensitivity::Low < Sensitivity::High);
        assert!(Sensitivity::Critical > Sensitivity::High);
    }

    #[test]
    fn test_describe_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Noop("b_tool")).unwrap();
        registry.register(Noop("a_tool")).unwrap();
        let ids: Vec<String> = registry.describe().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a_tool".to_string(), "b_tool".to_string()]);
    }
}
