//! 工具定义加载器
//!
//! 从 TOML 文件（`[[tool]]` 表）读取工具契约，并在启动时按 id 绑定到实现。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::tools::registry::{PermissionScope, RegistryError, Sensitivity, Tool, ToolCategory, ToolRegistry, ToolSpec};

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid tool definitions: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

fn default_version() -> String {
    "1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

fn any_schema() -> Value {
    serde_json::json!({})
}

fn low() -> Sensitivity {
    Sensitivity::Low
}

/// 单个工具定义（tools.toml 中的一个 `[[tool]]`）
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    pub tool_id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "object_schema")]
    pub input_schema: Value,
    #[serde(default = "any_schema")]
    pub output_schema: Value,
    pub category: ToolCategory,
    #[serde(default = "low")]
    pub sensitivity: Sensitivity,
    #[serde(default = "default_true")]
    pub idempotent: bool,
    #[serde(default = "default_true")]
    pub retryable: bool,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// 需要人工确认：有效敏感度至少提升到闸门阈值
    #[serde(default)]
    pub requires_confirmation: bool,
}

impl ToolDefinition {
    pub fn to_spec(&self, threshold: Sensitivity) -> ToolSpec {
        let sensitivity = if self.requires_confirmation {
            self.sensitivity.max(threshold)
        } else {
            self.sensitivity
        };
        ToolSpec {
            id: self.tool_id.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            output_schema: self.output_schema.clone(),
            permission_scope: PermissionScope::new(self.category, sensitivity),
            idempotent: self.idempotent,
            retryable: self.retryable,
            default_timeout_ms: self.default_timeout_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DefinitionsToml {
    #[serde(default)]
    tool: Vec<ToolDefinition>,
}

/// 解析 TOML 文本
pub fn parse_definitions(text: &str) -> Result<Vec<ToolDefinition>, LoaderError> {
    let parsed: DefinitionsToml = toml::from_str(text)?;
    Ok(parsed.tool)
}

/// 读取定义文件
pub fn load_definitions(path: impl AsRef<Path>) -> Result<Vec<ToolDefinition>, LoaderError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| LoaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_definitions(&text)
}

/// 按 id 把定义绑定到实现并注册；找不到实现的定义跳过并告警，返回注册数量
pub fn register_definitions(
    registry: &mut ToolRegistry,
    definitions: &[ToolDefinition],
    implementations: &HashMap<String, Arc<dyn Tool>>,
    threshold: Sensitivity,
) -> Result<usize, LoaderError> {
    let mut registered = 0;
    for def in definitions {
        match implementations.get(&def.tool_id) {
            Some(tool) => {
                registry.register_with_spec(def.to_spec(threshold), Arc::clone(tool))?;
                registered += 1;
            }
            None => tracing::warn!(tool = %def.tool_id, "No implementation bound for tool definition, skipping"),
        }
    }
    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::EchoTool;
    use std::io::Write;

    const DEFS: &str = r#"
[[tool]]
tool_id = "echo"
version = "2"
description = "Echo text"
category = "custom"
input_schema = { type = "object", required = ["text"], properties = { text = { type = "string" } } }

[[tool]]
tool_id = "send_email"
category = "communication"
sensitivity = "medium"
idempotent = false
requires_confirmation = true
default_timeout_ms = 10000
"#;

    #[test]
    fn test_parse_definitions() {
        let defs = parse_definitions(DEFS).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].version, "2");
        assert_eq!(defs[0].input_schema["required"][0], "text");
        assert!(defs[0].idempotent);

        let email = defs[1].to_spec(Sensitivity::High);
        assert_eq!(email.permission_scope.category, ToolCategory::Communication);
        assert_eq!(email.permission_scope.sensitivity, Sensitivity::High);
        assert!(!email.idempotent);
        assert_eq!(email.default_timeout_ms, 10_000);
        assert_eq!(email.version, "1");
    }

    #[test]
    fn test_register_binds_by_id() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DEFS.as_bytes()).unwrap();
        let defs = load_definitions(file.path()).unwrap();

        let mut impls: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        impls.insert("echo".into(), Arc::new(EchoTool));
        let mut registry = ToolRegistry::new();
        let n = register_definitions(&mut registry, &defs, &impls, Sensitivity::High).unwrap();

        assert_eq!(n, 1);
        assert_eq!(registry.lookup("echo").unwrap().version, "2");
        assert!(registry.lookup("send_email").is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(load_definitions("/nonexistent/tools.toml"), Err(LoaderError::Io { .. })));
    }
}
