//! 内置工具：echo（回显）与 wait（可取消的等待）

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::registry::{RegistryError, Tool, ToolCategory, ToolContext, ToolError, ToolOutput, ToolRegistry, ToolSpec};

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec::new("echo", ToolCategory::Custom)
            .with_description("Echo text. Args: {\"text\": \"message\"}")
            .with_input_schema(json!({
                "type": "object",
                "properties": { "text": {} }
            }))
            .with_timeout_ms(5_000)
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let value = match args.get("text") {
            Some(v) => v.clone(),
            None => Value::String("(empty)".into()),
        };
        Ok(ToolOutput::new(value))
    }
}

/// Wait 工具：等待 ms 毫秒，收到取消信号立即返回错误
pub struct WaitTool;

#[async_trait]
impl Tool for WaitTool {
    fn name(&self) -> &str {
        "wait"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec::new("wait", ToolCategory::System)
            .with_description("Sleep for a number of milliseconds. Args: {\"ms\": 100}")
            .with_input_schema(json!({
                "type": "object",
                "properties": { "ms": { "type": "integer", "minimum": 0 } },
                "required": ["ms"]
            }))
            .with_timeout_ms(60_000)
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let ms = args.get("ms").and_then(|v| v.as_u64()).unwrap_or(0);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(ToolOutput::new(json!({ "waited_ms": ms }))),
            _ = ctx.cancel.cancelled() => Err(ToolError::permanent("wait cancelled")),
        }
    }
}

/// 内置工具实现，按 id 索引（供定义文件绑定）
pub fn builtin_tools() -> HashMap<String, Arc<dyn Tool>> {
    let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(EchoTool), Arc::new(WaitTool)];
    tools.into_iter().map(|t| (t.name().to_string(), t)).collect()
}

/// 以各自的内置契约注册全部内置工具
pub fn register_builtins(registry: &mut ToolRegistry) -> Result<(), RegistryError> {
    registry.register(EchoTool)?;
    registry.register(WaitTool)?;
    Ok(())
}
