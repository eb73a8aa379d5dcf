//! 从规划器的自由文本中提取计划 / 修订 JSON
//!
//! 依次尝试：整体即 JSON、```json 代码块、第一个 `{` 到最后一个 `}`。

use serde::de::DeserializeOwned;

use crate::oracle::OracleError;
use crate::plan::{PlanDocument, PlanRevision};

fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return trimmed;
    }
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim());
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

fn parse<T: DeserializeOwned>(text: &str) -> Result<T, OracleError> {
    let json = extract_json(text);
    serde_json::from_str(json).map_err(|e| {
        let preview: String = json.chars().take(200).collect();
        OracleError::Malformed(format!("{e}: {preview}"))
    })
}

/// 解析计划文档
pub fn parse_plan_text(text: &str) -> Result<PlanDocument, OracleError> {
    parse(text)
}

/// 解析子树修订
pub fn parse_revision_text(text: &str) -> Result<PlanRevision, OracleError> {
    parse(text)
}
