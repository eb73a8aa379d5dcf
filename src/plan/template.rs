//! 参数模板：把 `{step_<id>_output}` 替换为依赖步骤的结果
//!
//! 整个字符串恰好是一个占位符时替换为结构化值本身；嵌在文本中时替换为其文本形式。
//! 只能引用本步骤声明的依赖；引用不到结果的占位符替换为 `[step <id> output unavailable]`。

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::plan::StepId;

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\{step_(.+?)_output\}").unwrap())
}

/// 递归替换参数中的占位符
pub fn resolve_arguments(args: &Value, outputs: &HashMap<StepId, Value>) -> Value {
    match args {
        Value::String(s) => resolve_string(s, outputs),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_arguments(v, outputs)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_arguments(v, outputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, outputs: &HashMap<StepId, Value>) -> Value {
    let re = placeholder();

    if let Some(caps) = re.captures(s) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
            let id = &caps[1];
            return match outputs.get(id) {
                Some(value) => value.clone(),
                None => Value::String(unavailable(id)),
            };
        }
    } else {
        return Value::String(s.to_string());
    }

    let replaced = re.replace_all(s, |caps: &regex::Captures| {
        let id = &caps[1];
        match outputs.get(id) {
            Some(Value::String(text)) => text.clone(),
            Some(value) => value.to_string(),
            None => unavailable(id),
        }
    });
    Value::String(replaced.into_owned())
}

fn unavailable(id: &str) -> String {
    format!("[step {id} output unavailable]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> HashMap<StepId, Value> {
        HashMap::from([
            ("search".to_string(), json!({"hits": 3})),
            ("summary".to_string(), json!("three results")),
        ])
    }

    #[test]
    fn test_whole_placeholder_keeps_structure() {
        let args = json!({"data": "{step_search_output}"});
        assert_eq!(resolve_arguments(&args, &outputs()), json!({"data": {"hits": 3}}));
    }

    #[test]
    fn test_embedded_placeholder_is_textual() {
        let args = json!({"body": "Found: {step_summary_output} ({step_search_output})"});
        assert_eq!(
            resolve_arguments(&args, &outputs()),
            json!({"body": "Found: three results ({\"hits\":3})"})
        );
    }

    #[test]
    fn test_missing_output_marked_unavailable() {
        let args = json!(["{step_nope_output}", "x {step_nope_output}", 7]);
        assert_eq!(
            resolve_arguments(&args, &outputs()),
            json!(["[step nope output unavailable]", "x [step nope output unavailable]", 7])
        );
    }
}
