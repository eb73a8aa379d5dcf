//! JSON Schema 子集校验与计划文档 Schema 导出
//!
//! 校验支持 type / properties / required / additionalProperties(false) / items / enum /
//! minLength / maxLength / minimum / maximum，足以覆盖工具契约里的参数与结果描述。
//! plan_schema_json 用 schemars 生成计划文档的 Schema，可拼入规划器的提示词。

use schemars::schema_for;
use serde_json::Value;

use crate::plan::PlanDocument;

/// 按 schema 校验 value；失败时返回带 JSON 路径的说明
pub fn validate_value(schema: &Value, value: &Value) -> Result<(), String> {
    validate_at(schema, value, "$")
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        // true / 非对象 schema 视为不约束
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        let ok = match expected {
            Value::String(t) => type_matches(t, value),
            Value::Array(ts) => ts.iter().filter_map(|t| t.as_str()).any(|t| type_matches(t, value)),
            _ => true,
        };
        if !ok {
            return Err(format!(
                "{path}: expected type {}, got {}",
                expected,
                type_name(value)
            ));
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            return Err(format!("{path}: value {value} not in enum"));
        }
    }

    if let Value::String(s) = value {
        let len = s.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(|v| v.as_u64()) {
            if len < min {
                return Err(format!("{path}: string shorter than {min}"));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(|v| v.as_u64()) {
            if len > max {
                return Err(format!("{path}: string longer than {max}"));
            }
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(|v| v.as_f64()) {
            if n < min {
                return Err(format!("{path}: {n} is below minimum {min}"));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(|v| v.as_f64()) {
            if n > max {
                return Err(format!("{path}: {n} is above maximum {max}"));
            }
        }
    }

    if let Value::Object(obj) = value {
        if let Some(Value::Array(required)) = schema.get("required") {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !obj.contains_key(key) {
                    return Err(format!("{path}: missing required property '{key}'"));
                }
            }
        }
        let properties = schema.get("properties").and_then(|p| p.as_object());
        for (key, child) in obj {
            match properties.and_then(|p| p.get(key)) {
                Some(child_schema) => validate_at(child_schema, child, &format!("{path}.{key}"))?,
                None => {
                    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                        return Err(format!("{path}: unexpected property '{key}'"));
                    }
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            validate_at(item_schema, item, &format!("{path}[{i}]"))?;
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 返回计划文档的 JSON Schema 字符串，可拼入规划提示词
pub fn plan_schema_json() -> String {
    let schema = schema_for!(PlanDocument);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn email_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "to": { "type": "string", "minLength": 3 },
                "priority": { "type": "string", "enum": ["low", "high"] },
                "cc": { "type": "array", "items": { "type": "string" } },
                "retries": { "type": "integer", "minimum": 0, "maximum": 5 }
            },
            "required": ["to"],
            "additionalProperties": false
        })
    }

    #[test]
    fn test_valid_arguments() {
        let args = json!({"to": "a@b.c", "priority": "high", "cc": ["x@y.z"], "retries": 2});
        assert!(validate_value(&email_schema(), &args).is_ok());
    }

    #[test]
    fn test_violations_report_path() {
        let err = validate_value(&email_schema(), &json!({"priority": "low"})).unwrap_err();
        assert!(err.contains("missing required property 'to'"));

        let err = validate_value(&email_schema(), &json!({"to": "a@b.c", "cc": ["ok", 3]})).unwrap_err();
        assert!(err.starts_with("$.cc[1]"), "{err}");

        let err = validate_value(&email_schema(), &json!({"to": "a@b.c", "bcc": "z"})).unwrap_err();
        assert!(err.contains("unexpected property 'bcc'"));

        let err = validate_value(&email_schema(), &json!({"to": "a@b.c", "retries": 9})).unwrap_err();
        assert!(err.contains("above maximum"));

        let err = validate_value(&email_schema(), &json!({"to": "a@b.c", "priority": "urgent"})).unwrap_err();
        assert!(err.contains("not in enum"));
    }

    #[test]
    fn test_empty_schema_accepts_anything() {
        assert!(validate_value(&json!({}), &json!([1, "two", null])).is_ok());
        assert!(validate_value(&json!(true), &json!("x")).is_ok());
    }

    #[test]
    fn test_type_union() {
        let schema = json!({"type": ["string", "null"]});
        assert!(validate_value(&schema, &json!(null)).is_ok());
        assert!(validate_value(&schema, &json!(1)).is_err());
    }

    #[test]
    fn test_plan_schema_mentions_steps() {
        let schema = plan_schema_json();
        assert!(schema.contains("steps"));
        assert!(schema.contains("depends_on"));
    }
}
