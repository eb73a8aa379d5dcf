//! 短期历史渲染：在字符预算内保留最新记录，按时间顺序输出，供修订请求使用

use serde_json::Value;

use crate::memory::store::MemoryRecord;

/// 渲染为多行文本，每行 `[step] status: content`；超出预算时丢弃最旧的记录
pub fn render_context(records: &[MemoryRecord], max_chars: usize) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut used = 0;
    for record in records.iter().rev() {
        let line = render_line(record);
        let cost = line.chars().count() + 1;
        if used + cost > max_chars {
            break;
        }
        used += cost;
        lines.push(line);
    }
    lines.reverse();
    lines.join("\n")
}

fn render_line(record: &MemoryRecord) -> String {
    let step = record.source_step_id.as_deref().unwrap_or("-");
    let status = record.content.get("status").and_then(Value::as_str).unwrap_or("note");
    let body = match record.content.get("result").or_else(|| record.content.get("error")) {
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => record.content.to_string(),
    };
    format!("[{step}] {status}: {}", truncate(&body, 300))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}
