//! 输出截断：超过字节上限的文本在 UTF-8 边界处截断并附加显式标记
//!
//! traceback 与 display 输出按整体预算截断，超出部分用一条标记代替。

use serde_json::{json, Value};

/// 截断后追加的标记，带上被丢弃的字节数
pub fn truncation_marker(omitted: usize) -> String {
    format!("\n[... output truncated: {omitted} bytes omitted ...]")
}

/// 超过 `max_bytes` 时截断；返回 (文本, 是否截断)
pub fn cap_output(text: String, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text, false);
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let omitted = text.len() - cut;
    let mut capped = text;
    capped.truncate(cut);
    capped.push_str(&truncation_marker(omitted));
    (capped, true)
}

/// 逐行累加，总字节数不超过 `max_bytes`；越界的那一行被截断，其后各行替换为一条标记
pub fn cap_lines(lines: Vec<String>, max_bytes: usize) -> (Vec<String>, bool) {
    let total = lines.len();
    let mut used = 0usize;
    let mut out = Vec::with_capacity(total);
    for (i, line) in lines.into_iter().enumerate() {
        let remaining = max_bytes.saturating_sub(used);
        if line.len() <= remaining {
            used += line.len();
            out.push(line);
            continue;
        }
        let (cut, _) = cap_output(line, remaining);
        out.push(cut);
        let dropped = total - i - 1;
        if dropped > 0 {
            out.push(format!("[... {dropped} more lines omitted ...]\n"));
        }
        return (out, true);
    }
    (out, false)
}

/// display bundle 按序列化后的大小累计；放不下的 bundle 丢弃并在末尾补一条说明
pub fn cap_displays(displays: Vec<Value>, max_bytes: usize) -> (Vec<Value>, bool) {
    let mut used = 0usize;
    let mut omitted = 0usize;
    let mut omitted_bytes = 0usize;
    let mut out = Vec::with_capacity(displays.len());
    for display in displays {
        let size = serde_json::to_string(&display).map(|s| s.len()).unwrap_or(0);
        if omitted == 0 && used + size <= max_bytes {
            used += size;
            out.push(display);
        } else {
            omitted += 1;
            omitted_bytes += size;
        }
    }
    if omitted == 0 {
        return (out, false);
    }
    out.push(json!({
        "text/plain": format!("[... {omitted} display outputs truncated: {omitted_bytes} bytes omitted ...]")
    }));
    (out, true)
}
