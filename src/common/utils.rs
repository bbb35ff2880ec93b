use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use tracing::Level;

/// quote 时保留的字符集，与 Python urllib 的默认 safe 集一致。
const QUOTE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/');

pub fn b64_encode(s: &str) -> String {
    STANDARD.encode(s.as_bytes())
}

pub fn b64_encode_safe(s: &str) -> String {
    URL_SAFE.encode(s.as_bytes())
}

/// 宽容解码：自动补齐 padding，标准字母表和 URL-safe 字母表都尝试。
/// 订阅源里两种形式混用，无法预先区分。
pub fn b64_decode(s: &str) -> Option<String> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }
    let padded = match cleaned.len() % 4 {
        0 => cleaned,
        rem => format!("{}{}", cleaned, "=".repeat(4 - rem)),
    };
    for engine in [&STANDARD, &URL_SAFE] {
        if let Ok(bytes) = engine.decode(&padded) {
            if let Ok(text) = String::from_utf8(bytes) {
                return Some(text);
            }
        }
    }
    None
}

pub fn percent_decode(s: &str) -> String {
    match percent_decode_str(s).decode_utf8() {
        Ok(cow) => cow.into_owned(),
        Err(_) => s.to_string(),
    }
}

pub fn quote(s: &str) -> String {
    utf8_percent_encode(s, QUOTE_SET).to_string()
}

/// 部分订阅源会在 scheme 前面混入零宽字符或 emoji，匹配前先剔除。
pub fn strip_non_ascii(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii()).collect()
}

// 把字符串转换成 Level，忽略大小写，不识别时返回 None
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_uppercase().as_str() {
        "ERROR" => Some(Level::ERROR),
        "WARN" | "WARNING" => Some(Level::WARN),
        "INFO" => Some(Level::INFO),
        "DEBUG" => Some(Level::DEBUG),
        "TRACE" => Some(Level::TRACE),
        _ => None,
    }
}
