//! 订阅文档的内容识别与节点提取。
//!
//! 进来的是已经取好的文档正文，可能是 clash 风格 YAML、整段 base64，
//! 或者夹杂分享链接的松散文本。单行解析失败只记入 skipped，
//! 绝不影响同一文档里其余节点。

use crate::convert;
use crate::error::ParseError;
use crate::model::ProxyNode;
use once_cell::sync::Lazy;
use regex::Regex;

static URI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:vless|vmess|trojan|hysteria2|hysteria|hy2|ssr|ss|socks5|https|http)://[^#\s]*(?:#[^\s]*)?",
    )
    .expect("uri pattern must parse")
});

pub struct Extraction {
    pub nodes: Vec<ProxyNode>,
    /// (原始行, 失败原因)，调用方决定如何呈现
    pub skipped: Vec<(String, ParseError)>,
}

pub fn extract(content: &str) -> Extraction {
    if looks_like_clash_yaml(content) {
        return extract_clash(content);
    }

    let decoded;
    let text = if looks_like_base64(content) {
        match crate::common::utils::b64_decode(content) {
            Some(t) => {
                decoded = t;
                &decoded
            }
            None => content,
        }
    } else {
        content
    };

    let mut extraction = Extraction {
        nodes: Vec::new(),
        skipped: Vec::new(),
    };
    for line in text.lines() {
        let line = line.trim();
        if !line.contains("://") {
            continue;
        }
        push_uri(&mut extraction, line);
    }

    // 整行解析一无所获时按松散文本扫（比如从网页里扒下来的正文）
    if extraction.nodes.is_empty() {
        let mut scanned = Extraction {
            nodes: Vec::new(),
            skipped: Vec::new(),
        };
        for m in URI_RE.find_iter(text) {
            push_uri(&mut scanned, m.as_str());
        }
        if !scanned.nodes.is_empty() {
            return scanned;
        }
    }
    extraction
}

fn push_uri(extraction: &mut Extraction, uri: &str) {
    match convert::parse(uri) {
        Ok(node) => extraction.nodes.push(node),
        Err(err) => extraction.skipped.push((uri.to_string(), err)),
    }
}

fn extract_clash(content: &str) -> Extraction {
    let mut extraction = Extraction {
        nodes: Vec::new(),
        skipped: Vec::new(),
    };
    let doc: serde_yaml::Value = match serde_yaml::from_str(content) {
        Ok(doc) => doc,
        Err(_) => return extraction,
    };
    let Some(proxies) = doc.get("proxies").and_then(|p| p.as_sequence()) else {
        return extraction;
    };
    for entry in proxies {
        match ProxyNode::from_engine_value(entry) {
            Ok(node) => extraction.nodes.push(node),
            Err(err) => {
                let line = serde_yaml::to_string(entry)
                    .unwrap_or_default()
                    .trim()
                    .replace('\n', " ");
                extraction.skipped.push((line, err));
            }
        }
    }
    extraction
}

fn looks_like_clash_yaml(raw: &str) -> bool {
    raw.lines().any(|line| {
        let t = line.trim_start();
        t.starts_with("proxies:") || t.starts_with("proxy-groups:")
    })
}

fn looks_like_base64(text: &str) -> bool {
    let s = text.trim();
    if s.len() < 16 || s.contains("://") {
        return false;
    }
    s.chars().all(|c| {
        c.is_whitespace() || c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '-' | '_')
    })
}
