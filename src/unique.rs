//! 节点身份计算与合并去重。
//!
//! 身份只看端点本身（协议、服务器、端口、鉴权、传输路径），
//! 展示名、参数大小写这类表面差异不参与。

use crate::common::utils::b64_decode;
use crate::model::{FilterConfig, ProtocolOptions, ProxyNode, Transport};
use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use tracing::info;

pub struct Deduped {
    pub unique: Vec<ProxyNode>,
    /// 疑似摆设节点，单独分拣，不直接丢弃
    pub unsupported: Vec<ProxyNode>,
    pub duplicates: usize,
}

/// 计算节点的身份哈希。
pub fn identity(node: &ProxyNode) -> u64 {
    let mut path = String::new();
    match &node.opts {
        ProtocolOptions::Vmess { .. } => {
            if let Some(transport) = &node.transport {
                path.push_str(transport.kind());
                path.push(':');
                path.push_str(&transport_signature(transport));
            }
        }
        ProtocolOptions::Trojan { .. }
        | ProtocolOptions::Vless { .. } => {
            path.push_str(node.sni().unwrap_or(""));
            path.push(':');
            if let Some(transport) = &node.transport {
                path.push_str(&transport_signature(transport));
            }
        }
        ProtocolOptions::ShadowsocksR { obfs_param, .. } => {
            path.push_str(obfs_param.as_deref().unwrap_or(""));
        }
        ProtocolOptions::Hysteria2 { obfs_password, .. } => {
            path.push_str(node.sni().unwrap_or(""));
            path.push(':');
            path.push_str(obfs_password.as_deref().unwrap_or(""));
            path.push(':');
        }
        _ => {}
    }

    let signature = format!(
        "{}:{}:{}:{}@{}@{}",
        node.kind(),
        node.server,
        node.port,
        path,
        node.alpn.join(","),
        node.opts.secret(),
    );
    let mut hasher = DefaultHasher::new();
    hasher.write(signature.as_bytes());
    hasher.finish()
}

fn transport_signature(transport: &Transport) -> String {
    match transport {
        Transport::Ws { path, host } => format!(
            "{}/{}",
            host.as_deref().unwrap_or(""),
            path.as_deref().unwrap_or("")
        ),
        Transport::H2 { path, hosts } => {
            format!("{}/{}", hosts.join(","), path.as_deref().unwrap_or(""))
        }
        Transport::Grpc { service_name } => service_name.clone(),
    }
}

/// 摆设节点识别：裸主机名、保留端口、命中黑名单的服务器或名字。
pub fn is_fake(node: &ProxyNode, filter: &FilterConfig) -> bool {
    if !node.server.contains('.') {
        return true;
    }
    if node.port < 20 {
        return true;
    }
    if filter
        .fake_domains
        .iter()
        .chain(filter.fake_ips.iter())
        .any(|suffix| node.server.ends_with(suffix))
    {
        return true;
    }
    filter.ban.iter().any(|word| node.name.contains(word))
}

/// 规整展示名并保证集合内唯一，重名追加 " #N"。
/// 对已经规整过且不冲突的名字再跑一遍不会有任何改动。
pub fn unique_name(node: &mut ProxyNode, seen: &mut HashSet<String>, filter: &FilterConfig) {
    for blob in &filter.banned_words {
        let Some(words) = b64_decode(blob) else {
            continue;
        };
        for word in words.split_whitespace() {
            if node.name.contains(word) {
                node.name = node.name.replace(word, &"*".repeat(word.chars().count()));
            }
        }
    }

    let chars: Vec<char> = node.name.chars().collect();
    if chars.len() > filter.max_name_len && !node.name.ends_with("...") {
        node.name = chars[..filter.max_name_len].iter().collect::<String>() + "...";
    }

    for (canonical, display) in &filter.display_names {
        if &node.name == display {
            node.name = canonical.clone();
            break;
        }
    }

    if seen.contains(&node.name) {
        let mut i = 1;
        let mut candidate = format!("{} #{}", node.name, i);
        while seen.contains(&candidate) {
            i += 1;
            candidate = format!("{} #{}", node.name, i);
        }
        node.name = candidate;
    }
    seen.insert(node.name.clone());
}

/// 按输入顺序合并：身份相同只留第一个，后来的静默丢弃（仅计数）。
pub fn dedup(nodes: Vec<ProxyNode>, filter: &FilterConfig) -> Deduped {
    let mut seen_ids = HashSet::new();
    let mut seen_names = HashSet::new();
    let mut result = Deduped {
        unique: Vec::new(),
        unsupported: Vec::new(),
        duplicates: 0,
    };

    for mut node in nodes {
        unique_name(&mut node, &mut seen_names, filter);
        if !seen_ids.insert(identity(&node)) {
            result.duplicates += 1;
            continue;
        }
        if is_fake(&node, filter) {
            result.unsupported.push(node);
        } else {
            result.unique.push(node);
        }
    }

    info!(
        "合并完成：有效 {} 个，摆设 {} 个，重复 {} 个",
        result.unique.len(),
        result.unsupported.len(),
        result.duplicates
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::utils::b64_encode;
    use crate::convert::parse;
    use crate::model::TlsOptions;

    fn test_filter() -> FilterConfig {
        FilterConfig {
            fake_domains: vec!["example.invalid".to_string()],
            fake_ips: vec!["1.2.3.4".to_string()],
            ban: vec!["过期".to_string()],
            banned_words: vec![b64_encode("电报群 官网")],
            max_name_len: 30,
            display_names: [("HK".to_string(), "香港节点".to_string())].into(),
        }
    }

    fn ss_node(name: &str, password: &str) -> ProxyNode {
        ProxyNode {
            name: name.to_string(),
            server: "s.example.com".to_string(),
            port: 8388,
            opts: ProtocolOptions::Shadowsocks {
                cipher: "aes-256-gcm".to_string(),
                password: password.to_string(),
            },
            tls: None,
            transport: None,
            alpn: vec![],
        }
    }

    #[test]
    fn identity_ignores_display_name() {
        assert_eq!(
            identity(&ss_node("甲", "pw")),
            identity(&ss_node("乙", "pw"))
        );
        assert_ne!(
            identity(&ss_node("甲", "pw")),
            identity(&ss_node("甲", "other"))
        );
    }

    #[test]
    fn identity_covers_transport_path() {
        let a = parse("trojan://pw@h.example.com:443?type=ws&path=/a#n1").unwrap();
        let b = parse("trojan://pw@h.example.com:443?type=ws&path=/b#n1").unwrap();
        assert_ne!(identity(&a), identity(&b));
    }

    #[test]
    fn dedup_keeps_first_per_identity() {
        let filter = test_filter();
        let deduped = dedup(
            vec![
                ss_node("第一", "pw"),
                ss_node("第二", "pw"),
                ss_node("第三", "other"),
            ],
            &filter,
        );
        assert_eq!(deduped.unique.len(), 2);
        assert_eq!(deduped.duplicates, 1);
        assert_eq!(deduped.unique[0].name, "第一");
    }

    #[test]
    fn fake_nodes_are_partitioned_not_dropped() {
        let filter = test_filter();
        let mut bare = ss_node("裸机", "pw");
        bare.server = "localhost".to_string();
        let mut banned = ss_node("已过期节点", "pw2");
        banned.port = 8389;

        let deduped = dedup(vec![bare, banned], &filter);
        assert!(deduped.unique.is_empty());
        assert_eq!(deduped.unsupported.len(), 2);
    }

    #[test]
    fn is_fake_rules() {
        let filter = test_filter();
        let mut node = ss_node("正常", "pw");
        assert!(!is_fake(&node, &filter));

        node.port = 19;
        assert!(is_fake(&node, &filter));
        node.port = 8388;

        node.server = "a.example.invalid".to_string();
        assert!(is_fake(&node, &filter));
    }

    #[test]
    fn unique_name_redacts_truncates_and_suffixes() {
        let filter = test_filter();
        let mut seen = HashSet::new();

        let mut node = ss_node("加入电报群 领福利", "a");
        unique_name(&mut node, &mut seen, &filter);
        assert_eq!(node.name, "加入*** 领福利");

        let mut long = ss_node(&"长".repeat(40), "b");
        unique_name(&mut long, &mut seen, &filter);
        assert_eq!(long.name.chars().count(), 33);
        assert!(long.name.ends_with("..."));

        let mut alias = ss_node("香港节点", "c");
        unique_name(&mut alias, &mut seen, &filter);
        assert_eq!(alias.name, "HK");

        let mut dup1 = ss_node("HK", "d");
        unique_name(&mut dup1, &mut seen, &filter);
        assert_eq!(dup1.name, "HK #1");
        let mut dup2 = ss_node("HK", "e");
        unique_name(&mut dup2, &mut seen, &filter);
        assert_eq!(dup2.name, "HK #2");
    }

    #[test]
    fn unique_name_is_idempotent_on_clean_names() {
        let filter = test_filter();
        let mut first_pass = HashSet::new();
        let mut node = ss_node(&format!("{}尾", "长".repeat(40)), "a");
        unique_name(&mut node, &mut first_pass, &filter);
        let settled = node.name.clone();

        // 已规整的名字在新集合里重跑，不应再变
        let mut second_pass = HashSet::new();
        unique_name(&mut node, &mut second_pass, &filter);
        assert_eq!(node.name, settled);
    }

    #[test]
    fn same_endpoint_different_names_collapses() {
        let filter = test_filter();
        let a = parse(&format!(
            "ss://{}@h.example.com:8388#NameA",
            crate::common::utils::b64_encode_safe("aes-256-gcm:pw")
        ))
        .unwrap();
        let b = parse(&format!(
            "ss://{}@h.example.com:8388#NameB",
            crate::common::utils::b64_encode_safe("aes-256-gcm:pw")
        ))
        .unwrap();
        assert_eq!(identity(&a), identity(&b));

        let deduped = dedup(vec![a, b], &filter);
        assert_eq!(deduped.unique.len(), 1);
        assert_eq!(deduped.unique[0].name, "NameA");
    }

    #[test]
    fn identity_includes_sni_for_tls_protocols() {
        let mut a = ss_node("x", "pw");
        a.opts = ProtocolOptions::Trojan {
            password: "pw".to_string(),
        };
        let mut b = a.clone();
        b.tls = Some(TlsOptions {
            sni: Some("cdn.example.com".to_string()),
            ..Default::default()
        });
        assert_ne!(identity(&a), identity(&b));
    }
}
