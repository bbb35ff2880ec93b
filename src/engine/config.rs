//! 引擎配置文档的组装与修复。
//!
//! 纯数据操作：模板深拷贝、端口改写、节点挂载，以及按启动诊断把
//! 问题节点从 proxies 和所有策略组里摘除。不做任何 I/O（落盘除外）。

use crate::model::{APP_CONFIG, ProxyNode};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value;
use std::path::Path;
use tracing::info;

/// 一个批次租用的四个端口。
pub struct BatchPorts {
    pub control: u16,
    pub http: u16,
    pub socks: u16,
    pub redirect: u16,
}

/// 被引擎拒绝而摘除的节点，带上触发的诊断原文，不再参与后续测试。
#[derive(Debug, Clone)]
pub struct ProblemNode {
    pub node: ProxyNode,
    pub error: String,
}

/// 配置基础结构。策略组四件套：0 节点选择 / 1 自动选择 / 2 故障转移 / 3 手动选择
const TEMPLATE: &str = r#"
port: 7890
socks-port: 7891
redir-port: 7892
allow-lan: true
mode: rule
log-level: info
external-controller: 127.0.0.1:9090
tcp-concurrent: true
unified-delay: true
geodata-mode: true
dns:
  enable: true
  ipv6: false
  default-nameserver:
    - 223.5.5.5
    - 223.6.6.6
    - 1.1.1.1
    - 8.8.8.8
  enhanced-mode: fake-ip
  fake-ip-range: 198.18.0.1/16
  nameserver:
    - https://223.5.5.5/dns-query
    - https://223.6.6.6/dns-query
  fallback:
    - 1.1.1.1
    - 8.8.8.8
  fallback-filter:
    geoip: true
    geoip-code: CN
    ipcidr:
      - 240.0.0.0/4
      - 127.0.0.1/8
      - 0.0.0.0/32
proxies: []
proxy-groups:
  - name: 节点选择
    type: select
    proxies:
      - 自动选择
      - 故障转移
      - DIRECT
      - 手动选择
  - name: 自动选择
    type: url-test
    exclude-filter: "(?i)中国|China|CN|电信|移动|联通"
    proxies: []
    url: ""
    interval: 300
    tolerance: 50
  - name: 故障转移
    type: fallback
    exclude-filter: "(?i)中国|China|CN|电信|移动|联通"
    proxies: []
    url: ""
    interval: 300
  - name: 手动选择
    type: select
    proxies: []
rules:
  - DOMAIN-SUFFIX,local,DIRECT
  - IP-CIDR,192.168.0.0/16,DIRECT,no-resolve
  - IP-CIDR,10.0.0.0/8,DIRECT,no-resolve
  - IP-CIDR,172.16.0.0/12,DIRECT,no-resolve
  - IP-CIDR,127.0.0.0/8,DIRECT,no-resolve
  - IP-CIDR,100.64.0.0/10,DIRECT,no-resolve
  - IP-CIDR6,::1/128,DIRECT,no-resolve
  - IP-CIDR6,fc00::/7,DIRECT,no-resolve
  - IP-CIDR6,fe80::/10,DIRECT,no-resolve
  - GEOIP,CN,DIRECT
  - MATCH,节点选择
"#;

static BASE_DOC: Lazy<Value> =
    Lazy::new(|| serde_yaml::from_str(TEMPLATE).expect("engine config template must parse"));

static PROXY_INDEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"proxy (\d+):").expect("proxy index pattern must parse"));

pub struct EngineConfig {
    doc: Value,
    nodes: Vec<ProxyNode>,
    host: String,
    control_port: u16,
    problems: Vec<ProblemNode>,
}

impl EngineConfig {
    /// 模板深拷贝后挂上节点并改写四个端口与控制地址。
    pub fn build(nodes: &[ProxyNode], ports: &BatchPorts) -> Self {
        let host = APP_CONFIG.check.engine_host.clone();
        let mut doc = BASE_DOC.clone();

        doc["port"] = Value::Number(ports.http.into());
        doc["socks-port"] = Value::Number(ports.socks.into());
        doc["redir-port"] = Value::Number(ports.redirect.into());
        doc["external-controller"] = Value::String(format!("{}:{}", host, ports.control));

        if let Some(proxies) = doc["proxies"].as_sequence_mut() {
            proxies.extend(nodes.iter().map(|n| n.engine_value()));
        }
        if let Some(groups) = doc["proxy-groups"].as_sequence_mut() {
            for group in groups.iter_mut() {
                if let Some(url) = group.get_mut("url") {
                    *url = Value::String(APP_CONFIG.check.delay_test_url.clone());
                }
            }
            // 第 0 组只引用其它组，节点名挂到后三组
            for group in groups.iter_mut().skip(1) {
                if let Some(members) = group
                    .get_mut("proxies")
                    .and_then(Value::as_sequence_mut)
                {
                    members.extend(
                        nodes
                            .iter()
                            .map(|n| Value::String(n.name.clone())),
                    );
                }
            }
        }

        EngineConfig {
            doc,
            nodes: nodes.to_vec(),
            host,
            control_port: ports.control,
            problems: Vec::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn api_port(&self) -> u16 {
        self.control_port
    }

    pub fn proxy_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.doc["proxy-groups"]
            .as_sequence()
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(|g| g.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn group_proxies(&self, group_name: &str) -> Vec<String> {
        self.doc["proxy-groups"]
            .as_sequence()
            .and_then(|groups| {
                groups
                    .iter()
                    .find(|g| g.get("name").and_then(Value::as_str) == Some(group_name))
            })
            .and_then(|g| g.get("proxies"))
            .and_then(Value::as_sequence)
            .map(|members| {
                members
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 按启动诊断修复配置：解析 `proxy N:` 下标，把该节点从 proxies
    /// 和所有策略组里摘除并记为问题节点。返回是否完成修复。
    pub fn repair(&mut self, diagnostic: &str) -> bool {
        let Some(index) = PROXY_INDEX_RE
            .captures(diagnostic)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<usize>().ok())
        else {
            return false;
        };
        if index >= self.nodes.len() {
            return false;
        }

        if let Some(proxies) = self.doc["proxies"].as_sequence_mut() {
            proxies.remove(index);
        }
        let node = self.nodes.remove(index);
        if let Some(groups) = self.doc["proxy-groups"].as_sequence_mut() {
            for group in groups.iter_mut() {
                if let Some(members) = group
                    .get_mut("proxies")
                    .and_then(Value::as_sequence_mut)
                {
                    members.retain(|m| m.as_str() != Some(node.name.as_str()));
                }
            }
        }

        info!(
            "修复配置：移除 proxy 下标 {}，节点 {}，剩余 {} 个",
            index,
            node.name,
            self.nodes.len()
        );
        self.problems.push(ProblemNode {
            node,
            error: diagnostic.trim().to_string(),
        });
        true
    }

    pub fn take_problems(&mut self) -> Vec<ProblemNode> {
        std::mem::take(&mut self.problems)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)?;
        serde_yaml::to_writer(file, &self.doc)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::parse;
    use crate::common::utils::b64_encode_safe;

    fn sample_nodes(count: usize) -> Vec<ProxyNode> {
        (0..count)
            .map(|i| {
                parse(&format!(
                    "ss://{}@h{}.example.com:8388#节点{}",
                    b64_encode_safe("aes-256-gcm:pw"),
                    i,
                    i
                ))
                .unwrap()
            })
            .collect()
    }

    fn ports() -> BatchPorts {
        BatchPorts {
            control: 9090,
            http: 9091,
            socks: 9092,
            redirect: 9093,
        }
    }

    #[test]
    fn build_wires_ports_and_groups() {
        let nodes = sample_nodes(3);
        let config = EngineConfig::build(&nodes, &ports());

        assert_eq!(config.api_port(), 9090);
        assert_eq!(
            config.group_names(),
            vec!["节点选择", "自动选择", "故障转移", "手动选择"]
        );
        // 后三组都挂满节点名，第 0 组保持组引用
        for group in &config.group_names()[1..] {
            let members = config.group_proxies(group);
            for node in &nodes {
                assert!(members.contains(&node.name), "{group} 缺少 {}", node.name);
            }
        }
        assert!(
            config
                .group_proxies("节点选择")
                .contains(&"自动选择".to_string())
        );
    }

    #[test]
    fn repair_loop_shrinks_by_exactly_k() {
        let nodes = sample_nodes(5);
        let mut config = EngineConfig::build(&nodes, &ports());

        // 模拟引擎分三轮报错，每轮报一个坏节点
        assert!(config.repair("time=\"x\" level=error msg=\"Parse config error: proxy 2: missing uuid\""));
        assert!(config.repair("Parse config error: proxy 0: invalid port"));
        assert!(config.repair("Parse config error: proxy 2: unknown cipher"));

        assert_eq!(config.proxy_count(), 2);
        let problems = config.take_problems();
        assert_eq!(problems.len(), 3);
        let removed: Vec<&str> = problems.iter().map(|p| p.node.name.as_str()).collect();
        assert_eq!(removed, vec!["节点2", "节点0", "节点4"]);
        assert!(problems[0].error.contains("missing uuid"));

        // 组成员同步摘除
        for group in &config.group_names()[1..] {
            let members = config.group_proxies(group);
            assert_eq!(members, vec!["节点1", "节点3"]);
        }
    }

    #[test]
    fn repair_rejects_unparseable_or_out_of_range() {
        let nodes = sample_nodes(2);
        let mut config = EngineConfig::build(&nodes, &ports());
        assert!(!config.repair("Parse config error: something else entirely"));
        assert!(!config.repair("Parse config error: proxy 9: out of range"));
        assert_eq!(config.proxy_count(), 2);
        assert!(config.take_problems().is_empty());
    }
}
