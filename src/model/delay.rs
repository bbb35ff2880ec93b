#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 引擎 /proxies 快照里的一条延迟历史记录。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub time: DateTime<Utc>,
    /// 单位毫秒，0 表示该轮测速失败
    pub delay: i64,
}

/// 引擎侧单个节点的状态，未知字段直接忽略。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyState {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub proxy_type: String,
    #[serde(default)]
    pub alive: bool,
    #[serde(default)]
    pub history: Vec<HistoryItem>,
    #[serde(default)]
    pub udp: bool,
}

#[derive(Debug, Deserialize)]
pub struct ProxiesSnapshot {
    pub proxies: HashMap<String, ProxyState>,
}

/// 计算平均延迟，延迟为 0 的记录全部排除；没有有效记录时返回 None。
pub fn average_delay(history: &[HistoryItem]) -> Option<f64> {
    let delays: Vec<i64> = history.iter().map(|h| h.delay).filter(|d| *d > 0).collect();
    if delays.is_empty() {
        return None;
    }
    Some(delays.iter().sum::<i64>() as f64 / delays.len() as f64)
}

/// 引擎返回的快照里混着策略组和内建出口，不是真实节点。
pub fn is_builtin_name(name: &str) -> bool {
    matches!(
        name,
        "节点选择"
            | "自动选择"
            | "故障转移"
            | "手动选择"
            | "DIRECT"
            | "COMPATIBLE"
            | "GLOBAL"
            | "PASS"
            | "REJECT"
            | "REJECT-DROP"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(delay: i64) -> HistoryItem {
        HistoryItem {
            time: Utc::now(),
            delay,
        }
    }

    #[test]
    fn average_excludes_zero_samples() {
        let history = vec![item(0), item(100), item(200), item(0)];
        assert_eq!(average_delay(&history), Some(150.0));
    }

    #[test]
    fn average_of_all_zero_is_none() {
        assert_eq!(average_delay(&[item(0), item(0)]), None);
        assert_eq!(average_delay(&[]), None);
    }

    #[test]
    fn snapshot_deserializes_engine_shape() {
        let raw = r#"{
            "proxies": {
                "节点A": {
                    "name": "节点A",
                    "type": "Vmess",
                    "alive": true,
                    "udp": false,
                    "history": [{"time": "2024-05-01T10:00:00.000Z", "delay": 230}],
                    "xudp": false,
                    "id": "abc"
                }
            }
        }"#;
        let snapshot: ProxiesSnapshot = serde_json::from_str(raw).unwrap();
        let state = &snapshot.proxies["节点A"];
        assert!(state.alive);
        assert_eq!(state.history[0].delay, 230);
    }

    #[test]
    fn builtin_names_are_recognized() {
        assert!(is_builtin_name("自动选择"));
        assert!(is_builtin_name("DIRECT"));
        assert!(!is_builtin_name("节点A"));
    }
}
