//! 批量延迟检测的编排。
//!
//! 大节点集切成有界批次，批次之间串行（同一时刻只有一个外部引擎进程），
//! 单批流程：租 4 个端口 → 组配置 → 启动引擎 → 多轮测速 → 拉快照合并。
//! 任何一步失败都只损失这一批；端口在所有出口上归还。

use crate::engine::api::EngineApi;
use crate::engine::config::{BatchPorts, EngineConfig, ProblemNode};
use crate::engine::process::EngineProcess;
use crate::model::{APP_CONFIG, ProxyNode, ProxyState, average_delay, is_builtin_name};
use crate::ports::PortPool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct DelayChecker {
    engine_bin: PathBuf,
    port_pool: PortPool,
    nodes: Mutex<Vec<ProxyNode>>,
    results: Mutex<HashMap<String, ProxyState>>,
    problems: Mutex<Vec<ProblemNode>>,
}

impl DelayChecker {
    /// 引擎二进制由入口显式准备好后传入，这里不做任何隐式安装。
    pub fn new(engine_bin: PathBuf) -> Self {
        let check = &APP_CONFIG.check;
        DelayChecker {
            engine_bin,
            port_pool: PortPool::new(check.port_start, check.port_count),
            nodes: Mutex::new(Vec::new()),
            results: Mutex::new(HashMap::new()),
            problems: Mutex::new(Vec::new()),
        }
    }

    pub async fn check_nodes(&self, nodes: Vec<ProxyNode>) {
        self.nodes.lock().unwrap().extend(nodes.iter().cloned());
        let batch_size = APP_CONFIG.check.batch_size.max(1);
        let total = nodes.len();

        for (i, batch) in nodes.chunks(batch_size).enumerate() {
            let progress = format!("{}/{}/{}", batch.len(), i * batch_size + batch.len(), total);
            info!("批次开始：{}", progress);
            if let Err(e) = self.check_batch(batch).await {
                warn!("批次检测失败（跳过该批）：{e:#}");
            }
            info!("批次结束：{}", progress);
        }
    }

    async fn check_batch(&self, batch: &[ProxyNode]) -> anyhow::Result<()> {
        debug!("端口池余量：{}", self.port_pool.available_count());
        let ports = BatchPorts {
            control: self.port_pool.acquire().await,
            http: self.port_pool.acquire().await,
            socks: self.port_pool.acquire().await,
            redirect: self.port_pool.acquire().await,
        };

        let outcome = self.run_batch(batch, &ports).await;

        for port in [ports.control, ports.http, ports.socks, ports.redirect] {
            if let Err(e) = self.port_pool.release(port) {
                // 池内状态被破坏属于编程错误，大声记录
                error!("端口归还失败：{e}");
            }
        }
        outcome
    }

    async fn run_batch(&self, batch: &[ProxyNode], ports: &BatchPorts) -> anyhow::Result<()> {
        let mut config = EngineConfig::build(batch, ports);
        let mut process = EngineProcess::new(self.engine_bin.clone());

        let outcome = self.test_batch(&mut config, &mut process).await;

        // 无论成败：回收进程，收集修复阶段摘掉的节点
        process.stop().await;
        self.problems
            .lock()
            .unwrap()
            .extend(config.take_problems());
        outcome
    }

    async fn test_batch(
        &self,
        config: &mut EngineConfig,
        process: &mut EngineProcess,
    ) -> anyhow::Result<()> {
        process.start(config).await?;

        let check = &APP_CONFIG.check;
        let mut api = EngineApi::new(&check.engine_host, vec![config.api_port()], &check.engine_secret);
        if !api.check_connection().await {
            anyhow::bail!("引擎控制接口不可达");
        }

        let groups = config.group_names();
        let test_group = groups
            .get(1)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("配置里没有可测试的策略组"))?;
        if config.group_proxies(&test_group).is_empty() {
            info!("策略组 {} 中没有代理节点", test_group);
            return Ok(());
        }
        info!(
            "开始测试策略组 {}（{} 个节点，共 {} 轮）",
            test_group,
            config.proxy_count(),
            check.rounds
        );
        for round in 1..=check.rounds {
            api.test_group_delay(&test_group).await;
            info!("测速进度：{}/{}", round, check.rounds);
        }

        match api.get_proxies().await {
            Ok(snapshot) => {
                let mut results = self.results.lock().unwrap();
                results.extend(snapshot);
            }
            Err(e) => warn!("获取延迟快照失败，该批无数据：{e:#}"),
        }
        Ok(())
    }

    /// 存活且有有效延迟数据的节点，按平均延迟从小到大。
    pub fn alive_nodes(&self) -> Vec<ProxyNode> {
        let results = self.results.lock().unwrap();
        let nodes = self.nodes.lock().unwrap();

        let mut alive: Vec<(ProxyNode, f64)> = nodes
            .iter()
            .filter(|n| !is_builtin_name(&n.name))
            .filter_map(|n| {
                let state = results.get(&n.name)?;
                if !state.alive {
                    return None;
                }
                // 历史为空或全是 0 的节点视同不可用
                let avg = average_delay(&state.history)?;
                Some((n.clone(), avg))
            })
            .collect();

        alive.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        alive.truncate(APP_CONFIG.check.limit);
        alive.into_iter().map(|(n, _)| n).collect()
    }

    pub fn average_delay_of(&self, name: &str) -> Option<f64> {
        let results = self.results.lock().unwrap();
        average_delay(&results.get(name)?.history)
    }

    pub fn problem_nodes(&self) -> Vec<ProblemNode> {
        self.problems.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::utils::b64_encode_safe;
    use crate::convert::parse;
    use crate::model::HistoryItem;
    use chrono::Utc;

    fn node(name: &str) -> ProxyNode {
        parse(&format!(
            "ss://{}@{}.example.com:8388#{}",
            b64_encode_safe("aes-256-gcm:pw"),
            name,
            name
        ))
        .unwrap()
    }

    fn state(alive: bool, delays: &[i64]) -> ProxyState {
        ProxyState {
            alive,
            history: delays
                .iter()
                .map(|d| HistoryItem {
                    time: Utc::now(),
                    delay: *d,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn alive_nodes_filters_and_sorts() {
        let checker = DelayChecker::new(PathBuf::from("./engine"));
        checker.nodes.lock().unwrap().extend([
            node("slow"),
            node("fast"),
            node("dead"),
            node("silent"),
            node("zeros"),
        ]);
        {
            let mut results = checker.results.lock().unwrap();
            results.insert("slow".to_string(), state(true, &[500, 700]));
            results.insert("fast".to_string(), state(true, &[0, 90, 110]));
            results.insert("dead".to_string(), state(false, &[100]));
            results.insert("silent".to_string(), state(true, &[]));
            results.insert("zeros".to_string(), state(true, &[0, 0]));
        }

        let alive = checker.alive_nodes();
        let names: Vec<&str> = alive.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["fast", "slow"]);
        assert_eq!(checker.average_delay_of("fast"), Some(100.0));
    }

    #[test]
    fn builtin_group_names_never_surface() {
        let checker = DelayChecker::new(PathBuf::from("./engine"));
        let mut fake_group = node("x");
        fake_group.name = "自动选择".to_string();
        checker.nodes.lock().unwrap().push(fake_group);
        checker
            .results
            .lock()
            .unwrap()
            .insert("自动选择".to_string(), state(true, &[10]));

        assert!(checker.alive_nodes().is_empty());
    }
}
