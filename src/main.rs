mod checker;
mod common;
mod convert;
mod engine;
mod error;
mod model;
mod ports;
mod subscription;
mod unique;

use crate::checker::DelayChecker;
use crate::common::log::init_logging;
use crate::model::{APP_CONFIG, ProxyNode};
use serde_yaml::Value;
use std::path::PathBuf;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 必须是程序第一个调用！
    init_logging().expect("Failed to initialize logging");

    // 引擎二进制作为显式依赖在入口校验一次，后续组件直接拿路径用
    let engine_bin = PathBuf::from(&APP_CONFIG.check.engine_bin);
    anyhow::ensure!(
        engine_bin.exists(),
        "引擎二进制不存在：{}，请先安装后再运行",
        engine_bin.display()
    );

    info!("========== [订阅解析阶段] ==========");
    let tasks = APP_CONFIG.sources.iter().map(|source| async move {
        let content = match tokio::fs::read_to_string(&source.path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("读取订阅 {} 失败：{}", source.path, e);
                return Vec::new();
            }
        };
        let mut extraction = subscription::extract(&content);
        for (line, err) in &extraction.skipped {
            warn!("跳过无效节点（{}）：{} - {}", source.path, line, err);
        }
        if let Some(max) = source.max {
            if extraction.nodes.len() > max {
                info!(
                    "{} 只取前 {} 个节点（共 {} 个）",
                    source.path,
                    max,
                    extraction.nodes.len()
                );
                extraction.nodes.truncate(max);
            }
        }
        info!("{} 解析到 {} 个节点", source.path, extraction.nodes.len());
        extraction.nodes
    });
    let all: Vec<ProxyNode> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .flatten()
        .collect();
    info!("各订阅源共解析 {} 个节点", all.len());

    info!("========== [去重过滤阶段] ==========");
    let deduped = unique::dedup(all, &APP_CONFIG.filter);

    std::fs::create_dir_all("results")?;
    write_nodes(
        "results/all_fetch.yml",
        &deduped.unique,
        &format!("Checking proxies, {}", deduped.unique.len()),
    )?;
    write_nodes(
        "results/unsupported.yml",
        &deduped.unsupported,
        &format!("Unsupported proxies, {}", deduped.unsupported.len()),
    )?;

    info!("========== [延迟检测阶段] ==========");
    let checker = DelayChecker::new(engine_bin);
    checker.check_nodes(deduped.unique).await;

    let alive = checker.alive_nodes();
    info!("存活节点 {} 个，延迟排序：", alive.len());
    for (i, node) in alive.iter().enumerate() {
        if let Some(ms) = checker.average_delay_of(&node.name) {
            info!("{}. {}: {:.2}ms", i + 1, node.name, ms);
        }
    }
    write_nodes(
        "results/all_alive.yml",
        &alive,
        &format!("Alive proxies, {}", alive.len()),
    )?;

    // 同步产出 v2ray 订阅格式：分享链接逐行拼接后整体 base64
    let uris: Vec<String> = alive.iter().map(convert::serialize).collect();
    std::fs::write(
        "results/all_sub.txt",
        common::utils::b64_encode(&uris.join("\n")),
    )?;
    info!("已写出 results/all_sub.txt");

    let problems = checker.problem_nodes();
    let problem_values: Vec<Value> = problems
        .iter()
        .map(|p| {
            let mut value = p.node.engine_value();
            if let Some(map) = value.as_mapping_mut() {
                map.insert("_error".into(), Value::String(p.error.clone()));
            }
            value
        })
        .collect();
    write_doc(
        "results/problem.yml",
        problem_values,
        &format!("Problem proxies, {}", problems.len()),
    )?;

    info!(
        "检测完成：存活 {} 个，问题节点 {} 个",
        alive.len(),
        problems.len()
    );
    Ok(())
}

fn write_nodes(path: &str, nodes: &[ProxyNode], comment: &str) -> anyhow::Result<()> {
    let values = nodes.iter().map(|n| n.engine_value()).collect();
    write_doc(path, values, comment)
}

fn write_doc(path: &str, proxies: Vec<Value>, comment: &str) -> anyhow::Result<()> {
    let mut doc = serde_yaml::Mapping::new();
    doc.insert("proxies".into(), Value::Sequence(proxies));

    let mut out = chrono::Local::now()
        .format("# Update: %Y-%m-%d %H:%M\n")
        .to_string();
    out.push_str(&format!("# {comment}\n"));
    out.push_str(&serde_yaml::to_string(&Value::Mapping(doc))?);
    std::fs::write(path, out)?;
    info!("已写出 {path}");
    Ok(())
}
