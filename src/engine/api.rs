#![allow(dead_code)]

//! 引擎控制接口（HTTP + JSON）客户端。
//!
//! 测速触发与快照拉取都带独立的请求超时；超时和传输错误只记日志，
//! 当轮不产生数据，绝不让整个批次失败。

use crate::model::{APP_CONFIG, ProxiesSnapshot, ProxyState};
use anyhow::Context;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

pub struct EngineApi {
    host: String,
    ports: Vec<u16>,
    secret: String,
    base_url: Option<String>,
    client: reqwest::Client,
}

impl EngineApi {
    pub fn new(host: &str, ports: Vec<u16>, secret: &str) -> Self {
        EngineApi {
            host: host.to_string(),
            ports,
            secret: secret.to_string(),
            base_url: None,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.timeout(Duration::from_secs(3));
        if self.secret.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.secret)
        }
    }

    /// 逐个候选端口试 `/version`，第一个应答的确定为基地址。
    pub async fn check_connection(&mut self) -> bool {
        for port in self.ports.clone() {
            let base = format!("http://{}:{}", self.host, port);
            let resp = self.request(self.client.get(format!("{base}/version"))).send().await;
            match resp {
                Ok(resp) if resp.status().is_success() => {
                    let version = resp
                        .json::<serde_json::Value>()
                        .await
                        .ok()
                        .and_then(|v| v.get("version").and_then(|s| s.as_str().map(String::from)))
                        .unwrap_or_else(|| "unknown".to_string());
                    info!("成功连接引擎控制接口（端口 {}），版本：{}", port, version);
                    self.base_url = Some(base);
                    return true;
                }
                _ => {
                    info!("端口 {} 连接失败，尝试下一个", port);
                }
            }
        }
        warn!("所有候选端口均连接失败：{:?}", self.ports);
        false
    }

    /// 触发一轮组内测速。引擎端按 URL 逐节点拨测，本调用只负责发起；
    /// 请求超时视为本轮无数据，不是致命错误。
    pub async fn test_group_delay(&self, group_name: &str) {
        let Some(base) = &self.base_url else {
            warn!("尚未建立控制接口连接，跳过测速");
            return;
        };
        let probe_timeout_ms = APP_CONFIG.check.delay_timeout_ms * 2;
        let request_timeout = Duration::from_millis(APP_CONFIG.check.delay_timeout_ms * 4);

        let result = self
            .request(self.client.get(format!("{base}/group/{group_name}/delay")))
            .query(&[
                ("url", APP_CONFIG.check.delay_test_url.as_str()),
                ("timeout", &probe_timeout_ms.to_string()),
            ])
            .timeout(request_timeout)
            .send()
            .await;

        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!("测速请求被拒绝：{}", resp.status());
            }
            Ok(_) => {}
            Err(e) if e.is_timeout() => {
                warn!(
                    "测速策略组 {} 超时（{} ms），本轮不计入",
                    group_name, probe_timeout_ms
                );
            }
            Err(e) => {
                warn!("测速策略组 {} 失败：{}", group_name, e);
            }
        }
    }

    /// 拉取全量节点状态快照。
    pub async fn get_proxies(&self) -> anyhow::Result<HashMap<String, ProxyState>> {
        let base = self
            .base_url
            .as_ref()
            .context("尚未建立控制接口连接")?;
        let snapshot: ProxiesSnapshot = self
            .request(self.client.get(format!("{base}/proxies")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(snapshot.proxies)
    }

    /// 切换策略组当前选中的节点，204 即成功。
    pub async fn switch_proxy(&self, group_name: &str, proxy_name: &str) -> anyhow::Result<()> {
        let base = self
            .base_url
            .as_ref()
            .context("尚未建立控制接口连接")?;
        let resp = self
            .request(self.client.put(format!("{base}/proxies/{group_name}")))
            .json(&serde_json::json!({ "name": proxy_name }))
            .send()
            .await?;
        if resp.status() != StatusCode::NO_CONTENT {
            anyhow::bail!("切换节点失败：{}", resp.status());
        }
        info!("策略组 {} 已切换到 {}", group_name, proxy_name);
        Ok(())
    }
}
