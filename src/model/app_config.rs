#![allow(dead_code)]

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub static APP_CONFIG: Lazy<AppConfig> =
    Lazy::new(|| AppConfig::load().expect("Failed to load configuration"));

#[derive(Debug, Deserialize, Serialize)]
pub struct AppConfig {
    pub check: CheckConfig,
    pub filter: FilterConfig,
    pub log: LoggingConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CheckConfig {
    /// 外部引擎二进制路径，入口处校验存在性
    pub engine_bin: String,
    pub engine_host: String,
    #[serde(default)]
    pub engine_secret: String,
    pub port_start: u16,
    pub port_count: u16,
    pub batch_size: usize,
    /// 每批次触发组测速的轮数，多轮平滑抖动
    pub rounds: u32,
    pub delay_test_url: String,
    pub delay_timeout_ms: u64,
    pub limit: usize,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FilterConfig {
    pub fake_domains: Vec<String>,
    pub fake_ips: Vec<String>,
    /// 节点名中出现即判定为无效节点的词
    pub ban: Vec<String>,
    /// 展示名里需要打码的词表，base64 存储，空格分隔
    pub banned_words: Vec<String>,
    pub max_name_len: usize,
    /// 规范名 -> 展示名
    #[serde(default)]
    pub display_names: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub console_levels: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SourceConfig {
    pub path: String,
    #[serde(default)]
    pub max: Option<usize>,
}

impl AppConfig {
    fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("Config"))
            .build()?;
        let config = config.try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        assert!(APP_CONFIG.check.batch_size > 0);
        assert!(APP_CONFIG.check.port_count >= 4);
    }
}
