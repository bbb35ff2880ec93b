//! 外部引擎进程的启动、监视与回收。
//!
//! 启动流程：配置落盘 → 拉起进程 → 边读标准输出边轮询控制接口。
//! 标准输出里有两类有意义的行：geo 库加载完成（就绪的前兆）和
//! `Parse config error ... proxy N:`（触发摘除该节点后重启）。
//! 修复循环不设上限，每轮必然少一个节点，收敛有保证；
//! 同一份配置反复拉不起来才算启动失败。

use crate::engine::config::EngineConfig;
use crate::error::CheckError;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const READY_HINT: &str = "GeoIP.dat";
const PARSE_ERROR_HINT: &str = "Parse config error";

/// 同一份配置的启动尝试次数，修复一次配置后重新计数
const LAUNCH_ATTEMPTS: u32 = 3;
/// 单次尝试内等待就绪的窗口
const ATTEMPT_WINDOW: Duration = Duration::from_secs(3);
/// geo 库加载完成后再等一小段让控制接口起来
const READY_GRACE: Duration = Duration::from_secs(5);
const STOP_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Ready,
    Failed,
}

pub struct EngineProcess {
    bin: PathBuf,
    client: reqwest::Client,
    child: Option<Child>,
    state: ProcessState,
    // 进程存活期间持有配置目录，退出时一并清掉
    workdir: Option<TempDir>,
}

impl EngineProcess {
    pub fn new(bin: PathBuf) -> Self {
        EngineProcess {
            bin,
            client: reqwest::Client::new(),
            child: None,
            state: ProcessState::NotStarted,
            workdir: None,
        }
    }

    /// 启动引擎直到控制接口可用。配置解析错误会触发修复并重启，
    /// 摘除的节点记录在 `config` 里。
    pub async fn start(&mut self, config: &mut EngineConfig) -> Result<(), CheckError> {
        info!("=================== 启动引擎并等待就绪 ===================");
        let mut attempts_left = LAUNCH_ATTEMPTS;

        'restart: loop {
            if attempts_left == 0 {
                self.state = ProcessState::Failed;
                return Err(CheckError::EngineStart(format!(
                    "控制接口在 {LAUNCH_ATTEMPTS} 次尝试内未就绪"
                )));
            }
            attempts_left -= 1;

            let mut lines = self.spawn(config).await?;
            let deadline = Instant::now() + ATTEMPT_WINDOW;

            while Instant::now() < deadline {
                match tokio::time::timeout(Duration::from_millis(500), lines.recv()).await {
                    Ok(Some(line)) => {
                        debug!("引擎输出：{}", line.trim_end());
                        if line.contains(PARSE_ERROR_HINT) {
                            if config.repair(&line) {
                                self.stop().await;
                                attempts_left = LAUNCH_ATTEMPTS;
                                continue 'restart;
                            }
                            warn!("无法从诊断中定位问题节点：{}", line.trim_end());
                        }
                        if line.contains(READY_HINT) {
                            info!("geo 库加载完成，等待控制接口");
                            tokio::time::sleep(READY_GRACE).await;
                            if self.probe(config).await {
                                self.state = ProcessState::Ready;
                                return Ok(());
                            }
                        }
                    }
                    // 标准输出关闭，进程大概率已退出，走重启
                    Ok(None) => break,
                    Err(_) => {
                        if self.probe(config).await {
                            self.state = ProcessState::Ready;
                            return Ok(());
                        }
                    }
                }
            }

            self.stop().await;
        }
    }

    async fn spawn(&mut self, config: &EngineConfig) -> Result<mpsc::Receiver<String>, CheckError> {
        let workdir = tempfile::tempdir()?;
        let config_path = workdir.path().join("engine.yaml");
        config.save(&config_path)?;

        let mut child = Command::new(&self.bin)
            .arg("-f")
            .arg(&config_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let (tx, rx) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }

        self.child = Some(child);
        self.workdir = Some(workdir);
        self.state = ProcessState::Starting;
        Ok(rx)
    }

    async fn probe(&self, config: &EngineConfig) -> bool {
        let url = format!("http://{}:{}/version", config.host(), config.api_port());
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(1))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                info!("控制接口已就绪，开始批量检测");
                true
            }
            _ => false,
        }
    }

    /// 先礼后兵：SIGTERM 后限时等待，还活着就 SIGKILL。
    /// 批次管线保证无论成败都会走到这里。
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            if tokio::time::timeout(STOP_WAIT, child.wait()).await.is_err() {
                warn!("引擎未在 {}s 内退出，强制结束", STOP_WAIT.as_secs());
                let _ = child.kill().await;
            }
        }
        self.workdir = None;
        if self.state != ProcessState::Failed {
            self.state = ProcessState::NotStarted;
        }
    }
}
