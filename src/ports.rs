//! 批次隔离用的端口池。
//!
//! 固定区间，取完即挂起等待，归还时唤醒一个等待者。
//! 多个批次并发取还时由互斥锁保证集合一致性。

use crate::error::CheckError;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;

pub struct PortPool {
    start: u16,
    end: u16,
    inner: Mutex<Inner>,
    available: Notify,
}

struct Inner {
    free: VecDeque<u16>,
    used: HashSet<u16>,
}

impl PortPool {
    pub fn new(start: u16, count: u16) -> Self {
        let end = start + count;
        PortPool {
            start,
            end,
            inner: Mutex::new(Inner {
                free: (start..end).collect(),
                used: HashSet::new(),
            }),
            available: Notify::new(),
        }
    }

    /// 取一个可用端口，池空时挂起直到有人归还。
    pub async fn acquire(&self) -> u16 {
        loop {
            // 先登记等待再查队列，避免归还通知落在检查间隙里
            let notified = self.available.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(port) = inner.free.pop_front() {
                    inner.used.insert(port);
                    return port;
                }
            }
            notified.await;
        }
    }

    /// 归还端口。不在区间内或当前并未借出时报 `InvalidRelease`，
    /// 这类调用属于编程错误，必须暴露。
    pub fn release(&self, port: u16) -> Result<(), CheckError> {
        if !(self.start..self.end).contains(&port) {
            return Err(CheckError::InvalidRelease(port));
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.used.remove(&port) {
                return Err(CheckError::InvalidRelease(port));
            }
            inner.free.push_back(port);
        }
        self.available.notify_one();
        Ok(())
    }

    pub fn available_count(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }
}
