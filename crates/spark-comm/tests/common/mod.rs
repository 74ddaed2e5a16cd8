//! 集成测试共用的管理器构造与等待工具。

#![allow(dead_code)]

use anyhow::{Result, bail};
use spark_comm::{ComConfig, ComManager, ComStatus, EventId, EventTable, RefNum};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 单个异步结果的最长等待时间。
pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub manager: ComManager,
    pub events: Arc<EventTable>,
}

impl Harness {
    pub fn new() -> Result<Self> {
        Self::with_config(ComConfig::default())
    }

    pub fn with_config(config: ComConfig) -> Result<Self> {
        let events = Arc::new(EventTable::new());
        let manager = ComManager::new(config, events.clone())?;
        Ok(Self { manager, events })
    }

    pub fn event(&self) -> EventId {
        self.events.create()
    }

    /// 等待事件置位，超时返回错误。
    pub fn wait(&self, id: EventId) -> Result<()> {
        match self.events.wait_any(&[id], Some(WAIT)) {
            Some(_) => Ok(()),
            None => bail!("事件 {id} 在 {WAIT:?} 内未置位"),
        }
    }

    /// 轮询状态直至满足条件。
    pub fn status_until(
        &self,
        refnum: RefNum,
        predicate: impl Fn(ComStatus) -> bool,
    ) -> Result<ComStatus> {
        let deadline = Instant::now() + WAIT;
        loop {
            let status = self.manager.status(refnum)?;
            if predicate(status) {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                bail!("状态 {status:?} 在 {WAIT:?} 内未满足条件");
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn text(&self, refnum: RefNum, request: &str) -> Result<String> {
        let response = self.manager.control(refnum, request.as_bytes())?;
        Ok(String::from_utf8(response)?)
    }

    pub fn fetch(&self, refnum: RefNum, capacity: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; capacity];
        let count = self.manager.fetch_received(refnum, &mut out)?;
        out.truncate(count);
        Ok(out)
    }
}

/// 轮询任意条件直至成立。
pub fn eventually(mut predicate: impl FnMut() -> Result<bool>) -> Result<()> {
    let deadline = Instant::now() + WAIT;
    while !predicate()? {
        if Instant::now() >= deadline {
            bail!("条件在 {WAIT:?} 内未成立");
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

/// 取一个当前空闲的本地端口。
pub fn free_tcp_port() -> Result<u16> {
    let scratch = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(scratch.local_addr()?.port())
}

pub fn free_udp_port() -> Result<u16> {
    let scratch = std::net::UdpSocket::bind("127.0.0.1:0")?;
    Ok(scratch.local_addr()?.port())
}
