//! 通道层的对外入口。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 解释器只看到引用号与事件号：[`ComManager`] 把打开字符串分派给后端，
//!   并把发送、接收、状态查询与控制请求路由到对应通道；
//! - 管理器持有（或借用）一个 Tokio 运行时，挂起操作的任务都在其上执行。
//!
//! ## 契约（What）
//! - 全部公开方法都是同步函数，只在登记表锁内短暂停留，不会等待 I/O
//!   （遗留的 `connect_wait` 除外）；
//! - 失效引用号返回 754；`GETERROR` 例外，它报告最近一次释放记录的错误文本；
//! - 对非 IDLE 方向发起新操作时先清除该方向，再检查永久错误。
//!
//! ## 注意事项（Trade-offs）
//! - 不得在 Tokio 工作线程内调用本类型的方法；`Drop` 会关闭所有通道并在后台
//!   关闭自有运行时。

use crate::backend;
use crate::channel::{ChannelFlags, ErrorQuery, RefNum, TransportKind};
use crate::config::ComConfig;
use crate::error::ComError;
use crate::event::{EventId, EventSink};
use crate::registry::Registry;
use crate::runtime::Shared;
use crate::serial;
use crate::status::{ClearScope, ComStatus, Direction, OpState, Timeout};
use crate::tcp;
use crate::udp;
use crate::util::error_verb;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::{Builder as RuntimeBuilder, Handle, Runtime};

const PERMANENT_ERROR: &str = "PERMANENT ERROR";
const NO_RECEIVE_DATA: &str = "NO RECEIVE DATA";

/// 通信通道管理器。
pub struct ComManager {
    shared: Arc<Shared>,
    runtime: Option<Runtime>,
}

impl ComManager {
    /// 创建自带多线程运行时的管理器。
    pub fn new(config: ComConfig, events: Arc<dyn EventSink>) -> Result<Self, ComError> {
        let runtime = RuntimeBuilder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("spark-comm")
            .enable_all()
            .build()
            .map_err(|err| ComError::Runtime {
                message: err.to_string(),
            })?;
        let handle = runtime.handle().clone();
        let mut manager = Self::with_handle(config, events, handle);
        manager.runtime = Some(runtime);
        Ok(manager)
    }

    /// 在已有的运行时上工作；运行时须启用 I/O 与时间驱动。
    pub fn with_handle(config: ComConfig, events: Arc<dyn EventSink>, handle: Handle) -> Self {
        tracing::debug!(workers = config.worker_threads, "communication manager started");
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                events,
                config,
                handle,
            }),
            runtime: None,
        }
    }

    /// 按首个关键字打开通道，返回新的引用号。
    pub fn open(&self, name: &str) -> Result<RefNum, ComError> {
        let _runtime = self.shared.handle.enter();
        let trimmed = name.trim_start();
        let split = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        let transport = TransportKind::from_keyword(&trimmed[..split].to_ascii_uppercase());
        let rest = trimmed[split..].trim_start();
        let shared = &self.shared;
        let refnum = match transport {
            TransportKind::TcpClient(family) => tcp::client::open(shared, family, rest),
            TransportKind::TcpServer(family) => tcp::listener::open(shared, family, rest),
            TransportKind::Udp(family) => udp::open(shared, family, rest),
            TransportKind::Serial => serial::open(shared, rest),
            TransportKind::Other => serial::open_other(shared, name),
        }?;
        tracing::debug!(%refnum, transport = transport.label(), "channel opened");
        Ok(refnum)
    }

    pub fn close(&self, refnum: RefNum) -> Result<(), ComError> {
        let _runtime = self.shared.handle.enter();
        let mut registry = self.shared.registry.lock();
        let key = registry
            .lookup(refnum)
            .ok_or(ComError::UnknownChannel { refnum })?;
        backend::close(&self.shared, &mut registry, key);
        Ok(())
    }

    /// 发起发送：数据前后拼接分帧序列，能立即写完则直接 DONE。
    pub fn send(
        &self,
        refnum: RefNum,
        event: EventId,
        timeout: Timeout,
        data: &[u8],
    ) -> Result<(), ComError> {
        self.start(refnum, Direction::Send, event, timeout, |framing| {
            let buffer = framing.frame_outbound(data);
            let length = buffer.len();
            (buffer, length)
        })
    }

    /// 发起接收，`count` 至少为 1。
    pub fn recv(
        &self,
        refnum: RefNum,
        event: EventId,
        timeout: Timeout,
        count: usize,
    ) -> Result<(), ComError> {
        if count == 0 {
            return Err(ComError::InvalidArgument { reason: "count" });
        }
        self.start(refnum, Direction::Recv, event, timeout, |framing| {
            (vec![0; framing.inbound_capacity(count)], count)
        })
    }

    fn start(
        &self,
        refnum: RefNum,
        direction: Direction,
        event: EventId,
        timeout: Timeout,
        build: impl FnOnce(&crate::framing::Framing) -> (Vec<u8>, usize),
    ) -> Result<(), ComError> {
        let now = Instant::now();
        let events = self.shared.events();
        let mut registry = self.shared.registry.lock();
        let channel = registry
            .by_refnum(refnum)
            .ok_or(ComError::UnknownChannel { refnum })?;
        if channel.op(direction).state != OpState::Idle {
            channel.op_mut(direction).reset(events);
        }
        if channel.permanent_error {
            return Err(ComError::operation(PERMANENT_ERROR));
        }
        let (buffer, length) = build(&channel.framing);
        backend::prepare(channel, direction);
        channel
            .op_mut(direction)
            .begin(buffer, length, timeout, event, now);
        backend::advance(&self.shared, channel, direction);
        Ok(())
    }

    /// 取回已结束的接收结果，返回复制的字节数。
    pub fn fetch_received(&self, refnum: RefNum, out: &mut [u8]) -> Result<usize, ComError> {
        if out.is_empty() {
            return Err(ComError::InvalidArgument { reason: "buffer" });
        }
        let mut registry = self.shared.registry.lock();
        let channel = registry
            .by_refnum(refnum)
            .ok_or(ComError::UnknownChannel { refnum })?;
        let op = &channel.recv;
        if op.buffer.is_empty() || !op.state.is_terminal() {
            return Err(ComError::operation(NO_RECEIVE_DATA));
        }
        let count = out.len().min(op.done);
        out[..count].copy_from_slice(&op.buffer[..count]);
        Ok(count)
    }

    /// 查询状态；已过截止时间的挂起操作先转为 TIMED_OUT。
    pub fn status(&self, refnum: RefNum) -> Result<ComStatus, ComError> {
        let mut registry = self.shared.registry.lock();
        let channel = registry
            .by_refnum(refnum)
            .ok_or(ComError::UnknownChannel { refnum })?;
        Ok(channel.status(Instant::now(), self.shared.events()))
    }

    /// 返回清除前的状态，并把所选方向复位为 IDLE。
    pub fn clear(&self, refnum: RefNum, scope: ClearScope) -> Result<ComStatus, ComError> {
        let mut registry = self.shared.registry.lock();
        let channel = registry
            .by_refnum(refnum)
            .ok_or(ComError::UnknownChannel { refnum })?;
        Ok(channel.clear(scope, Instant::now(), self.shared.events()))
    }

    /// 控制请求：`GETERROR` 系列由通用层回答，其余交给后端。
    pub fn control(&self, refnum: RefNum, request: &[u8]) -> Result<Vec<u8>, ComError> {
        let verb = error_verb(request);
        let query = ErrorQuery::from_verb(&verb);
        let mut registry = self.shared.registry.lock();
        let Some(key) = registry.lookup(refnum) else {
            return match query {
                Some(ErrorQuery::General) => Ok(registry.freed_error().into_bytes()),
                _ => Err(ComError::UnknownChannel { refnum }),
            };
        };
        let channel = registry
            .get_mut(key)
            .ok_or(ComError::UnknownChannel { refnum })?;
        match query {
            Some(query) => Ok(channel.error_report(query).into_bytes()),
            None => backend::control(channel, request),
        }
    }

    pub fn channel_flags(&self, refnum: RefNum) -> Result<ChannelFlags, ComError> {
        let mut registry = self.shared.registry.lock();
        registry
            .by_refnum(refnum)
            .map(|channel| channel.flags)
            .ok_or(ComError::UnknownChannel { refnum })
    }

    pub fn transport(&self, refnum: RefNum) -> Result<TransportKind, ComError> {
        let mut registry = self.shared.registry.lock();
        registry
            .by_refnum(refnum)
            .map(|channel| channel.transport)
            .ok_or(ComError::UnknownChannel { refnum })
    }

    /// 当前存活的引用号，按引用号升序。
    pub fn live_channels(&self) -> Vec<RefNum> {
        self.shared.registry.lock().live_refnums()
    }

    /// 关闭全部存活通道。
    pub fn shutdown(&self) {
        let _runtime = self.shared.handle.enter();
        let mut registry = self.shared.registry.lock();
        for key in registry.keys() {
            backend::close(&self.shared, &mut registry, key);
        }
        tracing::debug!("communication manager shut down");
    }
}

impl Drop for ComManager {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
