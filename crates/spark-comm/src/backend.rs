//! 后端分派：打开、尝试、挂起、控制与关闭。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 同步路径（解释器调用）与异步路径（Tokio 任务唤醒）都经由 [`attempt`]，
//!   保证两条路径对缓冲、`done` 与终态的影响完全一致；
//! - 各后端只返回 [`Outcome`]，状态迁移与错误文本统一在 [`apply`] 中落地。
//!
//! ## 契约（What）
//! - `attempt` 只在操作处于 PENDING 时被调用；
//! - [`advance`] 在首次尝试会阻塞时：`Immediate` 超时直接 TIMED_OUT，
//!   否则生成任务并把票据存入操作槽。

use crate::channel::{Channel, ChannelKey, RefNum, TransportKind};
use crate::error::ComError;
use crate::event::EventSink;
use crate::registry::Registry;
use crate::runtime::{OpTarget, Shared, spawn_op, spawn_timer};
use crate::status::{Direction, OpState, Timeout};
use crate::tcp::{self, TcpState};
use crate::udp::{self, UdpState};
use crate::util::INVALID_REQUEST;
use std::sync::Arc;

#[cfg(unix)]
use crate::serial::{self, SerialState};

/// 一次尝试的结果，由 [`apply`] 转换为状态迁移。
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Done,
    WouldBlock,
    /// 方向错误：写入方向错误文本并以 ERROR 结束。
    Fail(String),
    /// 永久错误：通道不可再用。
    Permanent(String),
    /// 对端断开：本方向 ERROR，另一方向若挂起亦 ERROR，随后进入永久错误。
    Disconnect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Progress {
    Complete,
    WouldBlock,
}

/// 通道持有的平台状态。
pub(crate) enum Backend {
    /// 尚未初始化或已拆除。
    Detached,
    Tcp(TcpState),
    Udp(UdpState),
    #[cfg(unix)]
    Serial(SerialState),
}

impl Backend {
    /// 释放平台句柄；串口在此恢复原始终端属性。
    pub(crate) fn release(&mut self) {
        *self = Backend::Detached;
    }
}

const DISCONNECT: &str = "DISCONNECT";

/// 将后端结果落地为状态迁移。
pub(crate) fn apply(
    channel: &mut Channel,
    direction: Direction,
    outcome: Outcome,
    events: &dyn EventSink,
) -> Progress {
    match outcome {
        Outcome::WouldBlock => return Progress::WouldBlock,
        Outcome::Done => {
            tracing::debug!(
                refnum = ?channel.refnum,
                ?direction,
                bytes = channel.op(direction).done,
                "operation completed"
            );
            channel.op_mut(direction).finish(OpState::Done, events);
        }
        Outcome::Fail(text) => channel.fail(direction, text, events),
        Outcome::Permanent(text) => channel.fail_permanent(text, events),
        Outcome::Disconnect => {
            channel.fail(direction, DISCONNECT, events);
            if channel.op(direction.other()).state == OpState::Pending {
                channel.fail(direction.other(), DISCONNECT, events);
            }
            channel.fail_permanent(DISCONNECT, events);
        }
    }
    Progress::Complete
}

/// 对挂起操作做一次非阻塞尝试。
pub(crate) fn attempt(events: &dyn EventSink, channel: &mut Channel, direction: Direction) -> Progress {
    let outcome = match &channel.backend {
        Backend::Detached => Outcome::WouldBlock,
        Backend::Tcp(_) => tcp::attempt(channel, direction),
        Backend::Udp(_) => udp::attempt(channel, direction),
        #[cfg(unix)]
        Backend::Serial(_) => serial::attempt(channel, direction),
    };
    apply(channel, direction, outcome, events)
}

/// 新操作替换旧缓冲之前的后端准备；串口在此回收上一次接收未扫描的字节。
pub(crate) fn prepare(channel: &mut Channel, direction: Direction) {
    #[cfg(unix)]
    if direction == Direction::Recv {
        serial::prepare_recv(channel);
    }
    #[cfg(not(unix))]
    let _ = (channel, direction);
}

/// 为挂起操作生成驱动任务。
pub(crate) fn arm(shared: &Arc<Shared>, channel: &mut Channel, direction: Direction) {
    let op = channel.op(direction);
    let target = OpTarget {
        key: channel.key,
        direction,
        instance: op.instance,
    };
    let deadline = op.deadline;
    let ticket = match &channel.backend {
        Backend::Tcp(state) => match state.stream() {
            Some(stream) => Some(spawn_op(
                shared,
                target,
                deadline,
                tcp::drive(Arc::clone(shared), Arc::clone(stream), target),
            )),
            None => spawn_timer(shared, target, deadline),
        },
        Backend::Udp(state) => Some(spawn_op(
            shared,
            target,
            deadline,
            udp::drive(Arc::clone(shared), Arc::clone(&state.ready), target),
        )),
        #[cfg(unix)]
        Backend::Serial(state) => Some(spawn_op(
            shared,
            target,
            deadline,
            serial::drive(Arc::clone(shared), Arc::clone(&state.device), target),
        )),
        Backend::Detached => spawn_timer(shared, target, deadline),
    };
    tracing::debug!(refnum = ?channel.refnum, ?direction, ?deadline, "operation pending");
    channel.op_mut(direction).ticket = ticket;
}

/// 首次尝试；会阻塞时按超时类型决定 TIMED_OUT 或挂起。
pub(crate) fn advance(shared: &Arc<Shared>, channel: &mut Channel, direction: Direction) {
    if attempt(shared.events(), channel, direction) == Progress::Complete {
        return;
    }
    if channel.op(direction).timeout == Timeout::Immediate {
        channel
            .op_mut(direction)
            .finish(OpState::TimedOut, shared.events());
    } else {
        arm(shared, channel, direction);
    }
}

/// 链路建立后重跑所有挂起操作，替换原先只等待截止时间的任务。
pub(crate) fn link_up(shared: &Arc<Shared>, channel: &mut Channel) {
    for direction in [Direction::Send, Direction::Recv] {
        if channel.op(direction).state == OpState::Pending {
            channel.op_mut(direction).ticket = None;
            advance(shared, channel, direction);
        }
    }
}

/// 分派后端控制请求；失败文本同时写入通道级错误文本。
pub(crate) fn control(channel: &mut Channel, request: &[u8]) -> Result<Vec<u8>, ComError> {
    let result = match &channel.backend {
        Backend::Tcp(_) => tcp::control(channel, request),
        Backend::Udp(_) => udp::control(channel, request),
        #[cfg(unix)]
        Backend::Serial(_) => serial::control(channel, request),
        Backend::Detached => Err(ComError::operation(INVALID_REQUEST)),
    };
    if let Err(error) = &result {
        channel.set_error(None, error.message());
    }
    result
}

/// 在登记表锁内完成通道初始化：占用槽位、构建后端、发放引用号。
pub(crate) fn install<F>(shared: &Arc<Shared>, transport: TransportKind, build: F) -> Result<RefNum, ComError>
where
    F: FnOnce(&mut Registry, ChannelKey) -> Result<(), ComError>,
{
    let mut registry = shared.registry.lock();
    let key = registry.allocate(transport);
    match build(&mut registry, key) {
        Ok(()) => registry
            .publish(key)
            .ok_or_else(|| ComError::operation("OPEN FAILURE")),
        Err(error) => {
            tracing::warn!(transport = transport.label(), error = %error.message(), "open failed");
            registry.discard(key, &error.message(), shared.events());
            Err(error)
        }
    }
}

/// 加锁前就已失败的打开：保留失败文本供 `GETERROR` 读取。
pub(crate) fn reject(shared: &Shared, transport: TransportKind, error: ComError) -> ComError {
    tracing::warn!(transport = transport.label(), error = %error.message(), "open failed");
    shared
        .registry
        .lock()
        .record_failure(transport, &error.message(), shared.events());
    error
}

/// 关闭通道：TCP 服务端先完成监听移交，随后释放记录。
pub(crate) fn close(shared: &Arc<Shared>, registry: &mut Registry, key: ChannelKey) {
    let is_server = registry
        .get_mut(key)
        .is_some_and(|channel| matches!(channel.transport, TransportKind::TcpServer(_)));
    if is_server {
        tcp::listener::hand_off_on_close(shared, registry, key);
    }
    if let Some(channel) = registry.release(key, shared.events()) {
        tracing::debug!(refnum = ?channel.refnum, transport = channel.transport.label(), "channel closed");
    }
}
