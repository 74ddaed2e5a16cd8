//! 通道记录：引用号、传输类型、状态位、两个操作槽与错误文本。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 把“一个逻辑通道”所需的全部可变状态收拢到 [`Channel`]，登记表只负责存放与寻址，
//!   后端只负责各自的平台句柄；
//! - 错误文本与操作状态的写入统一经由 [`Channel::fail`] / [`Channel::fail_permanent`]，
//!   确保“永久错误时不存在挂起操作”这一不变量只在一处维护。
//!
//! ## 契约（What）
//! - 三段错误文本各自最多 255 字节，超出部分截断；
//! - `GETERROR` 系列读取后清空对应文本；`"TIMEOUT"` 属于合成文本，不会被清除。

use crate::backend::Backend;
use crate::event::EventSink;
use crate::framing::Framing;
use crate::operation::Operation;
use crate::status::{ClearScope, ComStatus, Direction, OpState};
use bitflags::bitflags;
use std::fmt;
use std::time::Instant;

/// 错误文本的最大字节数。
pub(crate) const ERROR_TEXT_LIMIT: usize = 255;

/// 进程内唯一的通道引用号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefNum(u32);

impl RefNum {
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for RefNum {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RefNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// 地址族约束，来自打开关键字的 `4` / `6` 后缀。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Family {
    #[default]
    Any,
    V4,
    V6,
}

/// 打开时确定、此后不可变的传输类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    TcpClient(Family),
    TcpServer(Family),
    Udp(Family),
    Serial,
    Other,
}

impl TransportKind {
    /// 按打开字符串的首个关键字选择传输类型。
    pub(crate) fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "UDP" => TransportKind::Udp(Family::Any),
            "UDP4" => TransportKind::Udp(Family::V4),
            "TCPCLIENT" => TransportKind::TcpClient(Family::Any),
            "TCPCLIENT4" => TransportKind::TcpClient(Family::V4),
            "TCPCLIENT6" => TransportKind::TcpClient(Family::V6),
            "TCPSERVER" => TransportKind::TcpServer(Family::Any),
            "TCPSERVER4" => TransportKind::TcpServer(Family::V4),
            "TCPSERVER6" => TransportKind::TcpServer(Family::V6),
            "SERIAL" => TransportKind::Serial,
            _ => TransportKind::Other,
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            TransportKind::TcpClient(_) => "tcp-client",
            TransportKind::TcpServer(_) => "tcp-server",
            TransportKind::Udp(_) => "udp",
            TransportKind::Serial => "serial",
            TransportKind::Other => "other",
        }
    }
}

bitflags! {
    /// 通道生命周期与监听组角色的状态位。
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ChannelFlags: u16 {
        const OPEN = 0x0001;
        const BOUND = 0x0002;
        const NONBLOCKING = 0x0004;
        const REGISTERED = 0x0008;
        const LISTENING = 0x0010;
        const CONNECTED = 0x0020;
        const HOLDS_LISTENER = 0x0040;
        const SHARES_PORT = 0x0080;
        const TTY = 0x0100;
    }
}

/// 登记表内部寻址键：槽位下标 + 代际号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ChannelKey {
    pub slot: usize,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ErrorTexts {
    pub general: String,
    pub send: String,
    pub recv: String,
}

impl ErrorTexts {
    fn slot_mut(&mut self, direction: Option<Direction>) -> &mut String {
        match direction {
            None => &mut self.general,
            Some(Direction::Send) => &mut self.send,
            Some(Direction::Recv) => &mut self.recv,
        }
    }
}

/// 截断到 [`ERROR_TEXT_LIMIT`] 字节，保持在字符边界上。
pub(crate) fn cap_text(mut text: String) -> String {
    if text.len() > ERROR_TEXT_LIMIT {
        let mut end = ERROR_TEXT_LIMIT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// `GETERROR` 系列请求。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorQuery {
    General,
    Send,
    Recv,
}

impl ErrorQuery {
    pub(crate) fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            "GETERROR" => Some(ErrorQuery::General),
            "GETSENDERROR" => Some(ErrorQuery::Send),
            "GETRECVERROR" => Some(ErrorQuery::Recv),
            _ => None,
        }
    }
}

/// 一个逻辑通道的完整状态。
pub(crate) struct Channel {
    pub key: ChannelKey,
    pub refnum: Option<RefNum>,
    pub transport: TransportKind,
    pub flags: ChannelFlags,
    pub send: Operation,
    pub recv: Operation,
    pub framing: Framing,
    pub permanent_error: bool,
    pub errors: ErrorTexts,
    pub backend: Backend,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("key", &self.key)
            .field("refnum", &self.refnum)
            .field("transport", &self.transport)
            .field("flags", &self.flags)
            .field("send", &self.send.state)
            .field("recv", &self.recv.state)
            .field("permanent_error", &self.permanent_error)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(key: ChannelKey, transport: TransportKind) -> Self {
        Self {
            key,
            refnum: None,
            transport,
            flags: ChannelFlags::empty(),
            send: Operation::default(),
            recv: Operation::default(),
            framing: Framing::default(),
            permanent_error: false,
            errors: ErrorTexts::default(),
            backend: Backend::Detached,
        }
    }

    pub(crate) fn op(&self, direction: Direction) -> &Operation {
        match direction {
            Direction::Send => &self.send,
            Direction::Recv => &self.recv,
        }
    }

    pub(crate) fn op_mut(&mut self, direction: Direction) -> &mut Operation {
        match direction {
            Direction::Send => &mut self.send,
            Direction::Recv => &mut self.recv,
        }
    }

    /// 写入错误文本；`None` 表示通道级文本。
    pub(crate) fn set_error(&mut self, direction: Option<Direction>, text: impl Into<String>) {
        *self.errors.slot_mut(direction) = cap_text(text.into());
    }

    /// 以 ERROR 结束指定方向的操作并记录方向错误文本。
    pub(crate) fn fail(&mut self, direction: Direction, text: impl Into<String>, events: &dyn EventSink) {
        let text = text.into();
        tracing::debug!(refnum = ?self.refnum, ?direction, error = %text, "operation failed");
        self.set_error(Some(direction), text);
        self.op_mut(direction).finish(OpState::Error, events);
    }

    /// 进入永久错误：记录通道级文本，并以 ERROR 结束全部挂起操作。
    pub(crate) fn fail_permanent(&mut self, text: impl Into<String>, events: &dyn EventSink) {
        let text = text.into();
        tracing::warn!(
            refnum = ?self.refnum,
            transport = self.transport.label(),
            error = %text,
            "channel entered permanent error"
        );
        self.permanent_error = true;
        self.set_error(None, text);
        for direction in [Direction::Send, Direction::Recv] {
            if self.op(direction).state == OpState::Pending {
                self.op_mut(direction).finish(OpState::Error, events);
            }
        }
    }

    /// 把已过期的挂起操作转为 TIMED_OUT。
    pub(crate) fn reconcile(&mut self, now: Instant, events: &dyn EventSink) {
        self.send.reconcile(now, events);
        self.recv.reconcile(now, events);
    }

    pub(crate) fn status(&mut self, now: Instant, events: &dyn EventSink) -> ComStatus {
        self.reconcile(now, events);
        ComStatus::compose(self.send.state, self.recv.state, self.permanent_error)
    }

    /// 返回清除前的状态并复位所选方向。
    pub(crate) fn clear(&mut self, scope: ClearScope, now: Instant, events: &dyn EventSink) -> ComStatus {
        let status = self.status(now, events);
        for direction in [Direction::Send, Direction::Recv] {
            if scope.covers(direction) {
                self.op_mut(direction).reset(events);
            }
        }
        status
    }

    /// 生成 `GETERROR` 系列响应，并清空被读取的文本。
    pub(crate) fn error_report(&mut self, query: ErrorQuery) -> String {
        if self.permanent_error {
            return format!("PERMANENT ERROR: {}", std::mem::take(&mut self.errors.general));
        }
        match query {
            ErrorQuery::General => std::mem::take(&mut self.errors.general),
            ErrorQuery::Send => self.direction_report(Direction::Send),
            ErrorQuery::Recv => self.direction_report(Direction::Recv),
        }
    }

    fn direction_report(&mut self, direction: Direction) -> String {
        match self.op(direction).state {
            OpState::Error => std::mem::take(self.errors.slot_mut(Some(direction))),
            OpState::TimedOut => "TIMEOUT".to_string(),
            _ => String::new(),
        }
    }

    /// 关闭时的收尾：复位两个方向并释放平台句柄。
    pub(crate) fn teardown(&mut self, events: &dyn EventSink) {
        self.send.reset(events);
        self.recv.reset(events);
        self.backend.release();
        self.flags = ChannelFlags::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventId, EventTable};
    use crate::status::Timeout;

    fn channel() -> Channel {
        Channel::new(
            ChannelKey {
                slot: 0,
                generation: 1,
            },
            TransportKind::Other,
        )
    }

    #[test]
    fn keywords_select_transport_and_family() {
        assert_eq!(
            TransportKind::from_keyword("TCPCLIENT6"),
            TransportKind::TcpClient(Family::V6)
        );
        assert_eq!(TransportKind::from_keyword("UDP"), TransportKind::Udp(Family::Any));
        assert_eq!(TransportKind::from_keyword("/dev/ttyS0"), TransportKind::Other);
    }

    #[test]
    fn error_texts_are_capped() {
        let text = cap_text("x".repeat(400));
        assert_eq!(text.len(), ERROR_TEXT_LIMIT);
    }

    #[test]
    fn permanent_error_finishes_pending_ops() {
        let events = EventTable::new();
        let recv_event = events.create();
        let mut ch = channel();
        ch.recv.begin(Vec::new(), 4, Timeout::Never, recv_event, Instant::now());
        ch.fail_permanent("DISCONNECT", &events);
        assert_eq!(ch.recv.state, OpState::Error);
        assert_eq!(ch.send.state, OpState::Idle);
        assert!(events.is_signaled(recv_event));
        assert_eq!(ch.error_report(ErrorQuery::Recv), "PERMANENT ERROR: DISCONNECT");
        assert_eq!(ch.error_report(ErrorQuery::General), "PERMANENT ERROR: ");
    }

    #[test]
    fn direction_reports_timeout_and_clears_text() {
        let events = EventTable::new();
        let id = events.create();
        let mut ch = channel();
        ch.send.begin(Vec::new(), 0, Timeout::Never, id, Instant::now());
        ch.send.finish(OpState::TimedOut, &events);
        assert_eq!(ch.error_report(ErrorQuery::Send), "TIMEOUT");
        assert_eq!(ch.error_report(ErrorQuery::Send), "TIMEOUT");

        ch.recv.begin(Vec::new(), 1, Timeout::Never, EventId::new(99), Instant::now());
        ch.fail(Direction::Recv, "RECV FAILURE, ERRNO = 5", &events);
        assert_eq!(ch.error_report(ErrorQuery::Recv), "RECV FAILURE, ERRNO = 5");
        assert_eq!(ch.error_report(ErrorQuery::Recv), "");
    }

    #[test]
    fn clear_returns_prior_status_then_resets() {
        let events = EventTable::new();
        let id = events.create();
        let mut ch = channel();
        ch.send.begin(Vec::new(), 0, Timeout::Never, id, Instant::now());
        ch.send.finish(OpState::Done, &events);
        let status = ch.clear(ClearScope::Send, Instant::now(), &events);
        assert_eq!(status, ComStatus::SEND_DONE);
        assert_eq!(ch.send.state, OpState::Idle);
        assert!(!events.is_signaled(id));
        let again = ch.clear(ClearScope::Send, Instant::now(), &events);
        assert_eq!(again, ComStatus::empty());
    }
}
