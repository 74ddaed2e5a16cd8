//! 单方向操作槽：缓冲、进度、超时与完成通知。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 发送与接收共享同一套生命周期：IDLE → PENDING → DONE / TIMED_OUT / ERROR；
//! - 所有终态迁移都经过 [`Operation::finish`]，从而保证每个操作实例的事件至多置位一次。
//!
//! ## 契约（What）
//! - `instance` 在每次 [`Operation::begin`] 时递增，异步任务携带发起时的实例号，
//!   实例号不匹配的唤醒一律丢弃；
//! - [`OpTicket`] 是驱动该操作的 Tokio 任务的中止句柄，随操作复位或终结一并中止。

use crate::event::{EventId, EventSink};
use crate::status::{OpState, Timeout};
use std::time::Instant;
use tokio::task::AbortHandle;

/// 挂起操作的超时票据。
#[derive(Debug)]
pub(crate) struct OpTicket(AbortHandle);

impl OpTicket {
    pub(crate) fn new(handle: AbortHandle) -> Self {
        Self(handle)
    }
}

impl Drop for OpTicket {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Default)]
pub(crate) struct Operation {
    pub state: OpState,
    pub buffer: Vec<u8>,
    /// 发送为待写总字节数；接收为调用方请求的字节数。
    pub length: usize,
    pub done: usize,
    pub timeout: Timeout,
    pub event: Option<EventId>,
    pub deadline: Option<Instant>,
    pub ticket: Option<OpTicket>,
    pub instance: u64,
}

impl Operation {
    /// 发起新的操作实例，状态置为 PENDING，等待首次尝试决定去向。
    pub(crate) fn begin(
        &mut self,
        buffer: Vec<u8>,
        length: usize,
        timeout: Timeout,
        event: EventId,
        now: Instant,
    ) {
        self.ticket = None;
        self.instance = self.instance.wrapping_add(1);
        self.state = OpState::Pending;
        self.buffer = buffer;
        self.length = length;
        self.done = 0;
        self.timeout = timeout;
        self.event = Some(event);
        self.deadline = timeout.deadline_from(now);
    }

    pub(crate) fn is_current(&self, instance: u64) -> bool {
        self.state == OpState::Pending && self.instance == instance
    }

    /// 唯一的终态入口：只接受来自 PENDING 的迁移，并置位事件一次。
    pub(crate) fn finish(&mut self, state: OpState, events: &dyn EventSink) {
        debug_assert!(state.is_terminal());
        if self.state != OpState::Pending {
            return;
        }
        self.state = state;
        self.ticket = None;
        if let Some(event) = self.event {
            events.signal(event);
        }
    }

    pub(crate) fn reconcile(&mut self, now: Instant, events: &dyn EventSink) {
        if self.state == OpState::Pending && self.deadline.is_some_and(|deadline| deadline <= now) {
            self.finish(OpState::TimedOut, events);
        }
    }

    /// 中止任务、清除事件并回到 IDLE。
    pub(crate) fn reset(&mut self, events: &dyn EventSink) {
        self.ticket = None;
        if self.state != OpState::Idle {
            if let Some(event) = self.event {
                events.clear(event);
            }
        }
        self.state = OpState::Idle;
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventTable;
    use std::time::Duration;

    #[test]
    fn finish_signals_exactly_once_per_instance() {
        let events = EventTable::new();
        let id = events.create();
        let mut op = Operation::default();
        op.begin(vec![0; 4], 4, Timeout::Never, id, Instant::now());
        op.finish(OpState::Done, &events);
        op.finish(OpState::Error, &events);
        assert_eq!(op.state, OpState::Done);
        assert_eq!(events.signal_count(id), 1);
    }

    #[test]
    fn reconcile_times_out_expired_pending_ops() {
        let events = EventTable::new();
        let id = events.create();
        let start = Instant::now();
        let mut op = Operation::default();
        op.begin(Vec::new(), 1, Timeout::Centis(1), id, start);
        op.reconcile(start, &events);
        assert_eq!(op.state, OpState::Pending);
        op.reconcile(start + Duration::from_millis(10), &events);
        assert_eq!(op.state, OpState::TimedOut);
        assert!(events.is_signaled(id));
    }

    #[test]
    fn stale_instances_are_rejected() {
        let events = EventTable::new();
        let id = events.create();
        let mut op = Operation::default();
        op.begin(Vec::new(), 1, Timeout::Never, id, Instant::now());
        let first = op.instance;
        op.reset(&events);
        op.begin(Vec::new(), 1, Timeout::Never, id, Instant::now());
        assert!(!op.is_current(first));
        assert!(op.is_current(op.instance));
    }
}
