//! 事件子系统契约与默认实现。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 通道层只需要“置位 / 清除 / 查询”三个动作即可通知解释器，因此以
//!   [`EventSink`] trait 抽象外部事件子系统；
//! - [`EventTable`] 提供可直接使用的实现：创建、销毁以及带超时的 `wait_any`，
//!   供嵌入方与测试驱动事件循环。
//!
//! ## 契约（What）
//! - `signal` 对已置位事件幂等；对未知事件号静默忽略；
//! - `wait_any` 返回第一个已置位事件在入参切片中的下标，超时返回 `None`；
//! - `signal_count` 统计事件被置位的累计次数，便于验证“每个操作实例至多通知一次”。
//!
//! ## 注意事项（Trade-offs）
//! - 通道层在持有登记表锁时调用 `signal`，实现者不得在 `signal` 内回调通道层。

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// 调用方提供的事件标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u32);

impl EventId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evt#{}", self.0)
    }
}

/// 通道层消费的事件能力。
pub trait EventSink: Send + Sync {
    fn signal(&self, id: EventId);
    fn clear(&self, id: EventId);
    fn is_signaled(&self, id: EventId) -> bool;
}

#[derive(Default)]
struct Slot {
    signaled: bool,
    signals: u64,
}

#[derive(Default)]
struct TableState {
    next: u32,
    slots: HashMap<EventId, Slot>,
}

/// 基于互斥锁与条件变量的事件表。
#[derive(Default)]
pub struct EventTable {
    state: Mutex<TableState>,
    changed: Condvar,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配一个新的、未置位的事件。
    pub fn create(&self) -> EventId {
        let mut state = self.state.lock();
        state.next = state.next.wrapping_add(1);
        let mut id = EventId(state.next);
        while state.slots.contains_key(&id) {
            state.next = state.next.wrapping_add(1);
            id = EventId(state.next);
        }
        state.slots.insert(id, Slot::default());
        id
    }

    pub fn destroy(&self, id: EventId) {
        self.state.lock().slots.remove(&id);
    }

    /// 累计置位次数。
    pub fn signal_count(&self, id: EventId) -> u64 {
        self.state
            .lock()
            .slots
            .get(&id)
            .map_or(0, |slot| slot.signals)
    }

    /// 等待任一事件置位；`timeout` 为 `None` 时无限等待。
    pub fn wait_any(&self, ids: &[EventId], timeout: Option<Duration>) -> Option<usize> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        loop {
            let hit = ids.iter().position(|id| {
                state
                    .slots
                    .get(id)
                    .is_some_and(|slot| slot.signaled)
            });
            if hit.is_some() {
                return hit;
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return ids.iter().position(|id| {
                            state.slots.get(id).is_some_and(|slot| slot.signaled)
                        });
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
    }
}

impl EventSink for EventTable {
    fn signal(&self, id: EventId) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(&id) {
            slot.signaled = true;
            slot.signals += 1;
            self.changed.notify_all();
        }
    }

    fn clear(&self, id: EventId) {
        if let Some(slot) = self.state.lock().slots.get_mut(&id) {
            slot.signaled = false;
        }
    }

    fn is_signaled(&self, id: EventId) -> bool {
        self.state
            .lock()
            .slots
            .get(&id)
            .is_some_and(|slot| slot.signaled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_clear_roundtrip() {
        let table = EventTable::new();
        let id = table.create();
        assert!(!table.is_signaled(id));
        table.signal(id);
        assert!(table.is_signaled(id));
        assert_eq!(table.signal_count(id), 1);
        table.clear(id);
        assert!(!table.is_signaled(id));
        assert_eq!(table.signal_count(id), 1);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let table = EventTable::new();
        let id = table.create();
        table.destroy(id);
        table.signal(id);
        assert!(!table.is_signaled(id));
        assert_eq!(table.signal_count(id), 0);
    }

    #[test]
    fn wait_any_times_out_without_signal() {
        let table = EventTable::new();
        let id = table.create();
        assert_eq!(table.wait_any(&[id], Some(Duration::from_millis(20))), None);
    }

    #[test]
    fn wait_any_wakes_on_signal_from_other_thread() {
        let table = Arc::new(EventTable::new());
        let first = table.create();
        let second = table.create();
        let signaller = Arc::clone(&table);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.signal(second);
        });
        let index = table.wait_any(&[first, second], Some(Duration::from_secs(5)));
        handle.join().expect("信号线程不应 panic");
        assert_eq!(index, Some(1));
    }
}
