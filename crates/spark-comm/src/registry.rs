//! 通道登记表：带代际号的槽位、空闲栈与引用号映射。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 解释器持有的引用号与 Tokio 任务持有的 [`ChannelKey`] 都可能比通道活得更久；
//!   以“槽位 + 代际号”寻址，使过期的引用永远无法解析到复用同一槽位的新通道；
//! - 释放的槽位压入空闲栈（后进先出），栈顶槽位保留最后的通道级错误文本，
//!   使打开失败后仍可通过未知引用号的 `GETERROR` 读取失败原因。
//!
//! ## 契约（What）
//! - 引用号从 `0x1465_7687` 起单调递增，回绕后跳过仍被存活通道占用的值；
//! - 打开流程分两步：[`Registry::allocate`] 占用槽位但不发放引用号，
//!   后端初始化成功后由 [`Registry::publish`] 发放；失败则 [`Registry::discard`]；
//! - 槽位释放时代际号加一。

use crate::channel::{Channel, ChannelKey, RefNum, TransportKind, cap_text};
use crate::event::EventSink;
use std::collections::HashMap;

/// 第一个发放的引用号。
pub(crate) const FIRST_REFNUM: u32 = 0x1465_7687;

/// 未知引用号且无任何已释放记录时的 `GETERROR` 响应。
pub(crate) const NO_ERROR_INFORMATION: &str = "NO ERROR INFORMATION";

enum SlotState {
    Live(Box<Channel>),
    /// 已释放，保留最后的通道级错误文本。
    Free(String),
}

struct Slot {
    generation: u64,
    state: SlotState,
}

pub(crate) struct Registry {
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: HashMap<RefNum, usize>,
    next_refnum: u32,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: HashMap::new(),
            next_refnum: FIRST_REFNUM,
        }
    }
}

impl Registry {
    /// 占用一个槽位并放入新通道记录，此时尚未发放引用号。
    pub(crate) fn allocate(&mut self, transport: TransportKind) -> ChannelKey {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    state: SlotState::Free(String::new()),
                });
                self.slots.len() - 1
            }
        };
        let entry = &mut self.slots[slot];
        let key = ChannelKey {
            slot,
            generation: entry.generation,
        };
        entry.state = SlotState::Live(Box::new(Channel::new(key, transport)));
        key
    }

    /// 为初始化成功的通道发放引用号。
    pub(crate) fn publish(&mut self, key: ChannelKey) -> Option<RefNum> {
        let refnum = self.next_free_refnum();
        let channel = self.get_mut(key)?;
        channel.refnum = Some(refnum);
        self.live.insert(refnum, key.slot);
        Some(refnum)
    }

    fn next_free_refnum(&mut self) -> RefNum {
        loop {
            let candidate = RefNum::from(self.next_refnum);
            self.next_refnum = self.next_refnum.wrapping_add(1);
            if !self.live.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub(crate) fn get_mut(&mut self, key: ChannelKey) -> Option<&mut Channel> {
        let slot = self.slots.get_mut(key.slot)?;
        match &mut slot.state {
            SlotState::Live(channel) if slot.generation == key.generation => Some(channel.as_mut()),
            _ => None,
        }
    }

    pub(crate) fn lookup(&self, refnum: RefNum) -> Option<ChannelKey> {
        let slot = *self.live.get(&refnum)?;
        Some(ChannelKey {
            slot,
            generation: self.slots[slot].generation,
        })
    }

    pub(crate) fn by_refnum(&mut self, refnum: RefNum) -> Option<&mut Channel> {
        let key = self.lookup(refnum)?;
        self.get_mut(key)
    }

    pub(crate) fn get(&self, key: ChannelKey) -> Option<&Channel> {
        let slot = self.slots.get(key.slot)?;
        match &slot.state {
            SlotState::Live(channel) if slot.generation == key.generation => Some(channel.as_ref()),
            _ => None,
        }
    }

    /// 所有存活通道的键，按槽位顺序。
    pub(crate) fn keys(&self) -> Vec<ChannelKey> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot.state, SlotState::Live(_)))
            .map(|(index, slot)| ChannelKey {
                slot: index,
                generation: slot.generation,
            })
            .collect()
    }

    pub(crate) fn live_refnums(&self) -> Vec<RefNum> {
        let mut refnums: Vec<RefNum> = self.live.keys().copied().collect();
        refnums.sort_unstable();
        refnums
    }

    /// 释放通道：拆除后端、代际号加一、压入空闲栈，返回被移出的记录。
    pub(crate) fn release(&mut self, key: ChannelKey, events: &dyn EventSink) -> Option<Box<Channel>> {
        let slot = self.slots.get_mut(key.slot)?;
        if slot.generation != key.generation || !matches!(slot.state, SlotState::Live(_)) {
            return None;
        }
        let SlotState::Live(mut channel) = std::mem::replace(&mut slot.state, SlotState::Free(String::new()))
        else {
            return None;
        };
        channel.teardown(events);
        slot.state = SlotState::Free(std::mem::take(&mut channel.errors.general));
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(refnum) = channel.refnum {
            self.live.remove(&refnum);
        }
        self.free.push(key.slot);
        Some(channel)
    }

    /// 打开失败：以失败文本作为槽位的遗留错误文本释放记录。
    pub(crate) fn discard(&mut self, key: ChannelKey, text: &str, events: &dyn EventSink) {
        if let Some(channel) = self.get_mut(key) {
            channel.set_error(None, text);
        }
        self.release(key, events);
    }

    /// 读取并清空空闲栈顶记录的错误文本。
    pub(crate) fn freed_error(&mut self) -> String {
        let Some(&slot) = self.free.last() else {
            return NO_ERROR_INFORMATION.to_string();
        };
        match &mut self.slots[slot].state {
            SlotState::Free(text) => std::mem::take(text),
            SlotState::Live(_) => String::new(),
        }
    }

    /// 打开在加锁之前就已失败时，仍需占用并释放一条记录以保存失败文本。
    pub(crate) fn record_failure(&mut self, transport: TransportKind, text: &str, events: &dyn EventSink) {
        let key = self.allocate(transport);
        self.discard(key, &cap_text(text.to_string()), events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventTable;

    #[test]
    fn refnums_start_at_base_and_increase() {
        let events = EventTable::new();
        let mut registry = Registry::default();
        let first = registry.allocate(TransportKind::Other);
        let refnum = registry.publish(first).expect("槽位存活");
        assert_eq!(refnum.get(), FIRST_REFNUM);
        registry.release(first, &events);
        let second = registry.allocate(TransportKind::Other);
        assert_eq!(second.slot, first.slot);
        assert_ne!(second.generation, first.generation);
        let again = registry.publish(second).expect("槽位存活");
        assert_eq!(again.get(), FIRST_REFNUM + 1);
        assert!(registry.get_mut(first).is_none());
        assert!(registry.by_refnum(refnum).is_none());
    }

    #[test]
    fn refnum_wrap_skips_live_values() {
        let mut registry = Registry::default();
        let key = registry.allocate(TransportKind::Other);
        let held = registry.publish(key).expect("槽位存活");
        registry.next_refnum = held.get();
        let other = registry.allocate(TransportKind::Other);
        let next = registry.publish(other).expect("槽位存活");
        assert_eq!(next.get(), held.get() + 1);
    }

    #[test]
    fn freed_error_reports_failed_open_once() {
        let events = EventTable::new();
        let mut registry = Registry::default();
        assert_eq!(registry.freed_error(), NO_ERROR_INFORMATION);
        registry.record_failure(TransportKind::Udp(crate::Family::Any), "INVALID PORT NUMBER", &events);
        assert_eq!(registry.freed_error(), "INVALID PORT NUMBER");
        assert_eq!(registry.freed_error(), "");
    }
}
