//! 共享状态与操作任务的调度。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 解释器线程与 Tokio 任务通过 [`Shared`] 访问同一张登记表；
//! - 每个挂起操作对应一个任务：任务等待就绪后在登记表锁内重跑与同步路径
//!   完全相同的 attempt 函数，超时则与就绪竞速（`tokio::time::timeout_at`）。
//!
//! ## 契约（What）
//! - 任务携带 [`OpTarget`]（槽位、代际号、方向、实例号），任一不匹配即放弃；
//! - 任务从不在持锁状态下 `await`。

use crate::backend::{self, Progress};
use crate::channel::ChannelKey;
use crate::config::ComConfig;
use crate::event::EventSink;
use crate::operation::OpTicket;
use crate::registry::Registry;
use crate::status::{Direction, OpState};
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;

pub(crate) struct Shared {
    pub registry: Mutex<Registry>,
    pub events: Arc<dyn EventSink>,
    pub config: ComConfig,
    pub handle: Handle,
}

/// 任务唤醒时定位操作所需的全部信息。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OpTarget {
    pub key: ChannelKey,
    pub direction: Direction,
    pub instance: u64,
}

impl Shared {
    pub(crate) fn events(&self) -> &dyn EventSink {
        self.events.as_ref()
    }

    /// 在锁内重跑 attempt；仍会阻塞时返回 `WouldBlock`，供就绪等待循环继续。
    pub(crate) fn step(self: &Arc<Self>, target: OpTarget) -> io::Result<()> {
        let mut registry = self.registry.lock();
        let Some(channel) = registry.get_mut(target.key) else {
            return Ok(());
        };
        if !channel.op(target.direction).is_current(target.instance) {
            return Ok(());
        }
        match backend::attempt(self.events(), channel, target.direction) {
            Progress::Complete => Ok(()),
            Progress::WouldBlock => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    /// 截止时间到达：仍挂起的同一实例转为 TIMED_OUT。
    pub(crate) fn expire(&self, target: OpTarget) {
        let mut registry = self.registry.lock();
        let Some(channel) = registry.get_mut(target.key) else {
            return;
        };
        if channel.op(target.direction).is_current(target.instance) {
            tracing::debug!(refnum = ?channel.refnum, direction = ?target.direction, "operation timed out");
            channel
                .op_mut(target.direction)
                .finish(OpState::TimedOut, self.events.as_ref());
        }
    }

    /// 就绪等待本身失败（反应器错误），以方向错误结束操作。
    pub(crate) fn fault(&self, target: OpTarget, text: String) {
        let mut registry = self.registry.lock();
        let Some(channel) = registry.get_mut(target.key) else {
            return;
        };
        if channel.op(target.direction).is_current(target.instance) {
            channel.fail(target.direction, text, self.events.as_ref());
        }
    }
}

/// 生成驱动挂起操作的任务，返回其超时票据。
pub(crate) fn spawn_op<F>(
    shared: &Arc<Shared>,
    target: OpTarget,
    deadline: Option<Instant>,
    io: F,
) -> OpTicket
where
    F: Future<Output = ()> + Send + 'static,
{
    let task_shared = Arc::clone(shared);
    let task = shared.handle.spawn(async move {
        match deadline {
            Some(deadline) => {
                if tokio::time::timeout_at(deadline.into(), io).await.is_err() {
                    task_shared.expire(target);
                }
            }
            None => io.await,
        }
    });
    OpTicket::new(task.abort_handle())
}

/// 链路尚未建立时只等待截止时间；无截止时间则不需要任务。
pub(crate) fn spawn_timer(
    shared: &Arc<Shared>,
    target: OpTarget,
    deadline: Option<Instant>,
) -> Option<OpTicket> {
    deadline.map(|deadline| spawn_op(shared, target, Some(deadline), std::future::pending()))
}
