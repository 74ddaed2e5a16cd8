//! 操作状态、状态位与超时语义。

use bitflags::bitflags;
use std::time::{Duration, Instant};

/// 单个方向上操作的生命周期状态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OpState {
    #[default]
    Idle,
    Pending,
    Done,
    TimedOut,
    Error,
}

impl OpState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OpState::Done | OpState::TimedOut | OpState::Error)
    }
}

/// 操作方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    pub fn other(self) -> Self {
        match self {
            Direction::Send => Direction::Recv,
            Direction::Recv => Direction::Send,
        }
    }

    pub(crate) fn interest(self) -> tokio::io::Interest {
        match self {
            Direction::Send => tokio::io::Interest::WRITABLE,
            Direction::Recv => tokio::io::Interest::READABLE,
        }
    }
}

/// `clear` 的作用范围。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearScope {
    Send,
    Recv,
    Both,
}

impl ClearScope {
    pub fn covers(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (ClearScope::Both, _)
                | (ClearScope::Send, Direction::Send)
                | (ClearScope::Recv, Direction::Recv)
        )
    }
}

/// 操作超时，调用方以百分之一秒为单位给出。
///
/// - `0`：若无法立即完成则直接超时；
/// - 负数：无限等待；
/// - 正数：从发起时刻起计算的百分之一秒数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Timeout {
    #[default]
    Never,
    Immediate,
    Centis(u32),
}

impl Timeout {
    pub fn from_centis(value: i32) -> Self {
        match value {
            0 => Timeout::Immediate,
            v if v < 0 => Timeout::Never,
            v => Timeout::Centis(v.unsigned_abs()),
        }
    }

    pub(crate) fn deadline_from(self, start: Instant) -> Option<Instant> {
        match self {
            Timeout::Centis(centis) => Some(start + Duration::from_millis(u64::from(centis) * 10)),
            Timeout::Immediate => Some(start),
            Timeout::Never => None,
        }
    }
}

bitflags! {
    /// 解释器可见的通道状态位，发送与接收各占一个半字节。
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ComStatus: u32 {
        const SEND_PENDING = 0x0001;
        const SEND_DONE = 0x0002;
        const SEND_TIMED_OUT = 0x0004;
        const SEND_ERROR = 0x0008;
        const RECV_PENDING = 0x0010;
        const RECV_DONE = 0x0020;
        const RECV_TIMED_OUT = 0x0040;
        const RECV_ERROR = 0x0080;
        const PERMANENT_ERROR = 0x1_0000;

        const SEND_MASK = Self::SEND_PENDING.bits()
            | Self::SEND_DONE.bits()
            | Self::SEND_TIMED_OUT.bits()
            | Self::SEND_ERROR.bits();
        const RECV_MASK = Self::RECV_PENDING.bits()
            | Self::RECV_DONE.bits()
            | Self::RECV_TIMED_OUT.bits()
            | Self::RECV_ERROR.bits();
    }
}

impl ComStatus {
    pub(crate) fn compose(send: OpState, recv: OpState, permanent: bool) -> Self {
        let mut status = Self::for_state(Direction::Send, send) | Self::for_state(Direction::Recv, recv);
        if permanent {
            status |= ComStatus::PERMANENT_ERROR;
        }
        status
    }

    fn for_state(direction: Direction, state: OpState) -> Self {
        let send = matches!(direction, Direction::Send);
        match state {
            OpState::Idle => ComStatus::empty(),
            OpState::Pending if send => ComStatus::SEND_PENDING,
            OpState::Pending => ComStatus::RECV_PENDING,
            OpState::Done if send => ComStatus::SEND_DONE,
            OpState::Done => ComStatus::RECV_DONE,
            OpState::TimedOut if send => ComStatus::SEND_TIMED_OUT,
            OpState::TimedOut => ComStatus::RECV_TIMED_OUT,
            OpState::Error if send => ComStatus::SEND_ERROR,
            OpState::Error => ComStatus::RECV_ERROR,
        }
    }

    /// 提取单个方向的状态。
    pub fn state(self, direction: Direction) -> OpState {
        let (pending, done, timed_out, error) = match direction {
            Direction::Send => (
                ComStatus::SEND_PENDING,
                ComStatus::SEND_DONE,
                ComStatus::SEND_TIMED_OUT,
                ComStatus::SEND_ERROR,
            ),
            Direction::Recv => (
                ComStatus::RECV_PENDING,
                ComStatus::RECV_DONE,
                ComStatus::RECV_TIMED_OUT,
                ComStatus::RECV_ERROR,
            ),
        };
        if self.contains(pending) {
            OpState::Pending
        } else if self.contains(done) {
            OpState::Done
        } else if self.contains(timed_out) {
            OpState::TimedOut
        } else if self.contains(error) {
            OpState::Error
        } else {
            OpState::Idle
        }
    }

    pub fn is_permanent_error(self) -> bool {
        self.contains(ComStatus::PERMANENT_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_from_centis() {
        assert_eq!(Timeout::from_centis(0), Timeout::Immediate);
        assert_eq!(Timeout::from_centis(-1), Timeout::Never);
        assert_eq!(Timeout::from_centis(150), Timeout::Centis(150));
        let start = Instant::now();
        assert_eq!(
            Timeout::Centis(150).deadline_from(start),
            Some(start + Duration::from_millis(1500))
        );
        assert_eq!(Timeout::Never.deadline_from(start), None);
    }

    #[test]
    fn status_bits_match_wire_values() {
        let status = ComStatus::compose(OpState::Done, OpState::Pending, true);
        assert_eq!(status.bits(), 0x1_0012);
        assert_eq!(status.state(Direction::Send), OpState::Done);
        assert_eq!(status.state(Direction::Recv), OpState::Pending);
        assert!(status.is_permanent_error());
        assert_eq!(ComStatus::SEND_MASK.bits(), 0x0F);
        assert_eq!(ComStatus::RECV_MASK.bits(), 0xF0);
    }

    #[test]
    fn clear_scope_coverage() {
        assert!(ClearScope::Both.covers(Direction::Send));
        assert!(ClearScope::Recv.covers(Direction::Recv));
        assert!(!ClearScope::Recv.covers(Direction::Send));
    }
}
