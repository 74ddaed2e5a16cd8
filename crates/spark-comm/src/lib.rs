#![doc = r#"
# spark-comm

## 设计动机（Why）
- **定位**：该 crate 是业务语言运行时的通信通道层，向单线程解释器提供
  TCP 客户端/服务端、UDP 与串口设备的统一抽象。
- **架构角色**：解释器只持有引用号与事件号；发起发送/接收后立即返回，
  完成、超时或失败通过事件号异步通知。
- **设计理念**：同步路径与异步路径共用同一个 attempt 函数，保证“立即完成”
  与“稍后完成”产生完全相同的结果。

## 核心契约（What）
- **输入条件**：调用方通过 [`ComManager`] 访问全部能力，事件号由实现
  [`EventSink`] 的事件子系统分配；
- **输出保障**：每个操作实例的事件号至多置位一次；失效引用号一律返回 754，
  不会被解析到复用同一存储槽的新通道；
- **前置约束**：公开接口均为同步函数，不得在 Tokio 工作线程内调用
  （遗留的 `connect_wait` 会短暂阻塞 `open`）。

## 实现策略（How）
- **执行框架**：通道记录存放于带代际号的登记表，由唯一一把
  `parking_lot::Mutex` 保护；解释器线程与 Tokio 任务都在这把锁下修改通道；
- **挂起与恢复**：无法立即完成的操作交给 Tokio 任务等待就绪，超时通过
  `tokio::time::timeout_at` 与就绪竞速；
- **监听移交**：同端口的多个服务端通道之间以 `Option<Arc<TcpListener>>`
  显式转移监听所有权。

## 风险与考量（Trade-offs）
- **锁粒度**：单锁模型简化了并发推理，但所有通道的状态变更相互串行；
  通道数量极大时需要评估锁竞争；
- **串口**：仅在 unix 平台提供，其他平台打开串口返回 "UNSUPPORTED DEVICE"。
"#]

mod backend;
mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod framing;
mod manager;
mod operation;
mod registry;
mod runtime;
mod serial;
pub mod status;
mod tcp;
mod udp;
mod util;

pub use channel::{ChannelFlags, Family, RefNum, TransportKind};
pub use config::{ComConfig, ConfigError, TcpConfig};
pub use error::{CODE_INVALID_OPTION, CODE_INVALID_REFERENCE, CODE_OPERATION_FAILED, ComError};
pub use event::{EventId, EventSink, EventTable};
pub use framing::{FrameScanner, Framing, SequenceError, format_sequence, parse_sequence};
pub use manager::ComManager;
pub use status::{ClearScope, ComStatus, Direction, OpState, Timeout};
