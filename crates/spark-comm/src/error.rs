//! 通道层错误模型。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 解释器以数值状态码区分三类调用错误：754（引用号或参数非法）、753（操作失败）、
//!   775（控制选项非法），[`ComError::code`] 负责给出稳定映射；
//! - 操作级与永久错误并不以 `Err` 返回，而是写入通道的错误文本，由 `GETERROR`
//!   系列控制请求读取；[`map_io_error`] 负责生成这些文本。
//!
//! ## 契约（What）
//! - 错误文本遵循 `"<操作> FAILURE, ERRNO = <n>"` 的格式，无 errno 时仅保留操作名；
//! - `OperationKind::code` 为稳定的日志错误码，便于按码检索。

use crate::channel::RefNum;
use std::io;
use thiserror::Error;

/// 操作失败（包括打开失败、无可取数据、控制请求失败）。
pub const CODE_OPERATION_FAILED: i32 = 753;
/// 引用号未知或参数非法。
pub const CODE_INVALID_REFERENCE: i32 = 754;
/// 控制选项组合非法。
pub const CODE_INVALID_OPTION: i32 = 775;

/// 通道层对外暴露的错误。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ComError {
    #[error("引用号 {refnum} 未对应任何存活通道")]
    UnknownChannel { refnum: RefNum },
    #[error("参数非法: {reason}")]
    InvalidArgument { reason: &'static str },
    #[error("通道操作失败: {message}")]
    Operation { message: String },
    #[error("控制选项非法: {message}")]
    InvalidOption { message: String },
    #[error("运行时初始化失败: {message}")]
    Runtime { message: String },
}

impl ComError {
    /// 返回解释器可见的数值状态码。
    pub fn code(&self) -> i32 {
        match self {
            ComError::UnknownChannel { .. } | ComError::InvalidArgument { .. } => {
                CODE_INVALID_REFERENCE
            }
            ComError::InvalidOption { .. } => CODE_INVALID_OPTION,
            ComError::Operation { .. } | ComError::Runtime { .. } => CODE_OPERATION_FAILED,
        }
    }

    /// 错误附带的人类可读文本；写入通道错误文本时使用。
    pub fn message(&self) -> String {
        match self {
            ComError::Operation { message }
            | ComError::InvalidOption { message }
            | ComError::Runtime { message } => message.clone(),
            other => other.to_string(),
        }
    }

    pub(crate) fn operation(message: impl Into<String>) -> Self {
        ComError::Operation {
            message: message.into(),
        }
    }
}

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const SOCKET: OperationKind = OperationKind {
    code: "spark.comm.socket_failed",
    message: "SOCKET FAILURE",
};
pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.comm.bind_failed",
    message: "BIND FAILURE",
};
pub(crate) const LISTEN: OperationKind = OperationKind {
    code: "spark.comm.listen_failed",
    message: "LISTEN FAILURE",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.comm.accept_failed",
    message: "ACCEPT FAILURE",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.comm.connect_failed",
    message: "CONNECT FAILURE",
};
pub(crate) const NONBLOCK: OperationKind = OperationKind {
    code: "spark.comm.nonblock_failed",
    message: "NON-BLOCKING MODE FAILURE",
};
pub(crate) const KEEPALIVE: OperationKind = OperationKind {
    code: "spark.comm.keepalive_failed",
    message: "SET KEEPALIVE FAILURE",
};
pub(crate) const REGISTER: OperationKind = OperationKind {
    code: "spark.comm.register_failed",
    message: "EVTDEVINIT FAILURE",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.comm.write_failed",
    message: "WRITE FAILURE",
};
pub(crate) const RECV: OperationKind = OperationKind {
    code: "spark.comm.recv_failed",
    message: "RECV FAILURE",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.comm.read_failed",
    message: "READ FAILURE",
};
pub(crate) const SENDTO: OperationKind = OperationKind {
    code: "spark.comm.sendto_failed",
    message: "SENDTO FAILURE",
};
pub(crate) const RECVFROM: OperationKind = OperationKind {
    code: "spark.comm.recvfrom_failed",
    message: "RECVFROM FAILURE",
};
pub(crate) const GETSOCKNAME: OperationKind = OperationKind {
    code: "spark.comm.getsockname_failed",
    message: "GETSOCKNAME FAILURE",
};
pub(crate) const GETPEERNAME: OperationKind = OperationKind {
    code: "spark.comm.getpeername_failed",
    message: "GETPEERNAME FAILURE",
};
#[cfg_attr(not(unix), allow(dead_code))]
pub(crate) const OPEN: OperationKind = OperationKind {
    code: "spark.comm.open_failed",
    message: "OPEN FAILURE",
};
#[cfg_attr(not(unix), allow(dead_code))]
pub(crate) const TERMIOS: OperationKind = OperationKind {
    code: "spark.comm.termios_failed",
    message: "TCSETATTR FAILURE",
};
#[cfg_attr(not(unix), allow(dead_code))]
pub(crate) const MODEM: OperationKind = OperationKind {
    code: "spark.comm.modem_failed",
    message: "MODEM CONTROL FAILURE",
};

/// 将 IO 错误映射为通道错误文本，并在日志中留下稳定错误码。
pub(crate) fn map_io_error(kind: OperationKind, error: &io::Error) -> String {
    tracing::debug!(code = kind.code, %error, "os call failed");
    match error.raw_os_error() {
        Some(errno) if errno != 0 => format!("{}, ERRNO = {errno}", kind.message),
        _ => kind.message.to_string(),
    }
}

/// 构造携带映射文本的操作失败错误。
pub(crate) fn io_failure(kind: OperationKind, error: &io::Error) -> ComError {
    ComError::operation(map_io_error(kind, error))
}
