//! 串口后端：设备打开、终端属性、分帧收发与线路控制。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 串口没有报文边界，消息由可配置的起止序列界定；发送在数据前后拼接序列，
//!   接收交给 [`FrameScanner`](crate::framing::FrameScanner) 逐字节识别；
//! - 参数串解析与 `KEY=value` 控制逻辑与平台无关（[`params`]），只有设备访问
//!   依赖 unix。
//!
//! ## 契约（What）
//! - 设备以 `O_RDWR | O_NONBLOCK | O_NOCTTY` 打开；是 tty 时切换到原始模式，
//!   关闭时恢复原始终端属性；
//! - 一次读取可能越过本帧结束序列；多出的字节留给下一次接收，在读设备之前先行扫描；
//! - 读到 `EIO` 视为挂断，通道进入永久错误 "DEVICE ERROR OR HANGUP"；
//! - 非 unix 平台打开一律失败 "UNSUPPORTED DEVICE"。
//!
//! ## 实现（How）
//! - 设备文件包装为 `tokio::io::unix::AsyncFd`，就绪后在登记表锁内重跑同步尝试；
//! - 同步尝试直接在非阻塞文件描述符上读写。

mod params;

#[cfg(unix)]
mod line;

use crate::backend;
use crate::channel::{RefNum, TransportKind};
use crate::error::ComError;
use crate::runtime::Shared;
use std::sync::Arc;

const UNSUPPORTED_DEVICE: &str = "UNSUPPORTED DEVICE";

/// 打开 `SERIAL <device>[:<params>]`。
pub(crate) fn open(shared: &Arc<Shared>, args: &str) -> Result<RefNum, ComError> {
    let transport = TransportKind::Serial;
    let params = params::parse(args).map_err(|err| backend::reject(shared, transport, err))?;
    open_with(shared, transport, params)
}

/// 未识别关键字的通道：`/dev/` 开头的名字以默认参数打开为串口。
pub(crate) fn open_other(shared: &Arc<Shared>, name: &str) -> Result<RefNum, ComError> {
    let transport = TransportKind::Other;
    let name = name.trim();
    if !name.starts_with("/dev/") {
        return Err(backend::reject(
            shared,
            transport,
            ComError::operation(UNSUPPORTED_DEVICE),
        ));
    }
    let device = name
        .split(|c: char| c.is_whitespace() || matches!(c, ':' | ',' | ';'))
        .next()
        .unwrap_or(name);
    let params = params::parse(device).map_err(|err| backend::reject(shared, transport, err))?;
    open_with(shared, transport, params)
}

#[cfg(not(unix))]
fn open_with(
    shared: &Arc<Shared>,
    transport: TransportKind,
    _params: params::SerialParams,
) -> Result<RefNum, ComError> {
    Err(backend::reject(
        shared,
        transport,
        ComError::operation(UNSUPPORTED_DEVICE),
    ))
}

#[cfg(unix)]
pub(crate) use device::{SerialState, attempt, control, drive, prepare_recv};

#[cfg(unix)]
use device::open_with;

#[cfg(unix)]
mod device {
    use super::line;
    use super::params::{self, LineRequest, SerialParams};
    use crate::backend::{self, Backend, Outcome};
    use crate::channel::{Channel, ChannelFlags, RefNum, TransportKind};
    use crate::error::{self, ComError, map_io_error};
    use crate::framing::FrameScanner;
    use crate::runtime::{OpTarget, Shared};
    use crate::status::{Direction, OpState};
    use crate::tcp::trim_end;
    use crate::util::has_errno;
    use nix::errno::Errno;
    use nix::sys::termios::Termios;
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::sync::Arc;
    use tokio::io::unix::AsyncFd;

    const HANGUP: &str = "DEVICE ERROR OR HANGUP";

    pub(crate) struct SerialState {
        pub device: Arc<AsyncFd<File>>,
        pub path: String,
        /// 打开前的终端属性，关闭时恢复。
        saved: Option<Termios>,
        /// 当前生效的终端属性，线路控制在其上修改。
        current: Option<Termios>,
        scanner: FrameScanner,
        /// 上一次接收读入但未扫描的字节，下一次接收先于设备读取消费它们。
        carry: Vec<u8>,
    }

    impl Drop for SerialState {
        fn drop(&mut self) {
            if let Some(saved) = &self.saved {
                line::restore(self.device.get_ref(), saved);
            }
        }
    }

    pub(crate) fn open_with(
        shared: &Arc<Shared>,
        transport: TransportKind,
        params: SerialParams,
    ) -> Result<RefNum, ComError> {
        let state = open_device(&params).map_err(|err| backend::reject(shared, transport, err))?;
        let framing = params.framing;
        backend::install(shared, transport, |registry, key| {
            let channel = registry
                .get_mut(key)
                .ok_or_else(|| ComError::operation("OPEN FAILURE"))?;
            let mut flags = ChannelFlags::OPEN | ChannelFlags::NONBLOCKING | ChannelFlags::REGISTERED;
            if state.saved.is_some() {
                flags |= ChannelFlags::TTY;
            }
            tracing::debug!(device = %state.path, tty = state.saved.is_some(), "serial channel opened");
            channel.framing = framing;
            channel.backend = Backend::Serial(state);
            channel.flags = flags;
            Ok(())
        })
    }

    fn open_device(params: &SerialParams) -> Result<SerialState, ComError> {
        let file = line::open_device(&params.device)?;
        let (saved, current) = match line::configure(&file, &params.line)? {
            Some((saved, current)) => (Some(saved), Some(current)),
            None => (None, None),
        };
        let device = AsyncFd::new(file).map_err(|err| error::io_failure(error::REGISTER, &err))?;
        Ok(SerialState {
            device: Arc::new(device),
            path: params.device.clone(),
            saved,
            current,
            scanner: FrameScanner::new(&params.framing),
            carry: Vec::new(),
        })
    }

    /// 新的接收替换缓冲之前：把旧缓冲中未扫描的字节移到待续区前端，再按当前分帧配置复位扫描器。
    pub(crate) fn prepare_recv(channel: &mut Channel) {
        if let Backend::Serial(state) = &mut channel.backend {
            if let Some(leftover) = channel.recv.buffer.get(state.scanner.unscanned()) {
                state.carry.splice(0..0, leftover.iter().copied());
            }
            state.scanner = FrameScanner::new(&channel.framing);
        }
    }

    pub(crate) fn attempt(channel: &mut Channel, direction: Direction) -> Outcome {
        let Backend::Serial(state) = &mut channel.backend else {
            return Outcome::WouldBlock;
        };
        let mut file: &File = state.device.get_ref();
        match direction {
            Direction::Send => {
                let op = &mut channel.send;
                while op.done < op.length {
                    match file.write(&op.buffer[op.done..op.length]) {
                        Ok(0) => return Outcome::WouldBlock,
                        Ok(written) => op.done += written,
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            return Outcome::WouldBlock;
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => return Outcome::Fail(map_io_error(error::WRITE, &err)),
                    }
                }
                Outcome::Done
            }
            Direction::Recv => {
                let op = &mut channel.recv;
                let scanner = &mut state.scanner;
                let carry = &mut state.carry;
                loop {
                    scanner.compact(&mut op.buffer, op.done);
                    let offset = scanner.fill_offset();
                    if offset >= op.buffer.len() {
                        return Outcome::Done;
                    }
                    let room = &mut op.buffer[offset..];
                    let filled = if carry.is_empty() {
                        file.read(room)
                    } else {
                        let take = carry.len().min(room.len());
                        room[..take].copy_from_slice(&carry[..take]);
                        carry.drain(..take);
                        Ok(take)
                    };
                    match filled {
                        Ok(0) => return Outcome::WouldBlock,
                        Ok(read) => {
                            scanner.advance(read);
                            if scanner.scan(&mut op.buffer, &mut op.done, op.length, &channel.framing) {
                                return Outcome::Done;
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            return Outcome::WouldBlock;
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) if has_errno(&err, Errno::EIO as i32) => {
                            return Outcome::Permanent(HANGUP.to_string());
                        }
                        Err(err) => return Outcome::Fail(map_io_error(error::READ, &err)),
                    }
                }
            }
        }
    }

    /// 等待设备就绪并在锁内重跑尝试，直至操作离开 PENDING。
    pub(crate) async fn drive(shared: Arc<Shared>, device: Arc<AsyncFd<File>>, target: OpTarget) {
        loop {
            let ready = match target.direction {
                Direction::Send => device.writable().await,
                Direction::Recv => device.readable().await,
            };
            let mut guard = match ready {
                Ok(guard) => guard,
                Err(err) => {
                    let kind = match target.direction {
                        Direction::Send => error::WRITE,
                        Direction::Recv => error::READ,
                    };
                    shared.fault(target, map_io_error(kind, &err));
                    return;
                }
            };
            let closed = guard.ready().is_read_closed() || guard.ready().is_write_closed();
            match guard.try_io(|_| shared.step(target)) {
                Ok(_) => return,
                // 挂断后的 tty 读到 0 字节而不是 EIO，只能从就绪事件上识别。
                Err(_would_block) if closed => {
                    hang_up(&shared, target);
                    return;
                }
                Err(_would_block) => continue,
            }
        }
    }

    fn hang_up(shared: &Shared, target: OpTarget) {
        let mut registry = shared.registry.lock();
        let Some(channel) = registry.get_mut(target.key) else {
            return;
        };
        if channel.op(target.direction).is_current(target.instance) {
            channel.fail_permanent(HANGUP, shared.events());
        }
    }

    /// `KEY=value` 修改分帧配置；不含 `=` 的请求按线路控制字母处理，返回调制解调器状态。
    pub(crate) fn control(channel: &mut Channel, request: &[u8]) -> Result<Vec<u8>, ComError> {
        let request = trim_end(request);
        if let Some(separator) = request.iter().position(|&b| b == b'=') {
            let recv_pending = channel.recv.state == OpState::Pending;
            return params::apply_keyword(&mut channel.framing, recv_pending, request, separator);
        }
        let Backend::Serial(state) = &mut channel.backend else {
            return Err(ComError::operation(crate::util::INVALID_REQUEST));
        };
        let letters = LineRequest::parse(request)?;
        line::apply(state.device.get_ref(), state.current.as_mut(), &letters)?;
        Ok(line::modem_status(state.device.get_ref()).into_bytes())
    }
}
