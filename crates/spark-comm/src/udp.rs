//! UDP 后端：单次 `send_to` / `recv_from`，目的地址由控制请求设置。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 无连接语义下每次发送都需要目的地址，由 `SETSENDADDR` 预先写入通道；
//! - 每次接收记录发送方地址，供 `GETRECVADDR` 读取。
//!
//! ## 契约（What）
//! - 端口必须为非零十进制数，绑定 `0.0.0.0:<port>`；
//! - 报文大于请求长度时截断并以 DONE 完成，`done` 等于请求长度；
//! - 发送字节数与请求不符视为方向错误。
//!
//! ## 实现（How）
//! - 同步尝试使用复制出的标准库套接字句柄（与 Tokio 注册的句柄共享同一内核套接字），
//!   异步等待使用 `UdpSocket::async_io`。

use crate::backend::{self, Backend, Outcome};
use crate::channel::{Channel, ChannelFlags, Family, RefNum, TransportKind};
use crate::error::{self, ComError, map_io_error};
use crate::runtime::{OpTarget, Shared};
use crate::status::{Direction, OpState};
use crate::tcp::trim_end;
use crate::util::{
    INVALID_PORT, INVALID_REQUEST, control_verb, format_addr, is_message_too_long, parse_port,
    resolve, split_host_port,
};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

const NO_SEND_ADDRESS: &str = "NO SEND ADDRESS";
const MISSING_SEND_ADDRESS: &str = "MISSING SEND ADDRESS";
const SEND_PENDING: &str = "SETSENDADDR NOT ALLOWED WHILE SEND IS PENDING";
const SHORT_SEND: &str = "BYTES SENT NOT EQUAL TO BYTES REQUESTED";
const SEND_TOO_LONG: &str = "SEND MESSAGE TOO LONG";

pub(crate) struct UdpState {
    pub port: u16,
    /// 同步尝试使用的句柄。
    pub io: std::net::UdpSocket,
    /// 注册到反应器、用于等待就绪的句柄。
    pub ready: Arc<UdpSocket>,
    pub destination: Option<SocketAddr>,
    pub last_sender: Option<SocketAddr>,
}

/// 打开 `UDP[4] <port>`。
pub(crate) fn open(shared: &Arc<Shared>, family: Family, args: &str) -> Result<RefNum, ComError> {
    let transport = TransportKind::Udp(family);
    let state = bind(args).map_err(|err| backend::reject(shared, transport, err))?;
    backend::install(shared, transport, |registry, key| {
        let channel = registry
            .get_mut(key)
            .ok_or_else(|| ComError::operation("OPEN FAILURE"))?;
        tracing::debug!(port = state.port, "udp channel opened");
        channel.backend = Backend::Udp(state);
        channel.flags = ChannelFlags::OPEN
            | ChannelFlags::BOUND
            | ChannelFlags::NONBLOCKING
            | ChannelFlags::REGISTERED;
        Ok(())
    })
}

fn bind(args: &str) -> Result<UdpState, ComError> {
    let port = match args.split_whitespace().next() {
        Some(text) => parse_port(text)?,
        None => 0,
    };
    if port == 0 {
        return Err(ComError::operation(INVALID_PORT));
    }
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
        .map_err(|err| error::io_failure(error::BIND, &err))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| error::io_failure(error::NONBLOCK, &err))?;
    let io = socket
        .try_clone()
        .map_err(|err| error::io_failure(error::SOCKET, &err))?;
    let ready = UdpSocket::from_std(socket).map_err(|err| error::io_failure(error::REGISTER, &err))?;
    Ok(UdpState {
        port,
        io,
        ready: Arc::new(ready),
        destination: None,
        last_sender: None,
    })
}

pub(crate) fn attempt(channel: &mut Channel, direction: Direction) -> Outcome {
    let Backend::Udp(state) = &mut channel.backend else {
        return Outcome::WouldBlock;
    };
    match direction {
        Direction::Send => {
            let op = &mut channel.send;
            let Some(destination) = state.destination else {
                return Outcome::Fail(NO_SEND_ADDRESS.to_string());
            };
            loop {
                match state.io.send_to(&op.buffer[..op.length], destination) {
                    Ok(sent) if sent == op.length => {
                        op.done = sent;
                        return Outcome::Done;
                    }
                    Ok(_) => return Outcome::Fail(SHORT_SEND.to_string()),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Outcome::WouldBlock,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) if is_message_too_long(&err) => {
                        return Outcome::Fail(SEND_TOO_LONG.to_string());
                    }
                    Err(err) => return Outcome::Fail(map_io_error(error::SENDTO, &err)),
                }
            }
        }
        Direction::Recv => {
            let op = &mut channel.recv;
            loop {
                match state.io.recv_from(&mut op.buffer[..op.length]) {
                    Ok((received, sender)) => {
                        op.done = received;
                        state.last_sender = Some(sender);
                        return Outcome::Done;
                    }
                    Err(err) if is_message_too_long(&err) => {
                        op.done = op.length;
                        return Outcome::Done;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Outcome::WouldBlock,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Outcome::Fail(map_io_error(error::RECVFROM, &err)),
                }
            }
        }
    }
}

pub(crate) async fn drive(shared: Arc<Shared>, socket: Arc<UdpSocket>, target: OpTarget) {
    let result = socket
        .async_io(target.direction.interest(), || shared.step(target))
        .await;
    if let Err(err) = result {
        let kind = match target.direction {
            Direction::Send => error::SENDTO,
            Direction::Recv => error::RECVFROM,
        };
        shared.fault(target, map_io_error(kind, &err));
    }
}

/// `GETLOCALADDR`、`GETRECVADDR`、`SETSENDADDR`。
pub(crate) fn control(channel: &mut Channel, request: &[u8]) -> Result<Vec<u8>, ComError> {
    let send_pending = channel.send.state == OpState::Pending;
    let Backend::Udp(state) = &mut channel.backend else {
        return Err(ComError::operation(INVALID_REQUEST));
    };
    let parsed = control_verb(trim_end(request));
    match parsed.verb.as_str() {
        "GETRECVADDR" => Ok(match state.last_sender {
            Some(sender) if sender.port() != 0 && !sender.ip().is_unspecified() => {
                format_addr(Some(sender)).into_bytes()
            }
            _ => b"0".to_vec(),
        }),
        "GETLOCALADDR" => Ok(format!("0.0.0.0 {}", state.port).into_bytes()),
        "SETSENDADDR" => {
            if send_pending {
                return Err(ComError::operation(SEND_PENDING));
            }
            let text = std::str::from_utf8(parsed.rest)
                .map_err(|_| ComError::operation(crate::util::INVALID_ADDRESS))?
                .trim();
            if text.is_empty() {
                return Err(ComError::operation(MISSING_SEND_ADDRESS));
            }
            let (host, port) = split_host_port(text)?;
            let port = parse_port(port)?;
            state.destination = Some(resolve(host, port, Family::V4, false)?);
            Ok(Vec::new())
        }
        _ => Err(ComError::operation(INVALID_REQUEST)),
    }
}
