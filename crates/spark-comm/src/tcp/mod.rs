//! TCP 后端：客户端、服务端与同端口监听组。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 客户端与服务端共享同一份数据路径（[`attempt`] / [`drive`]），差异只在链路如何建立；
//! - 地址族由 [`Family`] 参数化，IPv4 与 IPv6 只在绑定地址与解析过滤处分支。
//!
//! ## 契约（What）
//! - 发送循环写出 `[done, length)` 直至全部完成；`EPIPE` / `ECONNRESET` 视为断开；
//! - 接收只做一次读取，读到 0 字节或 `ECONNRESET` 视为断开；
//! - 链路未建立时尝试返回“会阻塞”，操作只等待截止时间，链路建立后重新挂起。
//!
//! ## 实现（How）
//! - 同步尝试通过 `socket2::SockRef` 直接在非阻塞套接字上读写，反映内核的真实状态；
//! - 异步等待使用 `TcpStream::async_io`，就绪后在登记表锁内重跑同一尝试。

pub(crate) mod client;
pub(crate) mod listener;

use crate::backend::{Backend, Outcome};
use crate::channel::{Channel, ChannelFlags, Family};
use crate::error::{self, ComError, map_io_error};
use crate::operation::OpTicket;
use crate::runtime::{OpTarget, Shared};
use crate::status::Direction;
use crate::util::{INVALID_REQUEST, control_verb, format_addr, is_disconnect};
use socket2::SockRef;
use std::io::{self, Read};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: std::ffi::c_int = nix::libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: std::ffi::c_int = 0;

/// 写入已关闭的对端不得触发 SIGPIPE：Linux 依赖 `MSG_NOSIGNAL`，苹果平台在套接字上设置 `SO_NOSIGPIPE`。
#[cfg(target_vendor = "apple")]
pub(crate) fn suppress_sigpipe(socket: SockRef<'_>) -> io::Result<()> {
    socket.set_nosigpipe(true)
}

#[cfg(not(target_vendor = "apple"))]
pub(crate) fn suppress_sigpipe(_socket: SockRef<'_>) -> io::Result<()> {
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// 数据链路的建立进度。
pub(crate) enum Link {
    Down,
    Connecting(Arc<TcpStream>),
    Up(Arc<TcpStream>),
}

pub(crate) struct TcpState {
    pub role: Role,
    pub family: Family,
    /// 服务端的监听组端口；客户端为 0。
    pub port: u16,
    pub link: Link,
    pub listener: Option<Arc<TcpListener>>,
    pub acceptor: Option<OpTicket>,
    pub connector: Option<OpTicket>,
}

impl TcpState {
    pub(crate) fn new(role: Role, family: Family, port: u16) -> Self {
        Self {
            role,
            family,
            port,
            link: Link::Down,
            listener: None,
            acceptor: None,
            connector: None,
        }
    }

    /// 已建立链路的数据流。
    pub(crate) fn stream(&self) -> Option<&Arc<TcpStream>> {
        match &self.link {
            Link::Up(stream) => Some(stream),
            _ => None,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.link, Link::Up(_))
    }

    /// 正在等待监听句柄的服务端成员。
    pub(crate) fn is_waiting(&self) -> bool {
        self.role == Role::Server && self.listener.is_none() && matches!(self.link, Link::Down)
    }

    /// 持有监听句柄且尚未连接，即正在接受连接。
    pub(crate) fn is_listening(&self) -> bool {
        self.listener.is_some() && !self.is_connected()
    }

    /// 已连接且保留着一个备用监听句柄。
    pub(crate) fn holds_spare(&self) -> bool {
        self.listener.is_some() && self.is_connected()
    }
}

pub(crate) fn tcp_state(channel: &Channel) -> Option<&TcpState> {
    match &channel.backend {
        Backend::Tcp(state) => Some(state),
        _ => None,
    }
}

pub(crate) fn tcp_state_mut(channel: &mut Channel) -> Option<&mut TcpState> {
    match &mut channel.backend {
        Backend::Tcp(state) => Some(state),
        _ => None,
    }
}

/// 由链路与监听句柄推导角色状态位。
pub(crate) fn refresh_flags(channel: &mut Channel) {
    let Some(state) = tcp_state(channel) else {
        return;
    };
    let mut flags = channel.flags
        - (ChannelFlags::LISTENING
            | ChannelFlags::CONNECTED
            | ChannelFlags::HOLDS_LISTENER
            | ChannelFlags::REGISTERED);
    match &state.link {
        Link::Up(_) => flags |= ChannelFlags::CONNECTED | ChannelFlags::REGISTERED,
        Link::Connecting(_) => flags |= ChannelFlags::REGISTERED,
        Link::Down => {}
    }
    if state.is_listening() {
        flags |= ChannelFlags::LISTENING | ChannelFlags::REGISTERED | ChannelFlags::BOUND;
    }
    if state.holds_spare() {
        flags |= ChannelFlags::HOLDS_LISTENER;
    }
    channel.flags = flags;
}

/// 同步尝试：在非阻塞套接字上直接读写。
pub(crate) fn attempt(channel: &mut Channel, direction: Direction) -> Outcome {
    let Backend::Tcp(state) = &channel.backend else {
        return Outcome::WouldBlock;
    };
    let Some(stream) = state.stream() else {
        return Outcome::WouldBlock;
    };
    let socket = SockRef::from(&**stream);
    match direction {
        Direction::Send => {
            let op = &mut channel.send;
            while op.done < op.length {
                match socket.send_with_flags(&op.buffer[op.done..op.length], SEND_FLAGS) {
                    Ok(written) => op.done += written,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Outcome::WouldBlock,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) if is_disconnect(&err) => return Outcome::Disconnect,
                    Err(err) => return Outcome::Fail(map_io_error(error::WRITE, &err)),
                }
            }
            Outcome::Done
        }
        Direction::Recv => {
            let op = &mut channel.recv;
            let mut reader: &socket2::Socket = &socket;
            loop {
                match reader.read(&mut op.buffer[op.done..op.length]) {
                    Ok(0) => return Outcome::Disconnect,
                    Ok(read) => {
                        op.done += read;
                        return Outcome::Done;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Outcome::WouldBlock,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) if is_disconnect(&err) => return Outcome::Disconnect,
                    Err(err) => return Outcome::Fail(map_io_error(error::RECV, &err)),
                }
            }
        }
    }
}

/// 等待就绪并在锁内重跑尝试，直至操作离开 PENDING。
pub(crate) async fn drive(shared: Arc<Shared>, stream: Arc<TcpStream>, target: OpTarget) {
    let result = stream
        .async_io(target.direction.interest(), || shared.step(target))
        .await;
    if let Err(err) = result {
        let kind = match target.direction {
            Direction::Send => error::WRITE,
            Direction::Recv => error::RECV,
        };
        shared.fault(target, map_io_error(kind, &err));
    }
}

/// `GETLOCALADDR` / `GETREMOTEADDR`。
pub(crate) fn control(channel: &mut Channel, request: &[u8]) -> Result<Vec<u8>, ComError> {
    let Some(state) = tcp_state(channel) else {
        return Err(ComError::operation(INVALID_REQUEST));
    };
    let verb = control_verb(trim_end(request)).verb;
    let response = match verb.as_str() {
        "GETLOCALADDR" => {
            let local = match (&state.link, &state.listener) {
                (Link::Up(stream) | Link::Connecting(stream), _) => stream.local_addr(),
                (Link::Down, Some(listener)) => listener.local_addr(),
                (Link::Down, None) => return Ok(format_addr(None).into_bytes()),
            };
            format_addr(Some(
                local.map_err(|err| error::io_failure(error::GETSOCKNAME, &err))?,
            ))
        }
        "GETREMOTEADDR" => match &state.link {
            Link::Up(stream) => format_addr(Some(
                stream
                    .peer_addr()
                    .map_err(|err| error::io_failure(error::GETPEERNAME, &err))?,
            )),
            _ => format_addr(None),
        },
        _ => return Err(ComError::operation(INVALID_REQUEST)),
    };
    Ok(response.into_bytes())
}

pub(crate) fn trim_end(request: &[u8]) -> &[u8] {
    let end = request
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |index| index + 1);
    &request[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Socket, Type};

    #[test]
    fn sigpipe_is_suppressed_on_new_sockets() {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).expect("创建套接字");
        suppress_sigpipe(SockRef::from(&socket)).expect("设置 SIGPIPE 抑制");
        #[cfg(target_vendor = "apple")]
        assert!(socket.nosigpipe().expect("读取 SO_NOSIGPIPE"));
    }
}
