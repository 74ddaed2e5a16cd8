//! TCP 客户端：解析、非阻塞建连与建连完成回调。

use super::{Link, Role, TcpState, refresh_flags, tcp_state_mut};
use crate::backend::{self, Backend};
use crate::channel::{ChannelFlags, ChannelKey, Family, RefNum, TransportKind};
use crate::error::{self, ComError, map_io_error};
use crate::operation::OpTicket;
use crate::runtime::Shared;
use crate::util::{is_connect_in_progress, parse_port, resolve, split_host_port};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

const CONNECTION_REFUSED: &str = "CONNECTION REFUSED";

/// 建连的初始结果。
enum Connect {
    Established(TcpStream),
    InProgress(TcpStream),
}

/// 打开 `TCPCLIENT[4|6] <host> <port>`。
pub(crate) fn open(shared: &Arc<Shared>, family: Family, args: &str) -> Result<RefNum, ComError> {
    let transport = TransportKind::TcpClient(family);
    let connect = prepare(shared, family, args).map_err(|err| backend::reject(shared, transport, err))?;
    backend::install(shared, transport, |registry, key| {
        let channel = registry
            .get_mut(key)
            .ok_or_else(|| ComError::operation("OPEN FAILURE"))?;
        let mut state = TcpState::new(Role::Client, family, 0);
        let pending = match connect {
            Connect::Established(stream) => {
                state.link = Link::Up(Arc::new(stream));
                None
            }
            Connect::InProgress(stream) => {
                let stream = Arc::new(stream);
                state.link = Link::Connecting(Arc::clone(&stream));
                Some(stream)
            }
        };
        if let Some(stream) = pending {
            state.connector = Some(spawn_connector(shared, key, stream));
        }
        channel.backend = Backend::Tcp(state);
        channel.flags = ChannelFlags::OPEN | ChannelFlags::NONBLOCKING;
        refresh_flags(channel);
        tracing::debug!(transport = transport.label(), flags = ?channel.flags, "tcp client opened");
        Ok(())
    })
}

/// 解析目标并发起连接；全部在登记表锁之外完成。
fn prepare(shared: &Shared, family: Family, args: &str) -> Result<Connect, ComError> {
    let (host, port) = split_host_port(args)?;
    let port = parse_port(port)?;
    let target = resolve(host, port, family, shared.config.tcp.allow_ipv6)?;
    let socket = new_socket(shared, target)?;
    let address = SockAddr::from(target);

    if shared.config.tcp.connect_wait {
        socket.connect(&address).map_err(|err| connect_error(&err))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| error::io_failure(error::NONBLOCK, &err))?;
        return adopt(socket).map(Connect::Established);
    }

    socket
        .set_nonblocking(true)
        .map_err(|err| error::io_failure(error::NONBLOCK, &err))?;
    match socket.connect(&address) {
        Ok(()) => adopt(socket).map(Connect::Established),
        Err(err) if is_connect_in_progress(&err) => adopt(socket).map(Connect::InProgress),
        Err(err) => Err(error::io_failure(error::CONNECT, &err)),
    }
}

fn new_socket(shared: &Shared, target: SocketAddr) -> Result<Socket, ComError> {
    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))
        .map_err(|err| error::io_failure(error::SOCKET, &err))?;
    super::suppress_sigpipe(SockRef::from(&socket))
        .map_err(|err| error::io_failure(error::SOCKET, &err))?;
    if shared.config.tcp.client_keepalive {
        socket
            .set_keepalive(true)
            .map_err(|err| error::io_failure(error::KEEPALIVE, &err))?;
    }
    Ok(socket)
}

fn adopt(socket: Socket) -> Result<TcpStream, ComError> {
    TcpStream::from_std(std::net::TcpStream::from(socket))
        .map_err(|err| error::io_failure(error::REGISTER, &err))
}

fn connect_error(err: &io::Error) -> ComError {
    if err.kind() == io::ErrorKind::ConnectionRefused {
        ComError::operation(CONNECTION_REFUSED)
    } else {
        error::io_failure(error::CONNECT, err)
    }
}

/// 等待可写后检查 `SO_ERROR`，决定连接成败。
fn spawn_connector(shared: &Arc<Shared>, key: ChannelKey, stream: Arc<TcpStream>) -> OpTicket {
    let task_shared = Arc::clone(shared);
    let task = shared.handle.spawn(async move {
        let outcome = match stream.writable().await {
            Ok(()) => stream.take_error(),
            Err(err) => Err(err),
        };
        finish_connect(&task_shared, key, outcome);
    });
    OpTicket::new(task.abort_handle())
}

/// 建连结束：成功则链路就绪并重跑挂起操作，失败则进入永久错误。
pub(crate) fn finish_connect(shared: &Arc<Shared>, key: ChannelKey, outcome: io::Result<Option<io::Error>>) {
    let mut registry = shared.registry.lock();
    let Some(channel) = registry.get_mut(key) else {
        return;
    };
    let Some(state) = tcp_state_mut(channel) else {
        return;
    };
    let Link::Connecting(stream) = &state.link else {
        return;
    };
    let stream = Arc::clone(stream);
    state.connector = None;
    let failure = match outcome {
        Ok(None) => None,
        Ok(Some(err)) | Err(err) => Some(err),
    };
    match failure {
        None => {
            state.link = Link::Up(stream);
            refresh_flags(channel);
            tracing::debug!(refnum = ?channel.refnum, "tcp connection established");
            backend::link_up(shared, channel);
        }
        Some(err) => {
            let text = if err.kind() == io::ErrorKind::ConnectionRefused {
                CONNECTION_REFUSED.to_string()
            } else {
                map_io_error(error::CONNECT, &err)
            };
            channel.fail_permanent(text, shared.events());
        }
    }
}
