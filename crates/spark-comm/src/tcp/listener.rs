//! TCP 服务端与同端口监听组的句柄移交。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 解释器可以在同一端口上打开多个服务端通道，每个通道只服务一条连接；
//!   操作系统层面只有一个监听套接字，它在组内成员之间显式转移；
//! - 监听句柄建模为 `Option<Arc<TcpListener>>`：持有者即唯一的接受方，
//!   转移前中止旧持有者的接受任务。
//!
//! ## 契约（What）
//! - 组内至多一个成员处于 LISTENING，至多一个成员 HOLDS_LISTENER；
//! - 打开：组内已有成员在等待或监听 → 本通道等待；有成员持有备用句柄 → 接过句柄开始监听；
//!   否则新建套接字（`SO_REUSEADDR`、`SO_LINGER(0)`、`listen(5)`）；
//! - 接受：连接交给当前监听者，监听句柄交给第一个等待者，否则留作备用；
//! - 关闭：句柄交给第一个等待者，否则交给一个已连接且无备用句柄的成员，否则随通道释放。
//!
//! ## 注意事项（Trade-offs）
//! - 端口 0 绑定临时端口，不参与组扫描；
//! - 接受任务与关闭竞速时，已接受的连接转交给组内当前的监听者，无人监听则丢弃。

use super::{Link, Role, TcpState, refresh_flags, tcp_state, tcp_state_mut};
use crate::backend::{self, Backend};
use crate::channel::{ChannelFlags, ChannelKey, Family, RefNum, TransportKind};
use crate::error::{self, ComError, map_io_error};
use crate::operation::OpTicket;
use crate::registry::Registry;
use crate::runtime::Shared;
use crate::util::parse_port;
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

const LISTEN_BACKLOG: i32 = 5;

/// 打开时对监听组的处置。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Plan {
    Wait,
    TakeSpare(ChannelKey),
    Fresh,
}

/// 打开 `TCPSERVER[4|6] <port>`。
pub(crate) fn open(shared: &Arc<Shared>, family: Family, args: &str) -> Result<RefNum, ComError> {
    let transport = TransportKind::TcpServer(family);
    let port = match args.split_whitespace().next() {
        None => 0,
        Some(text) => parse_port(text).map_err(|err| backend::reject(shared, transport, err))?,
    };
    backend::install(shared, transport, |registry, key| {
        let mut state = TcpState::new(Role::Server, family, port);
        let mut flags = ChannelFlags::OPEN | ChannelFlags::NONBLOCKING;
        let decision = if port == 0 {
            Plan::Fresh
        } else {
            plan(registry, port, key)
        };
        match decision {
            Plan::Wait => flags |= ChannelFlags::SHARES_PORT,
            Plan::TakeSpare(holder) => {
                state.listener = take_listener(registry, holder);
                flags |= ChannelFlags::SHARES_PORT;
            }
            Plan::Fresh => {
                let listener = bind(family, port)?;
                state.port = listener
                    .local_addr()
                    .map_err(|err| error::io_failure(error::GETSOCKNAME, &err))?
                    .port();
                state.listener = Some(Arc::new(listener));
            }
        }
        let listening = state.listener.is_some();
        let channel = registry
            .get_mut(key)
            .ok_or_else(|| ComError::operation("OPEN FAILURE"))?;
        tracing::debug!(port = state.port, ?decision, "tcp server opened");
        channel.backend = Backend::Tcp(state);
        channel.flags = flags;
        refresh_flags(channel);
        if listening {
            start_listening(shared, registry, key);
        }
        Ok(())
    })
}

fn plan(registry: &Registry, port: u16, key: ChannelKey) -> Plan {
    if find_member(registry, port, key, |state| state.is_waiting() || state.is_listening()).is_some() {
        return Plan::Wait;
    }
    match find_member(registry, port, key, TcpState::holds_spare) {
        Some(holder) => Plan::TakeSpare(holder),
        None => Plan::Fresh,
    }
}

/// 在同端口的服务端成员中查找第一个满足条件者（按槽位顺序）。
fn find_member(
    registry: &Registry,
    port: u16,
    exclude: ChannelKey,
    predicate: impl Fn(&TcpState) -> bool,
) -> Option<ChannelKey> {
    if port == 0 {
        return None;
    }
    registry.keys().into_iter().filter(|key| *key != exclude).find(|key| {
        registry
            .get(*key)
            .filter(|channel| matches!(channel.transport, TransportKind::TcpServer(_)))
            .and_then(tcp_state)
            .is_some_and(|state| state.port == port && predicate(state))
    })
}

fn take_listener(registry: &mut Registry, holder: ChannelKey) -> Option<Arc<TcpListener>> {
    let channel = registry.get_mut(holder)?;
    let state = tcp_state_mut(channel)?;
    state.acceptor = None;
    let listener = state.listener.take();
    refresh_flags(channel);
    listener
}

fn give_listener(registry: &mut Registry, receiver: ChannelKey, listener: Arc<TcpListener>) {
    if let Some(channel) = registry.get_mut(receiver) {
        if let Some(state) = tcp_state_mut(channel) {
            state.listener = Some(listener);
        }
        refresh_flags(channel);
        tracing::debug!(refnum = ?channel.refnum, "listener handed off");
    }
}

fn bind(family: Family, port: u16) -> Result<TcpListener, ComError> {
    let address: SocketAddr = match family {
        Family::V6 => (Ipv6Addr::UNSPECIFIED, port).into(),
        Family::Any | Family::V4 => (Ipv4Addr::UNSPECIFIED, port).into(),
    };
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
        .map_err(|err| error::io_failure(error::SOCKET, &err))?;
    socket
        .set_reuse_address(true)
        .and_then(|()| socket.set_linger(Some(Duration::ZERO)))
        .map_err(|err| error::io_failure(error::SOCKET, &err))?;
    socket
        .bind(&SockAddr::from(address))
        .map_err(|err| error::io_failure(error::BIND, &err))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| error::io_failure(error::NONBLOCK, &err))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|err| error::io_failure(error::LISTEN, &err))?;
    TcpListener::from_std(std::net::TcpListener::from(socket))
        .map_err(|err| error::io_failure(error::REGISTER, &err))
}

/// 持有监听句柄的成员开始接受连接：先尝试一次立即接受，否则生成接受任务。
pub(crate) fn start_listening(shared: &Arc<Shared>, registry: &mut Registry, key: ChannelKey) {
    let Some(channel) = registry.get_mut(key) else {
        return;
    };
    let Some(state) = tcp_state_mut(channel) else {
        return;
    };
    let Some(listener) = state.listener.clone() else {
        return;
    };
    let port = state.port;
    state.acceptor = None;
    refresh_flags(channel);
    match try_accept(&listener) {
        Ok(Some(stream)) => accepted(shared, registry, key, port, stream),
        Ok(None) => {
            let ticket = spawn_acceptor(shared, key, port, listener);
            if let Some(state) = tcp_state_mut(channel) {
                state.acceptor = Some(ticket);
            }
        }
        Err(err) => channel.fail_permanent(map_io_error(error::ACCEPT, &err), shared.events()),
    }
}

fn try_accept(listener: &TcpListener) -> io::Result<Option<TcpStream>> {
    let socket = SockRef::from(listener);
    loop {
        match socket.accept() {
            Ok((accepted, _)) => {
                accepted.set_nonblocking(true)?;
                return TcpStream::from_std(std::net::TcpStream::from(accepted)).map(Some);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) =>
            {
                continue;
            }
            Err(err) => return Err(err),
        }
    }
}

fn spawn_acceptor(
    shared: &Arc<Shared>,
    key: ChannelKey,
    port: u16,
    listener: Arc<TcpListener>,
) -> OpTicket {
    let task_shared = Arc::clone(shared);
    let task = shared.handle.spawn(async move {
        let result = listener.accept().await;
        let mut registry = task_shared.registry.lock();
        match result {
            Ok((stream, _)) => accepted(&task_shared, &mut registry, key, port, stream),
            Err(err) => {
                if let Some(channel) = registry.get_mut(key) {
                    channel.fail_permanent(map_io_error(error::ACCEPT, &err), task_shared.events());
                }
            }
        }
    });
    OpTicket::new(task.abort_handle())
}

/// 新连接到达：交给监听者，监听句柄移交给等待者或留作备用，随后重跑挂起操作。
pub(crate) fn accepted(
    shared: &Arc<Shared>,
    registry: &mut Registry,
    key: ChannelKey,
    port: u16,
    stream: TcpStream,
) {
    let owner_listening = registry
        .get(key)
        .and_then(tcp_state)
        .is_some_and(TcpState::is_listening);
    if !owner_listening {
        let current = find_member(registry, port, key, TcpState::is_listening);
        match current {
            Some(current) => accepted(shared, registry, current, port, stream),
            None => tracing::debug!(port, "accepted connection dropped, no listener in group"),
        }
        return;
    }

    if let Err(err) = super::suppress_sigpipe(SockRef::from(&stream)) {
        tracing::warn!(port, code = error::SOCKET.code, %err, "sigpipe suppression not applied");
    }
    if shared.config.tcp.server_keepalive {
        if let Err(err) = SockRef::from(&stream).set_keepalive(true) {
            tracing::warn!(port, code = error::KEEPALIVE.code, %err, "keepalive not applied");
        }
    }

    let Some(channel) = registry.get_mut(key) else {
        return;
    };
    let Some(state) = tcp_state_mut(channel) else {
        return;
    };
    state.acceptor = None;
    state.link = Link::Up(Arc::new(stream));
    let listener = state.listener.take();
    refresh_flags(channel);
    tracing::debug!(refnum = ?channel.refnum, port, "tcp connection accepted");

    if let Some(listener) = listener {
        match find_member(registry, port, key, TcpState::is_waiting) {
            Some(next) => {
                give_listener(registry, next, listener);
                start_listening(shared, registry, next);
            }
            None => give_listener(registry, key, listener),
        }
    }

    if let Some(channel) = registry.get_mut(key) {
        backend::link_up(shared, channel);
    }
}

/// 关闭服务端成员前移交其持有的监听句柄。
pub(crate) fn hand_off_on_close(shared: &Arc<Shared>, registry: &mut Registry, key: ChannelKey) {
    let Some(state) = registry.get_mut(key).and_then(tcp_state_mut) else {
        return;
    };
    state.acceptor = None;
    let port = state.port;
    let Some(listener) = state.listener.take() else {
        return;
    };
    if let Some(next) = find_member(registry, port, key, TcpState::is_waiting) {
        give_listener(registry, next, listener);
        start_listening(shared, registry, next);
    } else if let Some(next) = find_member(registry, port, key, |state| {
        state.is_connected() && state.listener.is_none()
    }) {
        give_listener(registry, next, listener);
    } else {
        tracing::debug!(port, "listener released");
    }
}
