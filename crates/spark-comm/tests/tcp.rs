//! TCP 客户端、服务端与监听移交的端到端行为。

mod common;

use anyhow::Result;
use common::{Harness, eventually, free_tcp_port};
use spark_comm::{ChannelFlags, ClearScope, ComStatus, RefNum, Timeout};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use tracing_test::traced_test;

/// 回显对端：接受一条连接，把收到的前 `count` 字节原样写回。
fn echo_peer(count: usize) -> Result<(u16, thread::JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let handle = thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buffer = vec![0u8; count];
            if stream.read_exact(&mut buffer).is_ok() {
                let _ = stream.write_all(&buffer);
            }
            thread::sleep(Duration::from_millis(200));
        }
    });
    Ok((port, handle))
}

fn wait_connected(harness: &Harness, refnum: RefNum) -> Result<()> {
    eventually(|| {
        Ok(harness
            .manager
            .channel_flags(refnum)?
            .contains(ChannelFlags::CONNECTED))
    })
}

#[test]
#[traced_test]
fn client_echo_round_trip() -> Result<()> {
    let harness = Harness::new()?;
    let (port, peer) = echo_peer(4)?;
    let refnum = harness.manager.open(&format!("TCPCLIENT 127.0.0.1 {port}"))?;

    let sent = harness.event();
    harness
        .manager
        .send(refnum, sent, Timeout::from_centis(500), b"PING")?;
    harness.wait(sent)?;
    assert!(harness.manager.status(refnum)?.contains(ComStatus::SEND_DONE));

    let received = harness.event();
    harness
        .manager
        .recv(refnum, received, Timeout::from_centis(500), 4)?;
    harness.wait(received)?;
    let status = harness.manager.status(refnum)?;
    assert!(status.contains(ComStatus::RECV_DONE));
    assert!(!status.is_permanent_error());
    assert_eq!(harness.fetch(refnum, 16)?, b"PING".to_vec());

    assert_eq!(
        harness.text(refnum, "getremoteaddr")?,
        format!("127.0.0.1 {port}")
    );
    assert!(harness.text(refnum, "GETLOCALADDR")?.starts_with("127.0.0.1 "));
    assert_eq!(harness.events.signal_count(sent), 1);
    assert_eq!(harness.events.signal_count(received), 1);

    harness.manager.close(refnum)?;
    assert!(logs_contain("channel opened"));
    let _ = peer.join();
    Ok(())
}

#[test]
fn recv_times_out_without_permanent_error() -> Result<()> {
    let harness = Harness::new()?;
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let refnum = harness.manager.open(&format!("TCPCLIENT4 127.0.0.1 {port}"))?;
    let (_silent_peer, _) = listener.accept()?;

    let event = harness.event();
    let started = Instant::now();
    harness
        .manager
        .recv(refnum, event, Timeout::from_centis(100), 8)?;
    harness.wait(event)?;
    assert!(started.elapsed() >= Duration::from_millis(900));

    let status = harness.manager.status(refnum)?;
    assert!(status.contains(ComStatus::RECV_TIMED_OUT));
    assert!(!status.is_permanent_error());
    assert_eq!(harness.text(refnum, "GETRECVERROR")?, "TIMEOUT");

    // 清除是幂等的：第一次返回清除前状态，之后保持 IDLE。
    let before = harness.manager.clear(refnum, ClearScope::Recv)?;
    assert!(before.contains(ComStatus::RECV_TIMED_OUT));
    let again = harness.manager.clear(refnum, ClearScope::Recv)?;
    assert!(!again.intersects(ComStatus::RECV_MASK));
    assert_eq!(harness.manager.clear(refnum, ClearScope::Both)?, again);
    assert_eq!(harness.events.signal_count(event), 1);
    Ok(())
}

#[test]
fn immediate_timeout_and_late_data() -> Result<()> {
    let harness = Harness::new()?;
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let refnum = harness.manager.open(&format!("TCPCLIENT 127.0.0.1 {port}"))?;
    let (mut peer, _) = listener.accept()?;
    wait_connected(&harness, refnum)?;

    let immediate = harness.event();
    harness
        .manager
        .recv(refnum, immediate, Timeout::Immediate, 4)?;
    assert!(harness
        .manager
        .status(refnum)?
        .contains(ComStatus::RECV_TIMED_OUT));
    assert_eq!(harness.events.signal_count(immediate), 1);

    // 重新发起同方向操作会先清除旧状态；数据晚于 recv 到达时结果相同。
    let later = harness.event();
    harness.manager.recv(refnum, later, Timeout::Never, 4)?;
    assert!(harness.manager.status(refnum)?.contains(ComStatus::RECV_PENDING));
    peer.write_all(b"data")?;
    harness.wait(later)?;
    assert_eq!(harness.fetch(refnum, 4)?, b"data".to_vec());
    Ok(())
}

#[test]
fn fetch_requires_finished_receive() -> Result<()> {
    let harness = Harness::new()?;
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let refnum = harness.manager.open(&format!("TCPCLIENT 127.0.0.1 {port}"))?;
    let (_peer, _) = listener.accept()?;

    let mut out = [0u8; 4];
    assert_eq!(harness.manager.fetch_received(refnum, &mut out).unwrap_err().code(), 753);
    assert_eq!(harness.manager.fetch_received(refnum, &mut []).unwrap_err().code(), 754);
    let event = harness.event();
    assert_eq!(
        harness.manager.recv(refnum, event, Timeout::Never, 0).unwrap_err().code(),
        754
    );
    Ok(())
}

#[test]
fn peer_close_is_a_permanent_disconnect() -> Result<()> {
    let harness = Harness::new()?;
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let refnum = harness.manager.open(&format!("TCPCLIENT 127.0.0.1 {port}"))?;
    let (peer, _) = listener.accept()?;

    let event = harness.event();
    harness
        .manager
        .recv(refnum, event, Timeout::from_centis(500), 4)?;
    peer.shutdown(Shutdown::Both)?;
    drop(peer);
    harness.wait(event)?;

    let status = harness.manager.status(refnum)?;
    assert!(status.contains(ComStatus::RECV_ERROR));
    assert!(status.is_permanent_error());

    let send = harness.event();
    let rejected = harness.manager.send(refnum, send, Timeout::Never, b"x");
    assert_eq!(rejected.unwrap_err().code(), 753);
    assert_eq!(harness.events.signal_count(send), 0);
    assert_eq!(
        harness.text(refnum, "GETERROR")?,
        "PERMANENT ERROR: DISCONNECT"
    );
    Ok(())
}

#[test]
fn writes_to_a_closed_peer_end_in_disconnect() -> Result<()> {
    let harness = Harness::new()?;
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let refnum = harness.manager.open(&format!("TCPCLIENT 127.0.0.1 {port}"))?;
    let (peer, _) = listener.accept()?;
    wait_connected(&harness, refnum)?;
    drop(peer);

    // 首次写入通常仍被内核接收，随后的写入收到 EPIPE / ECONNRESET；进程不得被 SIGPIPE 终止。
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let event = harness.event();
        harness
            .manager
            .send(refnum, event, Timeout::from_centis(100), b"ping")?;
        let status = harness.manager.status(refnum)?;
        if status.is_permanent_error() {
            assert!(status.contains(ComStatus::SEND_ERROR));
            break;
        }
        anyhow::ensure!(Instant::now() < deadline, "对端关闭后写入始终未失败");
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(
        harness.text(refnum, "GETSENDERROR")?,
        "PERMANENT ERROR: DISCONNECT"
    );
    Ok(())
}

#[test]
fn refused_connection_reports_permanent_error() -> Result<()> {
    let harness = Harness::new()?;
    let port = free_tcp_port()?;
    match harness.manager.open(&format!("TCPCLIENT 127.0.0.1 {port}")) {
        Ok(refnum) => {
            harness.status_until(refnum, ComStatus::is_permanent_error)?;
            assert_eq!(
                harness.text(refnum, "GETERROR")?,
                "PERMANENT ERROR: CONNECTION REFUSED"
            );
        }
        Err(err) => assert_eq!(err.code(), 753),
    }
    Ok(())
}

#[test]
#[traced_test]
fn bad_client_arguments_fail_open() -> Result<()> {
    let harness = Harness::new()?;
    let err = harness.manager.open("TCPCLIENT 127.0.0.1 http").unwrap_err();
    assert_eq!(err.code(), 753);
    assert_eq!(
        harness.text(RefNum::from(1), "GETERROR")?,
        "INVALID PORT NUMBER"
    );
    let err = harness.manager.open("TCPCLIENT6 127.0.0.1 80").unwrap_err();
    assert_eq!(err.message(), "INVALID IP ADDRESS OR DOMAIN NAME");
    assert!(logs_contain("open failed"));
    Ok(())
}

fn listening_and_spares(harness: &Harness, members: &[RefNum]) -> Result<(usize, usize)> {
    let mut listening = 0;
    let mut spares = 0;
    for &member in members {
        let flags = harness.manager.channel_flags(member)?;
        listening += usize::from(flags.contains(ChannelFlags::LISTENING));
        spares += usize::from(flags.contains(ChannelFlags::HOLDS_LISTENER));
    }
    Ok((listening, spares))
}

#[test]
fn listener_moves_through_the_port_group() -> Result<()> {
    let harness = Harness::new()?;
    let port = free_tcp_port()?;
    let first = harness.manager.open(&format!("TCPSERVER {port}"))?;
    let second = harness.manager.open(&format!("tcpserver  {port}"))?;
    let first_flags = harness.manager.channel_flags(first)?;
    let second_flags = harness.manager.channel_flags(second)?;
    assert!(first_flags.contains(ChannelFlags::LISTENING));
    assert!(second_flags.contains(ChannelFlags::OPEN | ChannelFlags::SHARES_PORT));
    assert!(!second_flags.contains(ChannelFlags::LISTENING));
    assert_eq!(harness.text(second, "GETLOCALADDR")?, "0.0.0.0 0");

    // 第一条连接交给 first，监听句柄移交给等待中的 second。
    let mut client_one = TcpStream::connect(("127.0.0.1", port))?;
    wait_connected(&harness, first)?;
    eventually(|| {
        Ok(harness
            .manager
            .channel_flags(second)?
            .contains(ChannelFlags::LISTENING))
    })?;
    assert_eq!(listening_and_spares(&harness, &[first, second])?, (1, 0));

    client_one.write_all(b"hello")?;
    let event = harness.event();
    harness
        .manager
        .recv(first, event, Timeout::from_centis(500), 5)?;
    harness.wait(event)?;
    assert_eq!(harness.fetch(first, 5)?, b"hello".to_vec());

    // 关闭正在监听的 second：句柄落到已连接且无备用句柄的 first。
    harness.manager.close(second)?;
    let first_flags = harness.manager.channel_flags(first)?;
    assert!(first_flags.contains(ChannelFlags::CONNECTED | ChannelFlags::HOLDS_LISTENER));
    assert_eq!(listening_and_spares(&harness, &[first])?, (0, 1));

    // 新成员接过备用句柄并开始监听。
    let third = harness.manager.open(&format!("TCPSERVER {port}"))?;
    assert!(harness
        .manager
        .channel_flags(third)?
        .contains(ChannelFlags::LISTENING));
    assert_eq!(listening_and_spares(&harness, &[first, third])?, (1, 0));

    let _client_two = TcpStream::connect(("127.0.0.1", port))?;
    wait_connected(&harness, third)?;
    // 组内无人等待：接受者保留备用句柄。
    assert!(harness
        .manager
        .channel_flags(third)?
        .contains(ChannelFlags::HOLDS_LISTENER));
    assert_eq!(listening_and_spares(&harness, &[first, third])?, (0, 1));
    Ok(())
}

#[test]
fn closing_the_listener_wakes_the_next_waiting_member() -> Result<()> {
    let harness = Harness::new()?;
    let port = free_tcp_port()?;
    let first = harness.manager.open(&format!("TCPSERVER {port}"))?;
    let second = harness.manager.open(&format!("TCPSERVER {port}"))?;
    let third = harness.manager.open(&format!("TCPSERVER {port}"))?;
    assert_eq!(listening_and_spares(&harness, &[first, second, third])?, (1, 0));
    assert!(harness
        .manager
        .channel_flags(first)?
        .contains(ChannelFlags::LISTENING));

    // 关闭正在监听的 first：句柄交给按打开顺序的第一个等待者。
    harness.manager.close(first)?;
    let second_flags = harness.manager.channel_flags(second)?;
    assert!(second_flags.contains(ChannelFlags::LISTENING));
    assert!(!harness
        .manager
        .channel_flags(third)?
        .contains(ChannelFlags::LISTENING));
    assert_eq!(listening_and_spares(&harness, &[second, third])?, (1, 0));

    let mut client = TcpStream::connect(("127.0.0.1", port))?;
    wait_connected(&harness, second)?;
    eventually(|| {
        Ok(harness
            .manager
            .channel_flags(third)?
            .contains(ChannelFlags::LISTENING))
    })?;
    assert_eq!(listening_and_spares(&harness, &[second, third])?, (1, 0));

    client.write_all(b"ok")?;
    let event = harness.event();
    harness
        .manager
        .recv(second, event, Timeout::from_centis(500), 2)?;
    harness.wait(event)?;
    assert_eq!(harness.fetch(second, 2)?, b"ok".to_vec());
    Ok(())
}

#[test]
fn ephemeral_server_reports_bound_port() -> Result<()> {
    let harness = Harness::new()?;
    let server = harness.manager.open("TCPSERVER 0")?;
    let local = harness.text(server, "GETLOCALADDR")?;
    let port: u16 = local
        .rsplit(' ')
        .next()
        .unwrap_or_default()
        .parse()?;
    assert_ne!(port, 0);

    let mut client = TcpStream::connect(("127.0.0.1", port))?;
    let event = harness.event();
    harness
        .manager
        .send(server, event, Timeout::from_centis(500), b"hi")?;
    harness.wait(event)?;
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply)?;
    assert_eq!(&reply, b"hi");
    let unknown = harness.manager.control(server, b"NOSUCHVERB").unwrap_err();
    assert_eq!(unknown.message(), "INVALID COMCTL REQUEST");
    assert_eq!(harness.text(server, "GETERROR")?, "INVALID COMCTL REQUEST");
    Ok(())
}
