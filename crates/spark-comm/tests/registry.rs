//! 引用号分配、失效引用号与 `GETERROR` 回退。

mod common;

use anyhow::Result;
use common::{Harness, free_udp_port};
use spark_comm::{ClearScope, ComConfig, ComManager, EventTable, RefNum, Timeout};
use std::collections::HashSet;
use std::sync::Arc;

#[test]
fn refnums_are_unique_and_never_reused_while_live() -> Result<()> {
    let harness = Harness::new()?;
    let mut seen = HashSet::new();
    let mut live = Vec::new();
    for round in 0..3 {
        for _ in 0..4 {
            let refnum = harness.manager.open(&format!("UDP {}", free_udp_port()?))?;
            assert!(seen.insert(refnum), "引用号 {refnum} 被重复发放");
            live.push(refnum);
        }
        if round < 2 {
            for refnum in live.drain(..2) {
                harness.manager.close(refnum)?;
            }
        }
    }
    let mut expected = live;
    expected.sort();
    assert_eq!(harness.manager.live_channels(), expected);
    Ok(())
}

#[test]
fn stale_refnum_is_not_found() -> Result<()> {
    let harness = Harness::new()?;
    let first = harness.manager.open(&format!("UDP {}", free_udp_port()?))?;
    harness.manager.close(first)?;
    // 新通道复用同一槽位，但旧引用号不得解析到它。
    let second = harness.manager.open(&format!("UDP {}", free_udp_port()?))?;
    assert_ne!(first, second);

    let event = harness.event();
    assert_eq!(harness.manager.close(first).unwrap_err().code(), 754);
    assert_eq!(harness.manager.status(first).unwrap_err().code(), 754);
    assert_eq!(
        harness
            .manager
            .send(first, event, Timeout::Never, b"x")
            .unwrap_err()
            .code(),
        754
    );
    assert_eq!(
        harness
            .manager
            .clear(first, ClearScope::Both)
            .unwrap_err()
            .code(),
        754
    );
    assert_eq!(
        harness.manager.control(first, b"GETLOCALADDR").unwrap_err().code(),
        754
    );
    assert!(harness.manager.status(second).is_ok());
    Ok(())
}

#[test]
fn geterror_on_unknown_refnum_falls_back() -> Result<()> {
    let harness = Harness::new()?;
    let unknown = RefNum::from(42);
    assert_eq!(harness.text(unknown, "GETERROR")?, "NO ERROR INFORMATION");
    assert_eq!(
        harness.manager.control(unknown, b"GETSENDERROR").unwrap_err().code(),
        754
    );

    assert!(harness.manager.open("UDP 0").is_err());
    assert_eq!(harness.text(unknown, "geterror")?, "INVALID PORT NUMBER");
    // 文本读取一次后清空；空闲栈非空时不再回落到默认文本。
    assert_eq!(harness.text(unknown, "GETERROR")?, "");
    Ok(())
}

#[test]
fn each_operation_instance_signals_at_most_once() -> Result<()> {
    let harness = Harness::new()?;
    let refnum = harness.manager.open(&format!("UDP {}", free_udp_port()?))?;
    let event = harness.event();

    harness.manager.recv(refnum, event, Timeout::Immediate, 8)?;
    assert_eq!(harness.events.signal_count(event), 1);
    // 状态查询与重复清除都不会再次置位。
    harness.manager.status(refnum)?;
    harness.manager.clear(refnum, ClearScope::Recv)?;
    harness.manager.clear(refnum, ClearScope::Recv)?;
    assert_eq!(harness.events.signal_count(event), 1);

    let pending = harness.event();
    harness.manager.recv(refnum, pending, Timeout::Never, 8)?;
    harness.manager.clear(refnum, ClearScope::Both)?;
    harness.manager.close(refnum)?;
    assert_eq!(harness.events.signal_count(pending), 0);
    Ok(())
}

#[test]
fn manager_on_external_runtime() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;
    let events = Arc::new(EventTable::new());
    let manager = ComManager::with_handle(ComConfig::default(), events.clone(), runtime.handle().clone());
    let refnum = manager.open(&format!("UDP {}", free_udp_port()?))?;
    let event = events.create();
    manager.recv(refnum, event, Timeout::from_centis(10), 4)?;
    assert!(events.wait_any(&[event], Some(common::WAIT)).is_some());
    manager.shutdown();
    assert!(manager.live_channels().is_empty());
    Ok(())
}
