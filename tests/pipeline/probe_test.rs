//! Tests for probe queues and kernel loading failures.

use std::time::{Duration, Instant};

use session_audit::config::BpfConfig;
use session_audit::probe::{
    ConnectEvent, Delivery, ExecEvent, OpenEvent, Probe, ProbeError, ProbeEvent,
};
use tokio::sync::watch;

use crate::support::{connect_v4_record, exec_record, open_record};

#[tokio::test]
async fn overflow_drops_without_blocking() {
    const CAPACITY: usize = 16;
    let (mut probe, feed) = Probe::<ExecEvent>::detached(CAPACITY);
    let mut rx = probe.take_events().expect("queue");

    // Nobody consumes: the first CAPACITY events queue, the next is dropped.
    let started = Instant::now();
    for pid in 0..u32::try_from(CAPACITY).expect("capacity") {
        assert_eq!(
            feed.submit(&exec_record(42, pid, "/bin/true", &[])),
            Delivery::Queued
        );
    }
    assert_eq!(
        feed.submit(&exec_record(42, 999, "/bin/true", &[])),
        Delivery::Dropped
    );
    assert!(started.elapsed() < Duration::from_secs(1));

    let stats = probe.stats();
    assert_eq!(stats.dropped(), 1);
    assert_eq!(stats.malformed(), 0);

    let first = rx.recv().await.expect("queued");
    assert_eq!(first.pid, 0);
    assert_eq!(first.path, "/bin/true");
}

#[test]
fn records_decode_through_the_feed() {
    let (mut probe, feed) = Probe::<ConnectEvent>::detached(4);
    let mut rx = probe.take_events().expect("queue");

    assert_eq!(
        feed.submit(&connect_v4_record(7, 3, [192, 0, 2, 10], 8080)),
        Delivery::Queued
    );
    let event = rx.try_recv().expect("event");
    assert_eq!(event.cgroup_id(), 7);
    assert_eq!(event.pid(), 3);
    assert_eq!(event.dst_addr.to_string(), "192.0.2.10");
    assert_eq!(event.dst_port, 8080);
    assert_eq!(event.version, 4);
}

#[test]
fn truncated_record_is_malformed() {
    let (probe, feed) = Probe::<OpenEvent>::detached(4);
    let raw = open_record(1, 1, "/etc/hosts");
    assert_eq!(feed.submit(&raw[..raw.len() / 2]), Delivery::Malformed);
    assert_eq!(probe.stats().malformed(), 1);
}

#[tokio::test]
async fn missing_object_fails_to_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = BpfConfig {
        object_dir: dir.path().to_path_buf(),
        ..BpfConfig::default()
    };
    let (_shutdown, shutdown_rx) = watch::channel(false);

    let err = Probe::<OpenEvent>::load(&config, &shutdown_rx).expect_err("no object file");
    match err {
        ProbeError::Load { path, .. } => assert_eq!(path, dir.path().join("open.bpf.o")),
        other => panic!("unexpected error: {other}"),
    }
}
