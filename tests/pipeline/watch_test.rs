//! Tests for the cgroup watch registry.

use std::sync::Arc;

use session_audit::watch::WatchRegistry;

use crate::support::{channel_sink, session};

#[test]
fn lookup_returns_registered_session() {
    let (sink, _rx) = channel_sink();
    let registry = WatchRegistry::new();
    registry.add_watch(42, session("s-1", 100, sink));

    let ctx = registry.lookup(42).expect("registered");
    assert_eq!(ctx.session_id, "s-1");
    assert!(registry.lookup(43).is_none());
}

#[test]
fn removed_watch_no_longer_matches() {
    let (sink, _rx) = channel_sink();
    let registry = WatchRegistry::new();
    registry.add_watch(42, session("s-1", 100, sink));

    registry.remove_watch(42);
    assert!(registry.lookup(42).is_none());
    assert!(registry.is_empty());

    // Removing an absent entry is a no-op.
    registry.remove_watch(42);
    registry.remove_watch(7);
    assert!(registry.is_empty());
}

#[test]
fn add_replaces_previous_session() {
    let (sink, _rx) = channel_sink();
    let registry = WatchRegistry::new();
    registry.add_watch(42, session("old", 100, sink.clone()));
    registry.add_watch(42, session("new", 200, sink));

    assert_eq!(registry.len(), 1);
    assert_eq!(registry.lookup(42).expect("registered").session_id, "new");
}

#[test]
fn concurrent_updates_are_consistent() {
    let (sink, _rx) = channel_sink();
    let registry = Arc::new(WatchRegistry::new());

    std::thread::scope(|scope| {
        for worker in 0..8u64 {
            let registry = Arc::clone(&registry);
            let sink = sink.clone();
            scope.spawn(move || {
                for n in 0..100u64 {
                    let id = worker.saturating_mul(1000).saturating_add(n);
                    registry.add_watch(id, session(&format!("s-{id}"), 1, sink.clone()));
                    assert!(registry.lookup(id).is_some());
                    if n % 2 == 0 {
                        registry.remove_watch(id);
                    }
                }
            });
        }
    });

    assert_eq!(registry.len(), 8 * 50);
}
