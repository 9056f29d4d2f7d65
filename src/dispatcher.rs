//! Correlation of probe events to sessions.
//!
//! A single task drains the three probe queues, looks each event's cgroup ID
//! up in the [`WatchRegistry`] and hands a merged audit record to the owning
//! session's sink. Events from cgroups nobody watches are discarded.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::events::session_fields;
use crate::probe::{ConnectEvent, ExecEvent, OpenEvent, ProbeEvent};
use crate::watch::WatchRegistry;

/// Counters reported when the dispatcher exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Records handed to a session sink.
    pub emitted: u64,
    /// Events from unwatched cgroups.
    pub discarded: u64,
}

/// Consumer of the probe queues.
pub struct Dispatcher {
    registry: Arc<WatchRegistry>,
    exec: mpsc::Receiver<ExecEvent>,
    open: mpsc::Receiver<OpenEvent>,
    connect: mpsc::Receiver<ConnectEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Wire a dispatcher to the probe queues and the shutdown signal.
    pub fn new(
        registry: Arc<WatchRegistry>,
        exec: mpsc::Receiver<ExecEvent>,
        open: mpsc::Receiver<OpenEvent>,
        connect: mpsc::Receiver<ConnectEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            exec,
            open,
            connect,
            shutdown,
        }
    }

    /// Run until shutdown is signalled or every queue is closed.
    ///
    /// Returns once; a stopped dispatcher is not restarted.
    pub async fn run(mut self) -> DispatchStats {
        let mut stats = DispatchStats::default();
        let (mut exec_open, mut open_open, mut connect_open) = (true, true, true);
        tracing::debug!("dispatcher started");

        loop {
            if *self.shutdown.borrow() || !(exec_open || open_open || connect_open) {
                break;
            }
            tokio::select! {
                event = self.exec.recv(), if exec_open => match event {
                    Some(event) => self.dispatch(&event, &mut stats),
                    None => exec_open = false,
                },
                event = self.open.recv(), if open_open => match event {
                    Some(event) => self.dispatch(&event, &mut stats),
                    None => open_open = false,
                },
                event = self.connect.recv(), if connect_open => match event {
                    Some(event) => self.dispatch(&event, &mut stats),
                    None => connect_open = false,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(emitted = stats.emitted, discarded = stats.discarded, "dispatcher stopped");
        stats
    }

    fn dispatch<E: ProbeEvent>(&self, event: &E, stats: &mut DispatchStats) {
        let Some(ctx) = self.registry.lookup(event.cgroup_id()) else {
            tracing::trace!(
                probe = %E::KIND,
                cgroup_id = event.cgroup_id(),
                pid = event.pid(),
                "no session watches cgroup, discarding event"
            );
            stats.discarded = stats.discarded.saturating_add(1);
            return;
        };

        let mut fields = session_fields(&ctx);
        event.append_fields(&mut fields);
        ctx.audit_log.emit_audit_event(E::EVENT_TYPE, fields);
        stats.emitted = stats.emitted.saturating_add(1);
    }
}
