//! Shared fixtures: a channel-backed audit sink, an in-memory cgroup manager
//! and raw record builders.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use session_audit::cgroup::{CgroupError, CgroupManager};
use session_audit::events::{AuditSink, EventFields, EventType};
use session_audit::probe::{ConnectEvent, ExecEvent, OpenEvent, Probe, ProbeFeed};
use session_audit::service::Probes;
use session_audit::session::SessionContext;
use session_audit::watch::WatchRegistry;
use session_audit_common::{
    write_c_str, ConnectRecord, ExecRecord, OpenRecord, AF_INET, AF_INET6,
};
use tokio::sync::mpsc;

/// Upper bound on waiting for a record that should arrive.
pub const RECORD_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards every record to an unbounded channel.
pub struct ChannelSink(mpsc::UnboundedSender<(EventType, EventFields)>);

impl AuditSink for ChannelSink {
    fn emit_audit_event(&self, event: EventType, fields: EventFields) {
        let _ = self.0.send((event, fields));
    }
}

/// A sink and the receiving end of its records.
pub fn channel_sink() -> (
    Arc<ChannelSink>,
    mpsc::UnboundedReceiver<(EventType, EventFields)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelSink(tx)), rx)
}

/// Wait for the next record, failing the test on timeout.
pub async fn next_record(
    rx: &mut mpsc::UnboundedReceiver<(EventType, EventFields)>,
) -> (EventType, EventFields) {
    tokio::time::timeout(RECORD_TIMEOUT, rx.recv())
        .await
        .expect("record should arrive in time")
        .expect("sink channel open")
}

/// Session context writing to `sink`.
pub fn session(session_id: &str, pid: u32, sink: Arc<dyn AuditSink>) -> Arc<SessionContext> {
    Arc::new(SessionContext {
        session_id: session_id.to_owned(),
        server_id: "node-1".to_owned(),
        namespace: "default".to_owned(),
        login: "root".to_owned(),
        user: "alice".to_owned(),
        pid,
        audit_log: sink,
    })
}

/// Feeds for a set of detached probes.
pub struct Feeds {
    pub exec: ProbeFeed<ExecEvent>,
    pub open: ProbeFeed<OpenEvent>,
    pub connect: ProbeFeed<ConnectEvent>,
}

/// Three detached probes with queues of `capacity`.
pub fn detached_probes(capacity: usize) -> (Probes, Feeds) {
    let (exec, exec_feed) = Probe::detached(capacity);
    let (open, open_feed) = Probe::detached(capacity);
    let (connect, connect_feed) = Probe::detached(capacity);
    (
        Probes {
            exec,
            open,
            connect,
        },
        Feeds {
            exec: exec_feed,
            open: open_feed,
            connect: connect_feed,
        },
    )
}

pub fn exec_record(cgroup_id: u64, pid: u32, path: &str, args: &[&str]) -> Vec<u8> {
    let mut record = ExecRecord::zeroed();
    record.pid = pid;
    record.ppid = 1;
    record.cgroup_id = cgroup_id;
    record.argc = u32::try_from(args.len()).expect("argc");
    write_c_str(&mut record.comm, path.rsplit('/').next().unwrap_or(path));
    write_c_str(&mut record.filename, path);
    for (slot, arg) in record.argv.iter_mut().zip(args) {
        write_c_str(slot, arg);
    }
    record.to_bytes().to_vec()
}

pub fn open_record(cgroup_id: u64, pid: u32, path: &str) -> Vec<u8> {
    let mut record = OpenRecord::zeroed();
    record.pid = pid;
    record.cgroup_id = cgroup_id;
    write_c_str(&mut record.comm, "cat");
    write_c_str(&mut record.path, path);
    record.to_bytes().to_vec()
}

pub fn connect_v4_record(cgroup_id: u64, pid: u32, dst: [u8; 4], port: u16) -> Vec<u8> {
    let mut record = ConnectRecord::zeroed();
    record.pid = pid;
    record.cgroup_id = cgroup_id;
    record.family = AF_INET;
    record.dport = port;
    record.saddr[..4].copy_from_slice(&[10, 0, 0, 1]);
    record.daddr[..4].copy_from_slice(&dst);
    write_c_str(&mut record.comm, "curl");
    record.to_bytes().to_vec()
}

pub fn connect_v6_record(cgroup_id: u64, pid: u32, dst: std::net::Ipv6Addr, port: u16) -> Vec<u8> {
    let mut record = ConnectRecord::zeroed();
    record.pid = pid;
    record.cgroup_id = cgroup_id;
    record.family = AF_INET6;
    record.dport = port;
    record.saddr = std::net::Ipv6Addr::LOCALHOST.octets();
    record.daddr = dst.octets();
    write_c_str(&mut record.comm, "curl");
    record.to_bytes().to_vec()
}

/// In-memory cgroup manager with fixed IDs per session.
#[derive(Default)]
pub struct FakeCgroups {
    ids: HashMap<String, u64>,
    fail_place: bool,
    created: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    registry: OnceLock<Arc<WatchRegistry>>,
    watched: Mutex<Vec<String>>,
}

impl FakeCgroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session `session_id` gets cgroup ID `id`.
    pub fn with_id(mut self, session_id: &str, id: u64) -> Self {
        self.ids.insert(session_id.to_owned(), id);
        self
    }

    /// Make every `place` fail.
    pub fn failing_place(mut self) -> Self {
        self.fail_place = true;
        self
    }

    /// Primitive calls so far, as `op:session[:pid]`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Observe `registry` from now on; see [`watched`](Self::watched).
    pub fn observe(&self, registry: &Arc<WatchRegistry>) {
        let _ = self.registry.set(Arc::clone(registry));
    }

    /// For every `place` and `remove` since [`observe`](Self::observe), whether
    /// the session's cgroup was watched at that moment, as `op:session:bool`.
    pub fn watched(&self) -> Vec<String> {
        self.watched.lock().expect("watched lock").clone()
    }

    /// Delete the session's cgroup behind the service's back.
    pub fn vanish(&self, session_id: &str) {
        self.created.lock().expect("created lock").remove(session_id);
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.created.lock().expect("created lock").contains(session_id)
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }

    fn note_watched(&self, op: &str, session_id: &str) {
        let Some(registry) = self.registry.get() else {
            return;
        };
        let watched = self
            .ids
            .get(session_id)
            .is_some_and(|id| registry.lookup(*id).is_some());
        self.watched
            .lock()
            .expect("watched lock")
            .push(format!("{op}:{session_id}:{watched}"));
    }
}

fn io_error(action: &'static str, session_id: &str) -> CgroupError {
    CgroupError::Io {
        action,
        path: session_id.into(),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    }
}

impl CgroupManager for FakeCgroups {
    fn create(&self, session_id: &str) -> Result<(), CgroupError> {
        self.record(format!("create:{session_id}"));
        self.created
            .lock()
            .expect("created lock")
            .insert(session_id.to_owned());
        Ok(())
    }

    fn place(&self, session_id: &str, pid: u32) -> Result<(), CgroupError> {
        self.record(format!("place:{session_id}:{pid}"));
        self.note_watched("place", session_id);
        if self.fail_place {
            return Err(CgroupError::Io {
                action: "write",
                path: session_id.into(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        if !self.exists(session_id) {
            return Err(io_error("open", session_id));
        }
        Ok(())
    }

    fn remove(&self, session_id: &str) -> Result<(), CgroupError> {
        self.record(format!("remove:{session_id}"));
        self.note_watched("remove", session_id);
        self.created.lock().expect("created lock").remove(session_id);
        Ok(())
    }

    fn identify(&self, session_id: &str) -> Result<u64, CgroupError> {
        if !self.exists(session_id) {
            return Err(io_error("stat", session_id));
        }
        self.ids
            .get(session_id)
            .copied()
            .ok_or_else(|| io_error("stat", session_id))
    }
}
