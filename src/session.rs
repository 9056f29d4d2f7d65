//! Session identity handed to the auditor when a session opens.

use std::fmt;
use std::sync::Arc;

use crate::events::AuditSink;

/// One logical session being audited.
///
/// Owned by the caller. The service keeps an `Arc` to it, keyed by the
/// session's cgroup ID, between `open_session` and `close_session`.
#[derive(Clone)]
pub struct SessionContext {
    /// Unique session ID; also names the session's cgroup.
    pub session_id: String,
    /// ID of the server hosting the session.
    pub server_id: String,
    /// Namespace the session belongs to.
    pub namespace: String,
    /// OS login the session runs as.
    pub login: String,
    /// Cluster user who opened the session.
    pub user: String,
    /// PID of the session's root process.
    pub pid: u32,
    /// Where records for this session go.
    pub audit_log: Arc<dyn AuditSink>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("server_id", &self.server_id)
            .field("namespace", &self.namespace)
            .field("login", &self.login)
            .field("user", &self.user)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}
