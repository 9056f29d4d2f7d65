//! Audit record vocabulary: event types, field names, and the sink contract.
//!
//! An audit record is a flat JSON object. The session's identity fields are
//! merged with the variant-specific fields of one kernel event and handed,
//! together with its [`EventType`], to the session's [`AuditSink`].

use std::fmt;

use serde::Serialize;

use crate::session::SessionContext;

/// Flat mapping of named values making up one audit record.
pub type EventFields = serde_json::Map<String, serde_json::Value>;

/// Namespace the session belongs to.
pub const EVENT_NAMESPACE: &str = "namespace";
/// Session ID.
pub const SESSION_ID: &str = "sid";
/// ID of the server hosting the session.
pub const SESSION_SERVER_ID: &str = "server_id";
/// OS login of the session.
pub const EVENT_LOGIN: &str = "login";
/// Cluster user of the session.
pub const EVENT_USER: &str = "user";

/// Process ID.
pub const PID: &str = "pid";
/// Parent process ID.
pub const PPID: &str = "ppid";
/// cgroup ID the event was captured in.
pub const CGROUP_ID: &str = "cgroup_id";
/// Command name of the process.
pub const PROGRAM: &str = "program";
/// Executable or file path.
pub const PATH: &str = "path";
/// Argument vector following `argv[0]`.
pub const ARGV: &str = "argv";
/// Syscall return value.
pub const RETURN_CODE: &str = "return_code";
/// Open flags.
pub const FLAGS: &str = "flags";
/// Source address of a connection.
pub const SRC_ADDR: &str = "src_addr";
/// Destination address of a connection.
pub const DST_ADDR: &str = "dst_addr";
/// Destination port of a connection.
pub const DST_PORT: &str = "dst_port";
/// IP version of a connection (4 or 6).
pub const TCP_VERSION: &str = "version";

/// Audit event type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    /// A session process called `execve`.
    #[serde(rename = "session.exec")]
    SessionExec,
    /// A session process opened a file.
    #[serde(rename = "session.open")]
    SessionOpen,
    /// A session process initiated a TCP connection.
    #[serde(rename = "session.connect")]
    SessionConnect,
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionExec => "session.exec",
            Self::SessionOpen => "session.open",
            Self::SessionConnect => "session.connect",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for audit records.
///
/// Implementations should not block for long: the dispatcher calls
/// `emit_audit_event` inline, so a slow sink delays every session.
pub trait AuditSink: Send + Sync {
    /// Accept one audit record. Delivery failures are the sink's concern.
    fn emit_audit_event(&self, event: EventType, fields: EventFields);
}

/// Identity fields shared by every record emitted for `ctx`.
pub fn session_fields(ctx: &SessionContext) -> EventFields {
    let mut fields = EventFields::new();
    fields.insert(EVENT_NAMESPACE.to_owned(), ctx.namespace.clone().into());
    fields.insert(SESSION_ID.to_owned(), ctx.session_id.clone().into());
    fields.insert(SESSION_SERVER_ID.to_owned(), ctx.server_id.clone().into());
    fields.insert(EVENT_LOGIN.to_owned(), ctx.login.clone().into());
    fields.insert(EVENT_USER.to_owned(), ctx.user.clone().into());
    fields
}
