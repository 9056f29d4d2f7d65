//! session-audit: kernel-level auditing of login sessions.
//!
//! eBPF probes record process execution, file opens and TCP connects. Each
//! session runs in its own cgroup v2 group, and the group's ID ties kernel
//! events back to the session that caused them. Correlated events become
//! structured audit records handed to the session's [`events::AuditSink`].
//!
//! Tracing failures never reach the session: full queues drop events, and
//! unknown cgroups are ignored.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cgroup;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod host;
pub mod logging;
pub mod probe;
pub mod service;
pub mod session;
pub mod watch;
