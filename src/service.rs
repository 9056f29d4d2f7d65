//! The session audit service.
//!
//! [`Service`] ties the pieces together: it checks the host, loads the three
//! probes, spawns the [`Dispatcher`] and keeps the [`WatchRegistry`] in step
//! with the session cgroups it creates and removes.
//!
//! ```text
//!  kernel ──► Probe (exec/open/connect) ──► queue ──► Dispatcher ──► AuditSink
//!                                                        │
//!                      open_session/close_session ──► WatchRegistry
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cgroup::{CgroupError, CgroupFs, CgroupManager};
use crate::config::{BpfConfig, Config, ConfigError};
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::host::{self, HostError};
use crate::probe::{ConnectEvent, ExecEvent, OpenEvent, Probe, ProbeError, ProbeEvent, ProbeKind};
use crate::session::SessionContext;
use crate::watch::WatchRegistry;

/// Cgroup primitive that failed during a session operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupOp {
    /// Creating the session cgroup.
    Create,
    /// Reading the cgroup ID.
    Identify,
    /// Moving the session process in.
    Place,
    /// Removing the session cgroup.
    Remove,
}

impl fmt::Display for CgroupOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Identify => "identify",
            Self::Place => "place",
            Self::Remove => "remove",
        })
    }
}

/// Errors surfaced by the service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The host cannot run the probes.
    #[error(transparent)]
    Host(#[from] HostError),
    /// A probe failed to load.
    #[error("{kind} probe: {source}")]
    ProbeLoad {
        /// Probe family.
        kind: ProbeKind,
        /// Underlying failure.
        #[source]
        source: ProbeError,
    },
    /// The cgroup hierarchy is unusable.
    #[error("cgroup setup: {0}")]
    CgroupSetup(#[source] CgroupError),
    /// A cgroup operation failed for a session.
    #[error("failed to {op} cgroup for session {session_id}: {source}")]
    Cgroup {
        /// Failed primitive.
        op: CgroupOp,
        /// Affected session.
        session_id: String,
        /// Underlying failure.
        #[source]
        source: CgroupError,
    },
    /// The service has been closed.
    #[error("session audit service is closed")]
    Closed,
}

/// The three probes a service runs.
#[derive(Debug)]
pub struct Probes {
    /// `execve` probe.
    pub exec: Probe<ExecEvent>,
    /// `openat` probe.
    pub open: Probe<OpenEvent>,
    /// TCP connect probe.
    pub connect: Probe<ConnectEvent>,
}

impl Probes {
    /// Load all three kernel probes. A failure unloads those already loaded.
    pub fn load(config: &BpfConfig, shutdown: &watch::Receiver<bool>) -> Result<Self, ServiceError> {
        Ok(Self {
            exec: load_probe(config, shutdown)?,
            open: load_probe(config, shutdown)?,
            connect: load_probe(config, shutdown)?,
        })
    }

    /// Close exec, open and connect, in that order.
    pub fn close(&mut self) {
        self.exec.close();
        self.open.close();
        self.connect.close();
    }
}

fn load_probe<E: ProbeEvent>(
    config: &BpfConfig,
    shutdown: &watch::Receiver<bool>,
) -> Result<Probe<E>, ServiceError> {
    Probe::load(config, shutdown).map_err(|source| ServiceError::ProbeLoad {
        kind: E::KIND,
        source,
    })
}

/// Session audit operations, implemented by [`Service`] and [`NopAuditor`].
pub trait SessionAuditor: Send + Sync {
    /// Start auditing the session rooted at `ctx.pid`.
    fn open_session(&self, ctx: &Arc<SessionContext>) -> Result<(), ServiceError>;
    /// Stop auditing the session and remove its cgroup.
    fn close_session(&self, ctx: &SessionContext) -> Result<(), ServiceError>;
    /// Stop all auditing.
    fn close(&self) -> Result<(), ServiceError>;
}

struct Running {
    probes: Probes,
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<DispatchStats>,
}

/// Kernel-level session auditor.
pub struct Service {
    registry: Arc<WatchRegistry>,
    cgroups: Arc<dyn CgroupManager>,
    /// Cgroup ID each open session is watched under.
    sessions: Mutex<HashMap<String, u64>>,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("watched", &self.registry.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Validate `config`, check the host, load the probes and start
    /// dispatching.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Any construction failure; everything acquired so far is released.
    pub async fn new(mut config: Config) -> Result<Self, ServiceError> {
        config.check_and_set_defaults()?;
        host::check(&config.host_requirements()?)?;

        // Probes first: CgroupFs::new leaves a directory behind on the mount.
        let (shutdown, shutdown_rx) = watch::channel(false);
        let probes = Probes::load(&config.bpf, &shutdown_rx)?;
        let cgroups =
            CgroupFs::new(&config.bpf.cgroup_mount_path).map_err(ServiceError::CgroupSetup)?;

        Self::start(Arc::new(cgroups), probes, shutdown)
    }

    /// Start a service from prepared parts, skipping the host check and
    /// kernel loading.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Config`] for invalid configuration, or
    /// [`ServiceError::ProbeLoad`] if a probe's queue was already taken.
    pub async fn with_parts(
        mut config: Config,
        cgroups: Arc<dyn CgroupManager>,
        probes: Probes,
    ) -> Result<Self, ServiceError> {
        config.check_and_set_defaults()?;
        let (shutdown, _) = watch::channel(false);
        Self::start(cgroups, probes, shutdown)
    }

    fn start(
        cgroups: Arc<dyn CgroupManager>,
        mut probes: Probes,
        shutdown: watch::Sender<bool>,
    ) -> Result<Self, ServiceError> {
        let registry = Arc::new(WatchRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            take_queue(&mut probes.exec)?,
            take_queue(&mut probes.open)?,
            take_queue(&mut probes.connect)?,
            shutdown.subscribe(),
        );
        let dispatcher = tokio::spawn(dispatcher.run());
        tracing::info!("session audit service started");

        Ok(Self {
            registry,
            cgroups,
            sessions: Mutex::new(HashMap::new()),
            running: Mutex::new(Some(Running {
                probes,
                shutdown,
                dispatcher,
            })),
        })
    }

    /// Registry of watched cgroups.
    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    /// Whether [`close`](Self::close) has not been called yet.
    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Begin auditing `ctx`: create its cgroup, watch the cgroup ID and move
    /// `ctx.pid` into it.
    ///
    /// If placement fails, the watch is rolled back and the cgroup removed
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Closed`] after [`close`](Self::close), otherwise
    /// [`ServiceError::Cgroup`] naming the failed primitive.
    pub fn open_session(&self, ctx: &Arc<SessionContext>) -> Result<(), ServiceError> {
        if !self.is_running() {
            return Err(ServiceError::Closed);
        }
        let session_id = ctx.session_id.as_str();

        self.cgroups
            .create(session_id)
            .map_err(|e| cgroup_error(CgroupOp::Create, session_id, e))?;

        let cgroup_id = match self.cgroups.identify(session_id) {
            Ok(id) => id,
            Err(e) => {
                self.discard_cgroup(session_id);
                return Err(cgroup_error(CgroupOp::Identify, session_id, e));
            }
        };

        // Watch before placing so the session's first events are correlated.
        self.registry.add_watch(cgroup_id, Arc::clone(ctx));
        self.track().insert(session_id.to_owned(), cgroup_id);

        if let Err(e) = self.cgroups.place(session_id, ctx.pid) {
            self.track().remove(session_id);
            self.registry.remove_watch(cgroup_id);
            self.discard_cgroup(session_id);
            return Err(cgroup_error(CgroupOp::Place, session_id, e));
        }

        tracing::info!(session_id, cgroup_id, pid = ctx.pid, "session audit opened");
        Ok(())
    }

    /// Stop auditing `ctx` and remove its cgroup.
    ///
    /// Sessions opened through this service are unwatched even if their
    /// cgroup has already disappeared; others are looked up by cgroup ID.
    /// Allowed after [`close`](Self::close) so sessions can still be cleaned up.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Cgroup`] naming the failed primitive.
    pub fn close_session(&self, ctx: &SessionContext) -> Result<(), ServiceError> {
        let session_id = ctx.session_id.as_str();

        let tracked = self.track().remove(session_id);
        let cgroup_id = match tracked {
            Some(id) => id,
            None => self
                .cgroups
                .identify(session_id)
                .map_err(|e| cgroup_error(CgroupOp::Identify, session_id, e))?,
        };

        self.registry.remove_watch(cgroup_id);

        self.cgroups
            .remove(session_id)
            .map_err(|e| cgroup_error(CgroupOp::Remove, session_id, e))?;

        tracing::info!(session_id, cgroup_id, "session audit closed");
        Ok(())
    }

    /// Close the probes, then signal the dispatcher to stop.
    ///
    /// A second call does nothing and returns `Ok(())`.
    pub fn close(&self) -> Result<(), ServiceError> {
        if let Some(running) = self.stop() {
            drop(running.dispatcher);
        }
        Ok(())
    }

    /// Like [`close`](Self::close), then wait for the dispatcher to exit.
    ///
    /// Returns the dispatcher's counters, or `None` if the service was
    /// already closed.
    pub async fn shutdown(&self) -> Option<DispatchStats> {
        let running = self.stop()?;
        match running.dispatcher.await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::error!(error = %e, "dispatcher task failed");
                None
            }
        }
    }

    fn stop(&self) -> Option<Running> {
        let mut running = self.lock().take()?;
        running.probes.close();
        // Only fails when the dispatcher already exited.
        let _ = running.shutdown.send(true);
        tracing::info!("session audit service closed");
        Some(running)
    }

    fn discard_cgroup(&self, session_id: &str) {
        if let Err(e) = self.cgroups.remove(session_id) {
            tracing::warn!(session_id, error = %e, "failed to remove cgroup after failed open");
        }
    }

    fn track(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl SessionAuditor for Service {
    fn open_session(&self, ctx: &Arc<SessionContext>) -> Result<(), ServiceError> {
        Service::open_session(self, ctx)
    }

    fn close_session(&self, ctx: &SessionContext) -> Result<(), ServiceError> {
        Service::close_session(self, ctx)
    }

    fn close(&self) -> Result<(), ServiceError> {
        Service::close(self)
    }
}

/// Auditor that audits nothing, for hosts with auditing disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopAuditor;

impl SessionAuditor for NopAuditor {
    fn open_session(&self, _ctx: &Arc<SessionContext>) -> Result<(), ServiceError> {
        Ok(())
    }

    fn close_session(&self, _ctx: &SessionContext) -> Result<(), ServiceError> {
        Ok(())
    }

    fn close(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Build the auditor `config` asks for: a running [`Service`], or a
/// [`NopAuditor`] when `bpf.enabled` is false.
///
/// # Errors
///
/// Whatever [`Service::new`] reports.
pub async fn auditor(config: Config) -> Result<Arc<dyn SessionAuditor>, ServiceError> {
    if !config.bpf.enabled {
        tracing::info!("session auditing disabled by configuration");
        return Ok(Arc::new(NopAuditor));
    }
    Ok(Arc::new(Service::new(config).await?))
}

fn take_queue<E: ProbeEvent>(
    probe: &mut Probe<E>,
) -> Result<tokio::sync::mpsc::Receiver<E>, ServiceError> {
    probe.take_events().ok_or(ServiceError::ProbeLoad {
        kind: E::KIND,
        source: ProbeError::QueueTaken,
    })
}

fn cgroup_error(op: CgroupOp, session_id: &str, source: CgroupError) -> ServiceError {
    ServiceError::Cgroup {
        op,
        session_id: session_id.to_owned(),
        source,
    }
}
