//! Kernel tracing probes and their event queues.
//!
//! A [`Probe`] owns one family of kernel programs (exec, open or connect) and
//! the bounded queue its decoded events land in. Records are decoded on the
//! capture task and enqueued with `try_send`, so a slow consumer costs
//! dropped events, never a stalled kernel buffer.
//!
//! A probe can also be [`detached`](Probe::detached): no kernel program, with
//! raw records submitted from user space through a [`ProbeFeed`] and the same
//! decode/enqueue path.

mod loader;
mod record;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use crate::config::BpfConfig;
use crate::events::{EventFields, EventType};

pub use record::{ConnectEvent, DecodeError, ExecEvent, OpenEvent};

use loader::LoadedProgram;

/// Syscall family a probe traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    /// `execve`.
    Exec,
    /// `openat`.
    Open,
    /// TCP `connect` over IPv4 and IPv6.
    Connect,
}

impl ProbeKind {
    /// Short name used in logs and object file names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::Open => "open",
            Self::Connect => "connect",
        }
    }

    /// File name of the prebuilt kernel object.
    pub fn object_name(self) -> String {
        format!("{}.bpf.o", self.as_str())
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded kernel event.
pub trait ProbeEvent: Sized + Send + 'static {
    /// Probe family producing this event.
    const KIND: ProbeKind;
    /// Audit event type emitted for it.
    const EVENT_TYPE: EventType;
    /// Size of the raw record layout.
    const RECORD_SIZE: usize;

    /// Decode one raw perf record.
    fn decode(raw: &[u8]) -> Result<Self, DecodeError>;
    /// cgroup the event was captured in.
    fn cgroup_id(&self) -> u64;
    /// Process that caused the event.
    fn pid(&self) -> u32;
    /// Add the event's audit fields to `fields`.
    fn append_fields(&self, fields: &mut EventFields);
}

/// Failure to bring up a kernel probe.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The object file could not be loaded into the kernel.
    #[error("failed to load {path}: {source}")]
    Load {
        /// Object file.
        path: PathBuf,
        /// Loader error.
        #[source]
        source: aya::EbpfError,
    },
    /// The object lacks an expected program.
    #[error("program {0} not found in object")]
    MissingProgram(&'static str),
    /// A program failed to load or attach.
    #[error("failed to attach {program}: {source}")]
    Attach {
        /// Program name.
        program: &'static str,
        /// Attach error.
        #[source]
        source: aya::programs::ProgramError,
    },
    /// The object lacks its perf event array.
    #[error("map {0} not found in object")]
    MissingMap(&'static str),
    /// The perf event array has the wrong type.
    #[error("perf event map: {0}")]
    Map(#[from] aya::maps::MapError),
    /// A per-CPU perf buffer could not be opened.
    #[error("perf buffer: {0}")]
    Buffer(#[from] aya::maps::perf::PerfBufferError),
    /// The online CPU list could not be read.
    #[error("failed to list online CPUs: {0}")]
    OnlineCpus(#[source] std::io::Error),
    /// The event queue was already handed out.
    #[error("event queue already taken")]
    QueueTaken,
}

/// Counters for events a probe could not deliver.
#[derive(Debug, Default)]
pub struct ProbeStats {
    dropped: AtomicU64,
    malformed: AtomicU64,
    lost: AtomicU64,
}

impl ProbeStats {
    /// Decoded events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records that failed to decode.
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Records the kernel reported lost before they reached user space.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    fn record_lost(&self, count: usize) {
        let count = u64::try_from(count).unwrap_or(u64::MAX);
        self.lost.fetch_add(count, Ordering::Relaxed);
    }
}

/// Outcome of handing one raw record to a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Decoded and queued.
    Queued,
    /// Decoded, but the queue was full.
    Dropped,
    /// Failed to decode.
    Malformed,
    /// The probe is closed or its consumer is gone.
    Closed,
}

/// Decode `raw` and enqueue it without waiting.
pub(crate) fn deliver<E: ProbeEvent>(
    tx: &mpsc::Sender<E>,
    stats: &ProbeStats,
    raw: &[u8],
) -> Delivery {
    let event = match E::decode(raw) {
        Ok(event) => event,
        Err(e) => {
            stats.malformed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(probe = %E::KIND, error = %e, "discarding malformed record");
            return Delivery::Malformed;
        }
    };

    match tx.try_send(event) {
        Ok(()) => Delivery::Queued,
        Err(TrySendError::Full(event)) => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                probe = %E::KIND,
                pid = event.pid(),
                cgroup_id = event.cgroup_id(),
                "event queue full, dropping event"
            );
            Delivery::Dropped
        }
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

enum Source<E> {
    Kernel(LoadedProgram),
    Feed(mpsc::Sender<E>),
}

/// One traced syscall family and its event queue.
pub struct Probe<E: ProbeEvent> {
    events: Option<mpsc::Receiver<E>>,
    source: Option<Source<E>>,
    stats: Arc<ProbeStats>,
}

impl<E: ProbeEvent> fmt::Debug for Probe<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("kind", &E::KIND)
            .field("attached", &self.is_attached())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<E: ProbeEvent> Probe<E> {
    /// Load the kernel object for `E::KIND` from `config.object_dir`, attach
    /// its programs and start one capture task per online CPU.
    ///
    /// Must be called within a Tokio runtime. Capture tasks stop when
    /// `shutdown` turns `true` or the probe is closed.
    ///
    /// # Errors
    ///
    /// Any load, attach or buffer failure. Nothing stays attached on error.
    pub fn load(config: &BpfConfig, shutdown: &watch::Receiver<bool>) -> Result<Self, ProbeError> {
        let object = config.object_dir.join(E::KIND.object_name());
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(ProbeStats::default());
        let program = LoadedProgram::load::<E>(
            &object,
            config.perf_buffer_page_count,
            tx,
            Arc::clone(&stats),
            shutdown.clone(),
        )?;
        tracing::info!(probe = %E::KIND, object = %object.display(), "probe attached");

        Ok(Self {
            events: Some(rx),
            source: Some(Source::Kernel(program)),
            stats,
        })
    }

    /// A probe with no kernel program, fed through the returned [`ProbeFeed`].
    pub fn detached(capacity: usize) -> (Self, ProbeFeed<E>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(ProbeStats::default());
        let feed = ProbeFeed {
            sender: tx.downgrade(),
            stats: Arc::clone(&stats),
        };
        let probe = Self {
            events: Some(rx),
            source: Some(Source::Feed(tx)),
            stats,
        };
        (probe, feed)
    }

    /// Hand out the read side of the event queue. Only the first call
    /// returns it.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<E>> {
        self.events.take()
    }

    /// Delivery counters.
    pub fn stats(&self) -> Arc<ProbeStats> {
        Arc::clone(&self.stats)
    }

    /// Whether the probe is still producing events.
    pub fn is_attached(&self) -> bool {
        self.source.is_some()
    }

    /// Detach the kernel programs, stop the capture tasks and release the
    /// buffers. Safe to call more than once.
    ///
    /// Events already queued stay readable; the queue reports closed once
    /// they are drained.
    pub fn close(&mut self) {
        match self.source.take() {
            Some(Source::Kernel(mut program)) => {
                program.close();
                tracing::info!(probe = %E::KIND, "probe detached");
            }
            Some(Source::Feed(_)) => {
                tracing::debug!(probe = %E::KIND, "detached probe closed");
            }
            None => {}
        }
    }
}

/// User-space input for a [detached](Probe::detached) probe.
///
/// Holds no strong reference to the queue: once the probe is closed,
/// submissions report [`Delivery::Closed`].
pub struct ProbeFeed<E: ProbeEvent> {
    sender: mpsc::WeakSender<E>,
    stats: Arc<ProbeStats>,
}

impl<E: ProbeEvent> Clone for ProbeFeed<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<E: ProbeEvent> fmt::Debug for ProbeFeed<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeFeed")
            .field("kind", &E::KIND)
            .finish_non_exhaustive()
    }
}

impl<E: ProbeEvent> ProbeFeed<E> {
    /// Decode and enqueue one raw record, exactly as a capture task would.
    pub fn submit(&self, raw: &[u8]) -> Delivery {
        match self.sender.upgrade() {
            Some(tx) => deliver(&tx, &self.stats, raw),
            None => Delivery::Closed,
        }
    }
}
