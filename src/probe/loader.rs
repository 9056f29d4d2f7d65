//! Loading probe objects into the kernel and draining their perf buffers.

use std::path::Path;
use std::sync::Arc;

use aya::maps::perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer};
use aya::maps::MapData;
use aya::programs::{KProbe, TracePoint};
use aya::Ebpf;
use bytes::BytesMut;
use session_audit_common::{connect, exec, open, EVENTS_MAP};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{deliver, ProbeError, ProbeEvent, ProbeKind, ProbeStats};

/// Records read from a CPU buffer per wakeup.
const READ_BATCH: usize = 16;

/// Where a program in a probe object hooks into the kernel.
#[derive(Debug, Clone, Copy)]
enum AttachPoint {
    TracePoint {
        program: &'static str,
        category: &'static str,
        name: &'static str,
    },
    KProbe {
        program: &'static str,
        function: &'static str,
    },
}

impl AttachPoint {
    fn program(self) -> &'static str {
        match self {
            Self::TracePoint { program, .. } | Self::KProbe { program, .. } => program,
        }
    }
}

fn attach_points(kind: ProbeKind) -> &'static [AttachPoint] {
    match kind {
        ProbeKind::Exec => &[
            AttachPoint::TracePoint {
                program: exec::ENTRY_PROGRAM,
                category: "syscalls",
                name: "sys_enter_execve",
            },
            AttachPoint::TracePoint {
                program: exec::EXIT_PROGRAM,
                category: "syscalls",
                name: "sys_exit_execve",
            },
        ],
        ProbeKind::Open => &[
            AttachPoint::TracePoint {
                program: open::ENTRY_PROGRAM,
                category: "syscalls",
                name: "sys_enter_openat",
            },
            AttachPoint::TracePoint {
                program: open::EXIT_PROGRAM,
                category: "syscalls",
                name: "sys_exit_openat",
            },
        ],
        // Entry and return probes share the function; the object's section
        // names decide which is which.
        ProbeKind::Connect => &[
            AttachPoint::KProbe {
                program: connect::V4_ENTRY_PROGRAM,
                function: "tcp_v4_connect",
            },
            AttachPoint::KProbe {
                program: connect::V4_EXIT_PROGRAM,
                function: "tcp_v4_connect",
            },
            AttachPoint::KProbe {
                program: connect::V6_ENTRY_PROGRAM,
                function: "tcp_v6_connect",
            },
            AttachPoint::KProbe {
                program: connect::V6_EXIT_PROGRAM,
                function: "tcp_v6_connect",
            },
        ],
    }
}

/// A probe object resident in the kernel plus its capture tasks.
///
/// Dropping it detaches the programs and aborts the tasks.
pub(crate) struct LoadedProgram {
    bpf: Option<Ebpf>,
    readers: Vec<JoinHandle<()>>,
}

impl LoadedProgram {
    /// Load `object`, attach every program of `E::KIND` and spawn one capture
    /// task per online CPU feeding `tx`.
    pub(crate) fn load<E: ProbeEvent>(
        object: &Path,
        page_count: usize,
        tx: mpsc::Sender<E>,
        stats: Arc<ProbeStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ProbeError> {
        let mut bpf = Ebpf::load_file(object).map_err(|source| ProbeError::Load {
            path: object.to_path_buf(),
            source,
        })?;

        for point in attach_points(E::KIND) {
            attach(&mut bpf, *point)?;
            tracing::debug!(probe = %E::KIND, program = point.program(), "program attached");
        }

        let map = bpf
            .take_map(EVENTS_MAP)
            .ok_or(ProbeError::MissingMap(EVENTS_MAP))?;
        let mut events = AsyncPerfEventArray::try_from(map)?;

        let cpus = aya::util::online_cpus().map_err(|(_, e)| ProbeError::OnlineCpus(e))?;
        // Open every buffer before spawning so a failure leaves no task behind.
        let buffers = cpus
            .into_iter()
            .map(|cpu| -> Result<_, ProbeError> {
                Ok((cpu, events.open(cpu, Some(page_count))?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let readers = buffers
            .into_iter()
            .map(|(cpu, buffer)| {
                tokio::spawn(capture::<E>(
                    cpu,
                    buffer,
                    tx.clone(),
                    Arc::clone(&stats),
                    shutdown.clone(),
                ))
            })
            .collect();

        Ok(Self {
            bpf: Some(bpf),
            readers,
        })
    }

    /// Abort the capture tasks and unload the programs.
    pub(crate) fn close(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        drop(self.bpf.take());
    }
}

impl Drop for LoadedProgram {
    fn drop(&mut self) {
        self.close();
    }
}

fn attach(bpf: &mut Ebpf, point: AttachPoint) -> Result<(), ProbeError> {
    let name = point.program();
    let program = bpf
        .program_mut(name)
        .ok_or(ProbeError::MissingProgram(name))?;
    let attach_err = |source: aya::programs::ProgramError| ProbeError::Attach {
        program: name,
        source,
    };

    match point {
        AttachPoint::TracePoint { category, name: tracepoint, .. } => {
            let program: &mut TracePoint = program.try_into().map_err(attach_err)?;
            program.load().map_err(attach_err)?;
            program.attach(category, tracepoint).map_err(attach_err)?;
        }
        AttachPoint::KProbe { function, .. } => {
            let program: &mut KProbe = program.try_into().map_err(attach_err)?;
            program.load().map_err(attach_err)?;
            program.attach(function, 0).map_err(attach_err)?;
        }
    }
    Ok(())
}

/// Drain one CPU's perf buffer until shutdown or a read error.
async fn capture<E: ProbeEvent>(
    cpu: u32,
    mut buffer: AsyncPerfEventArrayBuffer<MapData>,
    tx: mpsc::Sender<E>,
    stats: Arc<ProbeStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut records: Vec<BytesMut> = (0..READ_BATCH)
        .map(|_| BytesMut::with_capacity(E::RECORD_SIZE))
        .collect();

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            result = buffer.read_events(&mut records) => match result {
                Ok(events) => {
                    if events.lost > 0 {
                        stats.record_lost(events.lost);
                        tracing::warn!(probe = %E::KIND, cpu, lost = events.lost, "kernel dropped records");
                    }
                    for raw in records.iter().take(events.read) {
                        deliver(&tx, &stats, raw);
                    }
                }
                Err(e) => {
                    tracing::error!(probe = %E::KIND, cpu, error = %e, "perf buffer read failed, stopping capture");
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(probe = %E::KIND, cpu, "capture task stopped");
}
