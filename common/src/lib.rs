//! Data contract between the session-audit kernel programs and userspace.
//!
//! Each probe object writes one fixed-size, `#[repr(C)]` record per traced
//! syscall into its `EVENTS` perf event array. The layouts below are the only
//! thing the two sides share: the kernel programs fill them in place, and the
//! userspace decoder reads them back field by field at the offsets reported
//! by [`core::mem::offset_of!`]. Layouts carry explicit padding so that no
//! byte of a record is left unspecified.
//!
//! Integers are in host byte order. Strings are NUL-terminated inside their
//! fixed-size arrays. Network addresses are stored in network byte order.

#![cfg_attr(not(test), no_std)]

/// Length of the kernel task command name (`TASK_COMM_LEN`).
pub const TASK_COMM_LEN: usize = 16;

/// Maximum captured path length, including the terminating NUL.
pub const PATH_LEN: usize = 256;

/// Maximum number of exec arguments captured after `argv[0]`.
pub const ARGV_MAX: usize = 16;

/// Maximum captured length of a single exec argument, including the NUL.
pub const ARG_LEN: usize = 64;

/// `AF_INET` address family as reported by the connect probe.
pub const AF_INET: u16 = 2;

/// `AF_INET6` address family as reported by the connect probe.
pub const AF_INET6: u16 = 10;

/// Name of the perf event array every probe object writes its records to.
pub const EVENTS_MAP: &str = "EVENTS";

/// Program names inside the exec probe object.
pub mod exec {
    /// Tracepoint program on `syscalls/sys_enter_execve`.
    pub const ENTRY_PROGRAM: &str = "execve_entry";
    /// Tracepoint program on `syscalls/sys_exit_execve`; submits the record.
    pub const EXIT_PROGRAM: &str = "execve_exit";
}

/// Program names inside the open probe object.
pub mod open {
    /// Tracepoint program on `syscalls/sys_enter_openat`.
    pub const ENTRY_PROGRAM: &str = "openat_entry";
    /// Tracepoint program on `syscalls/sys_exit_openat`; submits the record.
    pub const EXIT_PROGRAM: &str = "openat_exit";
}

/// Program names inside the connect probe object.
pub mod connect {
    /// Kprobe on `tcp_v4_connect`, stashes the socket pointer.
    pub const V4_ENTRY_PROGRAM: &str = "tcp_v4_connect_entry";
    /// Kretprobe on `tcp_v4_connect`; submits the record.
    pub const V4_EXIT_PROGRAM: &str = "tcp_v4_connect_exit";
    /// Kprobe on `tcp_v6_connect`, stashes the socket pointer.
    pub const V6_ENTRY_PROGRAM: &str = "tcp_v6_connect_entry";
    /// Kretprobe on `tcp_v6_connect`; submits the record.
    pub const V6_EXIT_PROGRAM: &str = "tcp_v6_connect_exit";
}

/// One completed `execve` call.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExecRecord {
    /// Thread group ID of the calling process.
    pub pid: u32,
    /// Thread group ID of the parent process.
    pub ppid: u32,
    /// cgroup v2 ID of the calling task.
    pub cgroup_id: u64,
    /// Syscall return value.
    pub return_code: i32,
    /// Number of filled `argv` slots.
    pub argc: u32,
    /// Command name of the task after the exec.
    pub comm: [u8; TASK_COMM_LEN],
    /// Path passed to `execve`.
    pub filename: [u8; PATH_LEN],
    /// Arguments following `argv[0]`.
    pub argv: [[u8; ARG_LEN]; ARGV_MAX],
}

/// One completed `openat` call.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OpenRecord {
    /// Thread group ID of the calling process.
    pub pid: u32,
    /// Open flags passed to the syscall.
    pub flags: i32,
    /// cgroup v2 ID of the calling task.
    pub cgroup_id: u64,
    /// Syscall return value.
    pub return_code: i32,
    /// Explicit padding, always zero.
    pub _pad: u32,
    /// Command name of the calling task.
    pub comm: [u8; TASK_COMM_LEN],
    /// Path passed to `openat`.
    pub path: [u8; PATH_LEN],
}

/// One TCP connect attempt, IPv4 or IPv6.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ConnectRecord {
    /// Thread group ID of the calling process.
    pub pid: u32,
    /// Address family, [`AF_INET`] or [`AF_INET6`].
    pub family: u16,
    /// Destination port in host byte order.
    pub dport: u16,
    /// cgroup v2 ID of the calling task.
    pub cgroup_id: u64,
    /// Source address; IPv4 uses the first four bytes.
    pub saddr: [u8; 16],
    /// Destination address; IPv4 uses the first four bytes.
    pub daddr: [u8; 16],
    /// Command name of the calling task.
    pub comm: [u8; TASK_COMM_LEN],
}

/// Size in bytes of an [`ExecRecord`].
pub const EXEC_RECORD_SIZE: usize = core::mem::size_of::<ExecRecord>();

/// Size in bytes of an [`OpenRecord`].
pub const OPEN_RECORD_SIZE: usize = core::mem::size_of::<OpenRecord>();

/// Size in bytes of a [`ConnectRecord`].
pub const CONNECT_RECORD_SIZE: usize = core::mem::size_of::<ConnectRecord>();

impl ExecRecord {
    /// An all-zero record.
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            ppid: 0,
            cgroup_id: 0,
            return_code: 0,
            argc: 0,
            comm: [0; TASK_COMM_LEN],
            filename: [0; PATH_LEN],
            argv: [[0; ARG_LEN]; ARGV_MAX],
        }
    }

    /// Serialize the record exactly as the kernel program lays it out.
    pub fn to_bytes(&self) -> [u8; EXEC_RECORD_SIZE] {
        let mut buf = [0u8; EXEC_RECORD_SIZE];
        put(&mut buf, core::mem::offset_of!(Self, pid), &self.pid.to_ne_bytes());
        put(&mut buf, core::mem::offset_of!(Self, ppid), &self.ppid.to_ne_bytes());
        put(
            &mut buf,
            core::mem::offset_of!(Self, cgroup_id),
            &self.cgroup_id.to_ne_bytes(),
        );
        put(
            &mut buf,
            core::mem::offset_of!(Self, return_code),
            &self.return_code.to_ne_bytes(),
        );
        put(&mut buf, core::mem::offset_of!(Self, argc), &self.argc.to_ne_bytes());
        put(&mut buf, core::mem::offset_of!(Self, comm), &self.comm);
        put(&mut buf, core::mem::offset_of!(Self, filename), &self.filename);
        if let Some(region) = buf.get_mut(core::mem::offset_of!(Self, argv)..) {
            for (slot, arg) in region.chunks_exact_mut(ARG_LEN).zip(self.argv.iter()) {
                slot.copy_from_slice(arg);
            }
        }
        buf
    }
}

impl Default for ExecRecord {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl OpenRecord {
    /// An all-zero record.
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            flags: 0,
            cgroup_id: 0,
            return_code: 0,
            _pad: 0,
            comm: [0; TASK_COMM_LEN],
            path: [0; PATH_LEN],
        }
    }

    /// Serialize the record exactly as the kernel program lays it out.
    pub fn to_bytes(&self) -> [u8; OPEN_RECORD_SIZE] {
        let mut buf = [0u8; OPEN_RECORD_SIZE];
        put(&mut buf, core::mem::offset_of!(Self, pid), &self.pid.to_ne_bytes());
        put(&mut buf, core::mem::offset_of!(Self, flags), &self.flags.to_ne_bytes());
        put(
            &mut buf,
            core::mem::offset_of!(Self, cgroup_id),
            &self.cgroup_id.to_ne_bytes(),
        );
        put(
            &mut buf,
            core::mem::offset_of!(Self, return_code),
            &self.return_code.to_ne_bytes(),
        );
        put(&mut buf, core::mem::offset_of!(Self, comm), &self.comm);
        put(&mut buf, core::mem::offset_of!(Self, path), &self.path);
        buf
    }
}

impl Default for OpenRecord {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl ConnectRecord {
    /// An all-zero record.
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            family: 0,
            dport: 0,
            cgroup_id: 0,
            saddr: [0; 16],
            daddr: [0; 16],
            comm: [0; TASK_COMM_LEN],
        }
    }

    /// Serialize the record exactly as the kernel program lays it out.
    pub fn to_bytes(&self) -> [u8; CONNECT_RECORD_SIZE] {
        let mut buf = [0u8; CONNECT_RECORD_SIZE];
        put(&mut buf, core::mem::offset_of!(Self, pid), &self.pid.to_ne_bytes());
        put(
            &mut buf,
            core::mem::offset_of!(Self, family),
            &self.family.to_ne_bytes(),
        );
        put(&mut buf, core::mem::offset_of!(Self, dport), &self.dport.to_ne_bytes());
        put(
            &mut buf,
            core::mem::offset_of!(Self, cgroup_id),
            &self.cgroup_id.to_ne_bytes(),
        );
        put(&mut buf, core::mem::offset_of!(Self, saddr), &self.saddr);
        put(&mut buf, core::mem::offset_of!(Self, daddr), &self.daddr);
        put(&mut buf, core::mem::offset_of!(Self, comm), &self.comm);
        buf
    }
}

impl Default for ConnectRecord {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Copy `value` into `dst` as a NUL-terminated string, truncating if needed.
///
/// Bytes after the terminator are zeroed.
pub fn write_c_str(dst: &mut [u8], value: &str) {
    dst.fill(0);
    let limit = dst.len().saturating_sub(1);
    for (slot, byte) in dst.iter_mut().zip(value.bytes().take(limit)) {
        *slot = byte;
    }
}

fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    if let Some(dst) = buf
        .get_mut(offset..)
        .and_then(|tail| tail.get_mut(..bytes.len()))
    {
        dst.copy_from_slice(bytes);
    }
}
