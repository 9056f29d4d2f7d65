//! Typed kernel events and their decoders.
//!
//! Raw perf records are read field by field at the offsets of the shared
//! `#[repr(C)]` layouts, so decoding never reinterprets memory. Records
//! longer than the layout are accepted (perf pads samples to 8 bytes);
//! shorter ones are rejected.

use std::mem::offset_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use session_audit_common::{
    ConnectRecord, ExecRecord, OpenRecord, AF_INET, AF_INET6, ARGV_MAX, ARG_LEN,
    CONNECT_RECORD_SIZE, EXEC_RECORD_SIZE, OPEN_RECORD_SIZE, PATH_LEN, TASK_COMM_LEN,
};

use crate::events::{self, EventFields, EventType};

use super::{ProbeEvent, ProbeKind};

/// Why a raw record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The record is shorter than its layout.
    #[error("record too short: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Layout size in bytes.
        expected: usize,
        /// Received size in bytes.
        actual: usize,
    },
    /// The connect record carries an address family other than IPv4/IPv6.
    #[error("unsupported address family {0}")]
    UnknownFamily(u16),
}

/// A process called `execve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecEvent {
    /// Calling process.
    pub pid: u32,
    /// Parent of the calling process.
    pub ppid: u32,
    /// cgroup the process ran in.
    pub cgroup_id: u64,
    /// Command name.
    pub program: String,
    /// Executable path.
    pub path: String,
    /// Arguments following `argv[0]`.
    pub argv: Vec<String>,
    /// Syscall return value.
    pub return_code: i32,
}

/// A process called `openat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenEvent {
    /// Calling process.
    pub pid: u32,
    /// cgroup the process ran in.
    pub cgroup_id: u64,
    /// Command name.
    pub program: String,
    /// Opened path.
    pub path: String,
    /// Open flags.
    pub flags: i32,
    /// Syscall return value.
    pub return_code: i32,
}

/// A process initiated a TCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectEvent {
    /// Calling process.
    pub pid: u32,
    /// cgroup the process ran in.
    pub cgroup_id: u64,
    /// Command name.
    pub program: String,
    /// Local address.
    pub src_addr: IpAddr,
    /// Remote address.
    pub dst_addr: IpAddr,
    /// Remote port.
    pub dst_port: u16,
    /// IP version, 4 or 6.
    pub version: u8,
}

impl ProbeEvent for ExecEvent {
    const KIND: ProbeKind = ProbeKind::Exec;
    const EVENT_TYPE: EventType = EventType::SessionExec;
    const RECORD_SIZE: usize = EXEC_RECORD_SIZE;

    fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let raw = checked(raw, EXEC_RECORD_SIZE)?;
        let argc = usize::try_from(u32_at(raw, offset_of!(ExecRecord, argc)))
            .unwrap_or(ARGV_MAX)
            .min(ARGV_MAX);
        let argv = raw
            .get(offset_of!(ExecRecord, argv)..)
            .unwrap_or_default()
            .chunks_exact(ARG_LEN)
            .take(argc)
            .map(c_string)
            .collect();

        Ok(Self {
            pid: u32_at(raw, offset_of!(ExecRecord, pid)),
            ppid: u32_at(raw, offset_of!(ExecRecord, ppid)),
            cgroup_id: u64_at(raw, offset_of!(ExecRecord, cgroup_id)),
            program: str_at(raw, offset_of!(ExecRecord, comm), TASK_COMM_LEN),
            path: str_at(raw, offset_of!(ExecRecord, filename), PATH_LEN),
            argv,
            return_code: i32_at(raw, offset_of!(ExecRecord, return_code)),
        })
    }

    fn cgroup_id(&self) -> u64 {
        self.cgroup_id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn append_fields(&self, fields: &mut EventFields) {
        fields.insert(events::PID.to_owned(), self.pid.into());
        fields.insert(events::PPID.to_owned(), self.ppid.into());
        fields.insert(events::CGROUP_ID.to_owned(), self.cgroup_id.into());
        fields.insert(events::PROGRAM.to_owned(), self.program.clone().into());
        fields.insert(events::PATH.to_owned(), self.path.clone().into());
        fields.insert(events::ARGV.to_owned(), self.argv.clone().into());
        fields.insert(events::RETURN_CODE.to_owned(), self.return_code.into());
    }
}

impl ProbeEvent for OpenEvent {
    const KIND: ProbeKind = ProbeKind::Open;
    const EVENT_TYPE: EventType = EventType::SessionOpen;
    const RECORD_SIZE: usize = OPEN_RECORD_SIZE;

    fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let raw = checked(raw, OPEN_RECORD_SIZE)?;
        Ok(Self {
            pid: u32_at(raw, offset_of!(OpenRecord, pid)),
            cgroup_id: u64_at(raw, offset_of!(OpenRecord, cgroup_id)),
            program: str_at(raw, offset_of!(OpenRecord, comm), TASK_COMM_LEN),
            path: str_at(raw, offset_of!(OpenRecord, path), PATH_LEN),
            flags: i32_at(raw, offset_of!(OpenRecord, flags)),
            return_code: i32_at(raw, offset_of!(OpenRecord, return_code)),
        })
    }

    fn cgroup_id(&self) -> u64 {
        self.cgroup_id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn append_fields(&self, fields: &mut EventFields) {
        fields.insert(events::PID.to_owned(), self.pid.into());
        fields.insert(events::CGROUP_ID.to_owned(), self.cgroup_id.into());
        fields.insert(events::PROGRAM.to_owned(), self.program.clone().into());
        fields.insert(events::PATH.to_owned(), self.path.clone().into());
        fields.insert(events::FLAGS.to_owned(), self.flags.into());
        fields.insert(events::RETURN_CODE.to_owned(), self.return_code.into());
    }
}

impl ProbeEvent for ConnectEvent {
    const KIND: ProbeKind = ProbeKind::Connect;
    const EVENT_TYPE: EventType = EventType::SessionConnect;
    const RECORD_SIZE: usize = CONNECT_RECORD_SIZE;

    fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let raw = checked(raw, CONNECT_RECORD_SIZE)?;
        let family = u16::from_ne_bytes(array_at(raw, offset_of!(ConnectRecord, family)));
        let saddr: [u8; 16] = array_at(raw, offset_of!(ConnectRecord, saddr));
        let daddr: [u8; 16] = array_at(raw, offset_of!(ConnectRecord, daddr));

        let (src_addr, dst_addr, version) = match family {
            AF_INET => (ipv4(&saddr), ipv4(&daddr), 4),
            AF_INET6 => (
                IpAddr::V6(Ipv6Addr::from(saddr)),
                IpAddr::V6(Ipv6Addr::from(daddr)),
                6,
            ),
            other => return Err(DecodeError::UnknownFamily(other)),
        };

        Ok(Self {
            pid: u32_at(raw, offset_of!(ConnectRecord, pid)),
            cgroup_id: u64_at(raw, offset_of!(ConnectRecord, cgroup_id)),
            program: str_at(raw, offset_of!(ConnectRecord, comm), TASK_COMM_LEN),
            src_addr,
            dst_addr,
            dst_port: u16::from_ne_bytes(array_at(raw, offset_of!(ConnectRecord, dport))),
            version,
        })
    }

    fn cgroup_id(&self) -> u64 {
        self.cgroup_id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn append_fields(&self, fields: &mut EventFields) {
        fields.insert(events::PID.to_owned(), self.pid.into());
        fields.insert(events::CGROUP_ID.to_owned(), self.cgroup_id.into());
        fields.insert(events::PROGRAM.to_owned(), self.program.clone().into());
        fields.insert(events::SRC_ADDR.to_owned(), self.src_addr.to_string().into());
        fields.insert(events::DST_ADDR.to_owned(), self.dst_addr.to_string().into());
        fields.insert(events::DST_PORT.to_owned(), self.dst_port.into());
        fields.insert(events::TCP_VERSION.to_owned(), self.version.into());
    }
}

/// Reject records shorter than `size`, and cut padding beyond it.
fn checked(raw: &[u8], size: usize) -> Result<&[u8], DecodeError> {
    raw.get(..size).ok_or(DecodeError::Truncated {
        expected: size,
        actual: raw.len(),
    })
}

// Callers pass offsets inside a length-checked record; zeroes are returned
// only if a layout constant and the check disagree.
fn array_at<const N: usize>(raw: &[u8], offset: usize) -> [u8; N] {
    raw.get(offset..)
        .and_then(|tail| tail.get(..N))
        .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
        .unwrap_or([0; N])
}

fn u32_at(raw: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(array_at(raw, offset))
}

fn i32_at(raw: &[u8], offset: usize) -> i32 {
    i32::from_ne_bytes(array_at(raw, offset))
}

fn u64_at(raw: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(array_at(raw, offset))
}

fn str_at(raw: &[u8], offset: usize, len: usize) -> String {
    raw.get(offset..)
        .and_then(|tail| tail.get(..len))
        .map(c_string)
        .unwrap_or_default()
}

/// Text up to the first NUL; invalid UTF-8 is replaced, not rejected.
fn c_string(field: &[u8]) -> String {
    let text = field.split(|byte| *byte == 0).next().unwrap_or_default();
    String::from_utf8_lossy(text).into_owned()
}

fn ipv4(addr: &[u8; 16]) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]))
}
