//! Per-session control groups.
//!
//! The service only needs four primitives from the cgroup layer, captured by
//! [`CgroupManager`]. [`CgroupFs`] implements them on a cgroup v2 mount, where
//! the inode number of a cgroup directory is the ID the kernel reports from
//! `bpf_get_current_cgroup_id`.

use std::fmt;
use std::fs;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Directory under the mount holding one cgroup per session.
const SESSION_ROOT: &str = "session-audit";

/// Interface file listing (and accepting) member PIDs.
const PROCS_FILE: &str = "cgroup.procs";

/// Present only at the root of a cgroup v2 hierarchy.
const CONTROLLERS_FILE: &str = "cgroup.controllers";

/// cgroup layer failures.
#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    /// The session ID cannot be used as a cgroup directory name.
    #[error("invalid session id {0:?}")]
    InvalidName(String),
    /// No cgroup v2 hierarchy at the configured mount path.
    #[error("no cgroup v2 hierarchy mounted at {0}")]
    NotMounted(PathBuf),
    /// A cgroup filesystem operation failed.
    #[error("failed to {action} {path}: {source}")]
    Io {
        /// What was attempted.
        action: &'static str,
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Cgroup lifecycle primitives keyed by session ID.
///
/// Callers serialize mutations for a given session.
pub trait CgroupManager: Send + Sync {
    /// Create the session's cgroup. Succeeds if it already exists.
    fn create(&self, session_id: &str) -> Result<(), CgroupError>;
    /// Move `pid` into the session's cgroup.
    fn place(&self, session_id: &str, pid: u32) -> Result<(), CgroupError>;
    /// Remove the session's cgroup. Succeeds if it does not exist.
    fn remove(&self, session_id: &str) -> Result<(), CgroupError>;
    /// Kernel ID of the session's cgroup.
    fn identify(&self, session_id: &str) -> Result<u64, CgroupError>;
}

/// [`CgroupManager`] over a cgroup v2 filesystem.
///
/// Sessions live at `<mount>/session-audit/<session_id>`.
pub struct CgroupFs {
    mount_path: PathBuf,
    root: PathBuf,
}

impl fmt::Debug for CgroupFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgroupFs")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl CgroupFs {
    /// Open the hierarchy mounted at `mount_path` and create the session root.
    ///
    /// # Errors
    ///
    /// [`CgroupError::NotMounted`] if `mount_path` is not a cgroup v2 root.
    pub fn new(mount_path: impl Into<PathBuf>) -> Result<Self, CgroupError> {
        let mount_path = mount_path.into();
        if !mount_path.join(CONTROLLERS_FILE).exists() {
            return Err(CgroupError::NotMounted(mount_path));
        }
        let root = mount_path.join(SESSION_ROOT);
        fs::create_dir_all(&root).map_err(|source| CgroupError::Io {
            action: "create",
            path: root.clone(),
            source,
        })?;
        tracing::debug!(root = %root.display(), "cgroup session root ready");
        Ok(Self { mount_path, root })
    }

    /// Directory backing `session_id`.
    pub fn session_path(&self, session_id: &str) -> Result<PathBuf, CgroupError> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }

    /// PIDs currently in the session's cgroup.
    pub fn members(&self, session_id: &str) -> Result<Vec<u32>, CgroupError> {
        let path = self.session_path(session_id)?.join(PROCS_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CgroupError::Io {
                    action: "read",
                    path,
                    source,
                })
            }
        };
        Ok(contents
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    fn write_pid(path: &Path, pid: u32) -> Result<(), CgroupError> {
        let io_err = |action: &'static str, source: std::io::Error| CgroupError::Io {
            action,
            path: path.to_path_buf(),
            source,
        };
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| io_err("open", e))?;
        write!(file, "{pid}").map_err(|e| io_err("write", e))
    }
}

impl CgroupManager for CgroupFs {
    fn create(&self, session_id: &str) -> Result<(), CgroupError> {
        let path = self.session_path(session_id)?;
        match fs::create_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(source) => Err(CgroupError::Io {
                action: "create",
                path,
                source,
            }),
        }
    }

    fn place(&self, session_id: &str, pid: u32) -> Result<(), CgroupError> {
        let path = self.session_path(session_id)?.join(PROCS_FILE);
        Self::write_pid(&path, pid)
    }

    fn remove(&self, session_id: &str) -> Result<(), CgroupError> {
        let path = self.session_path(session_id)?;
        if !path.exists() {
            return Ok(());
        }

        // rmdir fails with EBUSY while the cgroup has members.
        let parent_procs = self.mount_path.join(PROCS_FILE);
        for pid in self.members(session_id)? {
            if let Err(e) = Self::write_pid(&parent_procs, pid) {
                tracing::warn!(session_id, pid, error = %e, "failed to move process out of session cgroup");
            }
        }

        match fs::remove_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CgroupError::Io {
                action: "remove",
                path,
                source,
            }),
        }
    }

    fn identify(&self, session_id: &str) -> Result<u64, CgroupError> {
        let path = self.session_path(session_id)?;
        fs::metadata(&path)
            .map(|meta| meta.ino())
            .map_err(|source| CgroupError::Io {
                action: "stat",
                path,
                source,
            })
    }
}

/// Path of the session's cgroup as listed in `/proc/<pid>/cgroup`.
pub fn hierarchy_path(session_id: &str) -> Result<String, CgroupError> {
    validate_session_id(session_id)?;
    Ok(format!("/{SESSION_ROOT}/{session_id}"))
}

/// Whether a `/proc/<pid>/cgroup` listing puts the process in the cgroup v2
/// group at `path`.
pub fn lists_member(proc_cgroup: &str, path: &str) -> bool {
    proc_cgroup
        .lines()
        .any(|line| line.strip_prefix("0::") == Some(path))
}

fn validate_session_id(session_id: &str) -> Result<(), CgroupError> {
    let valid = !session_id.is_empty()
        && session_id != "."
        && session_id != ".."
        && !session_id.contains(['/', '\0']);
    if valid {
        Ok(())
    } else {
        Err(CgroupError::InvalidName(session_id.to_owned()))
    }
}
