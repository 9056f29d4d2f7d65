//! Host compatibility check run once before any probe is loaded.
//!
//! Two things must hold on the host: the running kernel is at least the
//! configured minimum release, and every required shared library resolves in
//! the dynamic linker's search path.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use semver::Version;

/// Release file exposed by procfs.
const OSRELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

/// Linker configuration consulted for extra library directories.
const LD_SO_CONF: &str = "/etc/ld.so.conf";

/// Nesting limit for `include` directives in the linker configuration.
const MAX_INCLUDE_DEPTH: usize = 4;

/// Directories searched after `LD_LIBRARY_PATH` and the linker configuration.
const STANDARD_LIBRARY_DIRS: &[&str] = &[
    "/lib",
    "/usr/lib",
    "/lib64",
    "/usr/lib64",
    "/lib/x86_64-linux-gnu",
    "/usr/lib/x86_64-linux-gnu",
    "/lib/aarch64-linux-gnu",
    "/usr/lib/aarch64-linux-gnu",
    "/usr/local/lib",
];

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Why the host cannot run the probes.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The kernel is older than the minimum supported release.
    #[error("kernel {found} is older than the minimum supported {minimum}")]
    IncompatibleHost {
        /// Running kernel release.
        found: Version,
        /// Minimum supported release.
        minimum: Version,
    },
    /// The kernel release string could not be parsed.
    #[error("unrecognized kernel release {0:?}")]
    UnknownKernel(String),
    /// The kernel release could not be read.
    #[error("failed to read kernel release: {0}")]
    KernelRelease(#[source] std::io::Error),
    /// A required shared library is not installed.
    #[error("required library {0} not found")]
    MissingDependency(String),
}

/// What the host must provide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRequirements {
    /// Oldest kernel release that can run the probes.
    pub min_kernel: Version,
    /// Shared libraries that must resolve. Empty disables the check.
    pub required_libraries: Vec<String>,
}

impl Default for HostRequirements {
    // 4.18 is the first release with bpf_get_current_cgroup_id.
    fn default() -> Self {
        Self {
            min_kernel: Version::new(4, 18, 0),
            required_libraries: vec!["libbpf.so.1".to_owned()],
        }
    }
}

/// Verify the running host against `requirements`.
///
/// # Errors
///
/// Returns the first unmet requirement.
pub fn check(requirements: &HostRequirements) -> Result<(), HostError> {
    let release = std::fs::read_to_string(OSRELEASE_PATH).map_err(HostError::KernelRelease)?;
    let found = check_kernel_release(release.trim(), &requirements.min_kernel)?;
    tracing::debug!(kernel = %found, "kernel release supported");

    if requirements.required_libraries.is_empty() {
        return Ok(());
    }
    let dirs = library_search_dirs();
    for name in &requirements.required_libraries {
        let path = find_library(name, &dirs)?;
        tracing::debug!(library = %name, path = %path.display(), "found required library");
    }
    Ok(())
}

/// Compare a kernel release string such as `5.15.0-91-generic` with `minimum`.
///
/// # Errors
///
/// [`HostError::UnknownKernel`] when the release cannot be parsed,
/// [`HostError::IncompatibleHost`] when it is older than `minimum`.
pub fn check_kernel_release(release: &str, minimum: &Version) -> Result<Version, HostError> {
    let found =
        parse_kernel_release(release).ok_or_else(|| HostError::UnknownKernel(release.to_owned()))?;
    if found < *minimum {
        return Err(HostError::IncompatibleHost {
            found,
            minimum: minimum.clone(),
        });
    }
    Ok(found)
}

/// Extract `major.minor.patch` from a kernel release, ignoring any
/// distribution suffix. A missing patch component reads as 0.
pub fn parse_kernel_release(release: &str) -> Option<Version> {
    let mut parts = release
        .split(|c: char| !c.is_ascii_digit())
        .map(str::parse::<u64>);

    let major = parts.next()?.ok()?;
    let minor = parts.next()?.ok()?;
    // "4.18-rc1" has no patch; the next component belongs to the suffix.
    let numeric_prefix = release
        .split(['-', '+', '_', ' '])
        .next()
        .unwrap_or_default();
    let patch = if numeric_prefix.split('.').count() >= 3 {
        parts.next().and_then(Result::ok).unwrap_or(0)
    } else {
        0
    };
    Some(Version::new(major, minor, patch))
}

/// Locate `name` in `dirs` and confirm it is an ELF object.
///
/// # Errors
///
/// [`HostError::MissingDependency`] when no directory holds a readable ELF
/// file with that name.
pub fn find_library(name: &str, dirs: &[PathBuf]) -> Result<PathBuf, HostError> {
    dirs.iter()
        .map(|dir| dir.join(name))
        .find(|candidate| is_elf(candidate))
        .ok_or_else(|| HostError::MissingDependency(name.to_owned()))
}

// The handle is dropped on every return path.
fn is_elf(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).is_ok() && magic == ELF_MAGIC
}

/// Directories the dynamic linker would search, in order.
pub fn library_search_dirs() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = std::env::var("LD_LIBRARY_PATH")
        .map(|value| {
            value
                .split(':')
                .filter(|entry| !entry.is_empty())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default();

    ld_so_conf_dirs(Path::new(LD_SO_CONF), 0, &mut dirs);

    for dir in STANDARD_LIBRARY_DIRS {
        let dir = PathBuf::from(dir);
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}

/// Collect directories from a linker configuration file, following
/// `include` directives.
fn ld_so_conf_dirs(conf: &Path, depth: usize, dirs: &mut Vec<PathBuf>) {
    if depth > MAX_INCLUDE_DEPTH {
        return;
    }
    let Ok(contents) = std::fs::read_to_string(conf) else {
        return;
    };
    for line in contents.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        if let Some(pattern) = line.strip_prefix("include") {
            for included in expand_include(conf, pattern.trim()) {
                ld_so_conf_dirs(&included, depth.saturating_add(1), dirs);
            }
        } else {
            let dir = PathBuf::from(line);
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
    }
}

/// Resolve an include pattern relative to the including file. Matches are
/// visited in sorted order; an unreadable entry is skipped.
fn expand_include(conf: &Path, pattern: &str) -> Vec<PathBuf> {
    let pattern = match conf.parent() {
        Some(base) if !pattern.starts_with('/') => base.join(pattern),
        _ => PathBuf::from(pattern),
    };
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };
    let entries = match glob::glob(pattern) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(pattern, error = %e, "invalid include pattern in linker configuration");
            return Vec::new();
        }
    };

    let mut matches: Vec<PathBuf> = entries.filter_map(Result::ok).collect();
    matches.sort();
    matches
}
