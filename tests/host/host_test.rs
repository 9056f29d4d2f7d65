//! Tests for kernel version gating and library discovery.

use std::path::PathBuf;

use semver::Version;
use session_audit::host::{
    check, check_kernel_release, find_library, HostError, HostRequirements,
};

fn minimum() -> Version {
    HostRequirements::default().min_kernel
}

#[test]
fn exactly_the_minimum_kernel_passes() {
    let found = check_kernel_release("4.18.0", &minimum()).expect("minimum passes");
    assert_eq!(found, Version::new(4, 18, 0));
}

#[test]
fn older_kernel_is_incompatible() {
    let err = check_kernel_release("4.17.19-arch1", &minimum()).expect_err("too old");
    match err {
        HostError::IncompatibleHost { found, minimum } => {
            assert_eq!(found, Version::new(4, 17, 19));
            assert_eq!(minimum, Version::new(4, 18, 0));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn newer_kernels_pass() {
    for release in ["4.18.1", "4.19.0", "5.4.0-150-generic", "6.8.0+"] {
        check_kernel_release(release, &minimum()).expect(release);
    }
}

#[test]
fn unparseable_release_is_reported() {
    let err = check_kernel_release("linux", &minimum()).expect_err("no version");
    assert!(matches!(err, HostError::UnknownKernel(_)));
}

#[test]
fn library_found_in_later_directory() {
    let first = tempfile::tempdir().expect("tempdir");
    let second = tempfile::tempdir().expect("tempdir");
    let lib = second.path().join("libbpf.so.1");
    std::fs::write(&lib, b"\x7fELF\x02\x01\x01\0rest-of-header").expect("write");

    let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];
    assert_eq!(find_library("libbpf.so.1", &dirs).expect("found"), lib);
}

#[test]
fn non_elf_file_is_not_a_library() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("libbpf.so.1"), "INPUT(libbpf.so.1.4)").expect("write");

    let err = find_library("libbpf.so.1", &[dir.path().to_path_buf()]).expect_err("linker script");
    assert!(matches!(err, HostError::MissingDependency(name) if name == "libbpf.so.1"));
}

#[test]
fn missing_library_is_reported() {
    let err = find_library("libnothere.so.9", &[PathBuf::from("/nonexistent")])
        .expect_err("absent");
    assert!(matches!(err, HostError::MissingDependency(_)));
}

#[test]
fn running_host_meets_a_trivial_requirement() {
    let requirements = HostRequirements {
        min_kernel: Version::new(0, 0, 0),
        required_libraries: Vec::new(),
    };
    check(&requirements).expect("any linux kernel passes");
}
