//! Tests for loading configuration files.

use std::path::PathBuf;

use session_audit::config::Config;

#[test]
fn load_from_reads_all_sections() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[bpf]
enabled = false
perf_buffer_page_count = 16
cgroup_mount_path = "/sys/fs/cgroup"
object_dir = "/opt/audit/bpf"
queue_capacity = 256

[host]
min_kernel = "5.8.0"
required_libraries = ["libbpf.so.1", "libelf.so.1"]

[audit]
log_path = "/tmp/audit.log"

[logging]
level = "debug"
dir = "/tmp/logs"
"#,
    )
    .expect("write config");

    let mut config = Config::load_from(&path).expect("load");
    assert!(!config.bpf.enabled);
    assert_eq!(config.bpf.perf_buffer_page_count, 16);
    assert_eq!(config.bpf.cgroup_mount_path, PathBuf::from("/sys/fs/cgroup"));
    assert_eq!(config.bpf.queue_capacity, 256);
    assert_eq!(config.host.required_libraries.len(), 2);
    assert_eq!(config.audit.log_path, PathBuf::from("/tmp/audit.log"));
    assert_eq!(config.logging.level, "debug");

    config.check_and_set_defaults().expect("valid");
    let requirements = config.host_requirements().expect("requirements");
    assert_eq!(requirements.min_kernel, semver::Version::new(5, 8, 0));
}

#[test]
fn load_from_reports_parse_errors_with_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[bpf\nenabled = ").expect("write config");

    let err = Config::load_from(&path).expect_err("broken toml");
    assert!(format!("{err:#}").contains("broken.toml"));
}

#[test]
fn unknown_type_is_rejected() {
    let err = Config::from_toml("[bpf]\nperf_buffer_page_count = \"eight\"\n");
    assert!(err.is_err());
}

#[test]
fn rendered_defaults_parse_back() {
    let rendered = toml::to_string_pretty(&Config::default()).expect("render");
    let parsed = Config::from_toml(&rendered).expect("parse");
    assert_eq!(parsed.bpf.perf_buffer_page_count, 8);
    assert_eq!(parsed.bpf.cgroup_mount_path, PathBuf::from("/cgroup2"));
    assert_eq!(parsed.host.min_kernel, "4.18.0");
}
