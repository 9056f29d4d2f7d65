//! CLI contract tests.

use std::path::Path;
use std::process::Output;

use assert_cmd::Command;

fn session_audit(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("session-audit").expect("binary should build");
    cmd.env("SESSION_AUDIT_CONFIG", config)
        .env_remove("SESSION_AUDIT_PERF_PAGES")
        .env_remove("SESSION_AUDIT_LOG_LEVEL");
    cmd
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Config with auditing disabled and all paths inside `dir`.
fn disabled_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("config.toml");
    std::fs::write(
        &path,
        format!(
            "[bpf]\nenabled = false\n\n[audit]\nlog_path = \"{}\"\n\n[logging]\ndir = \"{}\"\n",
            dir.join("audit.log").display(),
            dir.join("logs").display()
        ),
    )
    .expect("write config");
    path
}

#[test]
fn help_lists_subcommands() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let output = session_audit(&tmp.path().join("absent.toml"))
        .arg("--help")
        .output()
        .expect("run");
    assert!(output.status.success());
    let text = stdout(&output);
    for subcommand in ["check", "config", "exec"] {
        assert!(text.contains(subcommand), "missing {subcommand}");
    }
}

#[test]
fn config_prints_effective_values() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[bpf]\nperf_buffer_page_count = 16\n").expect("write config");

    let output = session_audit(&path).arg("config").output().expect("run");
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("perf_buffer_page_count = 16"), "{text}");
    assert!(text.contains("min_kernel = \"4.18.0\""), "{text}");
}

#[test]
fn explicit_config_flag_wins() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("other.toml");
    std::fs::write(&path, "[bpf]\nqueue_capacity = 7\n").expect("write config");

    let output = session_audit(&tmp.path().join("absent.toml"))
        .arg("--config")
        .arg(&path)
        .arg("config")
        .output()
        .expect("run");
    assert!(output.status.success());
    assert!(stdout(&output).contains("queue_capacity = 7"));
}

#[test]
fn check_fails_on_unsupported_kernel() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[host]\nmin_kernel = \"999.0.0\"\nrequired_libraries = []\n")
        .expect("write config");

    let output = session_audit(&path).arg("check").output().expect("run");
    assert!(!output.status.success());
    assert!(stdout(&output).contains("cannot run"));
}

#[test]
fn exec_requires_a_command() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let output = session_audit(&disabled_config(tmp.path()))
        .arg("exec")
        .output()
        .expect("run");
    assert!(!output.status.success());
}

#[test]
fn exec_propagates_exit_status() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = disabled_config(tmp.path());

    let output = session_audit(&config)
        .args(["exec", "--", "true"])
        .output()
        .expect("run");
    assert!(output.status.success());

    let output = session_audit(&config)
        .args(["exec", "--", "sh", "-c", "exit 3"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(3));
    assert!(tmp.path().join("logs").exists());
}

/// This process's cgroup v2 path, if the host has a unified hierarchy.
fn own_cgroup() -> Option<String> {
    let listing = std::fs::read_to_string("/proc/self/cgroup").ok()?;
    listing
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(str::to_owned)
}

#[test]
fn gate_runs_command_once_in_cgroup() {
    let Some(cgroup) = own_cgroup() else {
        return;
    };
    let tmp = tempfile::tempdir().expect("tempdir");
    let output = session_audit(&tmp.path().join("absent.toml"))
        .args(["gate", "--cgroup", &cgroup, "--", "sh", "-c", "echo started; exit 4"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(4));
    assert!(stdout(&output).contains("started"));
}

#[test]
fn gate_never_runs_command_outside_cgroup() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let marker = tmp.path().join("ran");
    let output = session_audit(&tmp.path().join("absent.toml"))
        .args([
            "gate",
            "--cgroup",
            "/session-audit/never-created",
            "--timeout-ms",
            "50",
            "--",
            "touch",
        ])
        .arg(&marker)
        .output()
        .expect("run");
    assert!(!output.status.success());
    assert!(!marker.exists());
}

#[test]
fn gate_is_hidden_from_help() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let output = session_audit(&tmp.path().join("absent.toml"))
        .arg("--help")
        .output()
        .expect("run");
    assert!(!stdout(&output).contains("gate"));
}
