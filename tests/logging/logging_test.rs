//! Tests for `src/logging.rs`.

use session_audit::logging::LoggingGuard;

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn init_daemon_creates_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    assert!(!logs_dir.exists());

    // Only one global subscriber per process; a second install reports an
    // error after the directory is created.
    let _result = session_audit::logging::init_daemon(&logs_dir, "debug");
    assert!(logs_dir.exists(), "logs directory should be created");

    // Already installed: must not panic.
    session_audit::logging::init_cli("info");
}
