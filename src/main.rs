//! session-audit CLI entry point.
//!
//! Provides `check`, `config`, and `exec` subcommands for verifying the host,
//! printing the effective configuration, or running a command inside an
//! audited session.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::os::unix::process::CommandExt;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use session_audit::audit::JsonAuditLog;
use session_audit::cgroup;
use session_audit::config::Config;
use session_audit::host;
use session_audit::events::AuditSink;
use session_audit::service::auditor;
use session_audit::session::SessionContext;

/// session-audit: kernel-level auditing of login sessions.
#[derive(Parser)]
#[command(name = "session-audit", version, about)]
struct Cli {
    /// Config file (default: `$SESSION_AUDIT_CONFIG` or `/etc/session-audit/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Check that this host can run the probes.
    Check,
    /// Print the effective configuration as TOML.
    Config,
    /// Run a command in an audited session and exit with its status.
    ///
    /// The command starts only once it is inside the session cgroup. If the
    /// session cannot be audited it runs unaudited.
    Exec {
        /// OS login recorded for the session (default: `$USER`).
        #[arg(long)]
        login: Option<String>,
        /// Cluster user recorded for the session (default: the login).
        #[arg(long)]
        user: Option<String>,
        /// Namespace recorded for the session.
        #[arg(long, default_value = "default")]
        namespace: String,
        /// Command and arguments.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Wait until this process is in `cgroup`, then exec the command.
    #[command(hide = true)]
    Gate {
        /// Cgroup path as listed in `/proc/self/cgroup`.
        #[arg(long)]
        cgroup: String,
        /// Give up after this many milliseconds.
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
        /// Command and arguments.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

/// Poll interval while gated.
const GATE_POLL: Duration = Duration::from_millis(5);

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let command = match cli.command {
        // No config or logging in the gate.
        Command::Gate {
            cgroup,
            timeout_ms,
            command,
        } => return handle_gate(&cgroup, Duration::from_millis(timeout_ms), &command).await,
        command => command,
    };
    let config = load_config(cli.config)?;

    match command {
        Command::Check => handle_check(&config),
        Command::Config => handle_config(&config),
        Command::Exec {
            login,
            user,
            namespace,
            command,
        } => handle_exec(config, login, user, namespace, command).await,
        Command::Gate { .. } => unreachable!("handled above"),
    }
}

/// Load configuration with env overrides, from `path` when given.
fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load_from(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            config.apply_overrides(|key| std::env::var(key).ok());
            Ok(config)
        }
        None => Config::load().context("failed to load configuration"),
    }
}

/// Run the host compatibility check once and report.
fn handle_check(config: &Config) -> anyhow::Result<ExitCode> {
    session_audit::logging::init_cli(&config.logging.level);

    let requirements = config
        .host_requirements()
        .context("invalid [host] configuration")?;
    match host::check(&requirements) {
        Ok(()) => {
            println!(
                "host supports session auditing (kernel >= {}, libraries: {})",
                requirements.min_kernel,
                requirements.required_libraries.join(", ")
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("host cannot run session auditing: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Print the effective configuration.
fn handle_config(config: &Config) -> anyhow::Result<ExitCode> {
    let rendered = toml::to_string_pretty(config).context("failed to render configuration")?;
    print!("{rendered}");
    Ok(ExitCode::SUCCESS)
}

/// Run `command` in an audited session.
///
/// Audit failures are logged and never prevent the command from running.
async fn handle_exec(
    config: Config,
    login: Option<String>,
    user: Option<String>,
    namespace: String,
    command: Vec<String>,
) -> anyhow::Result<ExitCode> {
    let _logging_guard =
        session_audit::logging::init_daemon(&config.logging.dir, &config.logging.level)?;

    let audit_log: Arc<dyn AuditSink> = Arc::new(
        JsonAuditLog::new(&config.audit.log_path).context("failed to open audit log")?,
    );
    let enabled = config.bpf.enabled;
    let auditor = match auditor(config).await {
        Ok(auditor) => Some(auditor),
        Err(e) => {
            error!(error = %e, "session auditing unavailable, running unaudited");
            None
        }
    };

    let login = login
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "root".to_owned());
    let session_id = uuid::Uuid::new_v4().to_string();
    let session = |pid: u32| {
        Arc::new(SessionContext {
            session_id: session_id.clone(),
            server_id: server_id(),
            namespace: namespace.clone(),
            user: user.clone().unwrap_or_else(|| login.clone()),
            login: login.clone(),
            pid,
            audit_log: Arc::clone(&audit_log),
        })
    };

    let (mut child, ctx, audited) = match auditor.as_deref().filter(|_| enabled) {
        Some(auditor) => {
            let mut gate = spawn_gated(&session_id, &command)?;
            let ctx = session(gate.id().unwrap_or_default());
            match auditor.open_session(&ctx) {
                Ok(()) => (gate, ctx, true),
                Err(e) => {
                    warn!(session_id = %ctx.session_id, error = %e, "failed to open session audit");
                    // Still waiting, so the command has not started.
                    if let Err(e) = gate.kill().await {
                        warn!(error = %e, "failed to stop gated command");
                    }
                    let child = spawn(&command)?;
                    let ctx = session(child.id().unwrap_or_default());
                    (child, ctx, false)
                }
            }
        }
        None => {
            let child = spawn(&command)?;
            let ctx = session(child.id().unwrap_or_default());
            (child, ctx, false)
        }
    };
    info!(session_id = %ctx.session_id, pid = ctx.pid, audited, "session started");

    let status = child.wait().await.context("failed to wait for command")?;

    if let Some(auditor) = &auditor {
        if audited {
            if let Err(e) = auditor.close_session(&ctx) {
                warn!(session_id = %ctx.session_id, error = %e, "failed to close session audit");
            }
        }
        if let Err(e) = auditor.close() {
            warn!(error = %e, "failed to close session auditor");
        }
    }
    info!(session_id = %ctx.session_id, %status, "session ended");

    let code = status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1);
    Ok(ExitCode::from(code))
}

/// Start `command` directly.
fn spawn(command: &[String]) -> anyhow::Result<tokio::process::Child> {
    let (program, args) = command.split_first().context("no command given")?;
    tokio::process::Command::new(program)
        .args(args)
        .spawn()
        .with_context(|| format!("failed to start {program}"))
}

/// Start `command` behind a gate that holds it until the session cgroup
/// has been joined.
fn spawn_gated(session_id: &str, command: &[String]) -> anyhow::Result<tokio::process::Child> {
    let exe = std::env::current_exe().context("failed to locate own executable")?;
    let cgroup = cgroup::hierarchy_path(session_id)?;
    tokio::process::Command::new(exe)
        .arg("gate")
        .arg("--cgroup")
        .arg(cgroup)
        .arg("--")
        .args(command)
        .spawn()
        .context("failed to start gated command")
}

/// Wait to be placed in `cgroup`, then replace this process with `command`.
async fn handle_gate(cgroup: &str, timeout: Duration, command: &[String]) -> anyhow::Result<ExitCode> {
    let (program, args) = command.split_first().context("no command given")?;
    let deadline = Instant::now().checked_add(timeout);
    loop {
        let listing = tokio::fs::read_to_string("/proc/self/cgroup")
            .await
            .context("failed to read /proc/self/cgroup")?;
        if cgroup::lists_member(&listing, cgroup) {
            break;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            anyhow::bail!("not placed in {cgroup} within {timeout:?}");
        }
        tokio::time::sleep(GATE_POLL).await;
    }

    let err = std::process::Command::new(program).args(args).exec();
    Err(err).with_context(|| format!("failed to exec {program}"))
}

/// Host name recorded as the server ID.
fn server_id() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|name| name.trim().to_owned())
        .unwrap_or_else(|_| "localhost".to_owned())
}
