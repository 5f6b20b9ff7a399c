//! Isolated execution of untrusted generated code.
//!
//! Each call runs in a fresh child process inside a scratch directory that is
//! removed on exit; no state persists across calls. Wall-clock, CPU, memory,
//! output-size, and open-file limits all terminate the run with a structured
//! `kill_reason`. CPU and memory caps ride on `ulimit` in the wrapping shell
//! on unix; the wall-clock timeout is the portable backstop.

mod scan;

pub use scan::{ScanFinding, SecurityScanner};

use crate::errors::SandboxError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Per-call resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub timeout_seconds: u64,
    pub max_cpu_seconds: u64,
    pub max_memory_bytes: u64,
    pub max_output_bytes: usize,
    pub max_open_files: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout_seconds: 60,
            max_cpu_seconds: 30,
            max_memory_bytes: 2 * 1024 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            max_open_files: 64,
        }
    }
}

/// Why a run was terminated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    Timeout,
    Memory,
    Cpu,
    OutputSize,
    SecurityScan,
}

impl KillReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillReason::Timeout => "timeout",
            KillReason::Memory => "memory",
            KillReason::Cpu => "cpu",
            KillReason::OutputSize => "output_size",
            KillReason::SecurityScan => "security_scan",
        }
    }
}

/// Structured verdict for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_seconds: f64,
    pub killed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_reason: Option<KillReason>,
    /// Security-scan hits, present when the scan aborted the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scan_findings: Vec<String>,
}

impl ExecutionResult {
    fn scan_rejected(findings: Vec<ScanFinding>) -> Self {
        Self {
            success: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration_seconds: 0.0,
            killed: true,
            kill_reason: Some(KillReason::SecurityScan),
            scan_findings: findings
                .into_iter()
                .map(|f| format!("{}: {}", f.label, f.excerpt))
                .collect(),
        }
    }
}

/// Supported interpreters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Shell,
}

impl Language {
    pub fn parse(s: &str) -> Result<Self, SandboxError> {
        match s.to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            "shell" | "sh" | "bash" => Ok(Language::Shell),
            other => Err(SandboxError::UnsupportedLanguage(other.to_string())),
        }
    }

    fn file_name(&self) -> &'static str {
        match self {
            Language::Python => "main.py",
            Language::Javascript => "main.js",
            Language::Shell => "main.sh",
        }
    }

    fn interpreter(&self) -> &'static str {
        match self {
            Language::Python => "python3",
            Language::Javascript => "node",
            Language::Shell => "sh",
        }
    }
}

/// Runs code in fresh, resource-bounded child processes.
pub struct SandboxExecutor {
    limits: ResourceLimits,
    scanner: SecurityScanner,
}

impl SandboxExecutor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            scanner: SecurityScanner::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ResourceLimits::default())
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Execute code under the given (or default) limits.
    ///
    /// With `scan_security` the code is matched against the forbidden-pattern
    /// set first; any hit aborts before a process is spawned.
    pub async fn execute(
        &self,
        code: &str,
        language: Language,
        limits: Option<&ResourceLimits>,
        scan_security: bool,
        token: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let limits = limits.unwrap_or(&self.limits);

        if scan_security {
            let findings = self.scanner.scan(code);
            if !findings.is_empty() {
                tracing::warn!(findings = findings.len(), "sandbox security scan rejected code");
                return Ok(ExecutionResult::scan_rejected(findings));
            }
        }

        // Fresh scratch directory, removed when the guard drops.
        let scratch = tempfile::tempdir().context("Failed to create sandbox scratch dir")?;
        let code_path = scratch.path().join(language.file_name());
        std::fs::write(&code_path, code)
            .with_context(|| format!("Failed to write sandbox code: {}", code_path.display()))?;

        let mut cmd = build_command(language, limits, &code_path);
        cmd.current_dir(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(SandboxError::SpawnFailed)?;

        let mut stdout_pipe = child.stdout.take().context("sandbox stdout missing")?;
        let mut stderr_pipe = child.stderr.take().context("sandbox stderr missing")?;
        let cap = limits.max_output_bytes;

        // Read one byte past the cap so overflow is detectable.
        let collect = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let mut stdout_limited = (&mut stdout_pipe).take(cap as u64 + 1);
            let mut stderr_limited = (&mut stderr_pipe).take(cap as u64 + 1);
            let (out_res, err_res) = tokio::join!(
                stdout_limited.read_to_end(&mut stdout_buf),
                stderr_limited.read_to_end(&mut stderr_buf),
            );
            out_res.context("Failed to read sandbox stdout")?;
            err_res.context("Failed to read sandbox stderr")?;
            let status = child
                .wait()
                .await
                .context("Failed to wait for sandbox process")?;
            Ok::<_, anyhow::Error>((status, stdout_buf, stderr_buf))
        };

        let outcome = tokio::select! {
            res = collect => Some(res.map_err(SandboxError::Other)?),
            _ = tokio::time::sleep(Duration::from_secs(limits.timeout_seconds)) => None,
            _ = token.cancelled() => None,
        };

        let duration_seconds = start.elapsed().as_secs_f64();

        let Some((status, stdout_buf, stderr_buf)) = outcome else {
            // Timeout or cancellation: the collect future was dropped, so we
            // own the child again. Kill it and report a timeout.
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Ok(ExecutionResult {
                success: false,
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                duration_seconds,
                killed: true,
                kill_reason: Some(KillReason::Timeout),
                scan_findings: Vec::new(),
            });
        };

        let output_overflow = stdout_buf.len() > cap || stderr_buf.len() > cap;
        let mut stdout = String::from_utf8_lossy(&stdout_buf).into_owned();
        let mut stderr = String::from_utf8_lossy(&stderr_buf).into_owned();
        truncate_to(&mut stdout, cap);
        truncate_to(&mut stderr, cap);

        if output_overflow {
            return Ok(ExecutionResult {
                success: false,
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
                duration_seconds,
                killed: true,
                kill_reason: Some(KillReason::OutputSize),
                scan_findings: Vec::new(),
            });
        }

        let exit_code = status.code().unwrap_or(-1);
        let kill_reason = classify_abnormal_exit(&status, &stderr);
        let killed = kill_reason.is_some();

        Ok(ExecutionResult {
            success: status.success() && !killed,
            exit_code,
            stdout,
            stderr,
            duration_seconds,
            killed,
            kill_reason,
            scan_findings: Vec::new(),
        })
    }
}

/// Build the interpreter invocation, applying `ulimit` caps on unix.
fn build_command(language: Language, limits: &ResourceLimits, code_path: &std::path::Path) -> Command {
    #[cfg(unix)]
    {
        let shell_line = format!(
            "ulimit -t {} -v {} -n {}; exec {} '{}'",
            limits.max_cpu_seconds,
            limits.max_memory_bytes / 1024,
            limits.max_open_files,
            language.interpreter(),
            code_path.display(),
        );
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(shell_line);
        cmd
    }
    #[cfg(not(unix))]
    {
        let _ = limits;
        let mut cmd = Command::new(language.interpreter());
        cmd.arg(code_path);
        cmd
    }
}

/// Byte-cap a string without splitting a UTF-8 character.
fn truncate_to(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Map abnormal exits to a kill reason where the host tells us enough.
fn classify_abnormal_exit(status: &std::process::ExitStatus, stderr: &str) -> Option<KillReason> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        match status.signal() {
            Some(libc::SIGXCPU) => return Some(KillReason::Cpu),
            Some(libc::SIGKILL) => return Some(KillReason::Memory),
            _ => {}
        }
    }
    if stderr.contains("MemoryError") || stderr.contains("Cannot allocate memory") {
        return Some(KillReason::Memory);
    }
    let _ = status;
    None
}
