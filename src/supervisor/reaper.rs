//! Hanging-process detection and cleanup.
//!
//! Sandbox children register here for the lifetime of an orchestration. A
//! background monitor samples them every five seconds; a process is
//! classified hanging when its CPU usage exceeds 90% and more than 300
//! seconds have passed since its last progress beat. Graceful termination is
//! tried first, then forced after a grace period.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, System};
use tokio_util::sync::CancellationToken;

const SAMPLE_INTERVAL_SECS: u64 = 5;
const CPU_THRESHOLD_PERCENT: f32 = 90.0;
const HANG_AFTER_SECS: i64 = 300;
const FORCE_KILL_GRACE_SECS: u64 = 10;

/// One registered child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredProcess {
    pub pid: u32,
    pub label: String,
    pub registered_at: DateTime<Utc>,
    /// Last progress signal; refreshed by [`ProcessReaper::heartbeat`].
    pub last_progress: DateTime<Utc>,
}

/// Registry plus sampler for child processes.
pub struct ProcessReaper {
    processes: Mutex<BTreeMap<u32, MonitoredProcess>>,
    system: Mutex<System>,
}

impl Default for ProcessReaper {
    fn default() -> Self {
        Self {
            processes: Mutex::new(BTreeMap::new()),
            system: Mutex::new(System::new()),
        }
    }
}

impl ProcessReaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32, label: &str) {
        let now = Utc::now();
        self.processes
            .lock()
            .expect("reaper lock poisoned")
            .insert(
                pid,
                MonitoredProcess {
                    pid,
                    label: label.to_string(),
                    registered_at: now,
                    last_progress: now,
                },
            );
        tracing::debug!(pid, label, "process registered with reaper");
    }

    pub fn unregister(&self, pid: u32) {
        self.processes
            .lock()
            .expect("reaper lock poisoned")
            .remove(&pid);
    }

    /// Progress beat: the process is doing useful work.
    pub fn heartbeat(&self, pid: u32) {
        if let Some(proc) = self
            .processes
            .lock()
            .expect("reaper lock poisoned")
            .get_mut(&pid)
        {
            proc.last_progress = Utc::now();
        }
    }

    pub fn monitored(&self) -> Vec<MonitoredProcess> {
        self.processes
            .lock()
            .expect("reaper lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Sample registered processes and return the pids classified hanging:
    /// CPU above 90% with no progress beat for over 300 seconds. Processes
    /// that no longer exist are dropped from the registry.
    pub fn detect_hanging_processes(&self) -> Vec<u32> {
        let snapshot = self.monitored();
        if snapshot.is_empty() {
            return Vec::new();
        }

        let mut system = self.system.lock().expect("reaper sys lock poisoned");
        system.refresh_processes();

        let mut hanging = Vec::new();
        let mut gone = Vec::new();
        let now = Utc::now();
        for proc in &snapshot {
            match system.process(Pid::from_u32(proc.pid)) {
                Some(info) => {
                    let stalled_for = now - proc.last_progress;
                    if info.cpu_usage() > CPU_THRESHOLD_PERCENT
                        && stalled_for > Duration::seconds(HANG_AFTER_SECS)
                    {
                        hanging.push(proc.pid);
                    }
                }
                None => gone.push(proc.pid),
            }
        }
        drop(system);

        for pid in gone {
            self.unregister(pid);
        }
        hanging
    }

    /// Terminate a process: soft stop first, forced on request.
    pub fn kill_hanging_process(&self, pid: u32, force: bool) -> bool {
        let delivered = send_signal(pid, force);
        if delivered {
            tracing::warn!(pid, force, "hanging process signalled");
        }
        if force {
            self.unregister(pid);
        }
        delivered
    }

    /// Reap exited children that were never waited on. Returns how many were
    /// collected.
    pub fn cleanup_zombie_processes(&self) -> usize {
        #[cfg(unix)]
        {
            let mut reaped = 0;
            loop {
                let mut status: libc::c_int = 0;
                // Non-blocking: collect whatever already exited.
                let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
                if pid <= 0 {
                    break;
                }
                self.unregister(pid as u32);
                reaped += 1;
            }
            reaped
        }
        #[cfg(not(unix))]
        {
            0
        }
    }

    /// The background monitor task: sample every five seconds, soft-kill
    /// hangers, force-kill survivors after the grace period.
    pub fn spawn_monitor(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(SAMPLE_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = token.cancelled() => break,
                }

                self.cleanup_zombie_processes();
                let hanging = self.detect_hanging_processes();
                for pid in hanging {
                    self.kill_hanging_process(pid, false);
                    let reaper = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_secs(FORCE_KILL_GRACE_SECS))
                            .await;
                        // Escalate only if it is still around.
                        if reaper.monitored().iter().any(|p| p.pid == pid) {
                            reaper.kill_hanging_process(pid, true);
                        }
                    });
                }
            }
        })
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, force: bool) -> bool {
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _force: bool) -> bool {
    false
}
