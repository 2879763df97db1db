//! Node-local lifecycle of the supervised agent process.
//!
//! The supervised unit is an opaque command: the supervisor spawns it,
//! signals it, samples its resource usage, and tails its log file. Run state
//! survives a supervisor restart through a small JSON status file; a recorded
//! PID that no longer exists is observed as stopped with the error indicator
//! set.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::SupervisorConfig;
use crate::domain::generation::ConfigGeneration;
use crate::domain::health::{HealthSample, LogChunk};
use crate::domain::node::{NodeId, RunState};

/// Persisted process status, the supervisor's single source of truth across
/// its own restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub run_state: RunState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

pub struct AgentProcess {
    node_id: NodeId,
    command: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    state_dir: PathBuf,
    stop_grace: Duration,
    status: ProcessStatus,
    /// Child handle for a process spawned by this supervisor run. A process
    /// recovered from the status file after a supervisor restart has no
    /// handle and is controlled by PID alone.
    child: Option<Child>,
    system: System,
}

impl AgentProcess {
    pub fn load(config: &SupervisorConfig) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.state_dir)?;

        let status_path = config.state_dir.join("status.json");
        let status = match std::fs::read_to_string(&status_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(error = %e, "corrupt status file, starting from stopped");
                ProcessStatus::default()
            }),
            Err(_) => ProcessStatus::default(),
        };

        let mut process = Self {
            node_id: NodeId::new(config.node_id.clone()),
            command: config.agent.command.clone(),
            args: config.agent.args.clone(),
            workdir: config.agent.workdir.clone(),
            state_dir: config.state_dir.clone(),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
            status,
            child: None,
            system: System::new(),
        };
        process.refresh_liveness();
        Ok(process)
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir.join("agent.log")
    }

    fn status_path(&self) -> PathBuf {
        self.state_dir.join("status.json")
    }

    fn generation_path(&self) -> PathBuf {
        self.state_dir.join("generation.json")
    }

    fn agent_config_path(&self) -> PathBuf {
        self.state_dir.join("agent_config.json")
    }

    /// Reconcile the recorded status with reality: a recorded `running` whose
    /// PID is gone becomes `stopped` with the error indicator set.
    pub fn refresh_liveness(&mut self) {
        if self.status.run_state != RunState::Running {
            return;
        }

        if let Some(child) = self.child.as_mut() {
            if let Ok(Some(exit)) = child.try_wait() {
                self.status.run_state = RunState::Stopped;
                self.status.pid = None;
                self.status.last_error =
                    Some(format!("process exited unexpectedly ({exit})"));
                self.child = None;
                self.save_status();
            }
            return;
        }

        match self.status.pid {
            Some(pid) if pid_alive(pid) => {}
            _ => {
                self.status.run_state = RunState::Stopped;
                self.status.pid = None;
                self.status.last_error = Some("process not found".to_string());
                self.save_status();
            }
        }
    }

    /// Start the supervised process. Already running is a no-op success.
    /// Returns whether anything changed; spawn failures are application-level
    /// rejections.
    pub async fn start(&mut self) -> Result<bool, String> {
        self.refresh_liveness();
        if self.status.run_state == RunState::Running {
            return Ok(false);
        }
        if self.command.trim().is_empty() {
            return Err("no agent command configured".to_string());
        }

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .map_err(|e| format!("opening agent log: {e}"))?;
        let log_err = log.try_clone().map_err(|e| format!("opening agent log: {e}"))?;

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to spawn '{}': {e}", self.command);
                self.status.last_error = Some(message.clone());
                self.save_status();
                return Err(message);
            }
        };

        // Give the process a moment; an immediate exit is a failed start, the
        // ladder the original manager used.
        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Ok(Some(exit)) = child.try_wait() {
            let message = format!("agent exited immediately ({exit})");
            self.status.last_error = Some(message.clone());
            self.save_status();
            return Err(message);
        }

        self.status.run_state = RunState::Running;
        self.status.pid = child.id();
        self.status.started_at = Some(Utc::now());
        self.status.restart_count += 1;
        self.status.last_error = None;
        self.child = Some(child);
        self.save_status();

        info!(pid = ?self.status.pid, "agent started");
        Ok(true)
    }

    /// Stop the supervised process: SIGTERM, bounded wait, then hard kill.
    /// Already stopped is a no-op success.
    pub async fn stop(&mut self) -> Result<bool, String> {
        self.refresh_liveness();
        if self.status.run_state == RunState::Stopped {
            return Ok(false);
        }

        if let Some(pid) = self.status.pid {
            // Graceful first.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }

            let deadline = tokio::time::Instant::now() + self.stop_grace;
            while pid_alive(pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            if pid_alive(pid) {
                warn!(pid, "agent ignored SIGTERM, killing");
                if let Some(child) = self.child.as_mut() {
                    let _ = child.start_kill();
                } else {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                    }
                }
            }

            // Reap the child if this supervisor run spawned it.
            if let Some(mut child) = self.child.take() {
                let _ = child.wait().await;
            }

            info!(pid, "agent stopped");
        }

        self.status.run_state = RunState::Stopped;
        self.status.pid = None;
        self.status.last_error = None;
        self.save_status();
        Ok(true)
    }

    /// One health observation of the supervised process.
    pub fn sample(&mut self) -> HealthSample {
        self.refresh_liveness();

        let mut cpu_percent = 0.0;
        let mut memory_percent = 0.0;

        if let Some(pid) = self.status.pid {
            let pid = Pid::from_u32(pid);
            self.system.refresh_memory();
            self.system.refresh_process(pid);
            if let Some(process) = self.system.process(pid) {
                cpu_percent = f64::from(process.cpu_usage());
                let total = self.system.total_memory();
                if total > 0 {
                    memory_percent = process.memory() as f64 / total as f64 * 100.0;
                }
            }
        }

        let uptime_secs = match (self.status.run_state, self.status.started_at) {
            (RunState::Running, Some(started_at)) => Utc::now()
                .signed_duration_since(started_at)
                .num_seconds()
                .max(0) as u64,
            _ => 0,
        };

        HealthSample {
            node_id: self.node_id.clone(),
            taken_at: Utc::now(),
            run_state: self.status.run_state,
            cpu_percent,
            memory_percent,
            uptime_secs,
            restart_count: self.status.restart_count,
            active_generation: self.active_generation(),
            error: self.status.last_error.is_some(),
            error_message: self.status.last_error.clone(),
        }
    }

    /// Generation currently active on this node, from the generation file.
    pub fn active_generation(&self) -> Option<u64> {
        let content = std::fs::read_to_string(self.generation_path()).ok()?;
        let generation: ConfigGeneration = serde_json::from_str(&content).ok()?;
        Some(generation.id)
    }

    /// Activate a configuration generation: write the full generation record
    /// and the raw payload for the agent to read. Returns false when the
    /// generation is already active.
    pub fn activate_generation(&self, generation: &ConfigGeneration) -> Result<bool, String> {
        if self.active_generation() == Some(generation.id) {
            return Ok(false);
        }

        let payload = serde_json::to_string_pretty(&generation.payload)
            .map_err(|e| format!("serializing payload: {e}"))?;
        let record = serde_json::to_string_pretty(generation)
            .map_err(|e| format!("serializing generation: {e}"))?;

        write_atomic(&self.agent_config_path(), &payload)
            .map_err(|e| format!("writing agent config: {e}"))?;
        write_atomic(&self.generation_path(), &record)
            .map_err(|e| format!("writing generation record: {e}"))?;

        info!(generation = generation.id, "configuration activated");
        Ok(true)
    }

    fn save_status(&self) {
        match serde_json::to_string_pretty(&self.status) {
            Ok(content) => {
                if let Err(e) = write_atomic(&self.status_path(), &content) {
                    warn!(error = %e, "failed to persist process status");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize process status"),
        }
    }
}

fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}

/// Read a finite slice of the agent log starting at a byte cursor. The
/// caller resumes from `next_cursor`; a cursor past the end of a rotated
/// file restarts from the beginning.
pub fn read_log_chunk(path: &Path, cursor: u64, limit: usize) -> std::io::Result<LogChunk> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LogChunk {
                lines: Vec::new(),
                next_cursor: 0,
            })
        }
        Err(e) => return Err(e),
    };

    let len = file.metadata()?.len();
    let start = if cursor > len { 0 } else { cursor };
    file.seek(SeekFrom::Start(start))?;

    let mut buffer = String::new();
    file.take(MAX_CHUNK_BYTES).read_to_string(&mut buffer)?;

    let mut lines = Vec::new();
    let mut consumed = 0u64;
    for line in buffer.split_inclusive('\n') {
        if lines.len() >= limit || !line.ends_with('\n') {
            break;
        }
        consumed += line.len() as u64;
        lines.push(line.trim_end_matches(['\n', '\r']).to_string());
    }

    Ok(LogChunk {
        lines,
        next_cursor: start + consumed,
    })
}

const MAX_CHUNK_BYTES: u64 = 256 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_chunk_is_restartable_from_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        std::fs::write(&path, "one\ntwo\nthree\nfour\n").unwrap();

        let first = read_log_chunk(&path, 0, 2).unwrap();
        assert_eq!(first.lines, vec!["one", "two"]);

        let second = read_log_chunk(&path, first.next_cursor, 10).unwrap();
        assert_eq!(second.lines, vec!["three", "four"]);

        let third = read_log_chunk(&path, second.next_cursor, 10).unwrap();
        assert!(third.lines.is_empty());
        assert_eq!(third.next_cursor, second.next_cursor);
    }

    #[test]
    fn partial_last_line_is_left_for_the_next_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        std::fs::write(&path, "done\nin flight").unwrap();

        let chunk = read_log_chunk(&path, 0, 10).unwrap();
        assert_eq!(chunk.lines, vec!["done"]);
        assert_eq!(chunk.next_cursor, 5);
    }

    #[test]
    fn cursor_past_rotated_file_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        std::fs::write(&path, "fresh\n").unwrap();

        let chunk = read_log_chunk(&path, 10_000, 10).unwrap();
        assert_eq!(chunk.lines, vec!["fresh"]);
    }

    #[test]
    fn missing_log_file_yields_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = read_log_chunk(&dir.path().join("absent.log"), 0, 10).unwrap();
        assert!(chunk.lines.is_empty());
        assert_eq!(chunk.next_cursor, 0);
    }
}
