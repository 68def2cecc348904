use std::ffi::OsString;
use std::fs;
use std::io::{self, PipeReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{SweepError, SweepResult};
use crate::fsutil::{ensure_dir, remove_if_present};
use crate::monitor::{spawn_monitor, MonitorExit};
use crate::signal::Coordinator;

/// Everything needed to turn a candidate into a running tool process.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub tool: PathBuf,
    pub archive: PathBuf,
    pub min_len: u32,
    pub max_len: u32,
    pub work_dir: PathBuf,
    pub success_marker: String,
}

impl JobSettings {
    pub fn constraint_path(&self, candidate: &str) -> PathBuf {
        self.work_dir.join(constraint_file_name(candidate))
    }

    /// `-p<constraint_file> -l<min_len> -g<max_len> <archive_path>`
    pub fn tool_args(&self, constraint_path: &Path) -> Vec<OsString> {
        let mut pattern = OsString::from("-p");
        pattern.push(constraint_path);
        vec![
            pattern,
            OsString::from(format!("-l{}", self.min_len)),
            OsString::from(format!("-g{}", self.max_len)),
            self.archive.clone().into_os_string(),
        ]
    }

    pub fn command_line(&self, constraint_path: &Path) -> Vec<String> {
        std::iter::once(self.tool.clone().into_os_string())
            .chain(self.tool_args(constraint_path))
            .map(|part| part.to_string_lossy().to_string())
            .collect()
    }
}

/// Constraint payload handed to the tool for one prefix.
pub fn constraint_payload(candidate: &str) -> String {
    format!("##\n{}[$a $1] *", candidate)
}

/// `<candidate>.def` when the candidate is made of lowercase ASCII letters,
/// digits, `-` or `_`; otherwise `x<hex of utf-8 bytes>.def`. Hex names are
/// always longer than plain ones for a fixed candidate length, so the two
/// forms cannot collide, and case-insensitive filesystems see distinct names.
pub fn constraint_file_name(candidate: &str) -> String {
    let plain = !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if plain {
        format!("{}.def", candidate)
    } else {
        format!("x{}.def", hex::encode(candidate.as_bytes()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    AlreadyExited,
    Terminated,
    Killed,
}

/// Summary of a job once it has been reaped.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub index: u64,
    pub candidate: String,
    pub status: Option<ExitStatus>,
    pub monitor: Option<MonitorExit>,
    pub elapsed: Duration,
}

/// One tool process bound to one candidate. The constraint file lives
/// exactly as long as the job is active.
#[derive(Debug)]
pub struct Job {
    index: u64,
    candidate: String,
    constraint_path: PathBuf,
    child: Child,
    monitor: Option<JoinHandle<MonitorExit>>,
    started: Instant,
    reaped: bool,
}

impl Job {
    pub fn launch(
        settings: &JobSettings,
        index: u64,
        candidate: &str,
        coordinator: &Coordinator,
    ) -> SweepResult<Job> {
        let launch_failure = |source: io::Error| SweepError::Launch {
            index,
            candidate: candidate.to_string(),
            source,
        };
        let constraint_path = settings.constraint_path(candidate);
        let written = ensure_dir(&settings.work_dir)
            .and_then(|_| fs::write(&constraint_path, constraint_payload(candidate)));
        if let Err(e) = written {
            let _ = remove_if_present(&constraint_path);
            return Err(launch_failure(e));
        }
        debug!(index, path = %constraint_path.display(), "constraint file created");

        let (mut child, stream) = match spawn_tool(settings, &constraint_path) {
            Ok(spawned) => spawned,
            Err(e) => {
                let _ = remove_if_present(&constraint_path);
                return Err(launch_failure(e));
            }
        };
        let monitor = match spawn_monitor(
            index,
            candidate,
            stream,
            settings.success_marker.clone(),
            coordinator.clone(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = remove_if_present(&constraint_path);
                return Err(launch_failure(e));
            }
        };
        info!(
            index,
            candidate,
            pid = child.id(),
            command = %settings.command_line(&constraint_path).join(" "),
            "launched"
        );
        Ok(Job {
            index,
            candidate: candidate.to_string(),
            constraint_path,
            child,
            monitor: Some(monitor),
            started: Instant::now(),
            reaped: false,
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    pub fn constraint_path(&self) -> &Path {
        &self.constraint_path
    }

    /// Non-blocking liveness check.
    pub fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Asks the process to stop, waits up to `grace`, then force-kills it.
    pub fn terminate(&mut self, grace: Duration) -> io::Result<StopKind> {
        if !self.request_stop()? {
            return Ok(StopKind::AlreadyExited);
        }
        self.await_stop(Instant::now() + grace)
    }

    /// Sends the termination request. Returns false if the process had
    /// already exited.
    pub fn request_stop(&mut self) -> io::Result<bool> {
        if self.child.try_wait()?.is_some() {
            return Ok(false);
        }
        request_termination(&mut self.child);
        Ok(true)
    }

    /// Waits for a stop requested earlier until `deadline`, then kills.
    pub fn await_stop(&mut self, deadline: Instant) -> io::Result<StopKind> {
        loop {
            if self.child.try_wait()?.is_some() {
                return Ok(StopKind::Terminated);
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        warn!(
            index = self.index,
            candidate = %self.candidate,
            "shutdown_timeout: process ignored termination request; killing"
        );
        self.kill()?;
        self.child.wait()?;
        Ok(StopKind::Killed)
    }

    /// Force-kills the process; a process that already exited is not an error.
    pub fn kill(&mut self) -> io::Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Releases an exited job: removes its constraint file and joins its
    /// monitor for at most `join_timeout`.
    pub fn reap(self, join_timeout: Duration) -> JobRecord {
        self.reap_by(Instant::now() + join_timeout)
    }

    /// Like [`Job::reap`], but the monitor join ends at `join_deadline`, so
    /// many jobs reaped in a row share one bound.
    pub fn reap_by(mut self, join_deadline: Instant) -> JobRecord {
        let status = match self.child.wait() {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(index = self.index, error = %e, "failed to collect exit status");
                None
            }
        };
        self.remove_constraint_file();
        let monitor = self
            .monitor
            .take()
            .and_then(|handle| join_bounded(handle, join_deadline, self.index));
        self.reaped = true;
        debug!(index = self.index, candidate = %self.candidate, ?status, "reaped");
        JobRecord {
            index: self.index,
            candidate: self.candidate.clone(),
            status,
            monitor,
            elapsed: self.started.elapsed(),
        }
    }

    fn remove_constraint_file(&self) {
        match remove_if_present(&self.constraint_path) {
            Ok(true) => debug!(path = %self.constraint_path.display(), "constraint file deleted"),
            Ok(false) => {}
            Err(source) => {
                let err = SweepError::Cleanup {
                    path: self.constraint_path.clone(),
                    source,
                };
                warn!(index = self.index, "{}", err);
            }
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
            self.remove_constraint_file();
        }
    }
}

fn spawn_tool(settings: &JobSettings, constraint_path: &Path) -> io::Result<(Child, PipeReader)> {
    let (reader, writer) = io::pipe()?;
    let mut cmd = Command::new(&settings.tool);
    cmd.args(settings.tool_args(constraint_path));
    cmd.stdin(Stdio::null());
    cmd.stdout(writer.try_clone()?);
    cmd.stderr(writer);
    let child = cmd.spawn()?;
    // The parent's copies of the write end live in `cmd`; they must be closed
    // for the monitor to see end-of-stream when the tool exits.
    drop(cmd);
    Ok((child, reader))
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: the child has not been waited on, so its pid is still ours.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(
            pid,
            error = %io::Error::last_os_error(),
            "SIGTERM failed"
        );
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.kill();
}

fn join_bounded(
    handle: JoinHandle<MonitorExit>,
    deadline: Instant,
    index: u64,
) -> Option<MonitorExit> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(index, "monitor did not observe stream closure; detaching");
            return None;
        }
        thread::sleep(Duration::from_millis(5));
    }
    match handle.join() {
        Ok(exit) => Some(exit),
        Err(_) => {
            warn!(index, "monitor thread panicked");
            None
        }
    }
}
