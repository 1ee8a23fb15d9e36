//! Launching, polling and signalling worker processes.
//!
//! The reconciler only talks to [`WorkerLauncher`] and [`WorkerProcess`], so
//! its state machine can be driven by fakes in tests. All operations are
//! non-blocking; exits are observed by polling [`WorkerProcess::try_exit`].

use slotwarden_common::{RunId, SlotId};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use super::logcapture;
use crate::errors::SupervisorError;

/// Everything needed to start one worker run.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub slot: SlotId,
    pub run_id: RunId,
    pub root: PathBuf,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// `code` is `None` when the exit status could not be observed, which is
    /// the case for processes adopted from a previous supervisor.
    Exited { code: Option<i32> },
}

pub trait WorkerProcess: Send {
    fn pid(&self) -> u32;

    /// Poll for exit without blocking.
    fn try_exit(&mut self) -> io::Result<ProcessState>;

    /// Ask the worker to shut down gracefully (SIGTERM).
    fn terminate(&mut self) -> Result<(), SupervisorError>;

    /// Force the worker down (SIGKILL).
    fn kill(&mut self) -> Result<(), SupervisorError>;
}

pub trait WorkerLauncher: Send {
    fn launch(&mut self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>, SupervisorError>;

    /// Take over a worker started by an earlier supervisor, if `pid` is
    /// still alive.
    fn adopt(&mut self, pid: u32) -> Option<Box<dyn WorkerProcess>>;
}

/// Launches `<program> [base_args..] --root <root> worker --slot <id> --run-id <uuid>`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    base_args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    /// Arguments placed before the worker arguments, e.g. `-c <script>` for a shell.
    pub fn with_base_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&mut self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>, SupervisorError> {
        let (stdout, stderr) = logcapture::open(&spec.log_path, &spec.slot, spec.run_id)?;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("--root")
            .arg(&spec.root)
            .arg("worker")
            .arg("--slot")
            .arg(spec.slot.as_str())
            .arg("--run-id")
            .arg(spec.run_id.to_string())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false);
        // Own process group: a Ctrl-C aimed at the supervisor's terminal must
        // not reach the workers.
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
            slot: spec.slot.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| SupervisorError::SpawnFailed {
            slot: spec.slot.clone(),
            source: io::Error::other("worker exited before its pid was read"),
        })?;

        Ok(Box::new(ChildProcess { child, pid }))
    }

    fn adopt(&mut self, pid: u32) -> Option<Box<dyn WorkerProcess>> {
        if is_process_running(pid) {
            Some(Box::new(AdoptedProcess { pid }))
        } else {
            None
        }
    }
}

/// A worker this supervisor spawned itself.
struct ChildProcess {
    child: tokio::process::Child,
    pid: u32,
}

impl WorkerProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit(&mut self) -> io::Result<ProcessState> {
        match self.child.try_wait()? {
            None => Ok(ProcessState::Running),
            Some(status) => {
                use std::os::unix::process::ExitStatusExt;
                let code = status.code().or_else(|| status.signal().map(|s| 128 + s));
                Ok(ProcessState::Exited { code })
            }
        }
    }

    fn terminate(&mut self) -> Result<(), SupervisorError> {
        send_signal(self.pid, libc::SIGTERM)
    }

    fn kill(&mut self) -> Result<(), SupervisorError> {
        self.child
            .start_kill()
            .map_err(|source| SupervisorError::SignalFailed {
                pid: self.pid,
                source,
            })
    }
}

/// A worker left behind by a previous supervisor. It is not our child, so
/// liveness is probed with signal 0 and the exit code is unknown.
struct AdoptedProcess {
    pid: u32,
}

impl WorkerProcess for AdoptedProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit(&mut self) -> io::Result<ProcessState> {
        if is_process_running(self.pid) {
            Ok(ProcessState::Running)
        } else {
            Ok(ProcessState::Exited { code: None })
        }
    }

    fn terminate(&mut self) -> Result<(), SupervisorError> {
        send_signal(self.pid, libc::SIGTERM)
    }

    fn kill(&mut self) -> Result<(), SupervisorError> {
        send_signal(self.pid, libc::SIGKILL)
    }
}

fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), SupervisorError> {
    let result = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if result == 0 {
        return Ok(());
    }
    let source = io::Error::last_os_error();
    // Already gone: the next poll reports the exit.
    if source.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(SupervisorError::SignalFailed { pid, source })
}

pub fn is_process_running(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    let alive =
        result == 0 || io::Error::last_os_error().kind() == io::ErrorKind::PermissionDenied;
    alive && !is_zombie(pid)
}

/// An exited process nobody has reaped yet still answers signal 0.
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    stat.rfind(')')
        .and_then(|end| stat.get(end + 2..))
        .and_then(|rest| rest.split_whitespace().next())
        == Some("Z")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn spec(dir: &std::path::Path) -> LaunchSpec {
        LaunchSpec {
            slot: SlotId::new("proc").unwrap(),
            run_id: RunId::new(),
            root: dir.to_path_buf(),
            log_path: dir.join("logs").join("worker.log"),
        }
    }

    async fn wait_exit(process: &mut Box<dyn WorkerProcess>) -> Option<i32> {
        for _ in 0..100 {
            if let ProcessState::Exited { code } = process.try_exit().unwrap() {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process did not exit");
    }

    #[tokio::test]
    async fn test_launch_passes_worker_arguments_and_captures_output() {
        let dir = tempdir().unwrap();
        let spec = spec(dir.path());
        let mut launcher =
            CommandLauncher::new("sh").with_base_args(["-c", "echo \"args: $*\"", "sh"]);

        let mut process = launcher.launch(&spec).unwrap();
        assert!(process.pid() > 0);
        assert_eq!(wait_exit(&mut process).await, Some(0));

        let log = std::fs::read_to_string(&spec.log_path).unwrap();
        assert!(log.contains(&format!("--slot proc --run-id {}", spec.run_id)));
    }

    #[tokio::test]
    async fn test_terminate_delivers_sigterm() {
        let dir = tempdir().unwrap();
        let mut launcher = CommandLauncher::new("sh").with_base_args([
            "-c",
            "trap 'exit 0' TERM; while true; do sleep 0.05; done",
            "sh",
        ]);

        let mut process = launcher.launch(&spec(dir.path())).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        process.terminate().unwrap();
        assert_eq!(wait_exit(&mut process).await, Some(0));
    }

    #[tokio::test]
    async fn test_kill_stops_a_process_ignoring_sigterm() {
        let dir = tempdir().unwrap();
        let mut launcher = CommandLauncher::new("sh").with_base_args([
            "-c",
            "trap '' TERM; while true; do sleep 0.05; done",
            "sh",
        ]);

        let mut process = launcher.launch(&spec(dir.path())).unwrap();
        process.kill().unwrap();
        assert_eq!(wait_exit(&mut process).await, Some(128 + libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_missing_program_is_a_spawn_failure() {
        let dir = tempdir().unwrap();
        let mut launcher = CommandLauncher::new(dir.path().join("no-such-worker"));
        let err = launcher.launch(&spec(dir.path())).err().unwrap();
        assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
    }

    #[test]
    fn test_adopt_requires_live_pid() {
        let mut launcher = CommandLauncher::new("unused");
        assert!(launcher.adopt(std::process::id()).is_some());
        assert!(launcher.adopt(0).is_none());
    }

    #[test]
    fn test_unreaped_child_is_not_running() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        std::thread::sleep(Duration::from_millis(200));
        if std::path::Path::new("/proc").exists() {
            assert!(!is_process_running(pid));
        }
        child.wait().unwrap();
        assert!(!is_process_running(pid));
    }
}
