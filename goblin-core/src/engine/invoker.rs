// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Supervised invocation of the checkpoint/restore engine.
//!
//! One call runs one privileged engine subprocess, bounded by a timeout.
//! The engine is never retried here; retry policy belongs to the caller.

use std::ffi::OsString;
use std::fmt;
use std::io::Read;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::command::{resolve_command, EnginePrograms};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::log_interpreter::{read_tail, DEFAULT_TAIL_LINES};
use crate::types::ProcessId;

/// Poll interval while waiting on the engine or a pidfile.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Which way the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Dump,
    Restore,
}

impl Direction {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Dump => "dump",
            Self::Restore => "restore",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// What the engine operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineTarget {
    /// A live process, for dumps.
    Process(ProcessId),
    /// An image directory, for restores.
    Image(PathBuf),
}

/// A descriptor open in this process that a restore hands to the restored
/// tree in place of a dumped resource (`--inherit-fd`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritFd {
    pub fd: RawFd,
    /// Dumped resource it replaces, e.g. `pipe:[12345]`.
    pub resource: String,
}

/// Per-invocation options.
#[derive(Debug, Clone)]
pub struct InvocationOptions {
    /// Engine log file, normally inside the image directory.
    pub log_path: PathBuf,
    /// Where a restore writes the new pid.
    pub pidfile: Option<PathBuf>,
    pub timeout: Duration,
    /// Keep the dumped process running.
    pub leave_running: bool,
    /// Descriptors passed to a restore. Must stay open until `invoke` returns.
    pub inherit_fds: Vec<InheritFd>,
}

/// Raw outcome of one engine run.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub direction: Direction,
    /// `None` when the engine was killed by a signal.
    pub exit_code: Option<i32>,
    pub log_path: PathBuf,
    /// Trailing lines of the engine log at exit.
    pub tail: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub success: bool,
    pub timed_out: bool,
}

/// Capability interface over the checkpoint/restore engine.
pub trait Engine: Send + Sync {
    fn invoke(
        &self,
        direction: Direction,
        target: &EngineTarget,
        image_dir: &Path,
        options: &InvocationOptions,
    ) -> Result<InvocationResult, EngineError>;
}

/// CRIU run through a privilege wrapper.
#[derive(Debug, Clone)]
pub struct CriuEngine {
    programs: EnginePrograms,
    verbosity: u8,
    shell_job: bool,
    tcp_established: bool,
    extra_dump_args: Vec<String>,
    extra_restore_args: Vec<String>,
    kill_grace: Duration,
    tail_lines: usize,
}

impl CriuEngine {
    /// Resolve the engine executables described by `config`.
    ///
    /// # Errors
    /// Returns `BinaryNotFound` when `criu` (or `sudo`, if enabled) cannot be
    /// located. A missing `criu-ns` only downgrades restores to plain `criu`.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let criu = match &config.criu_path {
            Some(path) => path.clone(),
            None => resolve_command("criu")?,
        };

        let sudo = if config.use_sudo {
            Some(match &config.sudo_path {
                Some(path) => path.clone(),
                None => resolve_command("sudo")?,
            })
        } else {
            None
        };

        let criu_ns = if config.use_criu_ns {
            match &config.criu_ns_path {
                Some(path) => Some(path.clone()),
                None => match resolve_command("criu-ns") {
                    Ok(path) => Some(path),
                    Err(e) => {
                        tracing::warn!(error = %e, "criu-ns unavailable, restoring with criu");
                        None
                    }
                },
            }
        } else {
            None
        };

        tracing::info!(
            criu = %criu.display(),
            sudo = ?sudo,
            criu_ns = ?criu_ns,
            "CriuEngine initialized"
        );

        Ok(Self::new(EnginePrograms { sudo, criu, criu_ns }, config))
    }

    /// Build an engine from already-resolved programs.
    pub fn new(programs: EnginePrograms, config: &EngineConfig) -> Self {
        Self {
            programs,
            verbosity: config.verbosity,
            shell_job: config.shell_job,
            tcp_established: config.tcp_established,
            extra_dump_args: config.extra_dump_args.clone(),
            extra_restore_args: config.extra_restore_args.clone(),
            kill_grace: config.kill_grace,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines.max(1);
        self
    }

    pub fn programs(&self) -> &EnginePrograms {
        &self.programs
    }

    /// Full argv for one invocation, privilege wrapper included.
    pub fn command_line(
        &self,
        direction: Direction,
        target: &EngineTarget,
        image_dir: &Path,
        options: &InvocationOptions,
    ) -> Result<Vec<OsString>, EngineError> {
        let mut argv;
        match (direction, target) {
            (Direction::Dump, EngineTarget::Process(pid)) => {
                argv = self.programs.privileged(&self.programs.criu);
                argv.push("dump".into());
                argv.push("-D".into());
                argv.push(image_dir.as_os_str().to_os_string());
                argv.push("-t".into());
                argv.push(pid.to_string().into());
                argv.push("-o".into());
                argv.push(options.log_path.as_os_str().to_os_string());
                argv.push(format!("-v{}", self.verbosity).into());
                if self.shell_job {
                    argv.push("--shell-job".into());
                }
                if options.leave_running {
                    argv.push("--leave-running".into());
                }
                if self.tcp_established {
                    argv.push("--tcp-established".into());
                }
                argv.extend(self.extra_dump_args.iter().map(OsString::from));
            }
            (Direction::Restore, EngineTarget::Image(source)) => {
                let highest_fd = options.inherit_fds.iter().map(|i| i.fd).max();
                argv = self
                    .programs
                    .privileged_keeping(self.programs.restore_program(), highest_fd);
                argv.push("restore".into());
                argv.push("-D".into());
                argv.push(source.as_os_str().to_os_string());
                argv.push("-o".into());
                argv.push(options.log_path.as_os_str().to_os_string());
                argv.push(format!("-v{}", self.verbosity).into());
                if let Some(pidfile) = &options.pidfile {
                    argv.push("--pidfile".into());
                    argv.push(pidfile.as_os_str().to_os_string());
                }
                argv.push("--restore-detached".into());
                if self.shell_job {
                    argv.push("--shell-job".into());
                }
                if self.tcp_established {
                    argv.push("--tcp-established".into());
                }
                for inherit in &options.inherit_fds {
                    argv.push("--inherit-fd".into());
                    argv.push(format!("fd[{}]:{}", inherit.fd, inherit.resource).into());
                }
                argv.extend(self.extra_restore_args.iter().map(OsString::from));
            }
            (Direction::Dump, EngineTarget::Image(_)) => {
                return Err(EngineError::TargetMismatch {
                    direction: "dump",
                    expected: "process",
                })
            }
            (Direction::Restore, EngineTarget::Process(_)) => {
                return Err(EngineError::TargetMismatch {
                    direction: "restore",
                    expected: "image directory",
                })
            }
        }
        Ok(argv)
    }
}

impl Engine for CriuEngine {
    fn invoke(
        &self,
        direction: Direction,
        target: &EngineTarget,
        image_dir: &Path,
        options: &InvocationOptions,
    ) -> Result<InvocationResult, EngineError> {
        let argv = self.command_line(direction, target, image_dir, options)?;

        match direction {
            Direction::Dump => {
                std::fs::create_dir_all(image_dir).map_err(|e| EngineError::ImageDirectory {
                    path: image_dir.to_path_buf(),
                    reason: e.to_string(),
                })?;
            }
            Direction::Restore => ensure_populated(image_dir)?,
        }

        tracing::debug!(
            direction = %direction,
            command = ?argv,
            timeout_ms = options.timeout.as_millis() as u64,
            "Starting engine"
        );

        for inherit in &options.inherit_fds {
            set_inheritable(inherit.fd, true)?;
        }
        let start = Instant::now();
        let spawned = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        for inherit in &options.inherit_fds {
            if let Err(e) = set_inheritable(inherit.fd, false) {
                tracing::warn!(fd = inherit.fd, error = %e, "Could not restore close-on-exec");
            }
        }
        let mut child = spawned.map_err(|e| EngineError::SpawnFailed {
            reason: format!("Failed to execute {:?}: {}", argv[0], e),
        })?;

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let (status, timed_out) = supervise(&mut child, options.timeout, self.kill_grace)?;
        let duration = start.elapsed();

        let stdout = join_reader(stdout);
        let stderr = join_reader(stderr);
        let tail = read_tail(&options.log_path, self.tail_lines)
            .ok()
            .flatten()
            .unwrap_or_default();

        let exit_code = status.and_then(|s| s.code());
        let success = !timed_out && exit_code == Some(0);

        if success {
            tracing::info!(
                direction = %direction,
                elapsed_ms = duration.as_millis() as u64,
                "Engine completed"
            );
        } else {
            tracing::warn!(
                direction = %direction,
                exit_code = ?exit_code,
                timed_out = timed_out,
                elapsed_ms = duration.as_millis() as u64,
                "Engine failed"
            );
        }

        Ok(InvocationResult {
            direction,
            exit_code,
            log_path: options.log_path.clone(),
            tail,
            stdout,
            stderr,
            duration,
            success,
            timed_out,
        })
    }
}

/// Restore sources must exist and hold at least one entry.
fn ensure_populated(image_dir: &Path) -> Result<(), EngineError> {
    let mut entries = std::fs::read_dir(image_dir).map_err(|e| EngineError::ImageDirectory {
        path: image_dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    if entries.next().is_none() {
        return Err(EngineError::ImageDirectory {
            path: image_dir.to_path_buf(),
            reason: "directory is empty".to_string(),
        });
    }
    Ok(())
}

/// Toggle `FD_CLOEXEC` so `fd` is (or is no longer) passed to children.
fn set_inheritable(fd: RawFd, inheritable: bool) -> Result<(), EngineError> {
    let flags = if inheritable {
        FdFlag::empty()
    } else {
        FdFlag::FD_CLOEXEC
    };
    fcntl(fd, FcntlArg::F_SETFD(flags))
        .map(drop)
        .map_err(|e| EngineError::SpawnFailed {
            reason: format!("fd {} cannot be passed to the engine: {}", fd, e),
        })
}

/// Wait for the child, terminating it once `timeout` elapses.
///
/// Returns the exit status (if one was collected) and whether the timeout fired.
fn supervise(
    child: &mut Child,
    timeout: Duration,
    kill_grace: Duration,
) -> Result<(Option<ExitStatus>, bool), EngineError> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok((Some(status), false)),
            Ok(None) if Instant::now() >= deadline => break,
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                return Err(EngineError::Supervise {
                    reason: format!("wait failed: {}", e),
                })
            }
        }
    }

    let pid = Pid::from_raw(child.id() as i32);
    tracing::error!(pid = %pid, timeout_ms = timeout.as_millis() as u64, "Engine timed out, sending SIGTERM");
    if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
        tracing::warn!(pid = %pid, error = %e, "SIGTERM failed");
    }

    let grace_deadline = Instant::now() + kill_grace;
    while Instant::now() < grace_deadline {
        if let Ok(Some(status)) = child.try_wait() {
            return Ok((Some(status), true));
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    tracing::error!(pid = %pid, "Engine ignored SIGTERM, killing");
    let _ = child.kill();
    Ok((child.wait().ok(), true))
}

fn spawn_reader<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<String>> {
    stream.map(|mut s| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = s.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Poll for a pidfile written by a restore and parse the pid in it.
pub fn wait_for_pidfile(pidfile: &Path, timeout: Duration) -> Option<ProcessId> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(content) = std::fs::read_to_string(pidfile) {
            if let Some(pid) = content
                .trim()
                .parse::<u32>()
                .ok()
                .and_then(|p| ProcessId::new(p).ok())
            {
                return Some(pid);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CriuEngine {
        let programs = EnginePrograms {
            sudo: Some(PathBuf::from("/usr/bin/sudo")),
            criu: PathBuf::from("/usr/sbin/criu"),
            criu_ns: Some(PathBuf::from("/usr/sbin/criu-ns")),
        };
        CriuEngine::new(programs, &EngineConfig::default())
    }

    fn options(dir: &Path) -> InvocationOptions {
        InvocationOptions {
            log_path: dir.join("first-freeze.log"),
            pidfile: Some(dir.join("goblin-thaw.2.pid")),
            timeout: Duration::from_secs(1),
            leave_running: true,
            inherit_fds: Vec::new(),
        }
    }

    #[test]
    fn test_dump_command_line() {
        let dir = PathBuf::from("/tmp/g/first-freeze");
        let pid = ProcessId::new(4242).unwrap();
        let argv = engine()
            .command_line(Direction::Dump, &EngineTarget::Process(pid), &dir, &options(&dir))
            .unwrap();
        let argv: Vec<String> = argv.iter().map(|a| a.to_string_lossy().into_owned()).collect();

        assert_eq!(&argv[..4], &["/usr/bin/sudo", "-n", "/usr/sbin/criu", "dump"]);
        assert!(argv.windows(2).any(|w| w == ["-t", "4242"]));
        assert!(argv.contains(&"-v4".to_string()));
        assert!(argv.contains(&"--shell-job".to_string()));
        assert!(argv.contains(&"--leave-running".to_string()));
        assert!(!argv.contains(&"--pidfile".to_string()));
    }

    #[test]
    fn test_restore_command_line_uses_helper() {
        let dir = PathBuf::from("/tmp/g/first-freeze");
        let argv = engine()
            .command_line(
                Direction::Restore,
                &EngineTarget::Image(dir.clone()),
                &dir,
                &options(&dir),
            )
            .unwrap();
        let argv: Vec<String> = argv.iter().map(|a| a.to_string_lossy().into_owned()).collect();

        assert_eq!(argv[2], "/usr/sbin/criu-ns");
        assert_eq!(argv[3], "restore");
        assert!(argv.contains(&"--restore-detached".to_string()));
        assert!(argv.windows(2).any(|w| w[0] == "--pidfile" && w[1].ends_with("goblin-thaw.2.pid")));
    }

    #[test]
    fn test_restore_reattaches_stdio_pipes() {
        let dir = PathBuf::from("/tmp/g/first-freeze");
        let mut options = options(&dir);
        options.inherit_fds = vec![
            InheritFd {
                fd: 7,
                resource: "pipe:[4101]".to_string(),
            },
            InheritFd {
                fd: 8,
                resource: "pipe:[4102]".to_string(),
            },
        ];
        let argv = engine()
            .command_line(Direction::Restore, &EngineTarget::Image(dir.clone()), &dir, &options)
            .unwrap();
        let argv: Vec<String> = argv.iter().map(|a| a.to_string_lossy().into_owned()).collect();

        assert_eq!(&argv[..4], &["/usr/bin/sudo", "-n", "-C", "9"]);
        assert!(argv.windows(2).any(|w| w == ["--inherit-fd", "fd[7]:pipe:[4101]"]));
        assert!(argv.windows(2).any(|w| w == ["--inherit-fd", "fd[8]:pipe:[4102]"]));
    }

    #[test]
    fn test_inherited_fd_reaches_engine() {
        use std::os::unix::io::AsRawFd;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-criu");
        // Writes to the descriptor named in the `fd[N]:...` argument.
        std::fs::write(
            &script,
            r#"#!/bin/sh
for a in "$@"; do
    case "$a" in
        fd\[*) n=$(echo "$a" | sed 's/^fd\[\([0-9]*\)\].*/\1/') ;;
    esac
done
echo inherited >> /proc/self/fd/$n
"#,
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let image_dir = dir.path().join("first-freeze");
        std::fs::create_dir(&image_dir).unwrap();
        std::fs::write(image_dir.join("inventory.img"), b"x").unwrap();

        let sink_path = dir.path().join("sink");
        let sink = std::fs::File::create(&sink_path).unwrap();
        let engine = CriuEngine::new(
            EnginePrograms {
                sudo: None,
                criu: script,
                criu_ns: None,
            },
            &EngineConfig::default(),
        );
        let mut options = options(&image_dir);
        options.pidfile = None;
        options.inherit_fds = vec![InheritFd {
            fd: sink.as_raw_fd(),
            resource: "pipe:[4102]".to_string(),
        }];

        let result = engine
            .invoke(
                Direction::Restore,
                &EngineTarget::Image(image_dir.clone()),
                &image_dir,
                &options,
            )
            .unwrap();
        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(std::fs::read_to_string(&sink_path).unwrap(), "inherited\n");
    }

    #[test]
    fn test_target_mismatch() {
        let dir = PathBuf::from("/tmp/g");
        let pid = ProcessId::new(1).unwrap();
        let result = engine().command_line(
            Direction::Restore,
            &EngineTarget::Process(pid),
            &dir,
            &options(&dir),
        );
        assert!(matches!(result, Err(EngineError::TargetMismatch { .. })));
    }

    #[test]
    fn test_restore_requires_populated_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(ensure_populated(dir.path()).is_err());
        assert!(ensure_populated(&dir.path().join("missing")).is_err());
        std::fs::write(dir.path().join("inventory.img"), b"x").unwrap();
        assert!(ensure_populated(dir.path()).is_ok());
    }

    #[test]
    fn test_wait_for_pidfile() {
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("thaw.pid");
        assert!(wait_for_pidfile(&pidfile, Duration::from_millis(30)).is_none());

        std::fs::write(&pidfile, "7777\n").unwrap();
        assert_eq!(
            wait_for_pidfile(&pidfile, Duration::from_millis(30)).map(|p| p.value()),
            Some(7777)
        );
    }
}
