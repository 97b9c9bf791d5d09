//! Child process launching.
//!
//! `launch` starts exactly one child: the runtime running an entry module with
//! the given argument vector. The child inherits stdio, stays in egg-bin's
//! process group so it can read from the terminal, and is tied to the
//! parent's lifetime. [`ChildHandle::wait`] forwards termination signals to
//! the child and turns the exit status into the code the CLI exits with.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{DevError, DevResult};

pub const DEFAULT_RUNTIME: &str = "node";

/// Termination signals forwarded to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
}

#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    grace_ms: u64,
}

impl ShutdownConfig {
    pub fn new(grace_ms: u64) -> Self {
        Self { grace_ms }
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self::new(5_000)
    }
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Program that runs the entry module.
    pub runtime: String,
    /// Complete environment of the child.
    pub env: HashMap<String, String>,
    /// Runtime flags placed before the entry module.
    pub exec_argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub shutdown: ShutdownConfig,
}

/// Copies `parent` and forces `NODE_ENV` to `mode`.
pub fn mode_env(parent: &HashMap<String, String>, mode: &str) -> HashMap<String, String> {
    let mut env = parent.clone();
    env.insert("NODE_ENV".to_string(), mode.to_string());
    env
}

/// Spawns `runtime [exec_argv...] entry argv...`.
pub fn launch(entry: &Path, argv: &[String], options: &LaunchOptions) -> DevResult<ChildHandle> {
    if !entry.exists() {
        return Err(DevError::EntryNotFound(entry.to_path_buf()));
    }

    let mut command = Command::new(&options.runtime);
    command.args(&options.exec_argv).arg(entry).args(argv);
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }
    command.env_clear().envs(&options.env);
    command
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    command.kill_on_drop(true);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(target_os = "linux")]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong);
            Ok(())
        });
    }

    let child = command.spawn().map_err(|source| DevError::Spawn {
        program: options.runtime.clone(),
        source,
    })?;
    tracing::debug!(pid = ?child.id(), entry = %entry.display(), "spawned child");
    Ok(ChildHandle {
        child,
        shutdown: options.shutdown,
    })
}

/// A running child launched by [`launch`].
pub struct ChildHandle {
    child: Child,
    shutdown: ShutdownConfig,
}

impl ChildHandle {
    /// Waits for the child to exit and returns its exit code.
    ///
    /// SIGINT and SIGTERM received meanwhile are forwarded to the child once.
    /// A SIGINT while stdin is a terminal came from ctrl-c, which the
    /// terminal already delivered to the child, so it is not forwarded. If the
    /// child is still alive once the grace period after the first signal has
    /// passed, it is killed.
    pub async fn wait(mut self) -> DevResult<i32> {
        let (tx, mut rx) = mpsc::channel(8);
        let listener = spawn_signal_listener(tx);
        let mut deadline: Option<tokio::time::Instant> = None;
        let interactive = std::io::stdin().is_terminal();

        let result = loop {
            let grace = sleep_until(deadline);
            tokio::select! {
                status = self.child.wait() => break status.map_err(DevError::Wait),
                Some(signal) = rx.recv() => {
                    match self.child.id() {
                        Some(pid) if should_forward(signal, interactive) => {
                            tracing::debug!(pid, ?signal, "forwarding signal");
                            send_os_signal(pid, signal);
                        }
                        _ => {}
                    }
                    if deadline.is_none() {
                        deadline = Some(tokio::time::Instant::now() + self.shutdown.grace());
                    }
                }
                _ = grace => {
                    tracing::warn!("child did not exit after {}ms, killing it", self.shutdown.grace_ms);
                    let _ = self.child.start_kill();
                    deadline = None;
                }
            }
        };

        listener.abort();
        let status = result?;
        tracing::debug!(%status, "child exited");
        Ok(exit_code(status))
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn should_forward(signal: ProcessSignal, interactive: bool) -> bool {
    !(interactive && signal == ProcessSignal::SigInt)
}

fn spawn_signal_listener(tx: mpsc::Sender<ProcessSignal>) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (Ok(mut sigint), Ok(mut sigterm)) = (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
            ) else {
                return;
            };
            loop {
                let received = tokio::select! {
                    _ = sigint.recv() => ProcessSignal::SigInt,
                    _ = sigterm.recv() => ProcessSignal::SigTerm,
                };
                if tx.send(received).await.is_err() {
                    break;
                }
            }
        }
        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(ProcessSignal::SigInt).await.is_err() {
                    break;
                }
            }
        }
    })
}

/// Exit code for the CLI: the child's own code, `128 + signal` when it was
/// killed by a signal, otherwise 1.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    unsafe {
        let sig = match signal {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
        };
        let _ = libc::kill(pid as i32, sig);
    }
}

#[cfg(windows)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Windows has no SIGTERM/SIGINT; CTRL_BREAK is the closest console signal we can emit.
    let _ = signal;
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(not(any(unix, windows)))]
fn send_os_signal(_pid: u32, _signal: ProcessSignal) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_options(dir: &Path) -> LaunchOptions {
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        env.insert("KEEP_ME".to_string(), "yes".to_string());
        env.insert("NODE_ENV".to_string(), "production".to_string());
        LaunchOptions {
            runtime: "/bin/sh".to_string(),
            env: mode_env(&env, "development"),
            exec_argv: Vec::new(),
            cwd: Some(dir.to_path_buf()),
            shutdown: ShutdownConfig::new(200),
        }
    }

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("entry.sh");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn mode_env_forces_node_env_and_keeps_the_rest() {
        let mut parent = HashMap::new();
        parent.insert("NODE_ENV".to_string(), "production".to_string());
        parent.insert("HOME".to_string(), "/home/dev".to_string());
        let env = mode_env(&parent, "development");
        assert_eq!(env.get("NODE_ENV").map(String::as_str), Some("development"));
        assert_eq!(env.get("HOME").map(String::as_str), Some("/home/dev"));
        assert_eq!(parent.get("NODE_ENV").map(String::as_str), Some("production"));
    }

    #[tokio::test]
    async fn propagates_child_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let entry = script(dir.path(), "exit 3\n");
        let child = launch(&entry, &[], &sh_options(dir.path())).unwrap();
        assert_eq!(child.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn passes_argv_and_env_to_child() {
        let dir = tempfile::tempdir().unwrap();
        let entry = script(
            dir.path(),
            "printf '%s|%s|%s' \"$1\" \"$NODE_ENV\" \"$KEEP_ME\" > out.txt\n",
        );
        let argv = vec![r#"{"port":7001}"#.to_string()];
        let child = launch(&entry, &argv, &sh_options(dir.path())).unwrap();
        assert_eq!(child.wait().await.unwrap(), 0);

        let out = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(out, r#"{"port":7001}|development|yes"#);
    }

    #[tokio::test]
    async fn missing_entry_is_not_spawned() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("missing.js");
        let err = launch(&entry, &[], &sh_options(dir.path())).err().unwrap();
        assert!(matches!(err, DevError::EntryNotFound(path) if path == entry));
    }

    #[tokio::test]
    async fn missing_runtime_is_a_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let entry = script(dir.path(), "exit 0\n");
        let mut options = sh_options(dir.path());
        options.runtime = dir.path().join("no-such-runtime").display().to_string();
        let err = launch(&entry, &[], &options).err().unwrap();
        assert!(matches!(err, DevError::Spawn { .. }));
    }

    #[tokio::test]
    async fn signal_termination_maps_to_128_plus_signal() {
        let dir = tempfile::tempdir().unwrap();
        let entry = script(dir.path(), "kill -TERM $$\nsleep 5\n");
        let child = launch(&entry, &[], &sh_options(dir.path())).unwrap();
        assert_eq!(child.wait().await.unwrap(), 128 + libc::SIGTERM);
    }

    #[test]
    fn ctrl_c_on_a_terminal_is_not_forwarded_again() {
        assert!(!should_forward(ProcessSignal::SigInt, true));
        assert!(should_forward(ProcessSignal::SigInt, false));
        assert!(should_forward(ProcessSignal::SigTerm, true));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn child_stays_in_the_parent_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let entry = script(dir.path(), "cut -d' ' -f5 /proc/$$/stat > pgid.txt\n");
        let child = launch(&entry, &[], &sh_options(dir.path())).unwrap();
        assert_eq!(child.wait().await.unwrap(), 0);

        let pgid = std::fs::read_to_string(dir.path().join("pgid.txt")).unwrap();
        let expected = unsafe { libc::getpgrp() };
        assert_eq!(pgid.trim(), expected.to_string());
    }

    #[tokio::test]
    async fn forwarded_signal_reaches_the_child_once() {
        let dir = tempfile::tempdir().unwrap();
        let entry = script(
            dir.path(),
            "trap 'echo int >> signals.txt' INT\n\
             touch ready\n\
             i=0\n\
             while [ $i -lt 10 ]; do sleep 0.1; i=$((i+1)); done\n",
        );
        let child = launch(&entry, &[], &sh_options(dir.path())).unwrap();
        let pid = child.child.id().unwrap();
        while !dir.path().join("ready").exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        send_os_signal(pid, ProcessSignal::SigInt);
        assert_eq!(child.wait().await.unwrap(), 0);

        let signals = std::fs::read_to_string(dir.path().join("signals.txt")).unwrap();
        assert_eq!(signals.lines().count(), 1);
    }
}
