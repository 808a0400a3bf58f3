//! Process tree termination
//!
//! Interrupt every process in the tree, give them `graceful_wait` to exit, then kill
//! whatever is left.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, warn};

use sdk_core::LaunchMode;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period after the hard kill before giving up on a pid
const KILL_SETTLE: Duration = Duration::from_secs(1);

/// How the graceful interrupt is delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptStrategy {
    /// `SIGINT` to each pid
    Signal,
    /// Windows: `CTRL_C_EVENT` raised directly at the pid's process group, for children
    /// that share a console with their supervisor
    CtrlC,
    /// Windows: `<helper> console-ctrl <pid>` attaches to the pid's console and raises
    /// `CTRL_C_EVENT` there
    ConsoleCtrl { helper: PathBuf },
}

impl InterruptStrategy {
    /// Strategy for a child started in `mode` on this platform
    pub fn for_launch(mode: Option<LaunchMode>, helper: PathBuf) -> Self {
        Self::select(cfg!(windows), mode, helper)
    }

    fn select(windows: bool, mode: Option<LaunchMode>, helper: PathBuf) -> Self {
        match (windows, mode) {
            (false, _) => InterruptStrategy::Signal,
            // only a new terminal owns a console we are not attached to
            (true, Some(LaunchMode::NewTerminal) | None) => InterruptStrategy::ConsoleCtrl { helper },
            (true, Some(LaunchMode::Inline | LaunchMode::Background)) => InterruptStrategy::CtrlC,
        }
    }
}

/// What happened to each pid of the tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillOutcome {
    pub interrupted: Vec<u32>,
    pub killed: Vec<u32>,
    pub already_gone: Vec<u32>,
}

fn is_alive_status(status: ProcessStatus) -> bool {
    !matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// True if `pid` names a live (non-zombie) process
pub fn pid_exists(pid: u32) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|process| is_alive_status(process.status()))
}

/// `root` and every live descendant, parents before children
pub fn process_tree(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if !is_alive_status(process.status()) {
            continue;
        }
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let root = Pid::from_u32(root);
    if !system
        .process(root)
        .is_some_and(|process| is_alive_status(process.status()))
    {
        return Vec::new();
    }

    let mut seen = BTreeSet::new();
    let mut order = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if !seen.insert(pid) {
            continue;
        }
        order.push(pid.as_u32());
        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().copied());
        }
    }
    order
}

fn alive(pids: &[u32]) -> Vec<u32> {
    let mut system = System::new();
    let sys_pids: Vec<Pid> = pids.iter().map(|p| Pid::from_u32(*p)).collect();
    system.refresh_processes(ProcessesToUpdate::Some(&sys_pids), true);
    pids.iter()
        .copied()
        .filter(|pid| {
            system
                .process(Pid::from_u32(*pid))
                .is_some_and(|process| is_alive_status(process.status()))
        })
        .collect()
}

async fn wait_for_exit(pids: &[u32], timeout: Duration) -> Vec<u32> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = alive(pids);
        if remaining.is_empty() || Instant::now() >= deadline {
            return remaining;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Interrupt, wait, then kill the tree rooted at `root`
pub async fn kill_tree(root: u32, graceful_wait: Duration, strategy: &InterruptStrategy) -> KillOutcome {
    let mut outcome = KillOutcome::default();
    let tree = process_tree(root);
    if tree.is_empty() {
        debug!(pid = root, "Process already gone");
        outcome.already_gone.push(root);
        return outcome;
    }

    for pid in &tree {
        match interrupt(*pid, strategy).await {
            Ok(true) => outcome.interrupted.push(*pid),
            Ok(false) => outcome.already_gone.push(*pid),
            Err(e) => warn!(pid, "Failed to interrupt: {}", e),
        }
    }

    let survivors = wait_for_exit(&tree, graceful_wait).await;
    for pid in &survivors {
        match hard_kill(*pid) {
            Ok(true) => outcome.killed.push(*pid),
            Ok(false) => {}
            Err(e) => warn!(pid, "Failed to kill: {}", e),
        }
    }
    if !survivors.is_empty() {
        let stuck = wait_for_exit(&survivors, KILL_SETTLE).await;
        if !stuck.is_empty() {
            warn!(?stuck, "Processes survived the kill");
        }
    }
    debug!(root, ?outcome, "Process tree stopped");
    outcome
}

/// Deliver the graceful interrupt; `Ok(false)` when the pid no longer exists
async fn interrupt(pid: u32, strategy: &InterruptStrategy) -> std::io::Result<bool> {
    match strategy {
        InterruptStrategy::Signal => send_sigint(pid),
        InterruptStrategy::CtrlC => send_ctrl_c_event(pid),
        InterruptStrategy::ConsoleCtrl { helper } => {
            let status = tokio::process::Command::new(helper)
                .arg("console-ctrl")
                .arg(pid.to_string())
                .status()
                .await?;
            Ok(status.success())
        }
    }
}

#[cfg(unix)]
fn send_sigint(pid: u32) -> std::io::Result<bool> {
    send_signal(pid, nix::sys::signal::Signal::SIGINT)
}

#[cfg(not(unix))]
fn send_sigint(pid: u32) -> std::io::Result<bool> {
    let _ = pid;
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals are not available on this platform",
    ))
}

#[cfg(windows)]
fn send_ctrl_c_event(pid: u32) -> std::io::Result<bool> {
    use windows_sys::Win32::System::Console::{CTRL_C_EVENT, GenerateConsoleCtrlEvent};

    if !pid_exists(pid) {
        return Ok(false);
    }
    // SAFETY: no pointers are passed
    if unsafe { GenerateConsoleCtrlEvent(CTRL_C_EVENT, pid) } == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(true)
}

#[cfg(not(windows))]
fn send_ctrl_c_event(pid: u32) -> std::io::Result<bool> {
    send_sigint(pid)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> std::io::Result<bool> {
    use nix::errno::Errno;
    use nix::unistd::Pid as NixPid;

    let raw = i32::try_from(pid).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    match nix::sys::signal::kill(NixPid::from_raw(raw), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

#[cfg(unix)]
fn hard_kill(pid: u32) -> std::io::Result<bool> {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(windows)]
fn hard_kill(pid: u32) -> std::io::Result<bool> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()?;
    Ok(status.success())
}

/// Raise `CTRL_C_EVENT` in the console that owns `pid`.
///
/// Detaches from our own console first, so run it from a short-lived helper process.
#[cfg(windows)]
pub fn send_console_ctrl_c(pid: u32) -> std::io::Result<()> {
    use windows_sys::Win32::System::Console::{
        AttachConsole, CTRL_C_EVENT, FreeConsole, GenerateConsoleCtrlEvent, SetConsoleCtrlHandler,
    };

    // SAFETY: plain Win32 console calls with no pointers besides the null handler
    unsafe {
        FreeConsole();
        if AttachConsole(pid) == 0 {
            return Err(std::io::Error::last_os_error());
        }
        // ignore the event ourselves
        SetConsoleCtrlHandler(None, 1);
        if GenerateConsoleCtrlEvent(CTRL_C_EVENT, 0) == 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
