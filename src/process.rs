#![allow(unsafe_code)]
//! Forks, execs and reaps handler children; tracks per-child timeouts and
//! escalates a hung handler from SIGTERM to SIGKILL.

use crate::dispatch::HandlerInvocation;
use crate::handler::{Credentials, Handler, HandlerFlags};
use nix::sys::signal::Signal as NixSignal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// The escalation ladder a hung handler climbs: a plain-SIGTERM grace
/// period, then SIGKILL if it's still alive.
const KILL_GRACE: Duration = Duration::from_secs(2);

struct RunningChild {
    pid: Pid,
    deadline: Instant,
    escalated: bool,
    command: String,
    stdout_thread: Option<JoinHandle<()>>,
    stderr_thread: Option<JoinHandle<()>>,
}

/// Owns every handler child currently forked, reaping finished ones and
/// escalating signals against ones that overran their timeout.
#[derive(Default)]
pub struct ProcessManager {
    children: HashMap<i32, RunningChild>,
}

impl ProcessManager {
    pub fn new() -> Self {
        ProcessManager::default()
    }

    pub fn running_count(&self) -> usize {
        self.children.len()
    }

    /// Forks and execs one handler invocation, wiring up its environment
    /// and, if requested, capturing its stdout/stderr into the log.
    pub fn spawn(&mut self, invocation: &HandlerInvocation) -> std::io::Result<()> {
        let handler = &invocation.handler;
        let mut command = build_command(handler, invocation);

        let want_stdout = handler.flags.contains(HandlerFlags::STDOUT);
        let want_stderr = handler.flags.contains(HandlerFlags::STDERR);
        command.stdout(if want_stdout { Stdio::piped() } else { Stdio::null() });
        command.stderr(if want_stderr { Stdio::piped() } else { Stdio::null() });
        command.stdin(Stdio::null());

        let credentials = handler.credentials.clone();
        unsafe {
            command.pre_exec(move || {
                nix::unistd::setsid().map_err(to_io_error)?;
                apply_credentials(&credentials)?;
                Ok(())
            });
        }

        debug!("spawning handler: {:?}", command);
        let mut child = command.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);

        let stdout_thread = child.stdout.take().map(|out| spawn_log_thread(out, "stdout"));
        let stderr_thread = child.stderr.take().map(|err| spawn_log_thread(err, "stderr"));

        self.children.insert(
            pid.as_raw(),
            RunningChild {
                pid,
                deadline: Instant::now() + handler.timeout,
                escalated: false,
                command: handler.command.clone(),
                stdout_thread,
                stderr_thread,
            },
        );

        if handler.flags.contains(HandlerFlags::NOWAIT) {
            // Fire-and-forget: still tracked so it's eventually reaped and
            // its timeout still applies, but the caller never blocks on it.
        } else {
            // "wait" is the default: the dispatcher blocks here until this
            // one child exits, escalating SIGTERM then SIGKILL if it
            // overruns its deadline. This is the other suspension point
            // besides the backend's blocking poll.
            self.wait_blocking(pid.as_raw());
        }

        Ok(())
    }

    /// Blocks the calling thread until `raw_pid` is reaped, polling
    /// `waitpid(WNOHANG)` on a short tick rather than relying on a real
    /// SIGALRM (the daemon's only other timer source is the backend poll's
    /// own slice, which isn't running while we're stuck here). Escalates
    /// exactly like [`Self::scan_timeouts`] does for `nowait` children.
    fn wait_blocking(&mut self, raw_pid: i32) {
        const TICK: Duration = Duration::from_millis(50);
        loop {
            let pid = match self.children.get(&raw_pid) {
                Some(child) => child.pid,
                None => return,
            };
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    self.finish(raw_pid, &status);
                    return;
                }
                Err(nix::errno::Errno::ECHILD) => {
                    self.children.remove(&raw_pid);
                    return;
                }
                Err(_) => {}
            }
            self.escalate_one(raw_pid);
            std::thread::sleep(TICK);
        }
    }

    /// Sends SIGTERM on first deadline overrun, SIGKILL on the next one
    /// after the grace period — the same ladder [`Self::scan_timeouts`]
    /// applies to `nowait` children, factored out so both paths agree.
    fn escalate_one(&mut self, raw_pid: i32) {
        let Some(child) = self.children.get_mut(&raw_pid) else {
            return;
        };
        let now = Instant::now();
        if now < child.deadline {
            return;
        }
        if !child.escalated {
            debug!("handler {:?} (pid {}) timed out, sending SIGTERM", child.command, child.pid);
            let _ = nix::sys::signal::kill(child.pid, NixSignal::SIGTERM);
            child.escalated = true;
            child.deadline = now + KILL_GRACE;
        } else {
            debug!("handler {:?} (pid {}) ignored SIGTERM, sending SIGKILL", child.command, child.pid);
            let _ = nix::sys::signal::kill(child.pid, NixSignal::SIGKILL);
        }
    }

    /// Non-blocking reap pass: collects any child that has already exited.
    pub fn reap_children(&mut self) {
        let pids: Vec<i32> = self.children.keys().copied().collect();
        for raw_pid in pids {
            let Some(child) = self.children.get(&raw_pid) else {
                continue;
            };
            match waitpid(child.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    self.finish(raw_pid, &status);
                }
                Err(nix::errno::Errno::ECHILD) => {
                    self.children.remove(&raw_pid);
                }
                Err(_) => {}
            }
        }
    }

    /// Scans `nowait` children past their deadline, sending SIGTERM on
    /// first overrun and SIGKILL if they're still alive after the grace
    /// period. Children spawned in `wait` mode never appear here — their
    /// escalation happens inline inside [`Self::wait_blocking`].
    pub fn scan_timeouts(&mut self) {
        let pids: Vec<i32> = self.children.keys().copied().collect();
        for raw_pid in pids {
            self.escalate_one(raw_pid);
        }
    }

    fn finish(&mut self, raw_pid: i32, status: &WaitStatus) {
        if let Some(child) = self.children.remove(&raw_pid) {
            debug!("handler {:?} (pid {}) exited: {:?}", child.command, child.pid, status);
            if let Some(t) = child.stdout_thread {
                let _ = t.join();
            }
            if let Some(t) = child.stderr_thread {
                let _ = t.join();
            }
        }
    }
}

fn to_io_error(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

fn apply_credentials(credentials: &Credentials) -> std::io::Result<()> {
    use nix::unistd::{setgid, setgroups, setuid, Gid, Uid};

    if !credentials.has_identity_change() {
        return Ok(());
    }

    let gids: Vec<Gid> = credentials.gids.iter().map(|g| Gid::from_raw(*g)).collect();
    setgroups(&gids).map_err(to_io_error)?;
    if let Some(&primary) = credentials.gids.first() {
        setgid(Gid::from_raw(primary)).map_err(to_io_error)?;
    }
    setuid(Uid::from_raw(credentials.uid)).map_err(to_io_error)?;
    Ok(())
}

fn build_command(handler: &Handler, invocation: &HandlerInvocation) -> Command {
    let mut command = if handler.flags.contains(HandlerFlags::SHELL) {
        let mut c = Command::new("/bin/sh");
        c.arg("-c").arg(&handler.command);
        c
    } else {
        let mut parts = handler.command.split_whitespace();
        let program = parts.next().unwrap_or(&handler.command);
        let mut c = Command::new(program);
        c.args(parts);
        c
    };

    command.current_dir(&invocation.event.dir);

    for (key, value) in &handler.environ {
        command.env(key, value);
    }
    for (key, value) in env_vars_for(invocation) {
        command.env(key, value);
    }

    command
}

/// Builds the bit-exact `DIREVENT_*` environment bindings handlers rely on.
fn env_vars_for(invocation: &HandlerInvocation) -> Vec<(&'static str, String)> {
    let event = &invocation.event;
    vec![
        ("DIREVENT_SYSEV_CODE", event.native_bits.to_string()),
        ("DIREVENT_SYSEV_NAME", event.native_names.clone()),
        ("DIREVENT_GENEV_CODE", event.generic.as_decimal().to_string()),
        ("DIREVENT_GENEV_NAME", event.generic.names_joined()),
        (
            "DIREVENT_FILE",
            event
                .name
                .as_ref()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        ),
        ("DIREVENT_SELF_TEST_PID", std::process::id().to_string()),
    ]
}

fn spawn_log_thread(stream: impl std::io::Read + Send + 'static, label: &'static str) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(stream).lines().map_while(Result::ok) {
            info!("[{}] {}", label, line);
        }
    })
}
