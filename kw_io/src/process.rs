//! Bounded execution of package programs.

use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// How long output pipes may stay open after the program itself has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct Captured {
    /// `None` when the process was killed after the timeout
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }

    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    /// Stdout and stderr joined for error reports.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
        }
    }
}

/// Run `command` with empty stdin, capturing its output, for at most `timeout`.
///
/// The program runs in its own process group. On timeout the whole group is
/// killed, and processes it left behind holding the output pipes are killed
/// once `DRAIN_GRACE` has passed, so the call returns shortly after `timeout`.
pub fn run_captured(mut command: Command, timeout: Duration) -> io::Result<Captured> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()?;
    let group = child.id();

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let (status, timed_out) = match child.wait_timeout(timeout)? {
        Some(status) => (Some(status), false),
        None => {
            kill_group(group);
            kill_and_reap(&mut child);
            (None, true)
        }
    };

    let mut stdout = Drained::new(stdout);
    let mut stderr = Drained::new(stderr);
    stdout.wait(DRAIN_GRACE);
    stderr.wait(DRAIN_GRACE);
    if !(stdout.done() && stderr.done()) {
        debug!(pgid = group, "output still open after exit; killing process group");
        kill_group(group);
        stdout.wait(DRAIN_GRACE);
        stderr.wait(DRAIN_GRACE);
    }

    Ok(Captured {
        status,
        stdout: stdout.into_string(),
        stderr: stderr.into_string(),
        timed_out,
    })
}

/// Kill `child` if it is still running and wait for it.
pub fn kill_and_reap(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Err(e) = child.kill() {
        warn!(pid = child.id(), "failed to kill child: {e}");
    }
    let _ = child.wait();
}

/// SIGKILL every process in group `pgid`.
fn kill_group(pgid: u32) {
    let Ok(raw) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions
    if unsafe { libc::killpg(raw, libc::SIGKILL) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, "failed to kill process group: {err}");
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<String>> {
    pipe.map(|mut pipe| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
        });
        rx
    })
}

/// Output of one drain thread, collected with a deadline.
struct Drained {
    rx: Option<Receiver<String>>,
    text: Option<String>,
}

impl Drained {
    fn new(rx: Option<Receiver<String>>) -> Self {
        Self { rx, text: None }
    }

    fn wait(&mut self, grace: Duration) {
        if self.text.is_some() {
            return;
        }
        match &self.rx {
            Some(rx) => {
                if let Ok(text) = rx.recv_timeout(grace) {
                    self.text = Some(text);
                }
            }
            None => self.text = Some(String::new()),
        }
    }

    fn done(&self) -> bool {
        self.text.is_some()
    }

    fn into_string(self) -> String {
        self.text.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_output_and_status() {
        let out = run_captured(sh("echo out; echo err >&2; exit 3"), Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.code(), Some(3));
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.combined(), "out\nerr");
        assert!(!out.timed_out);
    }

    #[test]
    fn stdin_is_empty() {
        let out = run_captured(sh("cat; echo done"), Duration::from_secs(10)).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "done\n");
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_captured(sh("exec sleep 30"), Duration::from_millis(200)).unwrap();
        assert!(out.timed_out);
        assert!(out.status.is_none());
        assert!(!out.success());
    }

    #[test]
    fn timeout_bounds_forked_grandchildren() {
        let started = Instant::now();
        let out = run_captured(sh("sleep 30; true"), Duration::from_millis(200)).unwrap();
        assert!(out.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "returned after {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn background_process_holding_pipes_is_reaped() {
        let started = Instant::now();
        let out = run_captured(sh("echo ready; sleep 30 & exit 0"), Duration::from_secs(10))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "ready\n");
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[test]
    fn large_output_does_not_block() {
        let out = run_captured(
            sh("i=0; while [ $i -lt 20000 ]; do echo line-$i; i=$((i+1)); done"),
            Duration::from_secs(30),
        )
        .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.lines().count(), 20000);
    }
}
