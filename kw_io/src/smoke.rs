//! Smoke tests against an installed package.
//!
//! Each scenario launches the package on an ephemeral port with a scratch
//! config, polls until it answers and checks the answer for a marker. All
//! resources a scenario acquires live in a [`TestSession`] whose `Drop` kills
//! the process, stops the companion and removes the scratch directory, so
//! teardown happens on success, failure and panic alike.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::companion::Companion;
use crate::fsutil::copy_path;
use crate::port::reserve_port;
use crate::process::{kill_and_reap, run_captured};
use kw_core::{
    Error, InstallLayout, PackageSpec, ProbeSpec, RuntimeState, ScenarioSpec, SmokeTestSpec, Vars,
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioOutcome {
    Passed,
    Skipped { reason: String },
}

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: String,
    pub outcome: ScenarioOutcome,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub elapsed: Duration,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.outcome == ScenarioOutcome::Passed
    }
}

/// Resources held for the duration of one scenario.
pub struct TestSession {
    port: u16,
    child: Option<Child>,
    pid_file: Option<PathBuf>,
    companion: Option<Companion>,
    // Dropped last, after the process that writes into it is gone
    scratch: TempDir,
}

impl TestSession {
    fn new(scenario: &ScenarioSpec) -> Result<Self, Error> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("kw-test-{}-", scenario.name))
            .tempdir()
            .map_err(|e| session_err(scenario, format!("failed to create scratch dir: {e}")))?;
        for sub in ["config", "data", "logs"] {
            fs::create_dir_all(scratch.path().join(sub))
                .map_err(|e| session_err(scenario, format!("failed to create scratch {sub}: {e}")))?;
        }

        let companion = scenario
            .companion
            .as_ref()
            .map(|c| Companion::start(&c.expect, &c.reply))
            .transpose()
            .map_err(|e| session_err(scenario, format!("failed to start companion: {e}")))?;
        let port = match &companion {
            Some(companion) => companion.port(),
            None => reserve_port()
                .map_err(|e| session_err(scenario, format!("failed to reserve a port: {e}")))?,
        };

        let pid_file = scenario
            .pid_file
            .then(|| scratch.path().join(format!("{}.pid", scenario.name)));

        Ok(Self {
            port,
            child: None,
            pid_file,
            companion,
            scratch,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn scratch(&self) -> &Path {
        self.scratch.path()
    }

    /// PID of the process under test: the recorded one for daemonizing
    /// programs, the child otherwise.
    pub fn pid(&self) -> Option<u32> {
        self.recorded_pid()
            .or_else(|| self.child.as_ref().map(Child::id))
    }

    fn recorded_pid(&self) -> Option<u32> {
        let path = self.pid_file.as_ref()?;
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    fn stdout_path(&self) -> PathBuf {
        self.scratch.path().join("stdout.log")
    }

    fn stderr_path(&self) -> PathBuf {
        self.scratch.path().join("stderr.log")
    }

    /// Captured stdout and stderr of the process under test.
    pub fn output(&self) -> String {
        let stdout = fs::read_to_string(self.stdout_path()).unwrap_or_default();
        let stderr = fs::read_to_string(self.stderr_path()).unwrap_or_default();
        let mut out = String::new();
        if !stdout.trim().is_empty() {
            out.push_str("--- stdout ---\n");
            out.push_str(stdout.trim_end());
            out.push('\n');
        }
        if !stderr.trim().is_empty() {
            out.push_str("--- stderr ---\n");
            out.push_str(stderr.trim_end());
            out.push('\n');
        }
        out
    }

    fn teardown(&mut self) {
        if let Some(pid) = self.recorded_pid() {
            kill_pid(pid);
        }
        if let Some(mut child) = self.child.take() {
            kill_and_reap(&mut child);
        }
        if let Some(mut companion) = self.companion.take() {
            companion.stop();
        }
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        self.teardown();
        debug!(port = self.port, "test session torn down");
    }
}

fn session_err(scenario: &ScenarioSpec, message: String) -> Error {
    Error::SmokeTest {
        scenario: scenario.name.clone(),
        message,
        output: String::new(),
    }
}

/// SIGKILL `pid` and wait until it is gone.
fn kill_pid(pid: u32) {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return;
    };
    if raw <= 1 {
        return;
    }
    // SAFETY: kill(2) has no memory-safety preconditions
    unsafe {
        libc::kill(raw, libc::SIGKILL);
    }

    let deadline = Instant::now() + KILL_WAIT;
    while pid_alive(pid) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    if pid_alive(pid) {
        warn!(pid, "process still alive after SIGKILL");
    }
}

/// Whether `pid` names a live (non-zombie) process.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence and permission
    let exists = unsafe { libc::kill(raw, 0) } == 0
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next().map(|s| s == "Z"))
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

pub struct SmokeTester {
    client: reqwest::Client,
}

impl Default for SmokeTester {
    fn default() -> Self {
        Self::new()
    }
}

impl SmokeTester {
    pub fn new() -> Self {
        // Packages under test answer TLS with a freshly generated self-signed certificate
        let client = reqwest::Client::builder()
            .user_agent("kegwright/0.1")
            .danger_accept_invalid_certs(true)
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// Run the declared scenarios one after another.
    ///
    /// Stops at the first failing scenario. `only` restricts the run to one
    /// scenario by name.
    pub async fn run(
        &self,
        layout: &InstallLayout,
        spec: &PackageSpec,
        state: Option<&RuntimeState>,
        only: Option<&str>,
    ) -> Result<Vec<ScenarioReport>, Error> {
        let Some(test) = &spec.smoke_test else {
            return Ok(Vec::new());
        };

        let scenarios: Vec<&ScenarioSpec> = test
            .scenarios
            .iter()
            .filter(|s| only.is_none_or(|name| s.name == name))
            .collect();
        if let Some(name) = only
            && scenarios.is_empty()
        {
            return Err(Error::InvalidPackage {
                name: spec.name.clone(),
                message: format!("no smoke test scenario named '{name}'"),
            });
        }

        let mut reports = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            reports.push(self.run_scenario(layout, test, scenario, state).await?);
        }
        Ok(reports)
    }

    pub async fn run_scenario(
        &self,
        layout: &InstallLayout,
        test: &SmokeTestSpec,
        scenario: &ScenarioSpec,
        state: Option<&RuntimeState>,
    ) -> Result<ScenarioReport, Error> {
        let started = Instant::now();
        let credential = state.and_then(RuntimeState::credential);

        if scenario.requires_credential && !state.is_some_and(RuntimeState::is_secured) {
            info!(scenario = %scenario.name, "skipped: no credential");
            return Ok(ScenarioReport {
                name: scenario.name.clone(),
                outcome: ScenarioOutcome::Skipped {
                    reason: "security self-configuration did not produce a credential"
                        .to_string(),
                },
                port: None,
                pid: None,
                elapsed: started.elapsed(),
            });
        }

        let mut session = TestSession::new(scenario)?;
        let result = self
            .exercise(layout, test, scenario, &mut session, credential)
            .await;
        let pid = session.pid();
        let port = session.port();
        release(session).await;
        result?;

        info!(scenario = %scenario.name, elapsed = ?started.elapsed(), "passed");
        Ok(ScenarioReport {
            name: scenario.name.clone(),
            outcome: ScenarioOutcome::Passed,
            port: Some(port),
            pid,
            elapsed: started.elapsed(),
        })
    }

    /// Everything between acquiring the session and tearing it down.
    async fn exercise(
        &self,
        layout: &InstallLayout,
        test: &SmokeTestSpec,
        scenario: &ScenarioSpec,
        session: &mut TestSession,
        credential: Option<&str>,
    ) -> Result<(), Error> {
        let vars = scenario_vars(layout, scenario, session, credential)?;

        let commands = pre_commands(layout, scenario, &vars)?;
        let name = scenario.name.clone();
        let timeout = Duration::from_secs(scenario.ready_timeout_secs);
        tokio::task::spawn_blocking(move || run_pre_commands(&name, commands, timeout))
            .await
            .map_err(|e| session_err(scenario, format!("pre-command task failed: {e}")))??;

        materialise_config(layout, scenario, session, &vars)?;
        launch(layout, scenario, session, &vars)?;
        info!(scenario = %scenario.name, port = session.port(), "launched");

        self.await_ready(scenario, session, &vars, probe_auth(test, credential))
            .await
    }

    async fn await_ready(
        &self,
        scenario: &ScenarioSpec,
        session: &mut TestSession,
        vars: &Vars,
        auth: Option<(&str, &str)>,
    ) -> Result<(), Error> {
        let expect = vars.expand(&scenario.expect)?;
        let probe = Probe::resolve(&scenario.probe, vars, session.port())?;
        let waited = Duration::from_secs(scenario.ready_timeout_secs);
        let deadline = Instant::now() + waited;
        let mut delay = INITIAL_BACKOFF;
        let mut last_answer: Option<String> = None;

        loop {
            if !scenario.pid_file
                && let Some(child) = session.child.as_mut()
                && let Ok(Some(status)) = child.try_wait()
            {
                return Err(Error::SmokeTest {
                    scenario: scenario.name.clone(),
                    message: format!("process exited before becoming ready ({status})"),
                    output: session.output(),
                });
            }

            if let Some(answer) = self.probe(&probe, auth).await {
                if answer.contains(&expect) {
                    return Ok(());
                }
                last_answer = Some(answer);
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }

        match last_answer {
            Some(answer) => Err(Error::SmokeTest {
                scenario: scenario.name.clone(),
                message: format!("response never contained '{expect}'"),
                output: format!("--- response ---\n{}\n{}", answer.trim_end(), session.output()),
            }),
            None => {
                debug!(scenario = %scenario.name, output = %session.output(), "never ready");
                Err(Error::Timeout {
                    what: format!("scenario '{}' to become ready", scenario.name),
                    waited,
                })
            }
        }
    }

    async fn probe(&self, probe: &Probe, auth: Option<(&str, &str)>) -> Option<String> {
        match probe {
            Probe::Http { url } => {
                let mut request = self.client.get(url);
                if let Some((user, password)) = auth {
                    request = request.basic_auth(user, Some(password));
                }
                match request.send().await {
                    Ok(response) => response.text().await.ok(),
                    Err(e) => {
                        debug!(url, "probe not answered: {e}");
                        None
                    }
                }
            }
            Probe::File { pattern } => read_matching(pattern),
        }
    }
}

enum Probe {
    Http { url: String },
    File { pattern: String },
}

impl Probe {
    fn resolve(spec: &ProbeSpec, vars: &Vars, port: u16) -> Result<Self, Error> {
        Ok(match spec {
            ProbeSpec::Http { path, tls } => {
                let scheme = if *tls { "https" } else { "http" };
                let path = vars.expand(path)?;
                let path = path.trim_start_matches('/');
                Probe::Http {
                    url: format!("{scheme}://127.0.0.1:{port}/{path}"),
                }
            }
            ProbeSpec::File { path } => Probe::File {
                pattern: vars.expand(path)?,
            },
        })
    }
}

/// Basic-auth pair for HTTP probes once self-configuration captured a credential.
fn probe_auth<'a>(
    test: &'a SmokeTestSpec,
    credential: Option<&'a str>,
) -> Option<(&'a str, &'a str)> {
    Some((test.credential_user.as_deref()?, credential?))
}

/// Tear a session down on the blocking pool; killing a daemonized PID waits for it.
async fn release(session: TestSession) {
    if let Err(e) = tokio::task::spawn_blocking(move || drop(session)).await {
        warn!("test session teardown failed: {e}");
    }
}

/// Concatenated contents of every file matching `pattern`, if any.
fn read_matching(pattern: &str) -> Option<String> {
    let mut paths: Vec<PathBuf> = glob::glob(pattern).ok()?.filter_map(Result::ok).collect();
    paths.sort();
    let contents: Vec<String> = paths
        .iter()
        .filter(|p| p.is_file())
        .filter_map(|p| fs::read_to_string(p).ok())
        .collect();
    (!contents.is_empty()).then(|| contents.concat())
}

fn scenario_vars(
    layout: &InstallLayout,
    scenario: &ScenarioSpec,
    session: &TestSession,
    credential: Option<&str>,
) -> Result<Vars, Error> {
    let scratch = session.scratch();
    let mut vars = layout.vars();
    vars.set("port", session.port().to_string());
    vars.set("scratch", scratch.display().to_string());
    vars.set("scratch_config", scratch.join("config").display().to_string());
    vars.set("scratch_data", scratch.join("data").display().to_string());
    vars.set("scratch_logs", scratch.join("logs").display().to_string());
    if let Some(pid_file) = &session.pid_file {
        vars.set("pid_file", pid_file.display().to_string());
    }
    if let Some(credential) = credential {
        vars.set("credential", credential);
    }
    let node = match &scenario.node {
        Some(template) => vars.expand(template)?,
        None => format!("test-{}", scenario.name),
    };
    vars.set("node", node);
    Ok(vars)
}

fn command_for(
    layout: &InstallLayout,
    scenario: &ScenarioSpec,
    vars: &Vars,
    program: &str,
    args: &[String],
) -> Result<Command, Error> {
    let mut command = Command::new(layout.bin.join(program));
    command
        .args(vars.expand_all(args)?)
        .envs(vars.expand_map(&scenario.env)?);
    Ok(command)
}

/// Expand `pre_commands` into runnable commands paired with their display form.
fn pre_commands(
    layout: &InstallLayout,
    scenario: &ScenarioSpec,
    vars: &Vars,
) -> Result<Vec<(String, Command)>, Error> {
    let mut commands = Vec::with_capacity(scenario.pre_commands.len());
    for cmd in &scenario.pre_commands {
        let Some((program, args)) = cmd.split_first() else {
            continue;
        };
        commands.push((
            cmd.join(" "),
            command_for(layout, scenario, vars, program, args)?,
        ));
    }
    Ok(commands)
}

fn run_pre_commands(
    scenario: &str,
    commands: Vec<(String, Command)>,
    timeout: Duration,
) -> Result<(), Error> {
    for (display_str, command) in commands {
        let out = run_captured(command, timeout).map_err(|e| Error::SmokeTest {
            scenario: scenario.to_string(),
            message: format!("failed to run `{display_str}`: {e}"),
            output: String::new(),
        })?;
        if !out.success() {
            return Err(Error::SmokeTest {
                scenario: scenario.to_string(),
                message: format!("`{display_str}` failed"),
                output: out.combined(),
            });
        }
        debug!(scenario, command = %display_str, "pre-command passed");
    }
    Ok(())
}

fn materialise_config(
    layout: &InstallLayout,
    scenario: &ScenarioSpec,
    session: &TestSession,
    vars: &Vars,
) -> Result<(), Error> {
    let scratch_config = session.scratch().join("config");
    let fail = |message: String| Error::SmokeTest {
        scenario: scenario.name.clone(),
        message,
        output: String::new(),
    };

    for pattern in &scenario.copy_config {
        let full = layout.config.join(pattern);
        let matches: Vec<PathBuf> = glob::glob(&full.display().to_string())
            .map_err(|e| fail(format!("invalid config pattern '{pattern}': {e}")))?
            .filter_map(Result::ok)
            .collect();
        if matches.is_empty() {
            return Err(fail(format!(
                "no config entry matches '{pattern}' in {}",
                layout.config.display()
            )));
        }
        for src in matches {
            let Some(name) = src.file_name() else {
                continue;
            };
            copy_path(&src, &scratch_config.join(name))
                .map_err(|e| fail(format!("failed to copy {}: {e}", src.display())))?;
        }
    }

    for (name, template) in &scenario.config_files {
        let content = vars.expand(template)?;
        fs::write(scratch_config.join(name), content)
            .map_err(|e| fail(format!("failed to write {name}: {e}")))?;
    }
    Ok(())
}

fn launch(
    layout: &InstallLayout,
    scenario: &ScenarioSpec,
    session: &mut TestSession,
    vars: &Vars,
) -> Result<(), Error> {
    let fail = |message: String| Error::SmokeTest {
        scenario: scenario.name.clone(),
        message,
        output: String::new(),
    };
    let stdout = File::create(session.stdout_path())
        .map_err(|e| fail(format!("failed to create stdout log: {e}")))?;
    let stderr = File::create(session.stderr_path())
        .map_err(|e| fail(format!("failed to create stderr log: {e}")))?;

    let mut command = command_for(layout, scenario, vars, &scenario.program, &scenario.args)?;
    command
        .current_dir(session.scratch())
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);

    let child = command
        .spawn()
        .map_err(|e| fail(format!("failed to launch {}: {e}", scenario.program)))?;
    session.child = Some(child);
    Ok(())
}
