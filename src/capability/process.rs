//! Command execution capability.
//!
//! Every external process the restore engine invokes (`systemctl`, `mount`,
//! `umount`, `chattr`, `ip`, `ifreload`, `pvesh`, `proxmox-backup-manager`,
//! `systemd-run`, …) flows through this module. No call site in the crate
//! is allowed to call `std::process::Command` directly outside of here.

use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::io;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Value for environment variables.
#[derive(Clone, Debug)]
#[allow(dead_code)]
pub enum EnvValue {
    Plain(String),
    Secret(String),
}

/// How to configure stdio.
#[derive(Clone, Debug)]
pub enum StdioSpec {
    Inherit,
    Null,
    Pipe,
}

/// Command specification.
#[derive(Clone, Debug)]
pub struct CmdSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, EnvValue)>,
    pub stdin: StdioSpec,
    pub stdout: StdioSpec,
    pub stderr: StdioSpec,
}

#[allow(dead_code)]
impl CmdSpec {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin: StdioSpec::Inherit,
            stdout: StdioSpec::Inherit,
            stderr: StdioSpec::Inherit,
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, it: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(it.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, k: impl Into<String>, v: EnvValue) -> Self {
        self.envs.push((k.into(), v));
        self
    }

    pub fn stdin(mut self, s: StdioSpec) -> Self {
        self.stdin = s;
        self
    }
    pub fn stdout(mut self, s: StdioSpec) -> Self {
        self.stdout = s;
        self
    }
    pub fn stderr(mut self, s: StdioSpec) -> Self {
        self.stderr = s;
        self
    }

    /// Render this command with redacted secrets, for logging / dry-run.
    pub fn render(&self) -> String {
        let prog = sh_quote(&self.program);
        let args: Vec<String> = self.args.iter().map(|a| sh_quote(a)).collect();
        let mut env_prefix = String::new();
        for (k, v) in &self.envs {
            match v {
                EnvValue::Plain(val) => env_prefix.push_str(&format!("{k}={} ", sh_quote(val))),
                EnvValue::Secret(_) => env_prefix.push_str(&format!("{k}=<redacted> ")),
            }
        }
        format!("{}{} {}", env_prefix, prog, args.join(" "))
    }
}

/// A sequence of commands, possibly piped.
#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    pub cmds: Vec<CmdSpec>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { cmds: Vec::new() }
    }

    pub fn single(c: CmdSpec) -> Self {
        Self::new().cmd(c)
    }

    pub fn cmd(mut self, c: CmdSpec) -> Self {
        self.cmds.push(c);
        self
    }

    pub fn render(&self) -> String {
        self.cmds
            .iter()
            .map(|c| c.render())
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Outcome of a command run with a deadline: either it completed (with its
/// exit status recorded as a plain integer, platform signal deaths mapped
/// to a negative code) or the deadline elapsed and the process tree was
/// killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(i32),
    TimedOut,
}

pub trait Runner: Send + Sync {
    fn run(&self, pipeline: &Pipeline) -> Result<()>;
    fn run_capture(&self, pipeline: &Pipeline) -> Result<String>;

    /// Run a single command and return its raw exit status without
    /// treating non-zero as an error. Used by callers that need to branch
    /// on specific exit codes (e.g. `systemctl is-active`, `umount`'s 32
    /// for "not mounted").
    fn run_status(&self, cmd: &CmdSpec) -> Result<i32>;

    /// Like [`Runner::run`] but kills the process tree if `deadline`
    /// elapses first. Every suspension point in the restore engine that
    /// shells out honors this.
    fn run_with_deadline(&self, cmd: &CmdSpec, deadline: Option<Instant>) -> Result<RunOutcome>;
}

#[derive(Default, Clone)]
pub struct ProcessRunner {
    bin_overrides: HashMap<String, String>,
}

#[allow(dead_code)]
impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            bin_overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, bin: &str, path: &str) -> Self {
        self.bin_overrides.insert(bin.to_string(), path.to_string());
        self
    }

    fn resolve_bin<'a>(&'a self, bin: &'a str) -> &'a str {
        self.bin_overrides
            .get(bin)
            .map(|s| s.as_str())
            .unwrap_or(bin)
    }

    fn build(&self, spec: &CmdSpec) -> Command {
        let bin = self.resolve_bin(&spec.program);
        let mut cmd = Command::new(bin);
        cmd.args(&spec.args);
        for (k, v) in &spec.envs {
            match v {
                EnvValue::Plain(val) => cmd.env(k, val),
                EnvValue::Secret(val) => cmd.env(k, val),
            };
        }
        cmd
    }
}

impl Runner for ProcessRunner {
    fn run(&self, pipeline: &Pipeline) -> Result<()> {
        let mut children: Vec<Child> = Vec::new();
        let mut prev_stdout = None;

        for (i, spec) in pipeline.cmds.iter().enumerate() {
            let mut cmd = self.build(spec);

            if i == 0 {
                cmd.stdin(stdio_for(&spec.stdin));
            } else {
                cmd.stdin(prev_stdout.take().unwrap());
            }

            if i == pipeline.cmds.len() - 1 {
                cmd.stdout(stdio_for(&spec.stdout));
            } else {
                cmd.stdout(Stdio::piped());
            }
            cmd.stderr(stdio_for(&spec.stderr));

            let mut child = cmd
                .spawn()
                .with_context(|| format!("spawn {}", spec.render()))?;

            prev_stdout = child.stdout.take().map(Stdio::from);
            children.push(child);
        }

        for mut child in children {
            let status = child
                .wait()
                .with_context(|| format!("wait for {}", pipeline.render()))?;
            if !status.success() {
                bail!("command failed: {} with {status}", pipeline.render());
            }
        }
        Ok(())
    }

    fn run_capture(&self, pipeline: &Pipeline) -> Result<String> {
        if pipeline.cmds.len() != 1 {
            bail!(
                "capture only works with single command, got {}",
                pipeline.cmds.len()
            );
        }
        let spec = &pipeline.cmds[0];
        let out = self
            .build(spec)
            .output()
            .with_context(|| format!("run {}", spec.render()))?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            bail!("command failed: {} (status {})", spec.render(), out.status);
        }
    }

    fn run_status(&self, cmd: &CmdSpec) -> Result<i32> {
        let out = self
            .build(cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("run {}", cmd.render()))?;
        Ok(out.status.code().unwrap_or(-1))
    }

    fn run_with_deadline(&self, cmd: &CmdSpec, deadline: Option<Instant>) -> Result<RunOutcome> {
        let mut child = self
            .build(cmd)
            .stdin(stdio_for(&cmd.stdin))
            .stdout(stdio_for(&cmd.stdout))
            .stderr(stdio_for(&cmd.stderr))
            .spawn()
            .with_context(|| format!("spawn {}", cmd.render()))?;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(RunOutcome::Exited(status.code().unwrap_or(-1))),
                Ok(None) => {}
                Err(e) => return Err(e).with_context(|| format!("wait for {}", cmd.render())),
            }

            if let Some(dl) = deadline
                && Instant::now() >= dl
            {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(RunOutcome::TimedOut);
            }

            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

fn stdio_for(spec: &StdioSpec) -> Stdio {
    match spec {
        StdioSpec::Inherit => Stdio::inherit(),
        StdioSpec::Null => Stdio::null(),
        StdioSpec::Pipe => Stdio::piped(),
    }
}

/// Poll an external status command (e.g. `systemctl is-active foo`) until
/// it reports `done_when`, or `timeout` elapses.
pub fn poll_until(
    runner: &dyn Runner,
    mut probe: impl FnMut() -> Result<String>,
    done_when: impl Fn(&str) -> bool,
    timeout: Duration,
    interval: Duration,
) -> Result<bool> {
    let start = Instant::now();
    loop {
        let out = probe()?;
        if done_when(out.trim()) {
            return Ok(true);
        }
        if start.elapsed() >= timeout {
            return Ok(false);
        }
        // keep the runner referenced so callers threading it through don't
        // need a separate no-op branch when the probe itself is a closure.
        let _ = runner;
        std::thread::sleep(interval);
    }
}

pub fn sh_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".into();
    }
    if !s
        .bytes()
        .any(|b| b == b' ' || b == b'\'' || b == b'"' || b == b'\\')
    {
        return s.to_string();
    }
    let mut out = String::from("'");
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Translate a [`io::Error`] raised while spawning into a friendlier
/// "binary not found" message when applicable.
pub fn spawn_context(program: &str, err: io::Error) -> anyhow::Error {
    if err.kind() == io::ErrorKind::NotFound {
        anyhow::anyhow!("binary not found in PATH: {program}")
    } else {
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_redacts_secret_env() {
        let cmd = CmdSpec::new("echo")
            .arg("hi")
            .env("TOKEN", EnvValue::Secret("s3cr3t".into()));
        let rendered = cmd.render();
        assert!(rendered.contains("TOKEN=<redacted>"));
        assert!(!rendered.contains("s3cr3t"));
    }

    #[test]
    fn run_capture_reads_stdout() {
        let runner = ProcessRunner::new();
        let out = runner
            .run_capture(&Pipeline::single(CmdSpec::new("printf").arg("hello")))
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn run_with_deadline_kills_slow_process() {
        let runner = ProcessRunner::new();
        let deadline = Some(Instant::now() + Duration::from_millis(100));
        let outcome = runner
            .run_with_deadline(&CmdSpec::new("sleep").arg("5"), deadline)
            .unwrap();
        assert_eq!(outcome, RunOutcome::TimedOut);
    }

    #[test]
    fn run_status_reports_nonzero_without_erroring() {
        let runner = ProcessRunner::new();
        let code = runner
            .run_status(&CmdSpec::new("sh").arg("-c").arg("exit 7"))
            .unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn sh_quote_escapes_single_quotes() {
        assert_eq!(sh_quote("a'b"), "'a'\\''b'");
        assert_eq!(sh_quote("plain"), "plain");
    }
}
