use crate::adapter::engine::{
    Engine, EngineError, EngineFactory, EngineOptions, Evaluation, ExecContext,
};
use anyhow::Context;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use os_pipe::PipeReader;
use serde::Deserialize;
use std::ffi::OsStr;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const GRACE_PERIOD: Duration = Duration::from_millis(500);

/// How to run the interpreter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProcessConfig {
    /// Interpreter name or path, names are resolved through `PATH`.
    pub interpreter: String,
    /// Flag that makes the interpreter evaluate its next argument as source text.
    pub source_flag: String,
    /// Extra interpreter arguments, placed before the program.
    pub args: Vec<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            interpreter: "sh".to_string(),
            source_flag: "-c".to_string(),
            args: vec![],
        }
    }
}

/// Engine that evaluates programs in an interpreter subprocess.
///
/// Unlike in-process engines, evaluation can be cancelled for real: the whole process group
/// receives SIGTERM, then SIGKILL if it is still alive after a grace period.
pub struct ProcessEngine {
    interpreter: PathBuf,
    config: ProcessConfig,
    options: EngineOptions,
}

impl ProcessEngine {
    pub fn new(config: ProcessConfig, options: EngineOptions) -> anyhow::Result<Self> {
        let interpreter = which::which(&config.interpreter)
            .with_context(|| format!("interpreter `{}` not found", config.interpreter))?;
        Ok(Self {
            interpreter,
            config,
            options,
        })
    }

    pub fn factory(config: ProcessConfig) -> EngineFactory {
        Arc::new(move |options| {
            let engine = ProcessEngine::new(config.clone(), options)?;
            Ok(Box::new(engine) as Box<dyn Engine>)
        })
    }

    fn run(&mut self, ctx: &ExecContext, args: &[&OsStr]) -> Result<Evaluation, EngineError> {
        let (stdout_reader, stdout_writer) = os_pipe::pipe()?;
        let (stderr_reader, stderr_writer) = os_pipe::pipe()?;

        let mut command = Command::new(&self.interpreter);
        command
            .args(&self.config.args)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(stdout_writer)
            .stderr(stderr_writer)
            .process_group(0);
        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            program: self.interpreter.display().to_string(),
            source,
        })?;
        // release parent copies of the pipe write ends, readers see EOF when the child exits
        drop(command);
        debug!(target: "adapter", "interpreter started, pid {}", child.id());

        let child_stdin = child.stdin.take();
        let EngineOptions {
            stdin,
            stdout,
            stderr,
            ..
        } = &mut self.options;

        let status = thread::scope(|s| {
            s.spawn(move || forward(stdout_reader, stdout));
            s.spawn(move || forward(stderr_reader, stderr));
            if let Some(mut child_stdin) = child_stdin {
                s.spawn(move || {
                    _ = io::copy(stdin, &mut child_stdin);
                });
            }
            wait(&mut child, ctx)
        })?;

        match exit_code(status) {
            0 => Ok(Evaluation { exit_code: 0 }),
            code => Err(EngineError::Exit(code)),
        }
    }
}

impl Engine for ProcessEngine {
    fn evaluate_source(
        &mut self,
        ctx: &ExecContext,
        source: &str,
    ) -> Result<Evaluation, EngineError> {
        let flag = self.config.source_flag.clone();
        if flag.is_empty() {
            self.run(ctx, &[OsStr::new(source)])
        } else {
            self.run(ctx, &[OsStr::new(&flag), OsStr::new(source)])
        }
    }

    fn evaluate_path(&mut self, ctx: &ExecContext, path: &Path) -> Result<Evaluation, EngineError> {
        self.run(ctx, &[path.as_os_str()])
    }
}

/// Copy child output into an engine stream line by line.
fn forward(source: PipeReader, sink: &mut Box<dyn Write + Send>) {
    let mut source = BufReader::new(source);
    let mut line = Vec::new();
    loop {
        line.clear();
        match source.read_until(b'\n', &mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if sink.write_all(&line).is_err() {
                    break;
                }
            }
        }
    }
    _ = sink.flush();
}

fn wait(child: &mut Child, ctx: &ExecContext) -> Result<ExitStatus, EngineError> {
    loop {
        if let Some(status) = child.try_wait()? {
            // background jobs left by the program hold the output pipes open
            kill_leftovers(child);
            return Ok(status);
        }
        if ctx.wait_timeout(POLL_INTERVAL) {
            kill(child)?;
            return Err(EngineError::Cancelled);
        }
    }
}

/// Terminate the child process group: SIGTERM first, SIGKILL after a grace period.
fn kill(child: &mut Child) -> io::Result<()> {
    let group = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(group, Signal::SIGTERM) {
        warn!(target: "adapter", "send SIGTERM to {group}: {e}");
    }

    let deadline = Instant::now() + GRACE_PERIOD;
    while Instant::now() < deadline {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }

    debug!(target: "adapter", "interpreter {group} ignores SIGTERM, kill it");
    if let Err(e) = killpg(group, Signal::SIGKILL) {
        warn!(target: "adapter", "send SIGKILL to {group}: {e}");
    }
    child.wait().map(|_| ())
}

/// Kill what is left of the process group after the interpreter itself exited.
fn kill_leftovers(child: &Child) {
    let group = Pid::from_raw(child.id() as i32);
    match killpg(group, Signal::SIGKILL) {
        Ok(()) => debug!(target: "adapter", "killed leftover processes of group {group}"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(target: "adapter", "send SIGKILL to {group}: {e}"),
    }
}

/// Exit code of a process, signal terminations are mapped to `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}
