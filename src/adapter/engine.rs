use crate::adapter::channel::StopNotifier;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Cancellation token of one evaluation.
///
/// Cancellation is cooperative: an engine observes it only where it chooses to check.
/// A context is done once cancelled, either by the adapter or by the evaluation itself.
#[derive(Clone, Default)]
pub struct ExecContext {
    done: Arc<(Mutex<bool>, Condvar)>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the context. Idempotent.
    pub fn cancel(&self) {
        let (done, signal) = &*self.done;
        *done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        signal.notify_all();
    }

    pub fn is_done(&self) -> bool {
        *self.done.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the context is done or timeout elapses. Return true if context is done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (done, signal) = &*self.done;
        let guard = done.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = signal
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// What to evaluate: inline source text or a file.
#[derive(Debug, Clone, PartialEq)]
pub enum Program {
    Source(String),
    Path(PathBuf),
}

/// Streams and callbacks handed to an engine at construction time.
pub struct EngineOptions {
    pub stdin: Box<dyn Read + Send>,
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
    /// Report debug stops, engines without a debugger may ignore it.
    pub stops: StopNotifier,
}

/// Successful evaluation outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Evaluation {
    pub exit_code: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("evaluation cancelled")]
    Cancelled,
    #[error("program exited with code {0}")]
    Exit(i32),
    #[error("{0}")]
    Eval(String),
}

/// Language engine evaluating programs on behalf of the adapter.
pub trait Engine: Send {
    fn evaluate_source(
        &mut self,
        ctx: &ExecContext,
        source: &str,
    ) -> Result<Evaluation, EngineError>;

    fn evaluate_path(&mut self, ctx: &ExecContext, path: &Path) -> Result<Evaluation, EngineError>;

    fn evaluate(&mut self, ctx: &ExecContext, program: &Program) -> Result<Evaluation, EngineError> {
        match program {
            Program::Source(source) => self.evaluate_source(ctx, source),
            Program::Path(path) => self.evaluate_path(ctx, path),
        }
    }
}

/// Engine constructor.
pub type EngineFactory = Arc<dyn Fn(EngineOptions) -> anyhow::Result<Box<dyn Engine>> + Send + Sync>;

/// Execution state reported by an engine that stopped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugStop {
    pub thread_id: i64,
    /// `breakpoint`, `step`, `pause`, etc.
    pub reason: String,
    pub description: Option<String>,
    /// Innermost frame first.
    pub frames: Vec<FrameInfo>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameInfo {
    pub name: String,
    pub path: Option<PathBuf>,
    pub line: i64,
    pub column: i64,
    pub scopes: Vec<ScopeInfo>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeInfo {
    pub name: String,
    pub variables: Vec<VariableInfo>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableInfo {
    pub name: String,
    pub value: String,
    pub type_name: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_cancel_is_idempotent_and_shared() {
        let ctx = ExecContext::new();
        let clone = ctx.clone();
        assert!(!clone.is_done());
        ctx.cancel();
        ctx.cancel();
        assert!(clone.is_done());
    }

    #[test]
    fn test_wait_timeout() {
        let ctx = ExecContext::new();
        let now = Instant::now();
        assert!(!ctx.wait_timeout(Duration::from_millis(20)));
        assert!(now.elapsed() >= Duration::from_millis(20));

        let waiter = thread::spawn({
            let ctx = ctx.clone();
            move || ctx.wait_timeout(Duration::from_secs(10))
        });
        ctx.cancel();
        assert!(waiter.join().unwrap());
    }
}
