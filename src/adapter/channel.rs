//! Outbound queue of an evaluation task.
//!
//! The evaluation thread never touches the session. Everything it produces (program output,
//! debug stops, exit status) goes into an [`Outbound`] queue, drained by a single pump that
//! owns the session sender.

use crate::adapter::engine::DebugStop;
use crate::dap::types::OutputCategory;
use std::io;
use std::io::Write;
use std::sync::mpsc;

pub enum Outbound {
    Output {
        category: OutputCategory,
        output: String,
    },
    /// Engine stopped, it waits for a message on `resume` (or for `resume` to drop).
    Stopped {
        stop: DebugStop,
        resume: mpsc::Sender<()>,
    },
    Exited(i32),
    Terminated,
}

/// Redirected engine output stream, every write becomes an `output` event.
pub struct ChannelWriter {
    category: OutputCategory,
    queue: mpsc::Sender<Outbound>,
}

impl ChannelWriter {
    pub fn new(category: OutputCategory, queue: mpsc::Sender<Outbound>) -> Self {
        Self { category, queue }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.queue
            .send(Outbound::Output {
                category: self.category,
                output: String::from_utf8_lossy(buf).into_owned(),
            })
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Handle used by an engine to report a debug stop.
#[derive(Clone)]
pub struct StopNotifier {
    queue: mpsc::Sender<Outbound>,
}

impl StopNotifier {
    pub fn new(queue: mpsc::Sender<Outbound>) -> Self {
        Self { queue }
    }

    /// Report a stop and block until the client resumes execution.
    ///
    /// Return false if the session is gone, the engine should abort evaluation then.
    pub fn stop(&self, stop: DebugStop) -> bool {
        let (resume, resumed) = mpsc::channel();
        if self.queue.send(Outbound::Stopped { stop, resume }).is_err() {
            return false;
        }
        resumed.recv().is_ok()
    }
}
