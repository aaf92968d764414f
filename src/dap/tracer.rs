use anyhow::Context;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Line-oriented sink for protocol traffic diagnostics.
///
/// Inbound messages are traced as `> {json}`, outbound ones as `< {json}`.
#[derive(Clone)]
pub struct Tracer {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Tracer {
    /// Append trace lines to a file.
    pub fn file(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open trace file {}", path.display()))?;
        Ok(Self::new(file))
    }

    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    pub fn line(&self, text: &str) {
        if let Ok(mut sink) = self.sink.lock() {
            _ = writeln!(sink, "{text}");
            _ = sink.flush();
        }
    }

    pub fn inbound(&self, payload: &[u8]) {
        self.line(&format!("> {}", String::from_utf8_lossy(payload)));
    }

    pub fn outbound(&self, payload: &[u8]) {
        self.line(&format!("< {}", String::from_utf8_lossy(payload)));
    }

    pub fn decode_error(&self, err: &dyn std::fmt::Display) {
        self.line(&format!("> ERR {err}"));
    }
}
