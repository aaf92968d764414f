use crate::dap::error::Error;
use crate::dap::session::{Handler, Session};
use crate::dap::tracer::Tracer;
use crate::dap::transport::Listener;
use log::{info, warn};
use std::sync::Arc;
use std::thread;

/// Produce a fresh handler for each accepted connection.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// Accept connections from a listener and bind each of them to a new session.
pub struct Server {
    listener: Box<dyn Listener>,
    factory: HandlerFactory,
    tracer: Option<Tracer>,
}

impl Server {
    pub fn new(listener: Box<dyn Listener>, factory: HandlerFactory) -> Self {
        Self {
            listener,
            factory,
            tracer: None,
        }
    }

    /// Trace traffic of every session into a sink.
    pub fn with_tracer(self, tracer: Option<Tracer>) -> Self {
        Self { tracer, ..self }
    }

    pub fn local_addr(&self) -> String {
        self.listener.local_addr()
    }

    /// Block until a client connects and return a session ready to run.
    pub fn accept(&self) -> Result<Session, Error> {
        let conn = self.listener.accept()?;
        info!(target: "dap", "client connected: {}", conn.peer);
        if let Some(tracer) = &self.tracer {
            tracer.line(&format!("client connected: {}", conn.peer));
        }
        Ok(Session::with_tracer(
            conn,
            (self.factory)(),
            self.tracer.clone(),
        ))
    }

    /// Single-session mode: accept one connection and run it to completion.
    pub fn serve_one(&self) -> Result<(), Error> {
        let mut session = self.accept()?;
        let result = session.run();
        self.finish(&session, &result);
        result
    }

    /// Multi-session mode: run every accepted connection on its own thread.
    ///
    /// Session failures are logged and never stop the listener, an accept failure does.
    pub fn serve(self) -> Result<(), Error> {
        let server = Arc::new(self);
        loop {
            let mut session = server.accept()?;
            let server = server.clone();
            thread::spawn(move || {
                let result = session.run();
                server.finish(&session, &result);
            });
        }
    }

    fn finish(&self, session: &Session, result: &Result<(), Error>) {
        for err in session.errors() {
            warn!(target: "dap", "{} session error: {err:#}", session.peer());
        }
        match result {
            Ok(()) => {
                info!(target: "dap", "{} session finished", session.peer());
                if let Some(tracer) = &self.tracer {
                    tracer.line("session finished OK");
                }
            }
            Err(err) => {
                warn!(target: "dap", "{} ERR {err:#}", session.peer());
                if let Some(tracer) = &self.tracer {
                    tracer.line(&format!("session error: {err:#}"));
                }
            }
        }
    }
}
