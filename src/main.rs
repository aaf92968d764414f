//! yadap: Debug Adapter Protocol server for interpreter-hosted programs.
//!
//! Listens on stdio, TCP or a unix socket. Every session evaluates the configured program
//! in an interpreter subprocess and streams its output to the client.

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use yadap::adapter::process::ProcessEngine;
use yadap::adapter::Adapter;
use yadap::config::{Args, Config};
use yadap::dap::server::{HandlerFactory, Server};
use yadap::dap::session::Handler;
use yadap::dap::tracer::Tracer;
use yadap::dap::transport::{remove_stale_socket, ListenAddr};

fn init_logger(log_file: Option<&Path>) -> anyhow::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let config = Config::from_args(Args::parse())?;
    init_logger(config.log_file.as_deref())?;

    let tracer = match (&config.log_file, config.trace_dap) {
        (Some(path), true) => Some(Tracer::file(path)?),
        (None, true) => {
            warn!(target: "dap", "--trace-dap requires --log-file; tracing disabled");
            None
        }
        _ => None,
    };

    let listener = config
        .listen
        .bind()
        .with_context(|| format!("bind {}", config.listen))?;
    if let ListenAddr::Unix(path) = &config.listen {
        let path = path.clone();
        ctrlc::set_handler(move || {
            _ = remove_stale_socket(&path);
            std::process::exit(130);
        })
        .context("set Ctrl-C handler")?;
    }
    info!(target: "dap", "yadap listening on {}", listener.local_addr());

    let engine = ProcessEngine::factory(config.engine.clone());
    let program = config.program.clone();
    let factory: HandlerFactory = Arc::new(move || {
        Box::new(Adapter::new(engine.clone(), program.clone())) as Box<dyn Handler>
    });
    let server = Server::new(listener, factory).with_tracer(tracer);

    // standard streams can't be reopened once the client is gone
    if config.oneshot || config.listen == ListenAddr::Stdio {
        server.serve_one()?;
    } else {
        server.serve()?;
    }
    Ok(())
}
