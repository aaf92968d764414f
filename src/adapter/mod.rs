//! Reference session handler.
//!
//! [`Adapter`] runs one evaluation per session: `launch` announces readiness,
//! `configurationDone` starts the engine in a background thread, `terminate` cancels it.
//! Engine output and debug stops flow back to the client as events.

pub mod channel;
pub mod engine;
pub mod process;

use crate::adapter::channel::{ChannelWriter, Outbound, StopNotifier};
use crate::adapter::engine::{
    DebugStop, EngineError, EngineFactory, EngineOptions, ExecContext, Program,
};
use crate::dap::registry::{EventRegistry, Registry, ThreadKeyed};
use crate::dap::session::{ControlFlow, Handler, SessionSender};
use crate::dap::types::*;
use crate::dap::{Message, Request, RequestArguments, ResponseBody};
use crate::{muted_error, weak_error};
use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

/// Id of the single thread reported to clients.
const MAIN_THREAD_ID: i64 = 1;

/// Live stop of one debuggee thread.
#[derive(Clone)]
struct StopEvent {
    thread_id: i64,
    frame_ids: Vec<i64>,
    resume: Sender<()>,
}

impl ThreadKeyed for StopEvent {
    fn thread_id(&self) -> i64 {
        self.thread_id
    }
}

#[derive(Clone)]
struct Frame {
    name: String,
    source: Option<Source>,
    line: i64,
    column: i64,
    scopes: Vec<Scope>,
}

impl Frame {
    fn stack_frame(&self, id: i64) -> StackFrame {
        StackFrame {
            id,
            name: self.name.clone(),
            source: self.source.clone(),
            line: self.line,
            column: self.column,
        }
    }
}

/// Debugger state of the current stop, addressed by client-visible handles.
#[derive(Default)]
struct Registries {
    events: EventRegistry<StopEvent>,
    frames: Registry<Frame>,
    variables: Registry<Vec<Variable>>,
}

impl Registries {
    /// Start a new debug generation from a stop and return the `stopped` event body.
    ///
    /// Frames of older stops are discarded, threads stopped earlier stay stopped but lose
    /// their stack.
    fn record_stop(&self, stop: DebugStop, resume: Sender<()>) -> StoppedEventBody {
        self.frames.purge();
        self.variables.purge();
        for thread_id in self.events.threads() {
            if let Some(mut event) = self.events.get(thread_id) {
                event.frame_ids.clear();
                self.events.retain(event);
            }
        }

        let frame_ids = stop
            .frames
            .into_iter()
            .map(|frame| {
                let scopes = frame
                    .scopes
                    .into_iter()
                    .map(|scope| {
                        let variables = scope
                            .variables
                            .into_iter()
                            .map(|var| Variable {
                                name: var.name,
                                value: var.value,
                                type_name: var.type_name,
                                variables_reference: 0,
                            })
                            .collect();
                        Scope {
                            name: scope.name,
                            presentation_hint: None,
                            variables_reference: self.variables.add(variables),
                            expensive: false,
                        }
                    })
                    .collect();

                self.frames.add(Frame {
                    name: frame.name,
                    source: frame.path.map(|path| Source {
                        name: path
                            .file_name()
                            .map(|name| name.to_string_lossy().into_owned()),
                        path: Some(path.to_string_lossy().into_owned()),
                    }),
                    line: frame.line,
                    column: frame.column,
                    scopes,
                })
            })
            .collect();

        self.events.retain(StopEvent {
            thread_id: stop.thread_id,
            frame_ids,
            resume,
        });

        StoppedEventBody {
            reason: stop.reason,
            description: stop.description,
            thread_id: Some(stop.thread_id),
            all_threads_stopped: Some(false),
        }
    }

    /// Drop every handle. Engines blocked in a stop are released and abort.
    fn purge_all(&self) {
        self.events.purge();
        self.frames.purge();
        self.variables.purge();
    }
}

/// Handler bridging a session to an evaluation engine.
pub struct Adapter {
    factory: EngineFactory,
    program: Program,
    context: ExecContext,
    sender: Option<SessionSender>,
    registries: Arc<Registries>,
    started: bool,
}

impl Adapter {
    pub fn new(factory: EngineFactory, program: Program) -> Self {
        Self {
            factory,
            program,
            context: ExecContext::new(),
            sender: None,
            registries: Arc::default(),
            started: false,
        }
    }

    /// Start the evaluation thread and the pump that forwards its output to the session.
    fn start(&mut self, sender: &SessionSender) {
        if self.started || self.context.is_done() {
            return;
        }
        self.started = true;

        let (queue, outbound) = mpsc::channel();
        thread::spawn({
            let factory = self.factory.clone();
            let program = self.program.clone();
            let context = self.context.clone();
            move || evaluate(factory, program, context, queue)
        });
        thread::spawn({
            let sender = sender.clone();
            let registries = self.registries.clone();
            let context = self.context.clone();
            move || pump(outbound, sender, registries, context)
        });
    }

    fn handle(&mut self, sender: &SessionSender, request: &Request) -> anyhow::Result<ControlFlow> {
        match (request.command.as_str(), &request.arguments) {
            ("launch", _) => {
                sender.event("initialized", None)?;
                sender.respond_success(request, None)?;
            }
            ("configurationDone", _) => {
                sender.respond_success(request, None)?;
                self.start(sender);
            }
            ("threads", _) => {
                let threads = vec![Thread {
                    id: MAIN_THREAD_ID,
                    name: "main".to_string(),
                }];
                sender.respond_success(request, ResponseBody::from(ThreadsResponseBody { threads }))?;
            }
            ("terminate", _) => {
                info!(target: "adapter", "terminate requested");
                self.context.cancel();
                sender.respond_success(request, None)?;
            }
            ("disconnect", _) => {
                sender.respond_success(request, None)?;
                return Ok(ControlFlow::Stop);
            }
            ("stackTrace", Some(RequestArguments::StackTrace(args))) => {
                self.stack_trace(sender, request, args)?
            }
            ("scopes", Some(RequestArguments::Scopes(args))) => {
                match self.registries.frames.get(args.frame_id) {
                    Some(frame) => sender.respond_success(
                        request,
                        ResponseBody::from(ScopesResponseBody {
                            scopes: frame.scopes,
                        }),
                    )?,
                    None => sender.respond_error(request, format!("Invalid frame id {}", args.frame_id))?,
                }
            }
            ("variables", Some(RequestArguments::Variables(args))) => {
                self.variables(sender, request, args)?
            }
            ("continue", Some(RequestArguments::Continue(args))) => {
                self.resume(sender, request, args)?
            }
            (command @ ("stackTrace" | "scopes" | "variables" | "continue"), None) => {
                sender.respond_error(request, format!("Missing arguments for {command:?}"))?
            }
            (command, _) => sender.respond_error(request, format!("Unknown command {command:?}"))?,
        }
        Ok(ControlFlow::Continue)
    }

    fn stack_trace(
        &self,
        sender: &SessionSender,
        request: &Request,
        args: &StackTraceArguments,
    ) -> anyhow::Result<()> {
        let Some(event) = self.registries.events.get(args.thread_id) else {
            sender.respond_error(request, format!("Thread {} is not stopped", args.thread_id))?;
            return Ok(());
        };

        let frames: Vec<_> = event
            .frame_ids
            .iter()
            .filter_map(|&id| {
                self.registries
                    .frames
                    .get(id)
                    .map(|frame| frame.stack_frame(id))
            })
            .collect();
        let total_frames = frames.len() as i64;
        let start = args.start_frame.unwrap_or(0).max(0) as usize;
        let levels = match args.levels {
            Some(levels) if levels > 0 => levels as usize,
            _ => frames.len(),
        };

        let body = StackTraceResponseBody {
            stack_frames: frames.into_iter().skip(start).take(levels).collect(),
            total_frames: Some(total_frames),
        };
        sender.respond_success(request, ResponseBody::from(body))?;
        Ok(())
    }

    fn variables(
        &self,
        sender: &SessionSender,
        request: &Request,
        args: &VariablesArguments,
    ) -> anyhow::Result<()> {
        let Some(variables) = self.registries.variables.get(args.variables_reference) else {
            sender.respond_error(
                request,
                format!("Invalid variables reference {}", args.variables_reference),
            )?;
            return Ok(());
        };

        let start = args.start.unwrap_or(0).max(0) as usize;
        let count = match args.count {
            Some(count) if count > 0 => count as usize,
            _ => variables.len(),
        };
        let body = VariablesResponseBody {
            variables: variables.into_iter().skip(start).take(count).collect(),
        };
        sender.respond_success(request, ResponseBody::from(body))?;
        Ok(())
    }

    fn resume(
        &self,
        sender: &SessionSender,
        request: &Request,
        args: &ContinueArguments,
    ) -> anyhow::Result<()> {
        let Some(event) = self.registries.events.release(args.thread_id) else {
            sender.respond_error(request, format!("Thread {} is not stopped", args.thread_id))?;
            return Ok(());
        };
        self.registries.frames.purge();
        self.registries.variables.purge();

        sender.respond_success(
            request,
            ResponseBody::from(ContinueResponseBody {
                all_threads_continued: Some(false),
            }),
        )?;
        sender.event_body(ContinuedEventBody {
            thread_id: args.thread_id,
            all_threads_continued: Some(false),
        })?;

        weak_error!(
            target: "adapter",
            event.resume.send(()).map_err(|_| anyhow!("engine is gone")),
            "resume thread:"
        );
        Ok(())
    }
}

impl Handler for Adapter {
    fn initialize(
        &mut self,
        sender: &SessionSender,
        args: &InitializeArguments,
    ) -> anyhow::Result<Capabilities> {
        debug!(
            target: "adapter",
            "initialize from {}",
            args.client_name.as_deref().or(args.client_id.as_deref()).unwrap_or("unknown client")
        );
        self.sender = Some(sender.clone());
        Ok(Capabilities {
            supports_configuration_done_request: Some(true),
            supports_terminate_request: Some(true),
            ..Default::default()
        })
    }

    fn process(&mut self, message: Message) -> anyhow::Result<ControlFlow> {
        let was_started = self.started;
        let mut flow = ControlFlow::Continue;
        if let Message::Request(request) = message {
            let sender = self
                .sender
                .clone()
                .ok_or_else(|| anyhow!("adapter is not initialized"))?;
            flow = self.handle(&sender, &request)?;
        }

        // an evaluation that finishes right away is still reported before the session ends
        let just_started = !was_started && self.started;
        if self.context.is_done() && !just_started {
            flow = ControlFlow::Stop;
        }
        Ok(flow)
    }

    fn terminate(&mut self) {
        self.context.cancel();
        self.registries.purge_all();
    }
}

/// Return the message of the error one level below the outermost context.
fn unwrap_once(err: &anyhow::Error) -> String {
    err.chain()
        .nth(1)
        .map(ToString::to_string)
        .unwrap_or_else(|| err.to_string())
}

/// Body of the evaluation thread.
fn evaluate(factory: EngineFactory, program: Program, context: ExecContext, queue: Sender<Outbound>) {
    let options = EngineOptions {
        stdin: Box::new(io::empty()),
        stdout: Box::new(ChannelWriter::new(OutputCategory::Stdout, queue.clone())),
        stderr: Box::new(ChannelWriter::new(OutputCategory::Stderr, queue.clone())),
        stops: StopNotifier::new(queue.clone()),
    };

    info!(target: "adapter", "start evaluation");
    let result = factory(options)
        .context("create engine")
        .and_then(|mut engine| {
            engine
                .evaluate(&context, &program)
                .context("evaluate program")
        });

    match result {
        Ok(evaluation) => {
            info!(target: "adapter", "evaluation finished with code {}", evaluation.exit_code);
            _ = queue.send(Outbound::Exited(evaluation.exit_code));
        }
        Err(err) => {
            warn!(target: "adapter", "evaluation failed: {err:#}");
            _ = queue.send(Outbound::Output {
                category: OutputCategory::Stderr,
                output: format!("{}\n", unwrap_once(&err)),
            });
            if let Some(EngineError::Exit(code)) = err.downcast_ref::<EngineError>() {
                _ = queue.send(Outbound::Exited(*code));
            }
        }
    }

    if queue.send(Outbound::Terminated).is_err() {
        context.cancel();
    }
}

/// Forward everything the evaluation thread produces into the session.
fn pump(
    outbound: Receiver<Outbound>,
    sender: SessionSender,
    registries: Arc<Registries>,
    context: ExecContext,
) {
    for message in outbound {
        let result = match message {
            Outbound::Output { category, output } => sender.event_body(OutputEventBody {
                category: Some(category),
                output,
            }),
            Outbound::Stopped { stop, resume } => {
                debug!(target: "adapter", "thread {} stopped: {}", stop.thread_id, stop.reason);
                let body = registries.record_stop(stop, resume);
                // checked after recording: a session that ends concurrently purges after cancel
                if context.is_done() {
                    debug!(target: "adapter", "session is over, release stopped thread");
                    registries.purge_all();
                    continue;
                }
                sender.event_body(body)
            }
            Outbound::Exited(code) => sender.event_body(ExitedEventBody {
                exit_code: code.into(),
            }),
            Outbound::Terminated => {
                // done before the client sees `terminated`, its next request ends the session
                context.cancel();
                sender.event("terminated", None)
            }
        };
        muted_error!(target: "adapter", result, "forward evaluation event:");
    }
}
