use crate::dap::codec::{self, Decoder, Encoder};
use crate::dap::error::Error;
use crate::dap::message::{Event, Message, Request, Response};
use crate::dap::payload::{EventBody, RequestArguments, ResponseBody};
use crate::dap::tracer::Tracer;
use crate::dap::transport::{Connection, ReadHalf, WriteHalf};
use crate::dap::types::{Capabilities, InitializeArguments};
use log::debug;
use std::io::BufReader;
use std::sync::{Arc, Mutex, PoisonError};

/// Verdict of a handler on whether the dispatch loop should go on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    Continue,
    Stop,
}

/// Lifecycle of a session. Transitions are strictly linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum SessionState {
    Created,
    Initializing,
    Dispatching,
    Terminating,
    Closed,
}

/// Policy of a session: answers requests and decides when the session ends.
///
/// Handlers never read from the connection. They may send through the [`SessionSender`]
/// received in [`Handler::initialize`] from any thread.
pub trait Handler: Send {
    /// Called once with the arguments of the `initialize` request, returns adapter capabilities.
    fn initialize(
        &mut self,
        sender: &SessionSender,
        args: &InitializeArguments,
    ) -> anyhow::Result<Capabilities>;

    /// Process one inbound message.
    fn process(&mut self, message: Message) -> anyhow::Result<ControlFlow>;

    /// Called once when session terminates.
    fn terminate(&mut self);
}

struct Outbound {
    encoder: Encoder<Box<dyn WriteHalf>>,
    seq: i64,
}

/// Sending side of a session, shared between the dispatch loop and background tasks.
///
/// Sequence numbers are assigned under the send lock, so they follow wire order.
#[derive(Clone)]
pub struct SessionSender {
    outbound: Arc<Mutex<Outbound>>,
    tracer: Option<Tracer>,
}

impl SessionSender {
    fn new(writer: Box<dyn WriteHalf>, tracer: Option<Tracer>) -> Self {
        Self {
            outbound: Arc::new(Mutex::new(Outbound {
                encoder: Encoder::new(writer),
                seq: 0,
            })),
            tracer,
        }
    }

    /// Assign next sequence number to a message and write it. Return assigned number.
    ///
    /// A message violating the protocol contract is not written and does not consume
    /// a sequence number.
    pub fn send(&self, message: impl Into<Message>) -> Result<i64, Error> {
        let mut message = message.into();
        let mut outbound = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let seq = outbound.seq + 1;
        message.set_seq(seq);
        let payload = codec::to_payload(&message)?;
        outbound.encoder.write_frame(&payload)?;
        outbound.seq = seq;

        if let Some(tracer) = &self.tracer {
            tracer.outbound(&payload);
        }
        Ok(seq)
    }

    /// Send an event.
    pub fn event(&self, name: &str, body: Option<EventBody>) -> Result<(), Error> {
        self.send(Event::new(name, body)).map(|_| ())
    }

    /// Send an event, its name is derived from the body.
    pub fn event_body(&self, body: impl Into<EventBody>) -> Result<(), Error> {
        self.send(Event::from(body.into())).map(|_| ())
    }

    /// Send a response correlated to `request`.
    pub fn respond(
        &self,
        request: &Request,
        success: bool,
        message: Option<String>,
        body: Option<ResponseBody>,
    ) -> Result<(), Error> {
        self.send(Response::new(request, success, message, body))
            .map(|_| ())
    }

    pub fn respond_success(
        &self,
        request: &Request,
        body: impl Into<Option<ResponseBody>>,
    ) -> Result<(), Error> {
        self.respond(request, true, None, body.into())
    }

    pub fn respond_error(&self, request: &Request, error: impl Into<String>) -> Result<(), Error> {
        let error = error.into();
        debug!(target: "dap", "error {}: {error}", request.seq);
        self.respond(request, false, Some(error), None)
    }

    fn close(&self) -> std::io::Result<()> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .encoder
            .get_mut()
            .close()
    }
}

/// One protocol conversation over one connection.
pub struct Session {
    peer: String,
    decoder: Decoder<BufReader<Box<dyn ReadHalf>>>,
    sender: SessionSender,
    handler: Box<dyn Handler>,
    tracer: Option<Tracer>,
    state: SessionState,
    errors: Vec<Error>,
}

impl Session {
    pub fn new(conn: Connection, handler: Box<dyn Handler>) -> Self {
        Self::with_tracer(conn, handler, None)
    }

    pub fn with_tracer(conn: Connection, handler: Box<dyn Handler>, tracer: Option<Tracer>) -> Self {
        Self {
            peer: conn.peer,
            decoder: Decoder::new(BufReader::new(conn.reader)),
            sender: SessionSender::new(conn.writer, tracer.clone()),
            handler,
            tracer,
            state: SessionState::Created,
            errors: vec![],
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sender(&self) -> &SessionSender {
        &self.sender
    }

    /// Non-fatal errors collected during the run (failures to close the connection, etc.).
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Send an event.
    pub fn event(&self, name: &str, body: Option<EventBody>) -> Result<(), Error> {
        self.sender.event(name, body)
    }

    /// Send a response correlated to `request`.
    pub fn respond(
        &self,
        request: &Request,
        success: bool,
        message: Option<String>,
        body: Option<ResponseBody>,
    ) -> Result<(), Error> {
        self.sender.respond(request, success, message, body)
    }

    /// Run the session: initialize handshake, dispatch loop, termination.
    ///
    /// A clean end of stream ends the dispatch loop without error. Any other error is fatal
    /// and returned once the connection is closed.
    pub fn run(&mut self) -> Result<(), Error> {
        if self.state != SessionState::Created {
            return Err(Error::AlreadyRun);
        }

        self.state = SessionState::Initializing;
        if let Err(err) = self.handshake() {
            self.close();
            self.state = SessionState::Closed;
            return Err(err);
        }

        self.state = SessionState::Dispatching;
        let outcome = self.dispatch();

        self.state = SessionState::Terminating;
        if let Err(err) = self.sender.event("terminated", None) {
            self.errors.push(err);
        }
        self.handler.terminate();
        self.close();
        self.state = SessionState::Closed;

        outcome
    }

    fn handshake(&mut self) -> Result<(), Error> {
        let request = match self.read()? {
            Some(Message::Request(request)) => request,
            Some(other) => {
                return Err(self.handshake_error(format!(
                    "expected initialize request, got {}",
                    other.kind()
                )))
            }
            None => return Err(self.handshake_error("connection closed".to_string())),
        };
        if request.command != "initialize" {
            return Err(self.handshake_error(format!(
                "expected initialize request, got {:?}",
                request.command
            )));
        }
        let Some(RequestArguments::Initialize(args)) = &request.arguments else {
            return Err(
                self.handshake_error("initialize request carries no initialize arguments".to_string())
            );
        };

        let capabilities = match self.handler.initialize(&self.sender, args) {
            Ok(capabilities) => capabilities,
            Err(err) => return Err(self.handshake_error(format!("{err:#}"))),
        };
        self.sender
            .respond_success(&request, ResponseBody::Initialize(capabilities))
    }

    fn handshake_error(&mut self, reason: String) -> Error {
        self.errors.push(Error::Handshake(reason.clone()));
        Error::Handshake(reason)
    }

    fn dispatch(&mut self) -> Result<(), Error> {
        while let Some(message) = self.read()? {
            if let Message::Request(request) = &message {
                debug!(target: "dap", "{}: {}", request.seq, request.command);
            }
            if self.handler.process(message)? == ControlFlow::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Read next message, [`None`] on a clean end of stream.
    fn read(&mut self) -> Result<Option<Message>, Error> {
        match self.decoder.decode() {
            Ok(message) => {
                if let Some(tracer) = &self.tracer {
                    tracer.inbound(self.decoder.last_payload());
                }
                Ok(Some(message))
            }
            Err(err) if err.is_closed() => Ok(None),
            Err(err) => {
                if let Some(tracer) = &self.tracer {
                    tracer.decode_error(&err);
                }
                Err(err)
            }
        }
    }

    fn close(&mut self) {
        if let Err(err) = self.decoder.get_mut().get_mut().close() {
            self.errors.push(err.into());
        }
        if let Err(err) = self.sender.close() {
            self.errors.push(err.into());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dap::transport::Detachable;
    use crate::dap::types::ThreadsResponseBody;
    use os_pipe::{PipeReader, PipeWriter};
    use serde_json::{json, Value};
    use std::io::{BufRead, Read, Write};
    use std::thread;

    /// Client end of an in-memory connection.
    struct Client {
        writer: PipeWriter,
        reader: BufReader<PipeReader>,
        seq: i64,
    }

    impl Client {
        fn send(&mut self, command: &str, arguments: Option<Value>) -> i64 {
            self.seq += 1;
            let mut msg = json!({"seq": self.seq, "type": "request", "command": command});
            if let Some(arguments) = arguments {
                msg["arguments"] = arguments;
            }
            let payload = serde_json::to_vec(&msg).unwrap();
            write!(self.writer, "Content-Length: {}\r\n\r\n", payload.len()).unwrap();
            self.writer.write_all(&payload).unwrap();
            self.seq
        }

        fn read(&mut self) -> Option<Value> {
            let mut len = None;
            loop {
                let mut line = String::new();
                if self.reader.read_line(&mut line).unwrap() == 0 {
                    return None;
                }
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                len = line
                    .strip_prefix("Content-Length: ")
                    .map(|v| v.parse::<usize>().unwrap());
            }
            let mut buf = vec![0; len.unwrap()];
            self.reader.read_exact(&mut buf).unwrap();
            Some(serde_json::from_slice(&buf).unwrap())
        }
    }

    fn connection() -> (Connection, Client) {
        let (server_reader, client_writer) = os_pipe::pipe().unwrap();
        let (client_reader, server_writer) = os_pipe::pipe().unwrap();
        (
            Connection::new(
                "pipe",
                Detachable::new(server_reader),
                Detachable::new(server_writer),
            ),
            Client {
                writer: client_writer,
                reader: BufReader::new(client_reader),
                seq: 0,
            },
        )
    }

    /// Answers `threads`, stops on `disconnect`, ignores everything else.
    #[derive(Default)]
    struct Echo {
        sender: Option<SessionSender>,
        terminated: Arc<Mutex<bool>>,
    }

    impl Handler for Echo {
        fn initialize(
            &mut self,
            sender: &SessionSender,
            _: &InitializeArguments,
        ) -> anyhow::Result<Capabilities> {
            self.sender = Some(sender.clone());
            Ok(Capabilities {
                supports_configuration_done_request: Some(true),
                ..Default::default()
            })
        }

        fn process(&mut self, message: Message) -> anyhow::Result<ControlFlow> {
            let sender = self.sender.as_ref().unwrap();
            let Message::Request(request) = message else {
                return Ok(ControlFlow::Continue);
            };
            match request.command.as_str() {
                "threads" => {
                    sender.respond_success(&request, ResponseBody::from(ThreadsResponseBody::default()))?
                }
                "disconnect" => {
                    sender.respond_success(&request, None)?;
                    return Ok(ControlFlow::Stop);
                }
                _ => {}
            }
            Ok(ControlFlow::Continue)
        }

        fn terminate(&mut self) {
            *self.terminated.lock().unwrap() = true;
        }
    }

    #[test]
    fn test_initialize_handshake() {
        let (conn, mut client) = connection();
        let handler = Echo::default();
        let terminated = handler.terminated.clone();
        let mut session = Session::new(conn, Box::new(handler));
        let server = thread::spawn(move || {
            let result = session.run();
            (result.is_ok(), session.state())
        });

        let seq = client.send("initialize", Some(json!({})));
        let response = client.read().unwrap();
        assert_eq!(
            response,
            json!({
                "seq": 1,
                "type": "response",
                "request_seq": seq,
                "success": true,
                "command": "initialize",
                "body": {"supportsConfigurationDoneRequest": true},
            })
        );

        let seq = client.send("threads", None);
        let response = client.read().unwrap();
        assert_eq!(response["seq"], 2);
        assert_eq!(response["request_seq"], seq);
        assert_eq!(response["body"], json!({"threads": []}));

        client.send("disconnect", Some(json!({"terminateDebuggee": true})));
        assert_eq!(client.read().unwrap()["command"], "disconnect");
        let terminated_event = client.read().unwrap();
        assert_eq!(terminated_event["event"], "terminated");
        assert_eq!(terminated_event["seq"], 4);
        assert!(client.read().is_none());

        assert_eq!(server.join().unwrap(), (true, SessionState::Closed));
        assert!(*terminated.lock().unwrap());
    }

    #[test]
    fn test_handshake_rejects_other_requests() {
        let (conn, mut client) = connection();
        let mut session = Session::new(conn, Box::new(Echo::default()));
        let server = thread::spawn(move || {
            let err = session.run().unwrap_err();
            (err.to_string(), session.errors().len(), session.state())
        });

        client.send("threads", None);
        assert!(client.read().is_none());

        let (err, errors, state) = server.join().unwrap();
        assert!(err.contains("expected initialize request"), "{err}");
        assert_eq!(errors, 1);
        assert_eq!(state, SessionState::Closed);
    }

    #[test]
    fn test_handshake_requires_initialize_arguments() {
        let (conn, mut client) = connection();
        let mut session = Session::new(conn, Box::new(Echo::default()));
        let server = thread::spawn(move || session.run());

        client.send("initialize", None);
        assert!(client.read().is_none());
        assert!(matches!(server.join().unwrap(), Err(Error::Handshake(_))));
    }

    /// Refuses to initialize.
    struct Refuse;

    impl Handler for Refuse {
        fn initialize(
            &mut self,
            _: &SessionSender,
            _: &InitializeArguments,
        ) -> anyhow::Result<Capabilities> {
            Err(anyhow::anyhow!("unsupported client"))
        }

        fn process(&mut self, _: Message) -> anyhow::Result<ControlFlow> {
            Ok(ControlFlow::Stop)
        }

        fn terminate(&mut self) {}
    }

    #[test]
    fn test_failed_initialize_is_recorded() {
        let (conn, mut client) = connection();
        let mut session = Session::new(conn, Box::new(Refuse));
        let server = thread::spawn(move || {
            let result = session.run();
            let errors: Vec<_> = session.errors().iter().map(ToString::to_string).collect();
            (result, errors, session.state())
        });

        client.send("initialize", Some(json!({})));
        assert!(client.read().is_none());

        let (result, errors, state) = server.join().unwrap();
        assert!(matches!(result, Err(Error::Handshake(reason)) if reason == "unsupported client"));
        assert_eq!(errors, ["initialize handshake failed: unsupported client"]);
        assert_eq!(state, SessionState::Closed);
    }

    #[test]
    fn test_decode_error_terminates_session() {
        let (conn, mut client) = connection();
        let terminal = Arc::new(Mutex::new(Vec::new()));
        let trace = TraceBuf(terminal.clone());
        let mut session = Session::with_tracer(conn, Box::new(Echo::default()), Some(Tracer::new(trace)));
        let server = thread::spawn(move || session.run());

        client.send("initialize", Some(json!({"adapterID": "test"})));
        client.read().unwrap();
        client.writer.write_all(b"Content-Length: 2\r\n\r\n[]").unwrap();

        assert_eq!(client.read().unwrap()["event"], "terminated");
        assert!(client.read().is_none());
        assert!(matches!(server.join().unwrap(), Err(Error::Json(_))));

        let trace = String::from_utf8(terminal.lock().unwrap().clone()).unwrap();
        let lines: Vec<_> = trace.lines().collect();
        assert!(lines[0].starts_with("> {"), "{trace}");
        assert!(lines[1].starts_with("< {"), "{trace}");
        assert!(lines[2].starts_with("> ERR "), "{trace}");
        assert!(lines[3].contains("\"terminated\""), "{trace}");
    }

    #[test]
    fn test_run_twice() {
        let (conn, client) = connection();
        drop(client);
        let mut session = Session::new(conn, Box::new(Echo::default()));
        assert!(session.run().is_err());
        assert!(matches!(session.run(), Err(Error::AlreadyRun)));
    }

    #[test]
    fn test_concurrent_senders_get_gapless_sequence() {
        let (conn, mut client) = connection();
        let session = Session::new(conn, Box::new(Echo::default()));
        let sender = session.sender().clone();

        let reader = thread::spawn(move || {
            let mut seqs = vec![];
            while seqs.len() < 200 {
                let msg = client.read().unwrap();
                seqs.push(msg["seq"].as_i64().unwrap());
            }
            seqs
        });

        let senders: Vec<_> = (0..4)
            .map(|_| {
                let sender = sender.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        sender.event("initialized", None).unwrap();
                    }
                })
            })
            .collect();
        senders.into_iter().for_each(|h| h.join().unwrap());

        let seqs = reader.join().unwrap();
        assert_eq!(seqs, (1..=200).collect::<Vec<_>>());
    }

    #[test]
    fn test_stop_skips_pending_messages() {
        let (conn, mut client) = connection();
        let mut session = Session::new(conn, Box::new(Echo::default()));
        let server = thread::spawn(move || session.run());

        client.send("initialize", Some(json!({})));
        client.send("disconnect", None);
        client.send("threads", None);

        let mut names = vec![];
        while let Some(msg) = client.read() {
            let name = msg.get("command").or(msg.get("event")).unwrap();
            names.push(name.as_str().unwrap().to_string());
        }
        assert_eq!(names, ["initialize", "disconnect", "terminated"]);
        server.join().unwrap().unwrap();
    }

    #[derive(Clone)]
    struct TraceBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for TraceBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
