use crate::dap::error::Error;
use crate::dap::payload::{EventBody, RequestArguments, ResponseBody};
use serde::{Deserialize, Serialize};

/// Discriminant of a protocol message (`type` field on the wire).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Event,
}

/// A client or debug adapter initiated request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    /// Sequence number, assigned by the sending session.
    pub seq: i64,
    /// The command to execute. Derived from `arguments` if empty.
    pub command: String,
    pub arguments: Option<RequestArguments>,
}

impl Request {
    /// Create a request whose command is derived from its arguments.
    pub fn new(arguments: impl Into<RequestArguments>) -> Self {
        let arguments = arguments.into();
        Self {
            seq: 0,
            command: arguments.name().to_string(),
            arguments: Some(arguments),
        }
    }

    /// Create a request without arguments.
    pub fn bare(command: impl Into<String>) -> Self {
        Self {
            seq: 0,
            command: command.into(),
            arguments: None,
        }
    }

    /// Return the effective command of the request, enforcing command/arguments agreement.
    pub fn resolved_command(&self) -> Result<&str, Error> {
        resolve(
            MessageKind::Request,
            &self.command,
            self.arguments.as_ref().map(RequestArguments::name),
        )
    }
}

/// Response for a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub seq: i64,
    /// Sequence number of the corresponding request.
    pub request_seq: i64,
    pub success: bool,
    /// The command requested. Derived from `body` if empty.
    pub command: String,
    /// Human-readable status, contains the error in short form if `success` is false.
    pub message: Option<String>,
    pub body: Option<ResponseBody>,
}

impl Response {
    pub fn new(
        request: &Request,
        success: bool,
        message: Option<String>,
        body: Option<ResponseBody>,
    ) -> Self {
        Self {
            seq: 0,
            request_seq: request.seq,
            success,
            command: request.command.clone(),
            message,
            body,
        }
    }

    pub fn success(request: &Request, body: Option<ResponseBody>) -> Self {
        Self::new(request, true, None, body)
    }

    pub fn error(request: &Request, message: impl Into<String>) -> Self {
        Self::new(request, false, Some(message.into()), None)
    }

    /// Return the effective command of the response, enforcing command/body agreement.
    ///
    /// Error bodies agree with any command but only on failed responses.
    pub fn resolved_command(&self) -> Result<&str, Error> {
        let payload = match &self.body {
            Some(body) if body.is_error() && !self.success => None,
            Some(body) => Some(body.name()),
            None => None,
        };
        resolve(MessageKind::Response, &self.command, payload)
    }
}

/// A debug adapter initiated event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    pub seq: i64,
    /// Type of event. Derived from `body` if empty.
    pub event: String,
    pub body: Option<EventBody>,
}

impl Event {
    pub fn new(event: impl Into<String>, body: Option<EventBody>) -> Self {
        Self {
            seq: 0,
            event: event.into(),
            body,
        }
    }

    /// Return the effective event name, enforcing name/body agreement.
    pub fn resolved_event(&self) -> Result<&str, Error> {
        resolve(
            MessageKind::Event,
            &self.event,
            self.body.as_ref().map(EventBody::name),
        )
        .map_err(|err| match err {
            Error::MissingCommand(_) => Error::MissingEvent,
            err => err,
        })
    }
}

impl From<EventBody> for Event {
    fn from(body: EventBody) -> Self {
        Self::new(body.name(), Some(body))
    }
}

/// Any protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Request,
            Message::Response(_) => MessageKind::Response,
            Message::Event(_) => MessageKind::Event,
        }
    }

    pub fn seq(&self) -> i64 {
        match self {
            Message::Request(r) => r.seq,
            Message::Response(r) => r.seq,
            Message::Event(e) => e.seq,
        }
    }

    pub(crate) fn set_seq(&mut self, seq: i64) {
        match self {
            Message::Request(r) => r.seq = seq,
            Message::Response(r) => r.seq = seq,
            Message::Event(e) => e.seq = seq,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Message::Event(event)
    }
}

/// Reconcile a declared discriminant with the one intrinsic to the payload.
fn resolve<'a>(
    kind: MessageKind,
    declared: &'a str,
    payload: Option<&'static str>,
) -> Result<&'a str, Error> {
    match (declared.is_empty(), payload) {
        (true, None) => Err(Error::MissingCommand(kind)),
        (true, Some(payload)) => Ok(payload),
        (false, Some(payload)) if payload != declared => Err(Error::PayloadMismatch {
            kind,
            declared: declared.to_string(),
            payload,
        }),
        (false, _) => Ok(declared),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dap::types::{
        Capabilities, ErrorResponseBody, OutputEventBody, ScopesArguments, ThreadsResponseBody,
    };

    #[test]
    fn test_command_derived_from_arguments() {
        let mut request = Request::new(ScopesArguments { frame_id: 3 });
        assert_eq!(request.resolved_command().unwrap(), "scopes");

        request.command.clear();
        assert_eq!(request.resolved_command().unwrap(), "scopes");

        request.command = "variables".to_string();
        assert!(matches!(
            request.resolved_command(),
            Err(Error::PayloadMismatch { payload: "scopes", .. })
        ));

        assert!(matches!(
            Request::bare("").resolved_command(),
            Err(Error::MissingCommand(MessageKind::Request))
        ));
    }

    #[test]
    fn test_response_body_agreement() {
        let request = Request {
            seq: 7,
            ..Request::bare("threads")
        };

        let ok = Response::success(
            &request,
            Some(ThreadsResponseBody::default().into()),
        );
        assert_eq!(ok.request_seq, 7);
        assert_eq!(ok.resolved_command().unwrap(), "threads");

        let wrong = Response::success(&request, Some(Capabilities::default().into()));
        assert!(wrong.resolved_command().is_err());

        let failed = Response {
            body: Some(ErrorResponseBody::default().into()),
            ..Response::error(&request, "no threads")
        };
        assert_eq!(failed.resolved_command().unwrap(), "threads");
    }

    #[test]
    fn test_event_name_derived_from_body() {
        let event = Event::from(EventBody::from(OutputEventBody::default()));
        assert_eq!(event.resolved_event().unwrap(), "output");

        let nameless = Event::new("", None);
        assert!(matches!(
            nameless.resolved_event(),
            Err(Error::MissingEvent)
        ));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(MessageKind::Response.to_string(), "response");
        assert_eq!(
            "event".parse::<MessageKind>().unwrap(),
            MessageKind::Event
        );
    }
}
