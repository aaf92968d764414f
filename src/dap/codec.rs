//! DAP framing.
//!
//! Messages are framed using an HTTP-like header section:
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! { ...json... }
//! ```

use crate::dap::error::Error;
use crate::dap::message::{Event, Message, MessageKind, Request, Response};
use crate::dap::payload::{EventBody, RequestArguments, ResponseBody};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Write};

/// Upper bound for the header block of a single frame.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "Content-Length";

/// Writes framed messages into a byte stream.
pub struct Encoder<W> {
    writer: W,
    staging: Vec<u8>,
}

impl<W: Write> Encoder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            staging: Vec::new(),
        }
    }

    /// Validate, serialize and write a message as one frame.
    pub fn encode(&mut self, message: &Message) -> Result<(), Error> {
        let payload = to_payload(message)?;
        self.write_frame(&payload)?;
        Ok(())
    }

    /// Write an already serialized payload as one frame.
    ///
    /// Header and payload are staged and handed to the writer in a single `write_all`.
    pub fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        self.staging.clear();
        write!(
            self.staging,
            "{CONTENT_LENGTH}: {}\r\n\r\n",
            payload.len()
        )?;
        self.staging.extend_from_slice(payload);
        self.writer.write_all(&self.staging)?;
        self.writer.flush()
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}

/// Reads framed messages from a buffered byte stream.
pub struct Decoder<R> {
    reader: R,
    payload: Vec<u8>,
}

impl<R: BufRead> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            payload: Vec::new(),
        }
    }

    /// Read and decode the next message.
    ///
    /// Returns [`Error::ConnectionClosed`] if the stream ends before the first header byte.
    pub fn decode(&mut self) -> Result<Message, Error> {
        let len = self.read_header()?;
        self.read_payload(len)?;
        from_payload(&self.payload)
    }

    /// Payload of the last frame read, whether it decoded or not.
    pub fn last_payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    fn read_header(&mut self) -> Result<usize, Error> {
        let mut header = Vec::with_capacity(64);
        let mut byte = [0u8; 1];
        while !header.ends_with(HEADER_TERMINATOR) {
            if header.len() >= MAX_HEADER_BYTES {
                return Err(Error::HeaderTooLarge(MAX_HEADER_BYTES));
            }
            match self.reader.read(&mut byte) {
                Ok(0) if header.is_empty() => return Err(Error::ConnectionClosed),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(_) => header.push(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        parse_content_length(&header[..header.len() - HEADER_TERMINATOR.len()])
    }

    /// Read exactly `len` payload bytes. The buffer grows with the bytes actually received,
    /// not with the declared length.
    fn read_payload(&mut self, len: usize) -> Result<(), Error> {
        self.payload.clear();
        while self.payload.len() < len {
            let available = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if available.is_empty() {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            let chunk = available.len().min(len - self.payload.len());
            self.payload.extend_from_slice(&available[..chunk]);
            self.reader.consume(chunk);
        }
        Ok(())
    }
}

/// Extract the `Content-Length` value from a header block. Other headers are ignored.
fn parse_content_length(header: &[u8]) -> Result<usize, Error> {
    let header = std::str::from_utf8(header).map_err(|_| Error::InvalidContentLength)?;
    let mut content_length = None;
    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            continue;
        }
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidContentLength);
        }
        let len: i32 = value.parse().map_err(|_| Error::InvalidContentLength)?;
        content_length = Some(len as usize);
    }
    content_length.ok_or(Error::InvalidContentLength)
}

#[derive(Serialize)]
struct WireRequest<'a> {
    seq: i64,
    #[serde(rename = "type")]
    kind: MessageKind,
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<&'a RequestArguments>,
}

#[derive(Serialize)]
struct WireResponse<'a> {
    seq: i64,
    #[serde(rename = "type")]
    kind: MessageKind,
    request_seq: i64,
    success: bool,
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a ResponseBody>,
}

#[derive(Serialize)]
struct WireEvent<'a> {
    seq: i64,
    #[serde(rename = "type")]
    kind: MessageKind,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a EventBody>,
}

/// Validate a message against the protocol contract and serialize it to JSON.
pub fn to_payload(message: &Message) -> Result<Vec<u8>, Error> {
    let kind = message.kind();
    if message.seq() <= 0 {
        return Err(Error::MissingSeq(kind));
    }

    let payload = match message {
        Message::Request(request) => serde_json::to_vec(&WireRequest {
            seq: request.seq,
            kind,
            command: request.resolved_command()?,
            arguments: request.arguments.as_ref(),
        })?,
        Message::Response(response) => {
            if response.request_seq <= 0 {
                return Err(Error::MissingRequestSeq);
            }
            serde_json::to_vec(&WireResponse {
                seq: response.seq,
                kind,
                request_seq: response.request_seq,
                success: response.success,
                command: response.resolved_command()?,
                message: response.message.as_deref(),
                body: response.body.as_ref(),
            })?
        }
        Message::Event(event) => serde_json::to_vec(&WireEvent {
            seq: event.seq,
            kind,
            event: event.resolved_event()?,
            body: event.body.as_ref(),
        })?,
    };
    Ok(payload)
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct RawRequest {
    seq: i64,
    command: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Deserialize)]
struct RawResponse {
    seq: i64,
    request_seq: i64,
    success: bool,
    command: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    body: Option<Value>,
}

#[derive(Deserialize)]
struct RawEvent {
    seq: i64,
    event: String,
    #[serde(default)]
    body: Option<Value>,
}

/// Decode a JSON payload into a message.
///
/// The envelope is decoded first to learn the message type, then the payload is decoded
/// again into the matching container, whose `arguments`/`body` field is resolved through
/// the payload tables by command or event name.
///
/// A request without arguments keeps its command even if the command is not registered,
/// so a handler can still answer it.
pub fn from_payload(payload: &[u8]) -> Result<Message, Error> {
    let envelope: Envelope = serde_json::from_slice(payload)?;
    let kind: MessageKind = envelope
        .kind
        .parse()
        .map_err(|_| Error::UnrecognizedMessageType(envelope.kind))?;

    let message = match kind {
        MessageKind::Request => {
            let raw: RawRequest = serde_json::from_slice(payload)?;
            let arguments = raw
                .arguments
                .map(|value| RequestArguments::decode(&raw.command, value))
                .transpose()?;
            Message::Request(Request {
                seq: raw.seq,
                command: raw.command,
                arguments,
            })
        }
        MessageKind::Response => {
            let raw: RawResponse = serde_json::from_slice(payload)?;
            let body = raw
                .body
                .map(|value| ResponseBody::decode_for(&raw.command, raw.success, value))
                .transpose()?;
            Message::Response(Response {
                seq: raw.seq,
                request_seq: raw.request_seq,
                success: raw.success,
                command: raw.command,
                message: raw.message,
                body,
            })
        }
        MessageKind::Event => {
            let raw: RawEvent = serde_json::from_slice(payload)?;
            let body = raw
                .body
                .map(|value| EventBody::decode(&raw.event, value))
                .transpose()?;
            Message::Event(Event {
                seq: raw.seq,
                event: raw.event,
                body,
            })
        }
    };
    Ok(message)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dap::types::{
        Capabilities, ConfigurationDoneArguments, ContinueArguments, DisconnectArguments,
        InitializeArguments, LaunchArguments, OutputCategory, OutputEventBody, ScopesArguments,
        StackTraceArguments, TerminateArguments, ThreadsArguments, VariablesArguments,
    };
    use serde_json::json;
    use std::io::{BufReader, Cursor, Read};

    fn frame(json: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{json}", json.len()).into_bytes()
    }

    fn encode(message: impl Into<Message>) -> Vec<u8> {
        let mut out = Vec::new();
        Encoder::new(&mut out).encode(&message.into()).unwrap();
        out
    }

    /// Reader that hands out at most one byte per `read` call.
    struct Trickle<R>(R);

    impl<R: Read> Read for Trickle<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let len = buf.len().min(1);
            self.0.read(&mut buf[..len])
        }
    }

    #[test]
    fn test_frame_declares_exact_payload_length() {
        let mut request = Request::new(InitializeArguments {
            client_id: Some("vscode".to_string()),
            ..Default::default()
        });
        request.seq = 1;
        let bytes = encode(request.clone());

        let text = String::from_utf8(bytes).unwrap();
        let (header, json) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(header, format!("Content-Length: {}", json.len()));
        assert_eq!(
            serde_json::from_str::<Value>(json).unwrap(),
            json!({
                "seq": 1,
                "type": "request",
                "command": "initialize",
                "arguments": {"clientID": "vscode"},
            })
        );
    }

    #[test]
    fn test_request_round_trip() {
        let vocabulary: Vec<RequestArguments> = vec![
            InitializeArguments {
                adapter_id: Some("yadap".to_string()),
                lines_start_at1: Some(true),
                ..Default::default()
            }
            .into(),
            LaunchArguments {
                no_debug: Some(true),
                additional_data: json!({"program": "main.sh"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            }
            .into(),
            DisconnectArguments {
                terminate_debuggee: Some(true),
                ..Default::default()
            }
            .into(),
            StackTraceArguments {
                thread_id: 1,
                start_frame: Some(2),
                levels: Some(5),
            }
            .into(),
            VariablesArguments {
                variables_reference: 4,
                ..Default::default()
            }
            .into(),
            ContinueArguments {
                thread_id: 1,
                single_thread: None,
            }
            .into(),
            ConfigurationDoneArguments {}.into(),
            ThreadsArguments {}.into(),
            TerminateArguments {
                restart: Some(false),
            }
            .into(),
            ScopesArguments { frame_id: 3 }.into(),
        ];

        let mut covered: Vec<_> = vocabulary.iter().map(RequestArguments::name).collect();
        covered.sort_unstable();
        let mut registered: Vec<_> = RequestArguments::TABLE.iter().map(|(tag, _)| *tag).collect();
        registered.sort_unstable();
        assert_eq!(covered, registered);

        for (seq, arguments) in vocabulary.into_iter().enumerate() {
            let mut request = Request::new(arguments);
            request.seq = seq as i64 + 1;
            let bytes = encode(request.clone());

            let decoded = Decoder::new(Cursor::new(bytes)).decode().unwrap();
            assert_eq!(decoded, Message::Request(request));
        }
    }

    #[test]
    fn test_event_round_trip() {
        let event = Event {
            seq: 3,
            ..Event::from(EventBody::from(OutputEventBody {
                category: Some(OutputCategory::Stderr),
                output: "boom\n".to_string(),
            }))
        };
        let decoded = Decoder::new(Cursor::new(encode(event.clone())))
            .decode()
            .unwrap();
        assert_eq!(decoded, Message::Event(event));
    }

    #[test]
    fn test_header_split_across_reads() {
        let mut bytes = frame(r#"{"seq":1,"type":"request","command":"threads"}"#);
        bytes.extend(frame(r#"{"seq":2,"type":"event","event":"initialized"}"#));

        let mut decoder = Decoder::new(BufReader::new(Trickle(Cursor::new(bytes))));
        let first = decoder.decode().unwrap();
        assert_eq!(first, Message::Request(Request { seq: 1, ..Request::bare("threads") }));
        let second = decoder.decode().unwrap();
        assert_eq!(second.kind(), MessageKind::Event);
        assert!(decoder.decode().unwrap_err().is_closed());
    }

    #[test]
    fn test_header_names_are_case_insensitive_and_extra_headers_ignored() {
        let json = r#"{"seq":5,"type":"request","command":"threads"}"#;
        let bytes = format!(
            "content-type: application/vscode-jsonrpc\r\ncontent-LENGTH: {}\r\n\r\n{json}",
            json.len()
        );
        let message = Decoder::new(Cursor::new(bytes)).decode().unwrap();
        assert_eq!(message.seq(), 5);
    }

    #[test]
    fn test_invalid_content_length() {
        for header in [
            "Content-Type: text/plain\r\n\r\n{}",
            "Content-Length: abc\r\n\r\n{}",
            "Content-Length: -2\r\n\r\n{}",
            "Content-Length: 99999999999\r\n\r\n{}",
            "Content-Length:\r\n\r\n{}",
        ] {
            let err = Decoder::new(Cursor::new(header)).decode().unwrap_err();
            assert!(
                matches!(err, Error::InvalidContentLength),
                "{header:?}: {err}"
            );
        }
    }

    #[test]
    fn test_too_large_length_does_not_truncate() {
        let json = r#"{"seq":1,"type":"request","command":"threads"}"#;
        let bytes = format!("Content-Length: {}\r\n\r\n{json}", json.len() + 10);
        let err = Decoder::new(Cursor::new(bytes)).decode().unwrap_err();
        assert!(matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_declared_length_does_not_preallocate() {
        let mut decoder = Decoder::new(Cursor::new("Content-Length: 1500000000\r\n\r\n{}"));
        let err = decoder.decode().unwrap_err();
        assert!(matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
        assert_eq!(decoder.last_payload(), b"{}");
        assert!(decoder.payload.capacity() < 4096);
    }

    #[test]
    fn test_payload_split_across_reads() {
        let json = r#"{"seq":1,"type":"request","command":"threads"}"#;
        let mut decoder = Decoder::new(BufReader::with_capacity(3, Cursor::new(frame(json))));
        assert_eq!(decoder.decode().unwrap().seq(), 1);
        assert_eq!(decoder.last_payload(), json.as_bytes());
    }

    #[test]
    fn test_truncated_header() {
        let err = Decoder::new(Cursor::new("Content-Length: 10\r\n"))
            .decode()
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_oversized_header() {
        let bytes = "X".repeat(MAX_HEADER_BYTES + 1);
        let err = Decoder::new(Cursor::new(bytes)).decode().unwrap_err();
        assert!(matches!(err, Error::HeaderTooLarge(_)));
    }

    #[test]
    fn test_unknown_discriminants() {
        let err = from_payload(br#"{"seq":1,"type":"notification"}"#).unwrap_err();
        assert!(matches!(err, Error::UnrecognizedMessageType(t) if t == "notification"));

        let err = from_payload(br#"{"seq":1,"type":"request","command":"frobnicate","arguments":{}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::UnrecognizedCommand(c) if c == "frobnicate"));

        let err = from_payload(br#"{"seq":1,"type":"event","event":"frobnicated","body":{}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::UnrecognizedEvent(e) if e == "frobnicated"));

        // nothing to resolve, the handler decides what to do with an unknown command
        let message = from_payload(br#"{"seq":1,"type":"request","command":"frobnicate"}"#).unwrap();
        assert_eq!(
            message,
            Message::Request(Request { seq: 1, ..Request::bare("frobnicate") })
        );
    }

    #[test]
    fn test_json_syntax_error() {
        let err = Decoder::new(Cursor::new(frame("{\"seq\":")))
            .decode()
            .unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    fn assert_rejected(message: impl Into<Message>, expected: fn(&Error) -> bool) {
        let mut out = Vec::new();
        let err = Encoder::new(&mut out).encode(&message.into()).unwrap_err();
        assert!(expected(&err), "unexpected error: {err}");
        assert!(out.is_empty());
    }

    #[test]
    fn test_contract_violations_write_nothing() {
        let request = Request {
            seq: 1,
            ..Request::bare("threads")
        };

        assert_rejected(Request::bare("threads"), |e| {
            matches!(e, Error::MissingSeq(MessageKind::Request))
        });
        assert_rejected(
            Response {
                seq: 2,
                ..Response::success(&request, Some(Capabilities::default().into()))
            },
            |e| matches!(e, Error::PayloadMismatch { .. }),
        );
        assert_rejected(
            Response {
                seq: 2,
                request_seq: 0,
                ..Response::success(&request, None)
            },
            |e| matches!(e, Error::MissingRequestSeq),
        );
        assert_rejected(
            Event {
                seq: 2,
                ..Event::new("", None)
            },
            |e| matches!(e, Error::MissingEvent),
        );
    }

    #[test]
    fn test_failed_response_round_trip() {
        let request = Request {
            seq: 4,
            ..Request::bare("frobnicate")
        };
        let response = Response {
            seq: 9,
            ..Response::error(&request, "Unknown command \"frobnicate\"")
        };
        let decoded = from_payload(&to_payload(&response.clone().into()).unwrap()).unwrap();
        assert_eq!(decoded, Message::Response(response));
    }
}
