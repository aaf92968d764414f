//! Debug Adapter Protocol plumbing.
//!
//! Bytes from a transport go through [`codec::Decoder`] into a [`message::Message`], the
//! [`session::Session`] dispatches it to a [`session::Handler`], and everything the handler
//! sends goes back through [`codec::Encoder`].

pub mod codec;
pub mod error;
pub mod message;
pub mod payload;
pub mod registry;
pub mod server;
pub mod session;
pub mod tracer;
pub mod transport;
pub mod types;

pub use error::Error;
pub use message::{Event, Message, MessageKind, Request, Response};
pub use payload::{EventBody, RequestArguments, ResponseBody};
