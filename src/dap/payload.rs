//! Closed sets of message payloads.
//!
//! Every payload kind is a sum type plus a static table mapping the wire discriminant
//! (command or event name) to a decoder for the matching variant. Extending the vocabulary
//! is a one-line change in the corresponding `payload_set!` invocation.

use crate::dap::error::Error;
use crate::dap::types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Decoder for one variant of a payload set.
pub type PayloadDecoder<P> = fn(Value) -> serde_json::Result<P>;

macro_rules! payload_set {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident / $unknown:ident {
            $($tag:literal => $variant:ident($ty:ty),)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize)]
        #[serde(untagged)]
        $vis enum $name {
            $($variant($ty),)+
        }

        impl $name {
            /// Wire discriminant to variant decoder.
            pub const TABLE: &'static [(&'static str, PayloadDecoder<$name>)] = &[
                $(($tag, Self::decode_variant::<$ty> as PayloadDecoder<$name>),)+
            ];

            /// Discriminant intrinsic to this payload variant.
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant(_) => $tag,)+
                }
            }

            /// Second phase of a polymorphic decode: the discriminant is already known,
            /// decode `value` into the variant it selects.
            pub fn decode(name: &str, value: Value) -> Result<Self, Error> {
                let (_, decode) = Self::TABLE
                    .iter()
                    .find(|(tag, _)| *tag == name)
                    .ok_or_else(|| Error::$unknown(name.to_string()))?;
                Ok(decode(value)?)
            }

            fn decode_variant<T>(value: Value) -> serde_json::Result<$name>
            where
                T: DeserializeOwned + Into<$name>,
            {
                serde_json::from_value::<T>(value).map(Into::into)
            }
        }

        $(
            impl From<$ty> for $name {
                fn from(payload: $ty) -> Self {
                    $name::$variant(payload)
                }
            }
        )+
    };
}

payload_set! {
    /// Arguments of a request, keyed by command name.
    pub enum RequestArguments / UnrecognizedCommand {
        "initialize" => Initialize(InitializeArguments),
        "launch" => Launch(LaunchArguments),
        "configurationDone" => ConfigurationDone(ConfigurationDoneArguments),
        "threads" => Threads(ThreadsArguments),
        "terminate" => Terminate(TerminateArguments),
        "disconnect" => Disconnect(DisconnectArguments),
        "stackTrace" => StackTrace(StackTraceArguments),
        "scopes" => Scopes(ScopesArguments),
        "variables" => Variables(VariablesArguments),
        "continue" => Continue(ContinueArguments),
    }
}

payload_set! {
    /// Body of a response, keyed by the command it answers.
    pub enum ResponseBody / UnrecognizedCommand {
        "initialize" => Initialize(Capabilities),
        "threads" => Threads(ThreadsResponseBody),
        "stackTrace" => StackTrace(StackTraceResponseBody),
        "scopes" => Scopes(ScopesResponseBody),
        "variables" => Variables(VariablesResponseBody),
        "continue" => Continue(ContinueResponseBody),
        "error" => Error(ErrorResponseBody),
    }
}

payload_set! {
    /// Body of an event, keyed by event name.
    pub enum EventBody / UnrecognizedEvent {
        "output" => Output(OutputEventBody),
        "stopped" => Stopped(StoppedEventBody),
        "continued" => Continued(ContinuedEventBody),
        "exited" => Exited(ExitedEventBody),
        "terminated" => Terminated(TerminatedEventBody),
        "thread" => Thread(ThreadEventBody),
    }
}

impl ResponseBody {
    /// Error bodies belong to failed responses of any command.
    pub fn is_error(&self) -> bool {
        matches!(self, ResponseBody::Error(_))
    }

    /// Decode a response body. Bodies of failed responses are always error bodies.
    pub fn decode_for(command: &str, success: bool, value: Value) -> Result<Self, Error> {
        if success {
            Self::decode(command, value)
        } else {
            Self::decode("error", value)
        }
    }
}
