use crate::dap::message::MessageKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- framing errors --------------------------------------------
    #[error("invalid or missing Content-Length header")]
    InvalidContentLength,
    #[error("header block exceeds {0} bytes")]
    HeaderTooLarge(usize),
    #[error("connection closed")]
    ConnectionClosed,

    // --------------------------------- transport errors ------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),

    // --------------------------------- decode errors ---------------------------------------------
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized message type {0:?}")]
    UnrecognizedMessageType(String),
    #[error("unrecognized command {0:?}")]
    UnrecognizedCommand(String),
    #[error("unrecognized event {0:?}")]
    UnrecognizedEvent(String),

    // --------------------------------- protocol contract errors ----------------------------------
    #[error("{0} sequence number is not set")]
    MissingSeq(MessageKind),
    #[error("response is not correlated to a request (request_seq is not set)")]
    MissingRequestSeq,
    #[error("{0} has neither a command nor a payload")]
    MissingCommand(MessageKind),
    #[error("event has neither a name nor a body")]
    MissingEvent,
    #[error("{kind} names {declared:?} but its payload belongs to {payload:?}")]
    PayloadMismatch {
        kind: MessageKind,
        declared: String,
        payload: &'static str,
    },

    // --------------------------------- session errors --------------------------------------------
    #[error("initialize handshake failed: {0}")]
    Handshake(String),
    #[error("session already run")]
    AlreadyRun,
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl Error {
    /// Return true if error ends a stream at a frame boundary rather than in the middle of one.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed)
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $target: expr, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: $target, "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $target: expr, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: $target, concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
///
/// Logs under the `dap` target unless `target: "..."` is given first.
#[macro_export]
macro_rules! weak_error {
    (target: $target: expr, $res: expr) => {
        $crate::_error!(log::warn, $target, $res)
    };
    (target: $target: expr, $res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $target, $res, $msg)
    };
    ($res: expr) => {
        $crate::_error!(log::warn, "dap", $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, "dap", $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    (target: $target: expr, $res: expr) => {
        $crate::_error!(log::debug, $target, $res)
    };
    (target: $target: expr, $res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $target, $res, $msg)
    };
    ($res: expr) => {
        $crate::_error!(log::debug, "dap", $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, "dap", $res, $msg)
    };
}
