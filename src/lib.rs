//! YADAP - Debug Adapter Protocol server for embedded evaluation engines.
//!
//! The [`dap`] module holds the protocol machinery (message model, codec, handle registries,
//! sessions and listeners), [`adapter`] is the reference handler that runs an evaluation
//! engine behind a session.

pub mod adapter;
pub mod config;
pub mod dap;
