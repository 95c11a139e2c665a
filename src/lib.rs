//! JSON-RPC 2.0 sessions with the Language Server Protocol lifecycle.
//!
//! A [`Session`] runs over any pair of async byte streams. Outgoing calls
//! are checked against a [`MethodRegistry`] and the session phase before
//! anything is written, and each call resolves exactly once: with the
//! peer's response, or with [`Error::ConnectionClosed`] when the session
//! ends.

pub mod lsp;

pub use lsp::{
    Error, MethodRegistry, NotificationHandler, RequestHandler, RequestMethod, Result, Router,
    Session, SessionBuilder, SessionConfig, SessionPhase,
};
