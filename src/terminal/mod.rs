//! Interactive PTY shell sessions

mod service;

pub use service::TerminalSessionService;
