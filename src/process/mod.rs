//! Remote process listing and signalling

pub mod parser;
mod service;

pub use parser::{decode_process_table, ProcessRow, ProcessTable, SkippedLine};
pub use service::ProcessService;
