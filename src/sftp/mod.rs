//! SFTP file management module
//!
//! Remote file browsing, reading, writing and upload over one serialized
//! SFTP channel per connection.

mod backend;
pub mod error;
pub mod path_utils;
mod service;
pub mod types;

pub use backend::{RusshSftpBackend, SftpBackend, SftpWriter};
pub use error::SftpError;
pub use service::SftpService;
pub use types::{listing_order, FileEntry};
