//! SSH module - connections, channels and the transport manager
//!
//! Built on russh.
//!
//! # Features
//! - Password and private key authentication
//! - Host key verification via ~/.ssh/known_hosts (trust on first use)
//! - Single owner task per connection for all channel opens
//! - At most one live transport per connection id (see `transport`)

mod client;
mod config;
mod error;
mod handle_owner;
mod link;
mod session;
pub mod transport;

pub use client::{ClientHandler, SshClient, SshConnector};
pub use config::{AuthMethod, SshConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use link::{Connector, ExecOutput, Link, SessionCommand, ShellIo};
pub use session::{SshLink, SshSession};
pub use transport::{LinkHealth, TransportManager, TransportRef, TransportState, TransportStatus};
