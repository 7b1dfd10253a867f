//! Channel multiplexing over one transport per connection

mod channel;
mod multiplexer;

pub use channel::{ChannelHandle, ChannelId, ChannelKind, ChannelState};
pub use multiplexer::{ChannelMultiplexer, SftpLease};
