//! Event fan-out to the UI layer

mod dispatcher;

pub use dispatcher::{
    EventDispatcher, MetricsUpdate, SubscriptionId, TerminalEvent, TerminalStream,
};
