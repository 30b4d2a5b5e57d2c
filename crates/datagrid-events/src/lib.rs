#![warn(missing_docs)]

//! Datagrid event notifier: structured lifecycle events published to an
//! external bus with at-least-once, buffered delivery. The orchestration
//! core keeps running when the bus is down; events queue up to a
//! configured capacity and overflow per policy.

pub mod event;
pub mod notifier;

pub use event::Event;
pub use notifier::{
    BufferedNotifier, EventSink, MemorySink, NotifierConfig, OverflowPolicy, SinkError,
};
