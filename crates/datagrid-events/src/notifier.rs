//! Buffered event delivery.
//!
//! `BufferedNotifier` sits between the core and the bus sink. `emit` never
//! fails: the event is appended to a bounded buffer and the notifier
//! drains as much of the buffer as the sink will take, in order. When the
//! sink is down events accumulate; when the buffer is full the overflow
//! policy decides which end to drop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::event::Event;

/// Error from an event sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The bus rejected or could not accept the event.
    #[error("event sink unavailable: {reason}")]
    Unavailable {
        /// Backend-provided detail.
        reason: String,
    },
}

/// Outbound event sink, implemented per bus backend.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event. Returning an error leaves the event buffered for
    /// a later flush.
    async fn publish(&self, event: &Event) -> Result<(), SinkError>;
}

/// What to drop when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the oldest buffered event to make room for the new one.
    DropOldest,
    /// Drop the incoming event, keeping what is already buffered.
    DropNewest,
}

/// Notifier tunables.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Maximum number of buffered events.
    pub capacity: usize,
    /// Behavior when the buffer is full.
    pub policy: OverflowPolicy,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            policy: OverflowPolicy::DropOldest,
        }
    }
}

/// At-least-once event publisher with a bounded in-memory buffer.
pub struct BufferedNotifier {
    sink: Arc<dyn EventSink>,
    config: NotifierConfig,
    buffer: Mutex<VecDeque<Event>>,
    dropped: AtomicU64,
}

impl BufferedNotifier {
    /// Create a notifier in front of `sink`.
    pub fn new(sink: Arc<dyn EventSink>, config: NotifierConfig) -> Self {
        Self {
            sink,
            config,
            buffer: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue an event and drain the buffer as far as the sink allows.
    /// Infallible: a down sink leaves events buffered.
    pub async fn emit(&self, event: Event) {
        {
            let mut buffer = self.buffer.lock().await;
            if buffer.len() >= self.config.capacity {
                match self.config.policy {
                    OverflowPolicy::DropOldest => {
                        buffer.pop_front();
                        buffer.push_back(event);
                    }
                    OverflowPolicy::DropNewest => {}
                }
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    capacity = self.config.capacity,
                    "event buffer full, dropping per policy"
                );
            } else {
                buffer.push_back(event);
            }
        }
        self.flush().await;
    }

    /// Deliver buffered events in order until the sink fails or the buffer
    /// is empty. Returns the number delivered.
    pub async fn flush(&self) -> usize {
        let mut delivered = 0;
        let mut buffer = self.buffer.lock().await;
        while let Some(event) = buffer.front() {
            match self.sink.publish(event).await {
                Ok(()) => {
                    buffer.pop_front();
                    delivered += 1;
                }
                Err(err) => {
                    debug!(buffered = buffer.len(), %err, "sink unavailable, keeping events");
                    break;
                }
            }
        }
        delivered
    }

    /// Number of events currently buffered.
    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Number of events dropped by the overflow policy since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// In-memory sink recording published events. Can be switched unavailable
/// to exercise buffering.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
    down: AtomicBool,
}

impl MemorySink {
    /// Create an available sink with no recorded events.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the sink reject (`true`) or accept (`false`) publishes.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::Relaxed);
    }

    /// Snapshot of everything published so far.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, event: &Event) -> Result<(), SinkError> {
        if self.down.load(Ordering::Relaxed) {
            return Err(SinkError::Unavailable {
                reason: "sink marked down".to_string(),
            });
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
