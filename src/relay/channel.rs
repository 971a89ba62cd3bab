//! # Client Event Channel
//!
//! An ordered, multi-producer, single-subscriber queue of client events that feeds
//! the `/response-events` server-sent event stream.
//!
//! ## Delivery rules:
//! - Events are delivered in the order they were pushed.
//! - Only one subscriber may be attached at a time.
//! - While nobody is attached, events are kept in a bounded backlog; when the backlog
//!   is full the oldest event is evicted so the most recent events (and the terminal
//!   marker) survive.
//! - If the subscriber goes away in the middle of a session's stream, the backlog is
//!   discarded and further pushes for that session are dropped until its terminal
//!   event. Producers are never told; drops are logged and counted.
//! - `push` never blocks.

use crate::error::AppError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// SSE comment frame written while the stream is idle.
pub const KEEP_ALIVE_FRAME: &str = ": keep-alive\n\n";

/// One event as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Ordinary payload (base64 audio fragment)
    Data(String),
    /// The session finished successfully
    Complete,
    /// The session failed
    Error,
}

impl ClientEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientEvent::Complete | ClientEvent::Error)
    }

    /// Server-sent event framing.
    pub fn to_sse(&self) -> String {
        match self {
            ClientEvent::Data(payload) => {
                let mut frame = String::with_capacity(payload.len() + 8);
                for line in payload.split('\n') {
                    frame.push_str("data: ");
                    frame.push_str(line);
                    frame.push('\n');
                }
                frame.push('\n');
                frame
            }
            ClientEvent::Complete => "event: close\ndata: audio processing complete\n\n".to_string(),
            ClientEvent::Error => "event: error\ndata: audio processing error\n\n".to_string(),
        }
    }
}

/// Whether a pushed event made it into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Dropped,
}

/// Result of a bounded wait on the subscriber side.
#[derive(Debug, PartialEq, Eq)]
pub enum Pull {
    Event(ClientEvent),
    /// Nothing arrived within the wait; the caller should check its client is alive.
    Idle,
    /// The channel was shut down.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriberSlot {
    /// No subscriber; events are buffered.
    Waiting,
    Attached(u64),
    /// The subscriber left mid-stream; pushes are dropped until the next terminal event.
    Disconnected,
}

#[derive(Debug)]
struct ChannelState {
    backlog: VecDeque<ClientEvent>,
    slot: SubscriberSlot,
    next_subscriber_id: u64,
    /// A session has pushed data but not yet its terminal event.
    mid_stream: bool,
    dropped: u64,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ChannelState>,
    notify: Notify,
    capacity: usize,
}

/// Cloneable producer handle. All clones feed the same queue.
#[derive(Debug, Clone)]
pub struct EventChannel {
    shared: Arc<Shared>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ChannelState {
                    backlog: VecDeque::new(),
                    slot: SubscriberSlot::Waiting,
                    next_subscriber_id: 1,
                    mid_stream: false,
                    dropped: 0,
                    closed: false,
                }),
                notify: Notify::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an event without blocking.
    pub fn push(&self, event: ClientEvent) -> PushOutcome {
        let terminal = event.is_terminal();
        let mut state = self.lock();

        if state.closed {
            state.dropped += 1;
            debug!(?event, "Event channel closed, dropping event");
            return PushOutcome::Dropped;
        }

        state.mid_stream = !terminal;

        if state.slot == SubscriberSlot::Disconnected {
            state.dropped += 1;
            if terminal {
                // Next session starts buffering again for whoever subscribes.
                state.slot = SubscriberSlot::Waiting;
            }
            debug!(terminal, dropped = state.dropped, "Subscriber disconnected, dropping event");
            return PushOutcome::Dropped;
        }

        if state.backlog.len() >= self.shared.capacity {
            state.backlog.pop_front();
            state.dropped += 1;
            warn!(
                capacity = self.shared.capacity,
                dropped = state.dropped,
                "Event backlog full, evicted oldest event"
            );
        }

        state.backlog.push_back(event);
        drop(state);
        self.shared.notify.notify_one();
        PushOutcome::Queued
    }

    /// Attach the single subscriber.
    pub fn subscribe(&self) -> Result<EventSubscriber, AppError> {
        let mut state = self.lock();
        if let SubscriberSlot::Attached(_) = state.slot {
            return Err(AppError::SubscriberActive);
        }

        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.slot = SubscriberSlot::Attached(id);
        debug!(subscriber = id, backlog = state.backlog.len(), "Event subscriber attached");

        Ok(EventSubscriber {
            shared: self.shared.clone(),
            id,
            finished: false,
        })
    }

    /// Shut the channel down. Pending pulls return once the backlog is drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.notify.notify_one();
    }

    pub fn has_subscriber(&self) -> bool {
        matches!(self.lock().slot, SubscriberSlot::Attached(_))
    }

    pub fn backlog_len(&self) -> usize {
        self.lock().backlog.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }
}

/// The receiving end. Dropping it detaches the subscriber.
#[derive(Debug)]
pub struct EventSubscriber {
    shared: Arc<Shared>,
    id: u64,
    /// The last event handed out was terminal.
    finished: bool,
}

impl EventSubscriber {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the next event. Returns `None` once the channel is closed and drained.
    ///
    /// Cancel-safe: an event is only removed from the backlog on the poll that returns it.
    pub async fn pull(&mut self) -> Option<ClientEvent> {
        loop {
            let notified = self.shared.notify.notified();
            let next = {
                let mut state = self.lock();
                match state.backlog.pop_front() {
                    Some(event) => Some(event),
                    None if state.closed => return None,
                    None => None,
                }
            };
            if let Some(event) = next {
                self.finished = event.is_terminal();
                return Some(event);
            }
            notified.await;
        }
    }

    /// Like [`pull`](Self::pull) but gives up after `wait` so the caller can probe
    /// its client connection.
    pub async fn pull_within(&mut self, wait: Duration) -> Pull {
        match tokio::time::timeout(wait, self.pull()).await {
            Ok(Some(event)) => Pull::Event(event),
            Ok(None) => Pull::Closed,
            Err(_) => Pull::Idle,
        }
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        let id = self.id;
        let finished = self.finished;
        let mut state = self.lock();
        if state.slot != SubscriberSlot::Attached(id) {
            return;
        }

        if state.mid_stream && !finished {
            let discarded = state.backlog.len() as u64;
            state.backlog.clear();
            state.dropped += discarded;
            state.slot = SubscriberSlot::Disconnected;
            debug!(subscriber = id, discarded, "Event subscriber disconnected mid-stream");
        } else {
            state.slot = SubscriberSlot::Waiting;
            debug!(subscriber = id, "Event subscriber detached");
        }
    }
}
