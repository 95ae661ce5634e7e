//! Event Broadcaster
//!
//! Per-execution publish/subscribe with bounded replay.
//!
//! - Each execution id owns a stream, opened when the execution starts and
//!   reclaimed on [`close`](EventBroadcaster::close) or after sitting idle.
//! - A new subscriber receives the stream's history first, then live events
//!   in emission order.
//! - Fan-out never waits: a subscriber whose queue is full or closed is
//!   dropped.
//! - Progress updates never go backwards.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::EventConfig;

use super::events::{EventKind, StreamEvent};

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StreamEvent>,
}

struct Stream {
    history: VecDeque<StreamEvent>,
    subscribers: Vec<Subscriber>,
    progress: u8,
    last_activity: Instant,
}

impl Stream {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            subscribers: Vec::new(),
            progress: 0,
            last_activity: Instant::now(),
        }
    }
}

/// A live view of one execution's events.
#[derive(Debug)]
pub struct Subscription {
    pub execution_id: String,
    replay: VecDeque<StreamEvent>,
    rx: mpsc::Receiver<StreamEvent>,
}

impl Subscription {
    /// Next event: replayed history first, then live events. `None` once the
    /// stream is closed or this subscriber was dropped.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }

    /// Next event without waiting.
    pub fn try_next(&mut self) -> Option<StreamEvent> {
        self.replay.pop_front().or_else(|| self.rx.try_recv().ok())
    }

    /// Events still waiting in the replay buffer.
    pub fn pending_replay(&self) -> usize {
        self.replay.len()
    }
}

/// Publishes execution events to subscribers.
pub struct EventBroadcaster {
    config: EventConfig,
    streams: Mutex<HashMap<String, Stream>>,
    next_subscriber: AtomicU64,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(EventConfig::default())
    }
}

impl EventBroadcaster {
    pub fn new(config: EventConfig) -> Self {
        Self {
            config,
            streams: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, Stream>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates the stream for an execution if it does not exist yet.
    pub fn open(&self, execution_id: &str) {
        self.streams()
            .entry(execution_id.to_string())
            .or_insert_with(Stream::new);
        debug!("Opened event stream for {}", execution_id);
    }

    /// Attaches a subscriber, opening the stream if needed.
    pub fn subscribe(&self, execution_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let mut streams = self.streams();
        let stream = streams
            .entry(execution_id.to_string())
            .or_insert_with(Stream::new);
        stream.subscribers.push(Subscriber { id, tx });
        stream.last_activity = Instant::now();

        debug!(
            "Subscriber {} attached to {} ({} events to replay)",
            id,
            execution_id,
            stream.history.len()
        );
        Subscription {
            execution_id: execution_id.to_string(),
            replay: stream.history.clone(),
            rx,
        }
    }

    /// Records an event and fans it out. Returns how many subscribers got it.
    pub fn publish(&self, mut event: StreamEvent) -> usize {
        let mut streams = self.streams();
        let stream = streams
            .entry(event.execution_id.clone())
            .or_insert_with(Stream::new);

        if event.event_kind == EventKind::ProgressUpdate {
            let percent = event.percent().unwrap_or(0).max(stream.progress);
            stream.progress = percent;
            if let Some(data) = event.data.as_object_mut() {
                data.insert("percent".to_string(), json!(percent));
            }
        }

        stream.history.push_back(event.clone());
        while stream.history.len() > self.config.history_limit {
            stream.history.pop_front();
        }
        stream.last_activity = Instant::now();

        let execution_id = event.execution_id.clone();
        let mut delivered = 0;
        stream.subscribers.retain(|subscriber| {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Dropping slow subscriber {} on execution {}",
                        subscriber.id, execution_id
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {} on {} went away", subscriber.id, execution_id);
                    false
                }
            }
        });
        delivered
    }

    /// Tears down an execution's stream. Subscribers see the end of stream.
    pub fn close(&self, execution_id: &str) -> bool {
        let removed = self.streams().remove(execution_id).is_some();
        if removed {
            debug!("Closed event stream for {}", execution_id);
        }
        removed
    }

    /// Reclaims streams idle longer than the configured timeout.
    pub fn reap_idle(&self) -> usize {
        let idle = self.config.idle_timeout();
        let now = Instant::now();
        let mut streams = self.streams();
        let before = streams.len();
        streams.retain(|_, stream| now.duration_since(stream.last_activity) < idle);
        let reaped = before - streams.len();
        if reaped > 0 {
            info!("Reclaimed {} idle event stream(s)", reaped);
        }
        reaped
    }

    /// Runs [`reap_idle`](Self::reap_idle) every `interval` until aborted
    /// or until the broadcaster itself is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let broadcaster = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match broadcaster.upgrade() {
                    Some(broadcaster) => {
                        broadcaster.reap_idle();
                    }
                    None => break,
                }
            }
            debug!("Event stream reaper stopped");
        })
    }

    /// Sweep interval for a reaper honouring the configured idle timeout.
    pub fn reap_interval(&self) -> Duration {
        (self.config.idle_timeout() / 2).max(Duration::from_secs(1))
    }

    pub fn stream_count(&self) -> usize {
        self.streams().len()
    }

    pub fn subscriber_count(&self, execution_id: &str) -> usize {
        self.streams()
            .get(execution_id)
            .map(|s| s.subscribers.len())
            .unwrap_or(0)
    }

    /// Copy of the replay history for an execution.
    pub fn history(&self, execution_id: &str) -> Vec<StreamEvent> {
        self.streams()
            .get(execution_id)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }
}
