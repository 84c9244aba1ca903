use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use crate::protocol::{Envelope, WaveEvent};

struct Subscriber {
    tx: flume::Sender<Envelope>,
    /// Dotted-name prefixes; empty means everything.
    filter: Vec<String>,
}

impl Subscriber {
    fn wants(&self, event: &WaveEvent) -> bool {
        self.filter.is_empty() || self.filter.iter().any(|p| event.name().starts_with(p.as_str()))
    }
}

#[derive(Default)]
struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    seq: AtomicU64,
}

/// Broadcast bus over flume channels. Every subscriber sees every matching
/// event published after it subscribed, in publish order. Cloning is cheap.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        // A panicking publisher cannot leave the list half-updated.
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> flume::Receiver<Envelope> {
        self.subscribe_filtered(&[])
    }

    /// Receive only events whose name starts with one of `prefixes`, e.g.
    /// `["task.", "build.stuck"]`.
    pub fn subscribe_filtered(&self, prefixes: &[&str]) -> flume::Receiver<Envelope> {
        let (tx, rx) = flume::unbounded();
        self.subscribers().push(Subscriber {
            tx,
            filter: prefixes.iter().map(|p| p.to_string()).collect(),
        });
        rx
    }

    /// Fire-and-forget. Subscribers whose receivers are gone are pruned.
    pub fn publish(&self, event: WaveEvent) {
        let mut subs = self.subscribers();
        let envelope = Envelope {
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            at: Utc::now(),
            event,
        };
        tracing::trace!(event = envelope.event.name(), seq = envelope.seq, "publish");
        subs.retain(|s| !s.wants(&envelope.event) || s.tx.send(envelope.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
