// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{Event, EventType};

/// Async event handler.  Returns `Err` to fail the emission that delivered
/// the event; failures are isolated per emission and never unwind the
/// dispatcher.
pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    /// `None` subscribes to every event type (wildcard).
    filter: Option<EventType>,
    handler: Handler,
}

struct Envelope {
    event: Event,
    /// Present for `emit` (caller awaits handler completion); absent for
    /// `publish` (fire-and-forget).
    ack: Option<oneshot::Sender<Result<(), String>>>,
}

struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    /// Events enqueued but not yet fully dispatched (includes the one the
    /// dispatcher is currently delivering).
    depth: AtomicUsize,
    next_sub: AtomicU64,
    next_seq: AtomicU64,
}

/// Process-wide serialized event dispatcher.
///
/// All events flow through a single consumer task: one event is delivered to
/// all of its handlers, to completion, before the next begins.  Handlers that
/// need to raise follow-up events must use [`EventBus::publish`] — awaiting
/// `emit` from inside a handler would wait on the very dispatch slot the
/// handler occupies.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            subscribers: Mutex::new(Vec::new()),
            depth: AtomicUsize::new(0),
            next_sub: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(Arc::clone(&inner), rx));
        Self { inner, tx }
    }

    /// Register a handler for one event type, or for all types when
    /// `filter` is `None`.  Typed handlers fire before wildcard handlers,
    /// each group in subscription order.
    pub fn subscribe(&self, filter: Option<EventType>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_sub.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.lock().unwrap().push(Subscriber {
            id,
            filter,
            handler,
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .retain(|s| s.id != id);
    }

    /// Enqueue an event and wait until every handler has run.
    ///
    /// Returns the normalized event on success; returns `Err` when any
    /// handler failed (the remaining handlers still ran — failures are
    /// isolated to this emission).
    pub async fn emit(&self, event: Event) -> anyhow::Result<Event> {
        let event = self.normalize(event);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(event.clone(), Some(ack_tx))?;
        match ack_rx.await {
            Ok(Ok(())) => Ok(event),
            Ok(Err(msg)) => Err(anyhow::anyhow!("handler failed for {}: {msg}", event.event_type)),
            Err(_) => Err(anyhow::anyhow!("event bus stopped before dispatch")),
        }
    }

    /// Enqueue an event without waiting for delivery.  This is the only safe
    /// form from inside a handler.
    pub fn publish(&self, event: Event) -> anyhow::Result<Event> {
        let event = self.normalize(event);
        self.enqueue(event.clone(), None)?;
        Ok(event)
    }

    /// Number of events not yet fully dispatched.
    pub fn queue_depth(&self) -> usize {
        self.inner.depth.load(Ordering::Acquire)
    }

    /// Wait until the queue empties or `timeout` elapses.  Returns `true`
    /// when the queue drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.queue_depth() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    fn normalize(&self, mut event: Event) -> Event {
        if event.session_id.is_empty() {
            event.session_id = "main".into();
        }
        event.seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        event
    }

    fn enqueue(
        &self,
        event: Event,
        ack: Option<oneshot::Sender<Result<(), String>>>,
    ) -> anyhow::Result<()> {
        self.inner.depth.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(Envelope { event, ack }).is_err() {
            self.inner.depth.fetch_sub(1, Ordering::AcqRel);
            anyhow::bail!("event bus dispatcher is not running");
        }
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(Envelope { event, ack }) = rx.recv().await {
        debug!(event_type = %event.event_type, session = %event.session_id, "dispatching");

        // Snapshot the handler list: typed subscribers first, wildcard after,
        // both in subscription order.  Handlers registered mid-dispatch see
        // only subsequent events.
        let handlers: Vec<Handler> = {
            let subs = inner.subscribers.lock().unwrap();
            subs.iter()
                .filter(|s| s.filter == Some(event.event_type))
                .chain(subs.iter().filter(|s| s.filter.is_none()))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        let mut first_error: Option<String> = None;
        for handler in handlers {
            if let Err(e) = handler(event.clone()).await {
                warn!(event_type = %event.event_type, error = %e, "event handler failed");
                if first_error.is_none() {
                    first_error = Some(e.to_string());
                }
            }
        }

        inner.depth.fetch_sub(1, Ordering::AcqRel);
        if let Some(ack) = ack {
            let _ = ack.send(match first_error {
                None => Ok(()),
                Some(msg) => Err(msg),
            });
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
