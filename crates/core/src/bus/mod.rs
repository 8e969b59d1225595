//! In-process publish/subscribe.
//!
//! Every subscription owns an unbounded FIFO queue drained by its own dispatch
//! task, so `publish` never waits on a handler and one subscriber sees events
//! in publish order. A subscription to several tags shares one queue, so that
//! order holds across its tags too. Each handler call runs as its own task: an
//! `Err` or a panic is logged and the next event is still delivered.

pub mod event;

pub use event::{Event, EventTag};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A subscriber callback.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}

/// Token returned by `subscribe`; pass it to `unsubscribe` to stop delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: Uuid,
    tags: Vec<EventTag>,
}

impl Subscription {
    pub fn tags(&self) -> &[EventTag] {
        &self.tags
    }
}

struct Slot {
    id: Uuid,
    tx: mpsc::UnboundedSender<Event>,
}

struct BusInner {
    slots: RwLock<HashMap<EventTag, Vec<Slot>>>,
    token: CancellationToken,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    /// Dispatch tasks stop when `token` is cancelled.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(BusInner { slots: RwLock::new(HashMap::new()), token }),
        }
    }

    /// Enqueue `event` for every current subscriber of its tag.
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, event: Event) -> usize {
        let tag = event.tag();
        let slots = self.inner.slots.read().unwrap_or_else(|e| e.into_inner());
        let Some(list) = slots.get(&tag) else {
            tracing::trace!(?tag, "event published with no subscribers");
            return 0;
        };

        let mut delivered = 0;
        for slot in list {
            if slot.tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(?tag, subscription = %slot.id, "subscriber queue closed");
            }
        }
        delivered
    }

    /// Register `handler` for `tag`. Must be called within a tokio runtime.
    pub fn subscribe<H: EventHandler>(&self, tag: EventTag, handler: H) -> Subscription {
        self.subscribe_many(&[tag], handler)
    }

    /// Register `handler` for every tag in `tags` behind a single queue, so
    /// it observes all of them in publish order.
    pub fn subscribe_many<H: EventHandler>(&self, tags: &[EventTag], handler: H) -> Subscription {
        let id = Uuid::new_v4();
        let mut unique: Vec<EventTag> = Vec::with_capacity(tags.len());
        for tag in tags {
            if !unique.contains(tag) {
                unique.push(*tag);
            }
        }
        let tags = unique;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(id, tags.clone(), Arc::new(handler), rx, self.inner.token.clone()));

        let mut slots = self.inner.slots.write().unwrap_or_else(|e| e.into_inner());
        for tag in &tags {
            slots.entry(*tag).or_default().push(Slot { id, tx: tx.clone() });
        }
        tracing::debug!(?tags, subscription = %id, "subscribed");
        Subscription { id, tags }
    }

    /// Register an async closure for several tags sharing one queue.
    pub fn subscribe_many_fn<F, Fut>(&self, tags: &[EventTag], f: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_many(tags, FnHandler(f))
    }

    /// Register an async closure for `tag`.
    pub fn subscribe_fn<F, Fut>(&self, tag: EventTag, f: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(tag, FnHandler(f))
    }

    /// Stop delivery to `sub`. Events already queued are still handled.
    /// Returns false if the subscription was unknown.
    pub fn unsubscribe(&self, sub: &Subscription) -> bool {
        let mut slots = self.inner.slots.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        for tag in &sub.tags {
            if let Some(list) = slots.get_mut(tag) {
                let before = list.len();
                list.retain(|slot| slot.id != sub.id);
                removed |= before != list.len();
            }
        }
        removed
    }

    pub fn subscriber_count(&self, tag: EventTag) -> usize {
        let slots = self.inner.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.get(&tag).map_or(0, Vec::len)
    }
}

async fn dispatch(
    id: Uuid,
    tags: Vec<EventTag>,
    handler: Arc<dyn EventHandler>,
    mut rx: mpsc::UnboundedReceiver<Event>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };

        let h = Arc::clone(&handler);
        match tokio::spawn(async move { h.handle(event).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(?tags, subscription = %id, error = %e, "event handler failed");
            }
            Err(e) if e.is_panic() => {
                tracing::error!(?tags, subscription = %id, "event handler panicked");
            }
            Err(_) => break,
        }
    }
    tracing::debug!(?tags, subscription = %id, "dispatcher stopped");
}
