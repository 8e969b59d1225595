use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::{Event, EventBus, EventTag, Subscription};
use crate::types::ContextId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Reply,
    Fallback,
    /// Interim notice while the model is being reloaded.
    Thinking,
}

/// Something to show the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMessage {
    pub context_id: ContextId,
    pub content: String,
    pub kind: OutputKind,
    /// Set for replies and fallbacks.
    pub in_reply_to: Option<Uuid>,
}

impl OutputMessage {
    pub fn is_final(&self) -> bool {
        self.kind != OutputKind::Thinking
    }

    fn from_event(event: Event) -> Option<Self> {
        match event {
            Event::OutboundResponse(r) => Some(Self {
                context_id: r.context_id,
                content: r.text,
                kind: if r.fallback { OutputKind::Fallback } else { OutputKind::Reply },
                in_reply_to: Some(r.in_reply_to),
            }),
            Event::Thinking { context_id, text } => Some(Self {
                context_id,
                content: text,
                kind: OutputKind::Thinking,
                in_reply_to: None,
            }),
            _ => None,
        }
    }
}

pub type OutputReceiver = mpsc::Receiver<OutputMessage>;

/// Forward responses and thinking signals into a bounded channel, in publish
/// order: a turn's thinking signal always precedes its reply.
/// A full channel applies backpressure to this subscription only.
pub fn attach(bus: &EventBus, buffer: usize) -> (OutputReceiver, Subscription) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let sub = bus.subscribe_many_fn(&[EventTag::Thinking, EventTag::OutboundResponse], move |event| {
        let tx = tx.clone();
        async move {
            if let Some(msg) = OutputMessage::from_event(event) {
                tx.send(msg).await.map_err(|_| anyhow::anyhow!("output receiver dropped"))?;
            }
            Ok(())
        }
    });
    (rx, sub)
}
