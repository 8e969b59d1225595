use uuid::Uuid;

use crate::bus::{Event, EventBus};
use crate::types::InboundMessage;

/// Publish user text as an `InboundMessage` and return its id, which the
/// matching `OutboundResponse` carries in `in_reply_to`.
pub fn submit(bus: &EventBus, context_id: &str, speaker: &str, text: impl Into<String>) -> Uuid {
    let message = InboundMessage::new(context_id, speaker, text);
    let id = message.id;
    let delivered = bus.publish(Event::InboundMessage(message));
    if delivered == 0 {
        tracing::warn!(context = context_id, message = %id, "no orchestrator subscribed, message dropped");
    }
    id
}
