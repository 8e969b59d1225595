use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AffectState, ContextId, CryostasisPhase, InboundMessage, OutboundResponse, PadVector,
    ResourceSample,
};

/// Everything components say to each other travels as one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    InboundMessage(InboundMessage),
    OutboundResponse(OutboundResponse),
    /// Interim signal while a turn waits on a model reload.
    Thinking {
        context_id: ContextId,
        text: String,
    },
    AffectChanged {
        context_id: ContextId,
        state: AffectState,
        reason: String,
    },
    /// Interaction delta for the emotion engine to apply.
    AffectStimulus {
        context_id: ContextId,
        delta: PadVector,
        reason: String,
    },
    ResourceSampled(ResourceSample),
    ReloadRequested {
        context_id: Option<ContextId>,
    },
    CryostasisTransitioned {
        from: CryostasisPhase,
        to: CryostasisPhase,
        reason: String,
        at: DateTime<Utc>,
    },
    InferenceFailed {
        context_id: ContextId,
        attempts: u32,
        error: String,
    },
}

/// Subscription key. One per `Event` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTag {
    InboundMessage,
    OutboundResponse,
    Thinking,
    AffectChanged,
    AffectStimulus,
    ResourceSampled,
    ReloadRequested,
    CryostasisTransitioned,
    InferenceFailed,
}

impl EventTag {
    pub const ALL: [EventTag; 9] = [
        EventTag::InboundMessage,
        EventTag::OutboundResponse,
        EventTag::Thinking,
        EventTag::AffectChanged,
        EventTag::AffectStimulus,
        EventTag::ResourceSampled,
        EventTag::ReloadRequested,
        EventTag::CryostasisTransitioned,
        EventTag::InferenceFailed,
    ];
}

impl Event {
    pub fn tag(&self) -> EventTag {
        match self {
            Event::InboundMessage(_) => EventTag::InboundMessage,
            Event::OutboundResponse(_) => EventTag::OutboundResponse,
            Event::Thinking { .. } => EventTag::Thinking,
            Event::AffectChanged { .. } => EventTag::AffectChanged,
            Event::AffectStimulus { .. } => EventTag::AffectStimulus,
            Event::ResourceSampled(_) => EventTag::ResourceSampled,
            Event::ReloadRequested { .. } => EventTag::ReloadRequested,
            Event::CryostasisTransitioned { .. } => EventTag::CryostasisTransitioned,
            Event::InferenceFailed { .. } => EventTag::InferenceFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_kind_tag() {
        let event = Event::ReloadRequested { context_id: Some("c1".into()) };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "reload_requested");
        assert_eq!(json["context_id"], "c1");
    }

    #[test]
    fn newtype_payload_is_flattened() {
        let event = Event::InboundMessage(InboundMessage::new("c1", "kai", "hi"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "inbound_message");
        assert_eq!(json["text"], "hi");
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.tag(), EventTag::InboundMessage);
    }
}
