use ghost_llm::ChatMessage;

use crate::memory::AssembledContext;
use crate::types::{AffectState, InboundMessage};

const CLOSING_INSTRUCTION: &str = "You are a companion, not an assistant. Respond naturally and personally. \
    If your energy is low keep it brief; if your mood is good be more expressive.";

/// Everything the system prompt is built from.
#[derive(Debug, Clone, Copy)]
pub struct PromptParts<'a> {
    pub persona_name: &'a str,
    pub persona_prompt: &'a str,
    pub affect: &'a AffectState,
    pub phase: &'a str,
    pub sensor_context: &'a str,
}

fn system_prompt(parts: &PromptParts<'_>, context: &AssembledContext) -> String {
    let mut prompt = format!(
        "{}\n\n## Current state\nMood: {}\nTime of day: {}",
        parts.persona_prompt,
        parts.affect.describe(),
        parts.phase,
    );
    if !parts.sensor_context.is_empty() {
        prompt.push_str("\n\n## Surroundings\n");
        prompt.push_str(parts.sensor_context);
    }
    if !context.recalled.is_empty() {
        prompt.push_str("\n\n## Things you remember\n");
        for record in &context.recalled {
            prompt.push_str("- ");
            prompt.push_str(&record.render());
            prompt.push('\n');
        }
    }
    prompt.push_str("\n\n");
    prompt.push_str(CLOSING_INSTRUCTION);
    prompt
}

/// Build the message list for one turn: system prompt, recent conversation,
/// then the new message.
pub fn build_messages(parts: &PromptParts<'_>, context: &AssembledContext, message: &InboundMessage) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(context.recent.len() + 2);
    messages.push(ChatMessage::system(system_prompt(parts, context)));

    for record in &context.recent {
        if record.speaker == parts.persona_name {
            messages.push(ChatMessage::assistant(record.text.clone()));
        } else {
            messages.push(ChatMessage::user(record.text.clone()));
        }
    }

    messages.push(ChatMessage::user(message.text.clone()));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemoryRecord, PadVector};
    use chrono::Utc;
    use ghost_llm::Role;

    fn affect() -> AffectState {
        AffectState::at(PadVector::new(0.5, -0.2, 0.3), Utc::now())
    }

    fn parts<'a>(affect: &'a AffectState, sensors: &'a str) -> PromptParts<'a> {
        PromptParts {
            persona_name: "Korone",
            persona_prompt: "You are Korone.",
            affect,
            phase: "evening (winding down)",
            sensor_context: sensors,
        }
    }

    #[test]
    fn build_messages_basic() {
        let a = affect();
        let msg = InboundMessage::new("c1", "kai", "hello");
        let msgs = build_messages(&parts(&a, ""), &AssembledContext::default(), &msg);
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].content.contains("positive, calm, confident"));
        assert!(msgs[0].content.contains("evening"));
        assert!(!msgs[0].content.contains("Surroundings"));
        assert_eq!(msgs[1].content, "hello");
    }

    #[test]
    fn recent_records_map_to_roles() {
        let a = affect();
        let ctx = AssembledContext {
            recent: vec![
                MemoryRecord::new("c1", "kai", "earlier question"),
                MemoryRecord::new("c1", "Korone", "earlier answer"),
            ],
            ..AssembledContext::default()
        };
        let msg = InboundMessage::new("c1", "kai", "follow-up");
        let msgs = build_messages(&parts(&a, ""), &ctx, &msg);
        let roles: Vec<_> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
    }

    #[test]
    fn recalled_and_sensor_context_land_in_system_prompt() {
        let a = affect();
        let ctx = AssembledContext {
            recalled: vec![MemoryRecord::new("c0", "kai", "my cat is miso")],
            ..AssembledContext::default()
        };
        let msg = InboundMessage::new("c1", "kai", "hi");
        let msgs = build_messages(&parts(&a, "GPU load 12%"), &ctx, &msg);
        assert!(msgs[0].content.contains("- kai: my cat is miso"));
        assert!(msgs[0].content.contains("GPU load 12%"));
        assert_eq!(msgs.len(), 2);
    }
}
