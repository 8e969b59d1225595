use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Conversation identifier. Ordering and memory are scoped per context.
pub type ContextId = String;

fn unit(v: f32) -> f32 {
    if v.is_finite() { v.clamp(-1.0, 1.0) } else { 0.0 }
}

/// A point or displacement in pleasure/arousal/dominance space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PadVector {
    pub pleasure: f32,
    pub arousal: f32,
    pub dominance: f32,
}

impl PadVector {
    pub const ZERO: Self = Self { pleasure: 0.0, arousal: 0.0, dominance: 0.0 };

    pub fn new(pleasure: f32, arousal: f32, dominance: f32) -> Self {
        Self { pleasure, arousal, dominance }
    }

    /// Clamp every component to `[-limit, limit]`. Non-finite components become 0.
    pub fn bounded(self, limit: f32) -> Self {
        let b = |v: f32| if v.is_finite() { v.clamp(-limit, limit) } else { 0.0 };
        Self { pleasure: b(self.pleasure), arousal: b(self.arousal), dominance: b(self.dominance) }
    }

    pub fn clamped(self) -> Self {
        Self { pleasure: unit(self.pleasure), arousal: unit(self.arousal), dominance: unit(self.dominance) }
    }

    pub fn is_zero(&self) -> bool {
        self.pleasure == 0.0 && self.arousal == 0.0 && self.dominance == 0.0
    }
}

/// Current affect of one context. Every axis stays in `[-1.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffectState {
    pub pleasure: f32,
    pub arousal: f32,
    pub dominance: f32,
    pub updated_at: DateTime<Utc>,
    /// Set while the persona holds a grudge in this context.
    #[serde(default)]
    pub grudge_since: Option<DateTime<Utc>>,
}

impl AffectState {
    pub fn at(pad: PadVector, updated_at: DateTime<Utc>) -> Self {
        let pad = pad.clamped();
        Self {
            pleasure: pad.pleasure,
            arousal: pad.arousal,
            dominance: pad.dominance,
            updated_at,
            grudge_since: None,
        }
    }

    pub fn pad(&self) -> PadVector {
        PadVector::new(self.pleasure, self.arousal, self.dominance)
    }

    /// Add a displacement, then clamp.
    pub fn shift(&mut self, delta: PadVector, now: DateTime<Utc>) {
        self.pleasure = unit(self.pleasure + delta.pleasure);
        self.arousal = unit(self.arousal + delta.arousal);
        self.dominance = unit(self.dominance + delta.dominance);
        self.updated_at = now;
    }

    /// Move each axis toward `baseline`, keeping `retain` of the remaining distance.
    pub fn relax_toward(&mut self, baseline: PadVector, retain: f32, now: DateTime<Utc>) {
        let retain = retain.clamp(0.0, 1.0);
        let step = |x: f32, b: f32| unit(b + (x - b) * retain);
        self.pleasure = step(self.pleasure, baseline.pleasure);
        self.arousal = step(self.arousal, baseline.arousal);
        self.dominance = step(self.dominance, baseline.dominance);
        self.updated_at = now;
    }

    /// Short mood phrase used in prompts.
    pub fn describe(&self) -> String {
        let tone = if self.pleasure >= 0.0 { "positive" } else { "somber" };
        let energy = if self.arousal >= 0.0 { "energetic" } else { "calm" };
        let stance = if self.dominance >= 0.0 { "confident" } else { "uncertain" };
        match self.grudge_since {
            Some(_) => format!("{tone}, {energy}, {stance}, cold and holding a grudge"),
            None => format!("{tone}, {energy}, {stance}"),
        }
    }

    pub fn holds_grudge(&self) -> bool {
        self.grudge_since.is_some()
    }

    pub fn is_in_range(&self) -> bool {
        [self.pleasure, self.arousal, self.dominance]
            .iter()
            .all(|v| (-1.0..=1.0).contains(v))
    }
}

/// One utterance kept in episodic or long-term memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub context_id: ContextId,
    pub speaker: String,
    pub text: String,
    /// Filled in when the record is persisted; episodic copies carry none.
    pub embedding: Option<Vec<f32>>,
    pub timestamp: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(context_id: impl Into<ContextId>, speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            context_id: context_id.into(),
            speaker: speaker.into(),
            text: text.into(),
            embedding: None,
            timestamp: Utc::now(),
        }
    }

    /// Rendered as `speaker: text` in prompts.
    pub fn render(&self) -> String {
        format!("{}: {}", self.speaker, self.text)
    }

    /// Character cost of the rendered line, counted against the context budget.
    pub fn rendered_len(&self) -> usize {
        self.speaker.chars().count() + 2 + self.text.chars().count()
    }
}

/// One host resource observation. Percentages are in `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub gpu_percent: f32,
    pub cpu_percent: f32,
    /// Dedicated GPU memory in use, MiB. Zero when unknown.
    #[serde(default)]
    pub vram_used_mb: f32,
    /// Lowercased process names.
    pub running_process_names: BTreeSet<String>,
    pub sampled_at: DateTime<Utc>,
}

impl ResourceSample {
    pub fn new(gpu_percent: f32, cpu_percent: f32) -> Self {
        Self {
            gpu_percent: gpu_percent.clamp(0.0, 100.0),
            cpu_percent: cpu_percent.clamp(0.0, 100.0),
            vram_used_mb: 0.0,
            running_process_names: BTreeSet::new(),
            sampled_at: Utc::now(),
        }
    }

    pub fn with_vram(mut self, used_mb: f32) -> Self {
        self.vram_used_mb = used_mb.max(0.0);
        self
    }

    pub fn with_processes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.running_process_names = names.into_iter().map(|n| n.as_ref().to_lowercase()).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryostasisPhase {
    Resident,
    Cooling,
    Unloaded,
}

impl CryostasisPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resident => "resident",
            Self::Cooling => "cooling",
            Self::Unloaded => "unloaded",
        }
    }
}

impl std::fmt::Display for CryostasisPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleOp {
    Load,
    Unload,
}

impl LifecycleOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Unload => "unload",
        }
    }
}

/// Residency state of the inference model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryostasisState {
    pub phase: CryostasisPhase,
    pub last_transition_at: DateTime<Utc>,
    pub consecutive_high_samples: u32,
    pub consecutive_low_samples: u32,
    /// At most one load/unload runs at a time.
    pub operation_in_flight: Option<LifecycleOp>,
}

impl CryostasisState {
    pub fn resident(now: DateTime<Utc>) -> Self {
        Self {
            phase: CryostasisPhase::Resident,
            last_transition_at: now,
            consecutive_high_samples: 0,
            consecutive_low_samples: 0,
            operation_in_flight: None,
        }
    }

    /// Inference may be attempted unless the model is evicted.
    pub fn accepts_inference(&self) -> bool {
        self.phase != CryostasisPhase::Unloaded
    }
}

/// A user message entering the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: Uuid,
    pub context_id: ContextId,
    pub speaker: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(context_id: impl Into<ContextId>, speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            context_id: context_id.into(),
            speaker: speaker.into(),
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

/// The reply to exactly one inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundResponse {
    pub context_id: ContextId,
    pub in_reply_to: Uuid,
    pub text: String,
    /// True when the configured fallback replaced a model reply.
    pub fallback: bool,
}
