use crate::types::PadVector;

const POSITIVE: &[&str] = &["happy", "love", "great", "awesome", "good", "thanks", "appreciate"];
const NEGATIVE: &[&str] = &["sad", "hate", "bad", "terrible", "angry", "frustrated", "annoyed"];
const HIGH_ENERGY: &[&str] = &["exciting", "intense", "urgent", "rush", "crazy", "wild"];
const LOW_ENERGY: &[&str] = &["tired", "calm", "boring", "slow", "sleepy", "relaxed"];
const DOMINANT: &[&str] = &["sure", "definitely", "absolutely", "confident", "know"];
const SUBMISSIVE: &[&str] = &["maybe", "perhaps", "uncertain", "confused", "unsure", "help"];

const APOLOGY: &[&str] = &["sorry", "apology", "apologize", "my bad", "forgive", "didn't mean"];

const VALENCE_STEP: f32 = 0.1;
const ENERGY_STEP: f32 = 0.1;
const DOMINANCE_STEP: f32 = 0.05;

/// Whether `text` reads as an apology. Matches phrases anywhere, case-insensitive.
pub fn is_apology(text: &str) -> bool {
    let lower = text.to_lowercase();
    APOLOGY.iter().any(|phrase| lower.contains(phrase))
}

/// Estimates how an incoming message should move the persona's affect.
pub trait SentimentEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> PadVector;
}

/// Keyword counting over whole words.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordSentiment;

impl SentimentEstimator for KeywordSentiment {
    fn estimate(&self, text: &str) -> PadVector {
        let mut delta = PadVector::ZERO;
        let words = text
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase);

        for word in words {
            let w = word.as_str();
            if POSITIVE.contains(&w) {
                delta.pleasure += VALENCE_STEP;
            } else if NEGATIVE.contains(&w) {
                delta.pleasure -= VALENCE_STEP;
            }
            if HIGH_ENERGY.contains(&w) {
                delta.arousal += ENERGY_STEP;
            } else if LOW_ENERGY.contains(&w) {
                delta.arousal -= ENERGY_STEP;
            }
            if DOMINANT.contains(&w) {
                delta.dominance += DOMINANCE_STEP;
            } else if SUBMISSIVE.contains(&w) {
                delta.dominance -= DOMINANCE_STEP;
            }
        }
        delta
    }
}
