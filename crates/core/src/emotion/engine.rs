use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::circadian::{Baseline, CircadianCurve};
use super::persist::AffectStore;
use super::sentiment::is_apology;
use crate::bus::{Event, EventBus, EventTag};
use crate::config::{AffectScope, GhostCfg};
use crate::types::{AffectState, ContextId, PadVector};

/// Key used for the shared state when affect is global.
pub const GLOBAL_CONTEXT: &str = "*";

/// Every tracked affect state, keyed by context (or [`GLOBAL_CONTEXT`]).
pub type AffectBook = HashMap<ContextId, AffectState>;

/// Shared handle for reading affect state from any module.
pub type AffectWatch = watch::Receiver<AffectBook>;

/// Read-only affect lookups for other components.
#[derive(Debug, Clone)]
pub struct AffectView {
    rx: AffectWatch,
    scope: AffectScope,
    baseline: Baseline,
}

impl AffectView {
    /// Current state for `context_id`, or the baseline if it has none yet.
    pub fn snapshot(&self, context_id: &str) -> AffectState {
        let key = key_for(self.scope, context_id);
        if let Some(state) = self.rx.borrow().get(key) {
            return *state;
        }
        let now = Utc::now();
        AffectState::at(self.baseline.at(&now), now)
    }

    pub fn tracked_contexts(&self) -> usize {
        self.rx.borrow().len()
    }

    pub fn watch(&self) -> AffectWatch {
        self.rx.clone()
    }
}

fn key_for(scope: AffectScope, context_id: &str) -> &str {
    match scope {
        AffectScope::PerContext => context_id,
        AffectScope::Global => GLOBAL_CONTEXT,
    }
}

#[derive(Debug)]
struct Stimulus {
    context_id: ContextId,
    delta: PadVector,
    reason: String,
}

const GRUDGE_PLEASURE: f32 = -0.5;
const GRUDGE_DOMINANCE: f32 = 0.5;
/// Share of a positive pleasure delta that gets through a grudge.
const GRUDGE_DAMPENING: f32 = 0.3;
const GRUDGE_RELEASE_PLEASURE: f32 = 0.2;
/// States this close to the baseline on every axis are dropped from the book.
const SETTLED_EPSILON: f32 = 1e-3;

/// Relax `state` toward `baseline` for the time elapsed since its last
/// update. Returns whether any axis moved.
fn decay(state: &mut AffectState, baseline: PadVector, half_life_secs: f32, now: DateTime<Utc>) -> bool {
    let elapsed = (now - state.updated_at).num_milliseconds();
    if elapsed <= 0 {
        return false;
    }
    let retain = 0.5f32.powf(elapsed as f32 / 1000.0 / half_life_secs);
    let before = state.pad();
    state.relax_toward(baseline, retain, now);
    state.pad() != before
}

fn is_settled(state: &AffectState, baseline: PadVector) -> bool {
    let pad = state.pad();
    state.grudge_since.is_none()
        && (pad.pleasure - baseline.pleasure).abs() < SETTLED_EPSILON
        && (pad.arousal - baseline.arousal).abs() < SETTLED_EPSILON
        && (pad.dominance - baseline.dominance).abs() < SETTLED_EPSILON
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrudgeChange {
    Started,
    Released(&'static str),
}

/// Start a grudge when hurt and defensive; release it on an apology, once it
/// has been held for `release`, or when pleasure recovers.
fn settle_grudge(state: &mut AffectState, reason: &str, release: TimeDelta, now: DateTime<Utc>) -> Option<GrudgeChange> {
    let mut change = None;
    if state.grudge_since.is_none() && state.pleasure < GRUDGE_PLEASURE && state.dominance > GRUDGE_DOMINANCE {
        state.grudge_since = Some(now);
        change = Some(GrudgeChange::Started);
    }
    let since = state.grudge_since?;

    let why = if is_apology(reason) {
        "apology"
    } else if now - since > release {
        "grudge lapsed"
    } else if state.pleasure > GRUDGE_RELEASE_PLEASURE {
        "mood improved"
    } else {
        return change;
    };
    state.grudge_since = None;
    Some(GrudgeChange::Released(why))
}

/// Emotion actor: owns every `AffectState` and exposes them through a watch
/// channel. Stimuli arrive from the bus; decay runs on a timer.
pub struct EmotionEngine {
    states: AffectBook,
    scope: AffectScope,
    baseline: Baseline,
    half_life: Duration,
    max_delta: f32,
    grudge_release: TimeDelta,
    tx: watch::Sender<AffectBook>,
    bus: EventBus,
    store: Option<Arc<dyn AffectStore>>,
    dirty: HashSet<ContextId>,
    evicted: HashSet<ContextId>,
}

impl EmotionEngine {
    pub fn new(cfg: &GhostCfg, bus: EventBus) -> (Self, AffectView) {
        let baseline = Baseline {
            defaults: PadVector::new(cfg.default_pleasure, cfg.default_arousal, cfg.default_dominance),
            amplitude: cfg.circadian_amplitude,
            curve: CircadianCurve::new(cfg.active_hour, cfg.quiet_hour),
        };
        let (tx, rx) = watch::channel(AffectBook::new());
        let engine = Self {
            states: AffectBook::new(),
            scope: cfg.affect_scope,
            baseline,
            half_life: Duration::from_secs(cfg.decay_half_life_secs.max(1)),
            max_delta: cfg.max_interaction_delta,
            grudge_release: i64::try_from(cfg.grudge_release_secs)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .unwrap_or(TimeDelta::MAX),
            tx,
            bus,
            store: None,
            dirty: HashSet::new(),
            evicted: HashSet::new(),
        };
        let view = AffectView { rx, scope: cfg.affect_scope, baseline };
        (engine, view)
    }

    /// Restore from `store` at startup and write changes back to it.
    pub fn with_store(mut self, store: Arc<dyn AffectStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn broadcast(&self) {
        self.tx.send_replace(self.states.clone());
    }

    fn publish(&self, context_id: &str, state: AffectState, reason: &str) {
        self.bus.publish(Event::AffectChanged {
            context_id: context_id.to_string(),
            state,
            reason: reason.to_string(),
        });
    }

    /// Apply a bounded interaction delta. A context seen for the first time
    /// starts at the current baseline; a known one first decays for the time
    /// since its last update.
    pub fn apply(&mut self, context_id: &str, delta: PadVector, reason: &str, now: DateTime<Utc>) -> AffectState {
        let mut delta = delta.bounded(self.max_delta);
        let key = key_for(self.scope, context_id).to_string();
        let baseline = self.baseline.at(&now);
        let half_life = self.half_life.as_secs_f32();
        let release = self.grudge_release;

        let state = self
            .states
            .entry(key.clone())
            .or_insert_with(|| AffectState::at(baseline, now));
        decay(state, baseline, half_life, now);
        if state.holds_grudge() && delta.pleasure > 0.0 {
            delta.pleasure *= GRUDGE_DAMPENING;
        }
        state.shift(delta, now);
        let grudge = settle_grudge(state, reason, release, now);
        let snapshot = *state;

        match grudge {
            Some(GrudgeChange::Started) => tracing::warn!(
                context = %key,
                pleasure = snapshot.pleasure,
                dominance = snapshot.dominance,
                trigger = reason,
                "grudge started"
            ),
            Some(GrudgeChange::Released(why)) => tracing::info!(context = %key, why, "grudge released"),
            None => {}
        }
        tracing::debug!(
            context = %key,
            pleasure = snapshot.pleasure,
            arousal = snapshot.arousal,
            dominance = snapshot.dominance,
            reason,
            "affect stimulus applied"
        );
        self.evicted.remove(&key);
        self.dirty.insert(key.clone());
        self.broadcast();
        self.publish(&key, snapshot, reason);
        snapshot
    }

    /// Exponential decay of every state toward the baseline at `now`. Lapsed
    /// grudges are released and states back at the baseline are forgotten.
    /// Returns the number of states that moved.
    pub fn tick(&mut self, now: DateTime<Utc>) -> usize {
        let baseline = self.baseline.at(&now);
        let half_life = self.half_life.as_secs_f32();
        let mut moved = Vec::new();

        for (key, state) in self.states.iter_mut() {
            let mut changed = decay(state, baseline, half_life, now);
            if let Some(since) = state.grudge_since
                && now - since > self.grudge_release
            {
                state.grudge_since = None;
                changed = true;
                tracing::info!(context = %key, why = "grudge lapsed", "grudge released");
            }
            if changed {
                moved.push((key.clone(), *state));
            }
        }

        let settled: Vec<ContextId> = self
            .states
            .iter()
            .filter(|(_, s)| is_settled(s, baseline))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &settled {
            self.states.remove(key);
            self.dirty.remove(key);
        }
        if !settled.is_empty() {
            tracing::debug!(contexts = settled.len(), "settled affect states forgotten");
        }

        if !moved.is_empty() || !settled.is_empty() {
            self.broadcast();
        }
        for (key, state) in &moved {
            if self.states.contains_key(key) {
                self.dirty.insert(key.clone());
            }
            self.publish(key, *state, "decay");
        }
        self.evicted.extend(settled);
        moved.len()
    }

    pub fn current(&self, context_id: &str) -> Option<AffectState> {
        self.states.get(key_for(self.scope, context_id)).copied()
    }

    /// Adopt saved states. Entries already tracked are kept.
    pub fn restore(&mut self, saved: AffectBook) {
        for (key, state) in saved {
            self.states.entry(key).or_insert(state);
        }
        self.broadcast();
    }

    async fn load_saved(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        match store.load().await {
            Ok(saved) => {
                tracing::info!(contexts = saved.len(), "affect restored");
                self.restore(saved);
            }
            Err(e) => tracing::warn!(error = %e, "affect store unreadable, starting from baseline"),
        }
    }

    /// Write changed states and drop forgotten ones. Failed writes are retried
    /// on the next flush.
    async fn flush(&mut self) {
        let Some(store) = self.store.clone() else {
            self.dirty.clear();
            self.evicted.clear();
            return;
        };

        for key in std::mem::take(&mut self.evicted) {
            if let Err(e) = store.remove(&key).await {
                tracing::warn!(context = %key, error = %e, "failed to drop saved affect");
                self.evicted.insert(key);
            }
        }
        for key in std::mem::take(&mut self.dirty) {
            let Some(state) = self.states.get(&key).copied() else {
                continue;
            };
            if let Err(e) = store.save(&key, &state).await {
                tracing::warn!(context = %key, error = %e, "failed to save affect");
                self.dirty.insert(key);
            }
        }
    }

    /// Subscribe to `AffectStimulus`, restore saved states, then run decay
    /// every `tick`. Changes are saved after each tick and on shutdown.
    pub fn spawn(mut self, tick: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel::<Stimulus>();
        self.bus.subscribe_fn(EventTag::AffectStimulus, move |event| {
            let inbox = inbox_tx.clone();
            async move {
                if let Event::AffectStimulus { context_id, delta, reason } = event {
                    inbox
                        .send(Stimulus { context_id, delta, reason })
                        .map_err(|_| anyhow::anyhow!("emotion engine stopped"))?;
                }
                Ok(())
            }
        });

        tokio::spawn(async move {
            self.load_saved().await;

            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("emotion engine shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick(Utc::now());
                        self.flush().await;
                    }
                    stimulus = inbox_rx.recv() => match stimulus {
                        Some(s) => {
                            self.apply(&s.context_id, s.delta, &s.reason, Utc::now());
                        }
                        None => break,
                    },
                }
            }
            self.flush().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::persist::InMemoryAffectStore;
    use chrono::Duration as ChronoDuration;

    fn cfg(scope: AffectScope) -> GhostCfg {
        GhostCfg {
            affect_scope: scope,
            circadian_amplitude: 0.0,
            decay_half_life_secs: 60,
            max_interaction_delta: 0.25,
            ..GhostCfg::default()
        }
    }

    fn engine(scope: AffectScope) -> (EmotionEngine, AffectView) {
        EmotionEngine::new(&cfg(scope), EventBus::new(CancellationToken::new()))
    }

    /// Drive pleasure below -0.5 and dominance above 0.5 from the default baseline.
    fn provoke(e: &mut EmotionEngine, at: DateTime<Utc>) -> AffectState {
        let mut s = e.apply("c1", PadVector::ZERO, "test", at);
        for _ in 0..5 {
            s = e.apply("c1", PadVector::new(-0.25, 0.0, 0.05), "insult", at);
        }
        s
    }

    #[tokio::test]
    async fn new_context_starts_at_baseline() {
        let (mut e, view) = engine(AffectScope::PerContext);
        let s = e.apply("c1", PadVector::ZERO, "test", Utc::now());
        assert!((s.pleasure - 0.6).abs() < 1e-6);
        assert!((s.arousal - 0.7).abs() < 1e-6);
        assert_eq!(view.snapshot("c1"), s);
        assert_eq!(view.tracked_contexts(), 1);
    }

    #[tokio::test]
    async fn deltas_are_bounded_then_clamped() {
        let (mut e, _) = engine(AffectScope::PerContext);
        let s = e.apply("c1", PadVector::new(5.0, -5.0, 0.1), "test", Utc::now());
        assert!((s.pleasure - 0.85).abs() < 1e-6);
        assert!((s.arousal - 0.45).abs() < 1e-6);
        assert!((s.dominance - 0.6).abs() < 1e-6);

        for _ in 0..10 {
            e.apply("c1", PadVector::new(1.0, 1.0, 1.0), "test", Utc::now());
        }
        let s = e.current("c1").unwrap();
        assert_eq!((s.pleasure, s.arousal, s.dominance), (1.0, 1.0, 1.0));
    }

    #[tokio::test]
    async fn decay_halves_distance_per_half_life() {
        let (mut e, _) = engine(AffectScope::PerContext);
        let t0 = Utc::now();
        e.apply("c1", PadVector::new(-0.25, 0.0, 0.0), "test", t0);
        // distance from baseline 0.6 is 0.25
        assert_eq!(e.tick(t0 + ChronoDuration::seconds(60)), 1);
        let s = e.current("c1").unwrap();
        assert!((s.pleasure - (0.6 - 0.125)).abs() < 1e-4);
    }

    #[tokio::test]
    async fn stimulus_between_ticks_keeps_elapsed_decay() {
        let (mut e, _) = engine(AffectScope::PerContext);
        let t0 = Utc::now();
        e.apply("c1", PadVector::new(-0.25, 0.0, 0.0), "test", t0);
        e.apply("c1", PadVector::new(0.0, 0.0, 0.01), "test", t0 + ChronoDuration::seconds(55));
        e.tick(t0 + ChronoDuration::seconds(60));
        // one half-life in total, whatever arrived in between
        let s = e.current("c1").unwrap();
        assert!((s.pleasure - 0.475).abs() < 1e-3, "{s:?}");
    }

    #[tokio::test]
    async fn stimulus_after_long_silence_starts_near_baseline() {
        let (mut e, _) = engine(AffectScope::PerContext);
        let t0 = Utc::now();
        e.apply("c1", PadVector::new(-0.25, 0.0, 0.0), "test", t0);
        let s = e.apply("c1", PadVector::new(0.1, 0.0, 0.0), "test", t0 + ChronoDuration::hours(2));
        assert!((s.pleasure - 0.7).abs() < 1e-3, "{s:?}");
    }

    #[tokio::test]
    async fn decay_never_overshoots_baseline() {
        let (mut e, view) = engine(AffectScope::PerContext);
        let t0 = Utc::now();
        e.apply("c1", PadVector::new(0.25, -0.25, 0.25), "test", t0);
        let mut prev = e.current("c1").unwrap();
        for i in 1..50 {
            e.tick(t0 + ChronoDuration::seconds(i * 30));
            let s = view.snapshot("c1");
            assert!(s.pleasure <= prev.pleasure && s.pleasure >= 0.6);
            assert!(s.arousal >= prev.arousal && s.arousal <= 0.7);
            prev = s;
        }
    }

    #[tokio::test]
    async fn settled_states_are_forgotten() {
        let (mut e, view) = engine(AffectScope::PerContext);
        let t0 = Utc::now();
        e.apply("c1", PadVector::new(0.2, 0.0, 0.0), "test", t0);
        e.apply("c2", PadVector::new(0.2, 0.0, 0.0), "test", t0 + ChronoDuration::minutes(20));
        e.tick(t0 + ChronoDuration::minutes(20));

        assert!(e.current("c1").is_none());
        assert!(e.current("c2").is_some());
        assert_eq!(view.tracked_contexts(), 1);
        assert!((view.snapshot("c1").pleasure - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn grudge_dampens_positive_pleasure() {
        let (mut e, _) = engine(AffectScope::PerContext);
        let t0 = Utc::now();
        let s = provoke(&mut e, t0);
        assert_eq!(s.grudge_since, Some(t0));
        assert!(s.describe().contains("grudge"));

        let s = e.apply("c1", PadVector::new(0.2, 0.0, 0.0), "message sentiment", t0);
        assert!((s.pleasure - (-0.65 + 0.06)).abs() < 1e-4, "{s:?}");
        assert!(s.holds_grudge());

        // Negative deltas are not dampened.
        let s = e.apply("c1", PadVector::new(-0.1, 0.0, 0.0), "message sentiment", t0);
        assert!((s.pleasure - (-0.69)).abs() < 1e-4, "{s:?}");
    }

    #[tokio::test]
    async fn apology_releases_grudge() {
        let (mut e, _) = engine(AffectScope::PerContext);
        let t0 = Utc::now();
        provoke(&mut e, t0);
        let s = e.apply("c1", PadVector::ZERO, "apology", t0);
        assert!(!s.holds_grudge());

        let s = e.apply("c1", PadVector::new(0.2, 0.0, 0.0), "message sentiment", t0);
        assert!((s.pleasure - (-0.45)).abs() < 1e-4, "{s:?}");
    }

    #[tokio::test]
    async fn grudge_lapses_after_release_time() {
        let cfg = GhostCfg { grudge_release_secs: 10, ..cfg(AffectScope::PerContext) };
        let (mut e, _) = EmotionEngine::new(&cfg, EventBus::new(CancellationToken::new()));
        let t0 = Utc::now();
        provoke(&mut e, t0);

        e.tick(t0 + ChronoDuration::seconds(5));
        assert!(e.current("c1").unwrap().holds_grudge());
        e.tick(t0 + ChronoDuration::seconds(11));
        let s = e.current("c1").unwrap();
        assert!(!s.holds_grudge());
        assert!(s.pleasure < 0.0);
    }

    #[tokio::test]
    async fn saved_states_are_restored_and_written_back() {
        let token = CancellationToken::new();
        let bus = EventBus::new(token.clone());
        let now = Utc::now();
        let saved = AffectState::at(PadVector::new(-0.3, 0.1, 0.2), now);
        let store = Arc::new(InMemoryAffectStore::with_states(AffectBook::from([("old".to_string(), saved)])));

        let (e, view) = EmotionEngine::new(&cfg(AffectScope::PerContext), bus.clone());
        let mut watch = view.watch();
        let task = e.with_store(store.clone()).spawn(Duration::from_secs(3600), token.clone());

        tokio::time::timeout(Duration::from_secs(5), watch.wait_for(|b| b.contains_key("old")))
            .await
            .expect("state not restored")
            .unwrap();
        assert!((view.snapshot("old").pleasure + 0.3).abs() < 1e-6);

        bus.publish(Event::AffectStimulus {
            context_id: "new".into(),
            delta: PadVector::new(-0.2, 0.0, 0.0),
            reason: "message sentiment".into(),
        });
        tokio::time::timeout(Duration::from_secs(5), watch.wait_for(|b| b.contains_key("new")))
            .await
            .expect("stimulus not applied")
            .unwrap();

        token.cancel();
        task.await.unwrap();
        let written = store.get("new").expect("state not saved on shutdown");
        assert!((written.pleasure - 0.4).abs() < 1e-6);
        assert!(store.get("old").is_some());
    }

    #[tokio::test]
    async fn unreadable_store_starts_from_baseline() {
        let token = CancellationToken::new();
        let store = Arc::new(InMemoryAffectStore::new());
        store.set_available(false);
        let (e, view) = EmotionEngine::new(&cfg(AffectScope::PerContext), EventBus::new(token.clone()));
        let task = e.with_store(store).spawn(Duration::from_secs(3600), token.clone());
        token.cancel();
        task.await.unwrap();
        assert_eq!(view.tracked_contexts(), 0);
    }

    #[tokio::test]
    async fn contexts_are_isolated_per_context() {
        let (mut e, view) = engine(AffectScope::PerContext);
        e.apply("a", PadVector::new(-0.2, 0.0, 0.0), "test", Utc::now());
        e.apply("b", PadVector::new(0.2, 0.0, 0.0), "test", Utc::now());
        assert!(view.snapshot("a").pleasure < view.snapshot("b").pleasure);
    }

    #[tokio::test]
    async fn global_scope_shares_one_state() {
        let (mut e, view) = engine(AffectScope::Global);
        e.apply("a", PadVector::new(-0.2, 0.0, 0.0), "test", Utc::now());
        e.apply("b", PadVector::new(-0.2, 0.0, 0.0), "test", Utc::now());
        assert!((view.snapshot("zzz").pleasure - 0.2).abs() < 1e-6);
        assert_eq!(view.tracked_contexts(), 1);
    }

    #[tokio::test]
    async fn stays_in_range_under_arbitrary_deltas() {
        let (mut e, _) = engine(AffectScope::PerContext);
        let mut seed: u32 = 0x9e37_79b9;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed as f32 / u32::MAX as f32) * 4.0 - 2.0
        };
        let t0 = Utc::now();
        for i in 0..500 {
            let at = t0 + ChronoDuration::seconds(i);
            let s = e.apply("c1", PadVector::new(next(), next(), next()), "fuzz", at);
            assert!(s.is_in_range(), "{s:?}");
            if i % 7 == 0 {
                e.tick(at + ChronoDuration::milliseconds(500));
            }
        }
    }

    #[tokio::test]
    async fn stimulus_events_drive_the_actor() {
        let token = CancellationToken::new();
        let bus = EventBus::new(token.clone());
        let (e, view) = EmotionEngine::new(&GhostCfg::default(), bus.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe_fn(EventTag::AffectChanged, move |event| {
            let tx = tx.clone();
            async move {
                tx.send(event)?;
                Ok(())
            }
        });
        e.spawn(Duration::from_secs(3600), token.clone());

        bus.publish(Event::AffectStimulus {
            context_id: "c1".into(),
            delta: PadVector::new(0.1, 0.0, 0.0),
            reason: "message".into(),
        });
        match rx.recv().await.unwrap() {
            Event::AffectChanged { context_id, reason, .. } => {
                assert_eq!(context_id, "c1");
                assert_eq!(reason, "message");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(view.tracked_contexts(), 1);
        token.cancel();
    }
}
