//! End-to-end tests: the whole runtime on one bus, driven through the
//! transport helpers, with a mock backend and the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use ghost_core::bus::{Event, EventTag};
use ghost_core::config::GhostCfg;
use ghost_core::emotion::InMemoryAffectStore;
use ghost_core::io::{self as transport, OutputKind, OutputMessage, OutputReceiver};
use ghost_core::memory::{HashEmbedder, InMemoryStore};
use ghost_core::monitor::ScriptedMonitor;
use ghost_core::runtime::{Runtime, Services};
use ghost_core::types::{CryostasisPhase, ResourceSample};
use ghost_llm::MockBackend;
use tokio::sync::mpsc;

struct Harness {
    rt: Runtime,
    mock: Arc<MockBackend>,
    store: Arc<InMemoryStore>,
    output: OutputReceiver,
}

fn harness(cfg: GhostCfg, mock: MockBackend) -> Harness {
    harness_with(cfg, mock, |services| services)
}

fn harness_with(cfg: GhostCfg, mock: MockBackend, customize: impl FnOnce(Services) -> Services) -> Harness {
    let mock = Arc::new(mock);
    let store = Arc::new(InMemoryStore::new());
    let services = customize(Services::new(mock.clone(), store.clone(), Arc::new(HashEmbedder)));
    let mut rt = Runtime::new(Arc::new(cfg), services);
    rt.start();
    let (output, _sub) = transport::attach(rt.bus(), 64);
    Harness { rt, mock, store, output }
}

/// Collect every event of `tag` into a channel.
fn tap(rt: &Runtime, tag: EventTag) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    rt.bus().subscribe_fn(tag, move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
            Ok(())
        }
    });
    rx
}

async fn next_final(output: &mut OutputReceiver) -> OutputMessage {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(30), output.recv())
            .await
            .expect("no response in time")
            .expect("output closed");
        if msg.is_final() {
            return msg;
        }
    }
}

/// Every output up to and including the next final one.
async fn next_turn(output: &mut OutputReceiver) -> Vec<OutputKind> {
    let mut kinds = Vec::new();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(30), output.recv())
            .await
            .expect("no response in time")
            .expect("output closed");
        kinds.push(msg.kind);
        if msg.is_final() {
            return kinds;
        }
    }
}

async fn wait_for_records(store: &InMemoryStore, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("records not persisted");
}

/// Two high samples with debounce 1: Resident -> Cooling -> unload.
async fn unload_model(h: &Harness) {
    let mut cryo = h.rt.cryostasis();
    h.rt.bus().publish(Event::ResourceSampled(high()));
    h.rt.bus().publish(Event::ResourceSampled(high()));
    tokio::time::timeout(
        Duration::from_secs(30),
        cryo.wait_for(|s| s.phase == CryostasisPhase::Unloaded && s.operation_in_flight.is_none()),
    )
    .await
    .expect("model never unloaded")
    .unwrap();
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}

fn high() -> ResourceSample {
    ResourceSample::new(95.0, 0.0)
}

fn low() -> ResourceSample {
    ResourceSample::new(5.0, 0.0)
}

#[tokio::test]
async fn replies_within_a_context_keep_arrival_order() {
    let mut h = harness(GhostCfg::default(), MockBackend::echo().with_completion_delay(Duration::from_millis(5)));

    let ids: Vec<_> = (0..5)
        .map(|i| transport::submit(h.rt.bus(), "room", "kai", format!("message {i}")))
        .collect();

    for (i, id) in ids.iter().enumerate() {
        let msg = next_final(&mut h.output).await;
        assert_eq!(msg.kind, OutputKind::Reply);
        assert_eq!(msg.in_reply_to, Some(*id));
        assert_eq!(msg.content, format!("echo: message {i}"));
    }
    assert_eq!(h.mock.completion_calls(), 5);
    h.rt.stop().await;
}

#[tokio::test(start_paused = true)]
async fn contexts_are_served_concurrently() {
    let mut h = harness(GhostCfg::default(), MockBackend::echo().with_completion_delay(Duration::from_millis(200)));

    let started = tokio::time::Instant::now();
    transport::submit(h.rt.bus(), "a", "kai", "hi from a");
    transport::submit(h.rt.bus(), "b", "mika", "hi from b");

    let mut contexts = vec![
        next_final(&mut h.output).await.context_id,
        next_final(&mut h.output).await.context_id,
    ];
    contexts.sort();
    assert_eq!(contexts, vec!["a", "b"]);
    assert!(started.elapsed() < Duration::from_millis(400), "turns ran back to back");
    h.rt.stop().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_produce_one_fallback() {
    let mut h = harness(GhostCfg::default(), MockBackend::new("recovered").failing_first(2));
    let mut failures = tap(&h.rt, EventTag::InferenceFailed);

    let id = transport::submit(h.rt.bus(), "room", "kai", "are you there?");
    let msg = next_final(&mut h.output).await;
    assert_eq!(msg.kind, OutputKind::Fallback);
    assert_eq!(msg.in_reply_to, Some(id));
    assert_eq!(msg.content, GhostCfg::default().fallback_message);
    assert_eq!(h.mock.completion_calls(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = drain(&mut failures);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], Event::InferenceFailed { attempts: 2, .. }));

    // The next turn goes through normally.
    transport::submit(h.rt.bus(), "room", "kai", "how about now?");
    let msg = next_final(&mut h.output).await;
    assert_eq!(msg.kind, OutputKind::Reply);
    assert_eq!(msg.content, "recovered");
    h.rt.stop().await;
}

#[tokio::test]
async fn store_outage_does_not_block_replies() {
    let mut h = harness(GhostCfg::default(), MockBackend::echo());
    h.store.set_available(false);

    transport::submit(h.rt.bus(), "room", "kai", "remember my cat?");
    let msg = next_final(&mut h.output).await;
    assert_eq!(msg.kind, OutputKind::Reply);
    assert_eq!(msg.content, "echo: remember my cat?");

    let request = h.mock.last_request().unwrap();
    assert!(!request.messages[0].content.contains("Things you remember"));
    h.rt.stop().await;
}

#[tokio::test]
async fn completed_turns_reach_long_term_memory() {
    let mut h = harness(GhostCfg::default(), MockBackend::echo());

    transport::submit(h.rt.bus(), "room", "kai", "my cat is called miso");
    next_final(&mut h.output).await;

    wait_for_records(&h.store, 2).await;

    let mut speakers: Vec<_> = h.store.records().into_iter().map(|r| r.speaker).collect();
    speakers.sort();
    assert_eq!(speakers, vec!["Korone", "kai"]);
    h.rt.stop().await;
}

#[tokio::test]
async fn message_sentiment_moves_affect() {
    let cfg = GhostCfg { circadian_amplitude: 0.0, ..GhostCfg::default() };
    let mut h = harness(cfg, MockBackend::echo());
    let mut changes = tap(&h.rt, EventTag::AffectChanged);
    let before = h.rt.affect().snapshot("room");

    transport::submit(h.rt.bus(), "room", "kai", "thanks, I love this");
    next_final(&mut h.output).await;

    let event = tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("no affect change")
        .unwrap();
    assert!(matches!(event, Event::AffectChanged { ref context_id, .. } if context_id == "room"));
    let after = h.rt.affect().snapshot("room");
    assert!(after.pleasure > before.pleasure);
    assert!(after.is_in_range());
    h.rt.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unloaded_model_is_reloaded_on_demand() {
    let cfg = GhostCfg {
        high_debounce: 1,
        low_debounce: 1,
        reload_grace_ms: 100,
        reload_timeout_ms: 10_000,
        ..GhostCfg::default()
    };
    let mut h = harness(cfg, MockBackend::echo().with_lifecycle_delay(Duration::from_millis(500)));
    let mut cryo = h.rt.cryostasis();

    h.rt.bus().publish(Event::ResourceSampled(high()));
    h.rt.bus().publish(Event::ResourceSampled(high()));
    tokio::time::timeout(
        Duration::from_secs(5),
        cryo.wait_for(|s| s.phase == CryostasisPhase::Unloaded && s.operation_in_flight.is_none()),
    )
    .await
    .expect("model never unloaded")
    .unwrap();
    assert_eq!(h.mock.unload_calls(), 1);

    transport::submit(h.rt.bus(), "room", "kai", "wake up");
    let thinking = tokio::time::timeout(Duration::from_secs(5), h.output.recv())
        .await
        .expect("no thinking signal")
        .unwrap();
    assert_eq!(thinking.kind, OutputKind::Thinking);
    assert_eq!(thinking.content, GhostCfg::default().thinking_message);

    let reply = next_final(&mut h.output).await;
    assert_eq!(reply.kind, OutputKind::Reply);
    assert_eq!(reply.content, "echo: wake up");
    assert_eq!(h.mock.load_calls(), 1);
    assert_eq!(h.rt.cryostasis().borrow().phase, CryostasisPhase::Resident);
    h.rt.stop().await;
}

#[tokio::test(start_paused = true)]
async fn lifecycle_operations_never_overlap() {
    let cfg = GhostCfg { high_debounce: 1, low_debounce: 1, ..GhostCfg::default() };
    let mut h = harness(cfg, MockBackend::new("ok").with_lifecycle_delay(Duration::from_millis(40)));

    for i in 0..40 {
        let event = match i % 4 {
            0 | 1 => Event::ResourceSampled(high()),
            2 => Event::ReloadRequested { context_id: None },
            _ => Event::ResourceSampled(low()),
        };
        h.rt.bus().publish(event);
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(h.mock.unload_calls() + h.mock.load_calls() > 0);
    assert_eq!(h.mock.max_concurrent_lifecycle(), 1);
    h.rt.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_monitor_reads_keep_the_streak() {
    let cfg = GhostCfg { high_debounce: 2, sample_interval_ms: 10, ..GhostCfg::default() };
    let mock = Arc::new(MockBackend::new("ok"));
    let monitor = ScriptedMonitor::new(vec![Ok(high()), Err("nvidia-smi hiccup".into()), Ok(high())]);
    let services = Services::new(mock, Arc::new(InMemoryStore::new()), Arc::new(HashEmbedder))
        .with_monitor(Box::new(monitor));
    let mut rt = Runtime::new(Arc::new(cfg), services);
    let mut transitions = tap(&rt, EventTag::CryostasisTransitioned);
    rt.start();

    let mut cryo = rt.cryostasis();
    tokio::time::timeout(Duration::from_secs(5), cryo.wait_for(|s| s.phase == CryostasisPhase::Cooling))
        .await
        .expect("never cooled")
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = drain(&mut transitions);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        Event::CryostasisTransitioned { from: CryostasisPhase::Resident, to: CryostasisPhase::Cooling, .. }
    ));
    rt.stop().await;
}

#[tokio::test]
async fn health_reflects_wiring() {
    let mut h = harness(GhostCfg::default(), MockBackend::echo());
    let report = h.rt.health().await;
    assert!(report.inference_available);
    assert_eq!(report.cryostasis.phase, CryostasisPhase::Resident);
    let inbound = report
        .subscribers
        .iter()
        .find(|(tag, _)| *tag == EventTag::InboundMessage)
        .map(|(_, n)| *n);
    assert_eq!(inbound, Some(1));
    h.rt.stop().await;
}

#[tokio::test(start_paused = true)]
async fn timed_out_turn_still_remembers_the_message() {
    let cfg = GhostCfg { turn_timeout_ms: 1000, ..GhostCfg::default() };
    let mut h = harness(cfg, MockBackend::echo().with_completion_delay(Duration::from_secs(5)));

    let id = transport::submit(h.rt.bus(), "room", "kai", "are you still there?");
    let msg = next_final(&mut h.output).await;
    assert_eq!(msg.kind, OutputKind::Fallback);
    assert_eq!(msg.in_reply_to, Some(id));

    wait_for_records(&h.store, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].speaker, "kai");
    assert_eq!(records[0].text, "are you still there?");
    h.rt.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reload_that_outlasts_the_timeout_falls_back_once() {
    let cfg = GhostCfg {
        high_debounce: 1,
        low_debounce: 1,
        reload_grace_ms: 100,
        reload_timeout_ms: 1000,
        ..GhostCfg::default()
    };
    let mut h = harness(cfg, MockBackend::echo().with_lifecycle_delay(Duration::from_secs(5)));
    let mut failures = tap(&h.rt, EventTag::InferenceFailed);
    unload_model(&h).await;

    transport::submit(h.rt.bus(), "room", "kai", "hello?");
    assert_eq!(next_turn(&mut h.output).await, vec![OutputKind::Thinking, OutputKind::Fallback]);
    assert_eq!(h.mock.completion_calls(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.output.try_recv().is_err(), "extra output after the fallback");
    let events = drain(&mut failures);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], Event::InferenceFailed { attempts: 0, .. }));

    // The load keeps going and the next turn is served normally.
    let mut cryo = h.rt.cryostasis();
    tokio::time::timeout(Duration::from_secs(30), cryo.wait_for(|s| s.phase == CryostasisPhase::Resident))
        .await
        .expect("model never loaded")
        .unwrap();
    transport::submit(h.rt.bus(), "room", "kai", "now?");
    assert_eq!(next_turn(&mut h.output).await, vec![OutputKind::Reply]);
    assert_eq!(h.mock.load_calls(), 1);
    h.rt.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_reload_is_retried_by_the_next_turn() {
    let cfg = GhostCfg {
        high_debounce: 1,
        low_debounce: 1,
        reload_grace_ms: 100,
        reload_timeout_ms: 1000,
        ..GhostCfg::default()
    };
    let mut h = harness(cfg, MockBackend::echo().with_lifecycle_delay(Duration::from_millis(200)));
    unload_model(&h).await;
    h.mock.fail_next_loads(1);

    transport::submit(h.rt.bus(), "room", "kai", "wake up");
    assert_eq!(next_turn(&mut h.output).await, vec![OutputKind::Thinking, OutputKind::Fallback]);
    assert_eq!(h.mock.load_calls(), 1);
    assert_eq!(h.rt.cryostasis().borrow().phase, CryostasisPhase::Unloaded);

    transport::submit(h.rt.bus(), "room", "kai", "try again");
    assert_eq!(next_turn(&mut h.output).await, vec![OutputKind::Thinking, OutputKind::Reply]);
    assert_eq!(h.mock.load_calls(), 2);
    assert_eq!(h.mock.last_request().unwrap().messages.last().unwrap().content, "try again");
    h.rt.stop().await;
}

#[tokio::test(start_paused = true)]
async fn idle_workers_are_reaped_and_resume_from_memory() {
    let cfg = GhostCfg { worker_idle_secs: 1, ..GhostCfg::default() };
    let mut h = harness(cfg, MockBackend::echo());

    transport::submit(h.rt.bus(), "room", "kai", "my cat is called miso");
    next_final(&mut h.output).await;
    wait_for_records(&h.store, 2).await;
    assert_eq!(h.rt.health().await.context_workers, 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.rt.health().await.context_workers, 0);

    transport::submit(h.rt.bus(), "room", "kai", "what is my cat called?");
    let reply = next_final(&mut h.output).await;
    assert_eq!(reply.kind, OutputKind::Reply);
    assert_eq!(h.rt.health().await.context_workers, 1);

    let request = h.mock.last_request().unwrap();
    let history = &request.messages[1..request.messages.len() - 1];
    assert!(
        history.iter().any(|m| m.content == "my cat is called miso"),
        "earlier message missing from the new worker's context: {history:?}"
    );
    h.rt.stop().await;
}

#[tokio::test]
async fn affect_survives_a_restart() {
    let cfg = GhostCfg { circadian_amplitude: 0.0, ..GhostCfg::default() };
    let affect_store = Arc::new(InMemoryAffectStore::new());

    let store = affect_store.clone();
    let mut h = harness_with(cfg.clone(), MockBackend::echo(), move |s| s.with_affect_store(store));
    let mut changes = tap(&h.rt, EventTag::AffectChanged);
    transport::submit(h.rt.bus(), "room", "kai", "thanks, I love this");
    next_final(&mut h.output).await;
    tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("no affect change")
        .unwrap();
    let before = h.rt.affect().snapshot("room");
    h.rt.stop().await;

    let saved = affect_store.get("room").expect("affect not saved on shutdown");
    assert_eq!(saved.pleasure, before.pleasure);

    let store = affect_store.clone();
    let mut h = harness_with(cfg, MockBackend::echo(), move |s| s.with_affect_store(store));
    let mut watch = h.rt.affect().watch();
    tokio::time::timeout(Duration::from_secs(5), watch.wait_for(|book| book.contains_key("room")))
        .await
        .expect("affect not restored")
        .unwrap();
    let restored = h.rt.affect().snapshot("room");
    assert!(restored.pleasure > GhostCfg::default().default_pleasure);
    h.rt.stop().await;
}

#[tokio::test]
async fn apology_releases_a_grudge_through_the_pipeline() {
    let cfg = GhostCfg {
        circadian_amplitude: 0.0,
        default_pleasure: 0.0,
        max_interaction_delta: 1.0,
        ..GhostCfg::default()
    };
    let mut h = harness(cfg, MockBackend::echo());
    let mut changes = tap(&h.rt, EventTag::AffectChanged);

    h.rt.bus().publish(Event::AffectStimulus {
        context_id: "room".into(),
        delta: ghost_core::types::PadVector::new(-1.0, 0.0, 0.3),
        reason: "insult".into(),
    });
    let event = tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("no affect change")
        .unwrap();
    assert!(matches!(event, Event::AffectChanged { state, .. } if state.holds_grudge()));

    transport::submit(h.rt.bus(), "room", "kai", "sorry, I didn't mean that");
    next_final(&mut h.output).await;
    let event = tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("no affect change")
        .unwrap();
    assert!(matches!(event, Event::AffectChanged { ref reason, state, .. } if reason == "apology" && !state.holds_grudge()));

    // Later prompts no longer describe a grudge.
    transport::submit(h.rt.bus(), "room", "kai", "hi again");
    next_final(&mut h.output).await;
    let system = h.mock.last_request().unwrap().messages[0].content.clone();
    assert!(!system.contains("grudge"));
    h.rt.stop().await;
}
