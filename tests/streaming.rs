use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use branchloom::config::EngineConfig;
use branchloom::engine::Engine;
use branchloom::runs::ResumePayload;
use branchloom::types::RunState;

mod common;
use common::*;

#[tokio::test]
async fn subscribers_see_every_transition_in_order() {
    let engine = engine_with(Arc::new(ScriptedGeneration::echo()), seeded_entities());
    let rx = engine.subscribe();
    let def = engine.create_definition(review_definition()).unwrap();

    let paused = engine
        .start_run(def.definition.id, payload(&[]))
        .await
        .unwrap();
    engine
        .resume_run(paused.id, ResumePayload::empty())
        .await
        .unwrap();

    let snapshots: Vec<_> = rx.drain().collect();
    assert!(!snapshots.is_empty());
    assert!(snapshots.iter().all(|v| v.id == paused.id));

    let states: Vec<RunState> = snapshots.iter().map(|v| v.state).collect();
    let pause_at = states
        .iter()
        .position(|s| *s == RunState::PausedForUser)
        .expect("pause must be streamed");
    assert_eq!(*states.last().unwrap(), RunState::Completed);
    assert!(pause_at < states.len() - 1);

    // Payload grows monotonically across the stream: the draft only appears
    // after the resume.
    let final_view = snapshots.last().unwrap();
    assert!(final_view.payload.get("draft").is_some());
    assert!(snapshots[pause_at].payload.get("draft").is_none());
}

#[tokio::test]
async fn dropped_subscribers_do_not_stall_the_engine() {
    let engine = engine_with(Arc::new(ScriptedGeneration::echo()), seeded_entities());
    let rx = engine.subscribe();
    drop(rx);

    let def = engine.create_definition(straight_definition()).unwrap();
    let view = engine
        .start_run(def.definition.id, payload(&[]))
        .await
        .unwrap();
    assert_eq!(view.state, RunState::Completed);
}

#[tokio::test]
async fn undrained_subscribers_never_stall_execution() {
    let engine = Engine::builder(Arc::new(ScriptedGeneration::echo()))
        .entities(seeded_entities())
        .config(EngineConfig::default().with_stream_buffer(1))
        .build();
    let def = engine.create_definition(straight_definition()).unwrap();

    // This subscriber holds its receiver but never drains it. Runs must not
    // block on its full buffer; the laggard is severed instead.
    let rx = engine.subscribe();

    let first = tokio::time::timeout(
        Duration::from_secs(2),
        engine.start_run(def.definition.id, payload(&[])),
    )
    .await
    .expect("run must not block on a stalled subscriber")
    .unwrap();
    assert_eq!(first.state, RunState::Completed);

    // Other runs stay independent of the stalled consumer.
    let second = tokio::time::timeout(
        Duration::from_secs(2),
        engine.start_run(def.definition.id, payload(&[])),
    )
    .await
    .expect("second run must not be coupled to the stalled subscriber")
    .unwrap();
    assert_eq!(second.state, RunState::Completed);

    // At most one snapshot ever sat in the undrained buffer.
    assert!(rx.len() <= 1);
}

#[tokio::test]
async fn failures_are_streamed_too() {
    let engine = engine_with(Arc::new(FailingGeneration), seeded_entities());
    let rx = engine.subscribe();
    let def = engine.create_definition(straight_definition()).unwrap();

    let view = engine
        .start_run(def.definition.id, payload(&[]))
        .await
        .unwrap();
    assert_eq!(view.state, RunState::Failed);

    let last = rx.drain().last().unwrap();
    assert_eq!(last.state, RunState::Failed);
    assert!(last.failure.as_ref().unwrap().contains("scripted failure"));
}

#[tokio::test]
async fn payload_edits_at_resume_are_visible_downstream_and_in_the_stream() {
    let engine = engine_with(Arc::new(ScriptedGeneration::echo()), seeded_entities());
    let def = engine.create_definition(review_definition()).unwrap();
    let paused = engine
        .start_run(def.definition.id, payload(&[]))
        .await
        .unwrap();

    // Subscribe mid-run: only transitions after this point are delivered.
    let rx = engine.subscribe();
    let done = engine
        .resume_run(
            paused.id,
            ResumePayload::empty().with_edit("audience", json!("execs")),
        )
        .await
        .unwrap();
    assert_eq!(done.payload["audience"], json!("execs"));

    let snapshots: Vec<_> = rx.drain().collect();
    assert!(
        snapshots
            .iter()
            .all(|v| v.payload["audience"] == json!("execs"))
    );
}
