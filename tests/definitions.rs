use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

use branchloom::definitions::{Definition, Edge, Step, StepKind};
use branchloom::engine::Engine;
use branchloom::runs::EngineError;
use branchloom::types::DefinitionId;

mod common;
use common::*;

fn engine() -> Engine {
    Engine::builder(Arc::new(ScriptedGeneration::echo())).build()
}

#[test]
fn cyclic_definition_is_rejected_before_any_run_exists() {
    let engine = engine();
    let cyclic = Definition::builder("cyclic")
        .step(Step::new("a", StepKind::generate("a", "a_out")))
        .step(Step::new("b", StepKind::generate("b", "b_out")))
        .edge(Edge::new("a", "b"))
        .edge(Edge::new("b", "a"))
        .build();
    let err = engine.create_definition(cyclic).unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(engine.definitions().is_empty());
    assert!(engine.runs(None).unwrap().is_empty());
}

#[test]
fn update_keeps_the_original_id_and_revalidates() {
    let engine = engine();
    let created = engine.create_definition(review_definition()).unwrap();
    let id = created.definition.id;

    let replacement = Definition::builder("review-v2")
        .step(Step::new("draft", StepKind::generate("just draft", "draft")))
        .build();
    let updated = engine.update_definition(id, replacement).unwrap();
    assert_eq!(updated.definition.id, id);
    assert_eq!(updated.definition.name, "review-v2");
    assert_eq!(engine.definitions().len(), 1);

    let err = engine
        .update_definition(DefinitionId::new(), review_definition())
        .unwrap_err();
    assert!(matches!(err, EngineError::DefinitionNotFound { .. }));
}

#[test]
fn delete_removes_the_definition() {
    let engine = engine();
    let created = engine.create_definition(review_definition()).unwrap();
    let id = created.definition.id;
    assert!(engine.delete_definition(id));
    assert!(!engine.delete_definition(id));
    assert!(engine.definition(id).is_none());
}

#[tokio::test]
async fn deleting_a_definition_does_not_disturb_started_runs() {
    let entities = seeded_entities();
    let engine = engine_with(Arc::new(ScriptedGeneration::echo()), entities);
    let created = engine.create_definition(review_definition()).unwrap();
    let id = created.definition.id;

    let view = engine.start_run(id, payload(&[])).await.unwrap();
    assert!(engine.delete_definition(id));

    // The paused run holds its own compiled copy and finishes normally.
    let done = engine
        .resume_run(view.id, branchloom::runs::ResumePayload::empty())
        .await
        .unwrap();
    assert!(done.payload.get("draft").is_some());
}

/// Linear chains with arbitrary step names compile to exactly the chain
/// order, whatever the declaration order of edges.
fn step_names() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::vec("[a-z][a-z0-9_]{0,12}", 2..8).prop_map(|mut names| {
        names.sort();
        names.dedup();
        names
    })
}

proptest! {
    #[test]
    fn prop_forward_edges_always_respected(names in step_names(), seed in any::<u64>()) {
        prop_assume!(names.len() >= 2);

        // Deterministic pseudo-random forward edge selection: an edge i->j
        // (i < j) is present when the hash of (seed, i, j) is even.
        let mut def = Definition::builder("generated");
        for name in &names {
            def = def.step(Step::new(name.as_str(), StepKind::generate("x", "y")));
        }
        let mut edges = Vec::new();
        for i in 0..names.len() {
            for j in (i + 1)..names.len() {
                if (seed ^ ((i as u64) << 16) ^ (j as u64)).count_ones() % 2 == 0 {
                    edges.push((i, j));
                    def = def.edge(Edge::new(names[i].as_str(), names[j].as_str()));
                }
            }
        }
        let compiled = engine().create_definition(def.build()).unwrap();
        let pos = |name: &str| {
            compiled
                .order
                .iter()
                .position(|s| s.as_str() == name)
                .unwrap()
        };
        prop_assert_eq!(compiled.order.len(), names.len());
        for (i, j) in edges {
            prop_assert!(pos(&names[i]) < pos(&names[j]), "edge {}->{} violated", names[i], names[j]);
        }
    }
}

#[test]
fn definitions_round_trip_through_json() {
    let def = review_definition();
    let raw = serde_json::to_value(&def).unwrap();
    assert_eq!(raw["steps"][0]["kind"]["type"], json!("context"));
    let back: Definition = serde_json::from_value(raw).unwrap();
    assert_eq!(back.name, def.name);
    assert_eq!(back.steps.len(), def.steps.len());
}
