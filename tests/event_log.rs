use serde_json::json;
use std::sync::{Arc, Barrier};
use std::thread;

use branchloom::event_log::{EventLog, EventType, LogError};
use branchloom::types::SubjectId;

fn subject(name: &str) -> SubjectId {
    SubjectId::from(name)
}

#[test]
fn racing_appends_resolve_to_exactly_one_winner() {
    let log = Arc::new(EventLog::new());
    let (branch, root) = log.create_branch("shared");
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let log = log.clone();
            let barrier = barrier.clone();
            let expected = Some(root.id);
            thread::spawn(move || {
                barrier.wait();
                log.append(
                    branch,
                    expected,
                    EventType::SubjectUpdated,
                    subject("doc"),
                    json!({ "writer": i }),
                )
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("appender thread panicked"))
        .collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one racing append must win");

    let winner_id = results
        .iter()
        .find_map(|r| r.as_ref().ok())
        .map(|e| e.id)
        .unwrap();
    let conflict = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    match conflict {
        LogError::HeadConflict { current_head, .. } => {
            assert_eq!(*current_head, Some(winner_id));
        }
        other => panic!("expected HeadConflict, got {other:?}"),
    }

    // The loser retries against the refreshed head and lands behind the
    // winner; nothing is lost or reordered.
    let retried = log
        .append(
            branch,
            Some(winner_id),
            EventType::SubjectUpdated,
            subject("doc"),
            json!({ "writer": "retry" }),
        )
        .unwrap();
    let chain: Vec<_> = log
        .events_for_branch(branch)
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(chain, vec![root.id, winner_id, retried.id]);
}

#[test]
fn fork_shares_history_without_copying_or_disturbing_the_source() {
    let log = EventLog::new();
    let (main, root) = log.create_branch("main");
    let e1 = log
        .append_next(main, EventType::SubjectUpdated, subject("doc"), json!({"a": 1}))
        .unwrap();
    let e2 = log
        .append_next(main, EventType::SubjectUpdated, subject("doc"), json!({"b": 2}))
        .unwrap();
    let e3 = log
        .append_next(main, EventType::SubjectUpdated, subject("doc"), json!({"c": 3}))
        .unwrap();

    // Fork from the middle of history.
    let alt = log.fork(main, e2.id, "alt").unwrap();
    assert_eq!(log.head(alt).unwrap(), Some(e2.id));

    let alt_e = log
        .append_next(alt, EventType::SubjectUpdated, subject("doc"), json!({"d": 4}))
        .unwrap();

    // The source branch is untouched, including events after the fork point.
    let main_chain: Vec<_> = log
        .events_for_branch(main)
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(main_chain, vec![root.id, e1.id, e2.id, e3.id]);

    // The fork sees the shared prefix plus its own divergence; e3 is not
    // part of its visible history.
    let alt_chain: Vec<_> = log
        .events_for_branch(alt)
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(alt_chain, vec![root.id, e1.id, e2.id, alt_e.id]);

    let diff = log.compare(main, alt).unwrap();
    assert_eq!(diff.common_ancestor, Some(e2.id));
    assert_eq!(diff.only_in_a.iter().map(|e| e.id).collect::<Vec<_>>(), vec![e3.id]);
    assert_eq!(diff.only_in_b.iter().map(|e| e.id).collect::<Vec<_>>(), vec![alt_e.id]);
}

#[test]
fn events_carry_parent_linkage_not_timestamps_for_order() {
    let log = EventLog::new();
    let (branch, root) = log.create_branch("main");
    let e1 = log
        .append_next(branch, EventType::SubjectUpdated, subject("doc"), json!({}))
        .unwrap();
    assert_eq!(e1.parent_event_id, Some(root.id));
    assert_eq!(root.parent_event_id, None);

    let fetched = log.event(e1.id).unwrap();
    assert_eq!(fetched, e1);
}
