use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;

use crate::types::{BranchId, EventId, SubjectId};

use super::errors::LogError;
use super::event::{Event, EventType};

/// Lightweight view of a branch for listing and diffing.
#[derive(Clone, Debug, PartialEq)]
pub struct BranchSummary {
    pub id: BranchId,
    pub name: String,
    pub head_event_id: Option<EventId>,
}

/// Result of comparing two branches.
///
/// `common_ancestor` is the newest event reachable from both heads;
/// `only_in_a` / `only_in_b` are the divergent suffixes in chronological
/// (oldest→newest) order.
#[derive(Clone, Debug)]
pub struct BranchDiff {
    pub common_ancestor: Option<EventId>,
    pub only_in_a: Vec<Event>,
    pub only_in_b: Vec<Event>,
}

struct BranchState {
    name: String,
    // Per-branch head serialization point. Unrelated branches never contend
    // on each other's head.
    head: Mutex<Option<EventId>>,
}

/// In-process append-only event log with a branch index.
///
/// Events live in one shared arena keyed by id; branches are head pointers
/// into it. Forking installs a new head at an existing event, so history is
/// structurally shared up to the fork point and diverges only through
/// subsequent appends. Nothing is ever mutated or deleted.
#[derive(Default)]
pub struct EventLog {
    events: RwLock<FxHashMap<EventId, Arc<Event>>>,
    branches: RwLock<FxHashMap<BranchId, Arc<BranchState>>>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh root branch and record its `BranchCreated` root event.
    ///
    /// Returns the new branch id and the root event.
    #[instrument(skip(self))]
    pub fn create_branch(&self, name: impl Into<String> + std::fmt::Debug) -> (BranchId, Event) {
        let name = name.into();
        let branch_id = BranchId::new();
        let state = Arc::new(BranchState {
            name: name.clone(),
            head: Mutex::new(None),
        });
        self.branches.write().insert(branch_id, state.clone());

        let event = Event::new(
            None,
            branch_id,
            EventType::BranchCreated,
            SubjectId::from(format!("branch:{branch_id}")),
            serde_json::json!({ "name": name }),
        );
        let mut head = state.head.lock();
        self.events.write().insert(event.id, Arc::new(event.clone()));
        *head = Some(event.id);
        (branch_id, event)
    }

    /// Append a new event to `branch` using optimistic concurrency.
    ///
    /// `expected_head` must equal the branch's current head. On success the
    /// new event's parent is the prior head and the head advances to the new
    /// event atomically. When two callers race, exactly one succeeds; the
    /// loser gets [`LogError::HeadConflict`] carrying the refreshed head and
    /// must retry with it as the expected parent.
    #[instrument(skip(self, payload), err)]
    pub fn append(
        &self,
        branch: BranchId,
        expected_head: Option<EventId>,
        event_type: EventType,
        subject_id: SubjectId,
        payload: Value,
    ) -> Result<Event, LogError> {
        let state = self.branch_state(branch)?;
        let mut head = state.head.lock();
        if *head != expected_head {
            return Err(LogError::HeadConflict {
                branch,
                expected: expected_head,
                current_head: *head,
            });
        }
        let event = Event::new(*head, branch, event_type, subject_id, payload);
        self.events.write().insert(event.id, Arc::new(event.clone()));
        *head = Some(event.id);
        Ok(event)
    }

    /// Append chaining off whatever the current head is.
    ///
    /// Serializes on the branch head lock, so it cannot conflict. Used by
    /// the executor, which owns its run's branch exclusively; external
    /// callers extending shared branches should use [`append`](Self::append)
    /// and handle conflicts.
    pub fn append_next(
        &self,
        branch: BranchId,
        event_type: EventType,
        subject_id: SubjectId,
        payload: Value,
    ) -> Result<Event, LogError> {
        let state = self.branch_state(branch)?;
        let mut head = state.head.lock();
        let event = Event::new(*head, branch, event_type, subject_id, payload);
        self.events.write().insert(event.id, Arc::new(event.clone()));
        *head = Some(event.id);
        Ok(event)
    }

    /// Fork a new branch whose head is `checkout_event`.
    ///
    /// O(1): no event history is copied, only a new head pointer installed.
    /// The checkout event must be reachable from the source branch's current
    /// head by walking parent links; events strictly after it on the source
    /// branch are excluded from the new branch's visible history.
    #[instrument(skip(self), err)]
    pub fn fork(
        &self,
        source: BranchId,
        checkout_event: EventId,
        name: impl Into<String> + std::fmt::Debug,
    ) -> Result<BranchId, LogError> {
        let source_head = self.head(source)?;
        if !self.is_reachable(source_head, checkout_event)? {
            return Err(LogError::UnknownCheckoutEvent {
                event: checkout_event,
                branch: source,
            });
        }
        let branch_id = BranchId::new();
        self.branches.write().insert(
            branch_id,
            Arc::new(BranchState {
                name: name.into(),
                head: Mutex::new(Some(checkout_event)),
            }),
        );
        Ok(branch_id)
    }

    /// Current head of a branch (`None` only before any append on a branch
    /// created without a root event).
    pub fn head(&self, branch: BranchId) -> Result<Option<EventId>, LogError> {
        Ok(*self.branch_state(branch)?.head.lock())
    }

    /// Fetch a single event by id.
    pub fn event(&self, id: EventId) -> Result<Event, LogError> {
        self.events
            .read()
            .get(&id)
            .map(|e| (**e).clone())
            .ok_or(LogError::UnknownEvent { event: id })
    }

    /// Full chain of a branch in chronological (root→head) order.
    pub fn events_for_branch(&self, branch: BranchId) -> Result<Vec<Event>, LogError> {
        let head = self.head(branch)?;
        let mut chain = self.walk_to_root(head)?;
        chain.reverse();
        Ok(chain.into_iter().map(|e| (*e).clone()).collect())
    }

    /// Compare two branches: common ancestor plus each side's divergent
    /// suffix in chronological order.
    pub fn compare(&self, a: BranchId, b: BranchId) -> Result<BranchDiff, LogError> {
        let chain_a = self.walk_to_root(self.head(a)?)?;
        let ancestors_a: FxHashSet<EventId> = chain_a.iter().map(|e| e.id).collect();

        let mut only_in_b = Vec::new();
        let mut common_ancestor = None;
        let mut cursor = self.head(b)?;
        while let Some(id) = cursor {
            if ancestors_a.contains(&id) {
                common_ancestor = Some(id);
                break;
            }
            let event = self.parent_checked(id)?;
            cursor = event.parent_event_id;
            only_in_b.push((*event).clone());
        }
        only_in_b.reverse();

        let mut only_in_a: Vec<Event> = chain_a
            .into_iter()
            .take_while(|e| Some(e.id) != common_ancestor)
            .map(|e| (*e).clone())
            .collect();
        only_in_a.reverse();

        Ok(BranchDiff {
            common_ancestor,
            only_in_a,
            only_in_b,
        })
    }

    pub fn list_branches(&self) -> Vec<BranchSummary> {
        let mut out: Vec<BranchSummary> = self
            .branches
            .read()
            .iter()
            .map(|(id, state)| BranchSummary {
                id: *id,
                name: state.name.clone(),
                head_event_id: *state.head.lock(),
            })
            .collect();
        out.sort_by(|x, y| x.name.cmp(&y.name).then(x.id.cmp(&y.id)));
        out
    }

    pub fn branch_exists(&self, branch: BranchId) -> bool {
        self.branches.read().contains_key(&branch)
    }

    /// Walk head→root collecting `Arc<Event>`s (newest first).
    pub(crate) fn walk_to_root(&self, head: Option<EventId>) -> Result<Vec<Arc<Event>>, LogError> {
        let mut out = Vec::new();
        let mut cursor = head;
        while let Some(id) = cursor {
            let event = self.parent_checked(id)?;
            cursor = event.parent_event_id;
            out.push(event);
        }
        Ok(out)
    }

    fn branch_state(&self, branch: BranchId) -> Result<Arc<BranchState>, LogError> {
        self.branches
            .read()
            .get(&branch)
            .cloned()
            .ok_or(LogError::UnknownBranch { branch })
    }

    /// Look up an event, verifying its parent link is intact.
    fn parent_checked(&self, id: EventId) -> Result<Arc<Event>, LogError> {
        let events = self.events.read();
        let event = events
            .get(&id)
            .cloned()
            .ok_or(LogError::UnknownEvent { event: id })?;
        if let Some(parent) = event.parent_event_id
            && !events.contains_key(&parent)
        {
            return Err(LogError::ConsistencyViolation {
                event: id,
                missing_parent: parent,
            });
        }
        Ok(event)
    }

    fn is_reachable(&self, head: Option<EventId>, target: EventId) -> Result<bool, LogError> {
        let mut cursor = head;
        while let Some(id) = cursor {
            if id == target {
                return Ok(true);
            }
            cursor = self.parent_checked(id)?.parent_event_id;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subject() -> SubjectId {
        SubjectId::from("s1")
    }

    #[test]
    fn append_chains_off_prior_head() {
        let log = EventLog::new();
        let (branch, root) = log.create_branch("main");
        let e1 = log
            .append(
                branch,
                Some(root.id),
                EventType::SubjectUpdated,
                subject(),
                json!({"k": 1}),
            )
            .unwrap();
        assert_eq!(e1.parent_event_id, Some(root.id));
        assert_eq!(log.head(branch).unwrap(), Some(e1.id));
    }

    #[test]
    fn stale_head_is_rejected() {
        let log = EventLog::new();
        let (branch, root) = log.create_branch("main");
        let e1 = log
            .append(
                branch,
                Some(root.id),
                EventType::SubjectUpdated,
                subject(),
                json!({}),
            )
            .unwrap();
        let err = log
            .append(
                branch,
                Some(root.id),
                EventType::SubjectUpdated,
                subject(),
                json!({}),
            )
            .unwrap_err();
        match err {
            LogError::HeadConflict { current_head, .. } => {
                assert_eq!(current_head, Some(e1.id));
            }
            other => panic!("expected HeadConflict, got {other:?}"),
        }
    }

    #[test]
    fn fork_requires_reachable_checkout() {
        let log = EventLog::new();
        let (main, _) = log.create_branch("main");
        let (other, other_root) = log.create_branch("other");
        let err = log.fork(main, other_root.id, "alt").unwrap_err();
        assert!(matches!(err, LogError::UnknownCheckoutEvent { .. }));
        assert!(log.fork(other, other_root.id, "alt").is_ok());
    }

    #[test]
    fn compare_finds_fork_point() {
        let log = EventLog::new();
        let (main, root) = log.create_branch("main");
        let e1 = log
            .append_next(main, EventType::SubjectUpdated, subject(), json!({"a": 1}))
            .unwrap();
        let alt = log.fork(main, e1.id, "alt").unwrap();
        let e2 = log
            .append_next(main, EventType::SubjectUpdated, subject(), json!({"b": 2}))
            .unwrap();
        let e3 = log
            .append_next(alt, EventType::SubjectUpdated, subject(), json!({"c": 3}))
            .unwrap();

        let diff = log.compare(main, alt).unwrap();
        assert_eq!(diff.common_ancestor, Some(e1.id));
        assert_eq!(
            diff.only_in_a.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![e2.id]
        );
        assert_eq!(
            diff.only_in_b.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![e3.id]
        );
        let _ = root;
    }
}
