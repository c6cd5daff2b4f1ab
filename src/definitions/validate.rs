//! Definition validation and compilation.
//!
//! Validation runs once when a definition is saved, never at run time: a
//! cyclic or malformed graph is rejected before any run exists. The output
//! is a [`CompiledDefinition`] carrying the topological order and indexed
//! edges, so the executor's advance path does table lookups only.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::types::StepId;

use super::{Definition, Edge, LogicKind, Step, StepKind};

/// Rejections produced at definition-save time. All are recoverable by the
/// caller fixing the definition; no run is ever created from an invalid one.
#[derive(Debug, Error, Diagnostic)]
pub enum ValidationError {
    #[error("definition has no steps")]
    #[diagnostic(code(branchloom::definitions::empty))]
    EmptyDefinition,

    #[error("duplicate step id: {step}")]
    #[diagnostic(code(branchloom::definitions::duplicate_step))]
    DuplicateStepId { step: StepId },

    #[error("edge references unknown step: {missing}")]
    #[diagnostic(
        code(branchloom::definitions::unknown_endpoint),
        help("Every edge endpoint must name a step in the definition.")
    )]
    UnknownEdgeEndpoint { missing: StepId },

    #[error("step graph contains a cycle through: {remaining:?}")]
    #[diagnostic(
        code(branchloom::definitions::cyclic),
        help("Only loop steps may repeat work, and they bound it with max_iterations.")
    )]
    CyclicGraph { remaining: Vec<StepId> },

    #[error("loop step {step} has max_iterations = 0")]
    #[diagnostic(
        code(branchloom::definitions::unbounded_loop),
        help("A loop must carry a hard iteration ceiling of at least 1.")
    )]
    UnboundedLoop { step: StepId },

    #[error("loop step {step} has an empty body")]
    #[diagnostic(code(branchloom::definitions::empty_loop_body))]
    EmptyLoopBody { step: StepId },

    #[error("loop step {step} body references unknown step {member}")]
    #[diagnostic(code(branchloom::definitions::unknown_loop_member))]
    UnknownLoopMember { step: StepId, member: StepId },

    #[error("loop step {step} body contains human checkpoint {member}")]
    #[diagnostic(
        code(branchloom::definitions::human_in_loop),
        help("Human checkpoints suspend the run and cannot sit inside a bounded loop body.")
    )]
    HumanStepInLoop { step: StepId, member: StepId },

    #[error("loop step {step} body contains routing step {member}")]
    #[diagnostic(
        code(branchloom::definitions::routing_in_loop),
        help(
            "Loop bodies run as a flat sequence; if_else and nested loop steps \
             belong on the mainline. merge_outputs is allowed."
        )
    )]
    RoutingStepInLoop { step: StepId, member: StepId },

    #[error("if_else step {step} routes must match its two outgoing edges (got {actual:?})")]
    #[diagnostic(
        code(branchloom::definitions::bad_routes),
        help("An if_else step needs exactly two outgoing edges, one to each route.")
    )]
    InvalidRoutes { step: StepId, actual: Vec<StepId> },
}

/// A validated definition plus everything the executor needs precomputed:
/// topological order (loop bodies excluded from the mainline), incoming
/// edges per step, and a step index.
#[derive(Clone, Debug)]
pub struct CompiledDefinition {
    pub definition: Definition,
    /// Mainline execution order. Loop body members are excluded; they run
    /// only inside their loop's handler.
    pub order: Vec<StepId>,
    incoming: FxHashMap<StepId, Vec<Edge>>,
    steps_by_id: FxHashMap<StepId, usize>,
    /// Loop body member → its owning loop step.
    loop_owner: FxHashMap<StepId, StepId>,
}

impl CompiledDefinition {
    /// Validate `definition` and compile it. This is the only constructor;
    /// holding a `CompiledDefinition` is proof the graph is well-formed.
    pub fn compile(definition: Definition) -> Result<Self, ValidationError> {
        if definition.steps.is_empty() {
            return Err(ValidationError::EmptyDefinition);
        }

        let mut steps_by_id: FxHashMap<StepId, usize> = FxHashMap::default();
        for (idx, step) in definition.steps.iter().enumerate() {
            if steps_by_id.insert(step.id.clone(), idx).is_some() {
                return Err(ValidationError::DuplicateStepId {
                    step: step.id.clone(),
                });
            }
        }

        for edge in &definition.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !steps_by_id.contains_key(endpoint) {
                    return Err(ValidationError::UnknownEdgeEndpoint {
                        missing: endpoint.clone(),
                    });
                }
            }
        }

        let loop_owner = validate_step_kinds(&definition, &steps_by_id)?;
        let order = topological_order(&definition, &loop_owner)?;

        let mut incoming: FxHashMap<StepId, Vec<Edge>> = FxHashMap::default();
        for edge in &definition.edges {
            incoming.entry(edge.to.clone()).or_default().push(edge.clone());
        }

        Ok(Self {
            definition,
            order,
            incoming,
            steps_by_id,
            loop_owner,
        })
    }

    #[must_use]
    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps_by_id
            .get(id)
            .map(|idx| &self.definition.steps[*idx])
    }

    /// Incoming edges of a step (empty slice for entry steps).
    #[must_use]
    pub fn incoming(&self, id: &StepId) -> &[Edge] {
        self.incoming.get(id).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn is_loop_member(&self, id: &StepId) -> bool {
        self.loop_owner.contains_key(id)
    }
}

/// Per-kind structural checks; returns the loop ownership map
/// (body member → loop step).
fn validate_step_kinds(
    definition: &Definition,
    steps_by_id: &FxHashMap<StepId, usize>,
) -> Result<FxHashMap<StepId, StepId>, ValidationError> {
    let mut loop_owner: FxHashMap<StepId, StepId> = FxHashMap::default();
    for step in &definition.steps {
        match &step.kind {
            StepKind::Logic(LogicKind::Loop {
                body,
                max_iterations,
                ..
            }) => {
                if *max_iterations == 0 {
                    return Err(ValidationError::UnboundedLoop {
                        step: step.id.clone(),
                    });
                }
                if body.is_empty() {
                    return Err(ValidationError::EmptyLoopBody {
                        step: step.id.clone(),
                    });
                }
                for member in body {
                    let Some(idx) = steps_by_id.get(member) else {
                        return Err(ValidationError::UnknownLoopMember {
                            step: step.id.clone(),
                            member: member.clone(),
                        });
                    };
                    match &definition.steps[*idx].kind {
                        StepKind::Human { .. } => {
                            return Err(ValidationError::HumanStepInLoop {
                                step: step.id.clone(),
                                member: member.clone(),
                            });
                        }
                        StepKind::Logic(LogicKind::Loop { .. })
                        | StepKind::Logic(LogicKind::IfElse { .. }) => {
                            return Err(ValidationError::RoutingStepInLoop {
                                step: step.id.clone(),
                                member: member.clone(),
                            });
                        }
                        _ => {}
                    }
                    loop_owner.insert(member.clone(), step.id.clone());
                }
            }
            StepKind::Logic(LogicKind::IfElse {
                then_route,
                else_route,
                ..
            }) => {
                let mut outgoing: Vec<StepId> = definition
                    .edges
                    .iter()
                    .filter(|e| e.from == step.id)
                    .map(|e| e.to.clone())
                    .collect();
                outgoing.sort();
                let mut expected = vec![then_route.clone(), else_route.clone()];
                expected.sort();
                if outgoing != expected {
                    return Err(ValidationError::InvalidRoutes {
                        step: step.id.clone(),
                        actual: outgoing,
                    });
                }
            }
            _ => {}
        }
    }
    Ok(loop_owner)
}

/// Kahn's algorithm over the step graph. Deterministic: ties resolve in
/// definition order. Loop body members are excluded from the mainline.
///
/// Edges touching a body member are remapped to the owning loop step
/// before ordering: the member only ever runs inside its loop, so an edge
/// out of (or into) the body orders the loop itself on the mainline.
fn topological_order(
    definition: &Definition,
    loop_owner: &FxHashMap<StepId, StepId>,
) -> Result<Vec<StepId>, ValidationError> {
    let ids: Vec<&StepId> = definition.steps.iter().map(|s| &s.id).collect();

    let effective: Vec<(StepId, StepId)> = definition
        .edges
        .iter()
        .map(|edge| {
            let from = loop_owner.get(&edge.from).unwrap_or(&edge.from).clone();
            let to = loop_owner.get(&edge.to).unwrap_or(&edge.to).clone();
            (from, to)
        })
        .filter(|(from, to)| from != to)
        .collect();

    let mut indegree: FxHashMap<&StepId, usize> = ids.iter().map(|id| (*id, 0)).collect();
    for (_, to) in &effective {
        *indegree.get_mut(to).expect("validated endpoint") += 1;
    }

    let mut placed: FxHashSet<&StepId> = FxHashSet::default();
    let mut order = Vec::with_capacity(ids.len());
    while placed.len() < ids.len() {
        let Some(next) = ids
            .iter()
            .find(|id| !placed.contains(**id) && indegree[**id] == 0)
            .copied()
        else {
            let mut remaining: Vec<StepId> = ids
                .iter()
                .filter(|id| !placed.contains(**id))
                .map(|id| (*id).clone())
                .collect();
            remaining.sort();
            return Err(ValidationError::CyclicGraph { remaining });
        };
        placed.insert(next);
        for (_, to) in effective.iter().filter(|(from, _)| from == next) {
            *indegree.get_mut(to).expect("validated endpoint") -= 1;
        }
        if !loop_owner.contains_key(next) {
            order.push(next.clone());
        }
    }
    Ok(order)
}
