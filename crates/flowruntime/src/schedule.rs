use crate::context::ExecutionContext;
use crate::resolver::DependencyResolver;
use flowcore::{NodeId, SkipReason};
use std::collections::{HashMap, HashSet};

/// Copy of the status sets needed to plan the next step of one execution
#[derive(Debug, Default, Clone)]
pub(crate) struct SchedulingView {
    pub queued: HashSet<NodeId>,
    pub running: HashSet<NodeId>,
    pub completed: HashSet<NodeId>,
    pub failed: HashSet<NodeId>,
    pub skipped: HashMap<NodeId, SkipReason>,
    /// Output ports that produced items, per completed node
    pub fired_ports: HashMap<NodeId, HashSet<String>>,
}

impl SchedulingView {
    pub fn from_context(ctx: &ExecutionContext) -> Self {
        let fired_ports = ctx
            .completed_nodes()
            .iter()
            .filter_map(|id| ctx.node_result(id).map(|r| (id.clone(), r.fired_ports())))
            .collect();
        Self {
            queued: ctx.queued_nodes().clone(),
            running: ctx.running_nodes().clone(),
            completed: ctx.completed_nodes().clone(),
            failed: ctx.failed_nodes().clone(),
            skipped: ctx.skipped_nodes().clone(),
            fired_ports,
        }
    }

    fn is_idle(&self, id: &str) -> bool {
        !self.queued.contains(id)
            && !self.running.contains(id)
            && !self.completed.contains(id)
            && !self.failed.contains(id)
            && !self.skipped.contains_key(id)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct StepPlan {
    pub ready: Vec<NodeId>,
    pub skipped: Vec<(NodeId, SkipReason)>,
}

/// Decide which idle nodes become queued and which can never run.
///
/// Runs to a fixpoint because every skip may settle further joins. The
/// resolver's graph must be the execution scope, so joins only wait for
/// dependencies that belong to this execution. `start` is seeded by the
/// caller and never planned here.
pub(crate) fn plan_step(
    resolver: &DependencyResolver<'_>,
    start: &str,
    view: &SchedulingView,
) -> StepPlan {
    let graph = resolver.graph();
    let mut skipped = view.skipped.clone();
    let mut ready: HashSet<NodeId> = HashSet::new();
    let mut plan = StepPlan::default();

    loop {
        let mut changed = false;

        let idle: Vec<NodeId> = graph
            .nodes()
            .iter()
            .map(|n| n.id.clone())
            .filter(|id| id != start)
            .filter(|id| view.is_idle(id) && !skipped.contains_key(id) && !ready.contains(id))
            .collect();

        for id in &idle {
            let blocked = resolver.get_dependencies(id).iter().any(|dep| {
                view.failed.contains(dep)
                    || skipped
                        .get(dep)
                        .map(|reason| !reason.satisfies_dependents())
                        .unwrap_or(false)
            });
            if blocked {
                skipped.insert(id.clone(), SkipReason::UpstreamFailed);
                plan.skipped.push((id.clone(), SkipReason::UpstreamFailed));
                changed = true;
            }
        }
        if changed {
            continue;
        }

        let satisfied: HashSet<NodeId> = view
            .completed
            .iter()
            .cloned()
            .chain(
                skipped
                    .iter()
                    .filter(|(_, reason)| reason.satisfies_dependents())
                    .map(|(id, _)| id.clone()),
            )
            .collect();
        let candidates: HashSet<NodeId> = idle.iter().cloned().collect();
        let executable = resolver.get_executable_nodes(&candidates, &satisfied);

        for id in &idle {
            if executable.contains(id) {
                if activated(resolver, view, id) {
                    ready.insert(id.clone());
                    plan.ready.push(id.clone());
                } else {
                    skipped.insert(id.clone(), SkipReason::BranchNotTaken);
                    plan.skipped.push((id.clone(), SkipReason::BranchNotTaken));
                    changed = true;
                }
            } else if graph.is_disabled(id)
                && resolver
                    .get_dependencies(id)
                    .iter()
                    .all(|dep| satisfied.contains(dep))
            {
                skipped.insert(id.clone(), SkipReason::Disabled);
                plan.skipped.push((id.clone(), SkipReason::Disabled));
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    plan
}

/// At least one incoming connection comes from a completed node through a
/// port that produced items
fn activated(resolver: &DependencyResolver<'_>, view: &SchedulingView, id: &str) -> bool {
    resolver.graph().incoming(id).iter().any(|conn| {
        view.completed.contains(&conn.from_node)
            && view
                .fired_ports
                .get(&conn.from_node)
                .map(|ports| ports.contains(&conn.from_port))
                .unwrap_or(false)
    })
}
