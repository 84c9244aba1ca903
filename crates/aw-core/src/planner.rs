//! Wave planning over a task dependency graph.
//!
//! Tasks are loaded into an index-based arena ordered by creation time, so
//! every traversal (cycle search, frontier construction) is deterministic.
//! Cycle detection and impact validation are preconditions: a cyclic graph,
//! or one where two unordered tasks declare impossible impacts on a path, is
//! never partially scheduled.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::conflict::{ConflictDetector, ConflictError};
use crate::types::{Task, Wave};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("dependency cycle: {}", members.join(" -> "))]
    Cycle { members: Vec<String>, ids: Vec<Uuid> },
    #[error("task {task} depends on {dependency}, which is neither planned nor satisfied")]
    UnknownDependency { task: String, dependency: Uuid },
    #[error("tasks {left} and {right} declare incompatible impacts: {source}")]
    InvalidImpacts {
        left: String,
        right: String,
        #[source]
        source: ConflictError,
    },
}

pub type Result<T> = std::result::Result<T, PlanError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Arena of tasks plus their dependency edges as indices.
struct Graph<'a> {
    nodes: Vec<&'a Task>,
    deps: Vec<Vec<usize>>,
}

impl<'a> Graph<'a> {
    fn build(tasks: &'a [Task], satisfied: &HashSet<Uuid>) -> Result<Self> {
        let mut nodes: Vec<&Task> = tasks.iter().collect();
        nodes.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.display_id.cmp(&b.display_id))
        });

        let index: HashMap<Uuid, usize> =
            nodes.iter().enumerate().map(|(i, t)| (t.id, i)).collect();

        let mut deps = Vec::with_capacity(nodes.len());
        for task in &nodes {
            let mut edges = Vec::new();
            for dep in &task.depends_on {
                match index.get(dep) {
                    Some(&i) => edges.push(i),
                    None if satisfied.contains(dep) => {}
                    None => {
                        return Err(PlanError::UnknownDependency {
                            task: task.display_id.clone(),
                            dependency: *dep,
                        })
                    }
                }
            }
            deps.push(edges);
        }
        Ok(Self { nodes, deps })
    }

    /// For every node, the nodes it transitively depends on.
    fn ancestors(&self) -> Vec<HashSet<usize>> {
        (0..self.nodes.len())
            .map(|start| {
                let mut seen = HashSet::new();
                let mut stack = self.deps[start].clone();
                while let Some(node) = stack.pop() {
                    if seen.insert(node) {
                        stack.extend(&self.deps[node]);
                    }
                }
                seen
            })
            .collect()
    }

    /// Depth-first search with visited/in-progress marking. Returns the
    /// members of the first cycle found, listed from its entry point.
    fn find_cycle(&self) -> Option<Vec<usize>> {
        let n = self.nodes.len();
        let mut mark = vec![Mark::Unvisited; n];

        for root in 0..n {
            if mark[root] != Mark::Unvisited {
                continue;
            }
            mark[root] = Mark::InProgress;
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                if frame.1 < self.deps[node].len() {
                    let child = self.deps[node][frame.1];
                    frame.1 += 1;
                    match mark[child] {
                        Mark::Unvisited => {
                            mark[child] = Mark::InProgress;
                            stack.push((child, 0));
                        }
                        Mark::InProgress => {
                            let start = stack.iter().position(|(n, _)| *n == child).unwrap_or(0);
                            return Some(stack[start..].iter().map(|(n, _)| *n).collect());
                        }
                        Mark::Done => {}
                    }
                } else {
                    mark[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct WavePlanner {
    detector: ConflictDetector,
}

impl WavePlanner {
    pub fn new(detector: ConflictDetector) -> Self {
        Self { detector }
    }

    /// Plan `tasks` into ordered waves numbered from zero.
    ///
    /// `satisfied` holds ids of tasks outside `tasks` that dependents may
    /// treat as done (completed or skipped before planning).
    pub fn plan(&self, tasks: &[Task], satisfied: &HashSet<Uuid>) -> Result<Vec<Wave>> {
        self.plan_from(tasks, satisfied, 0)
    }

    /// Keep `frozen` waves untouched and plan `tasks` that are not in them
    /// into new waves numbered after the last frozen wave.
    pub fn replan(
        &self,
        frozen: &[Wave],
        tasks: &[Task],
        satisfied: &HashSet<Uuid>,
    ) -> Result<Vec<Wave>> {
        let mut placed: HashSet<Uuid> = satisfied.clone();
        for wave in frozen {
            placed.extend(wave.task_ids.iter().copied());
        }
        let pending: Vec<Task> = tasks
            .iter()
            .filter(|t| !frozen.iter().any(|w| w.contains(&t.id)))
            .cloned()
            .collect();

        let first = frozen.iter().map(|w| w.number + 1).max().unwrap_or(0);
        let mut waves: Vec<Wave> = frozen.to_vec();
        waves.extend(self.plan_from(&pending, &placed, first)?);
        Ok(waves)
    }

    fn plan_from(
        &self,
        tasks: &[Task],
        satisfied: &HashSet<Uuid>,
        first: u32,
    ) -> Result<Vec<Wave>> {
        let graph = Graph::build(tasks, satisfied)?;

        if let Some(cycle) = graph.find_cycle() {
            let members = cycle
                .iter()
                .map(|&i| graph.nodes[i].display_id.clone())
                .collect();
            let ids = cycle.iter().map(|&i| graph.nodes[i].id).collect();
            return Err(PlanError::Cycle { members, ids });
        }
        self.validate_pairs(&graph)?;

        let n = graph.nodes.len();
        let mut wave_of: Vec<Option<u32>> = vec![None; n];
        let mut remaining = n;
        let mut waves = Vec::new();
        let mut number = first;

        while remaining > 0 {
            let mut frontier: Vec<usize> = (0..n)
                .filter(|&i| {
                    wave_of[i].is_none() && graph.deps[i].iter().all(|&d| wave_of[d].is_some())
                })
                .collect();
            // Arena order is creation order; a stable sort keeps it as the
            // tie-break under priority.
            frontier.sort_by_key(|&i| Reverse(graph.nodes[i].priority));

            let mut placed: Vec<usize> = Vec::new();
            for candidate in frontier {
                let mut fits = true;
                for &other in &placed {
                    let a = graph.nodes[candidate];
                    let b = graph.nodes[other];
                    let reason = self.detector.tasks_conflict(a, b).map_err(|source| {
                        PlanError::InvalidImpacts {
                            left: a.display_id.clone(),
                            right: b.display_id.clone(),
                            source,
                        }
                    })?;
                    if let Some(reason) = reason {
                        tracing::debug!(
                            task = %a.display_id,
                            blocker = %b.display_id,
                            path = %reason.path,
                            wave = number,
                            "conflict; deferring to a later wave"
                        );
                        fits = false;
                        break;
                    }
                }
                if fits {
                    placed.push(candidate);
                }
            }

            for &i in &placed {
                wave_of[i] = Some(number);
            }
            remaining -= placed.len();
            waves.push(Wave::new(
                number,
                placed.iter().map(|&i| graph.nodes[i].id).collect(),
            ));
            number += 1;
        }

        tracing::debug!(tasks = n, waves = waves.len(), "planned waves");
        Ok(waves)
    }

    /// Check every pair of tasks that no dependency orders. Any of them may
    /// share a wave, so whether a bad pair is caught must not depend on how
    /// the frontier happens to be scanned.
    fn validate_pairs(&self, graph: &Graph<'_>) -> Result<()> {
        let ancestors = graph.ancestors();
        let n = graph.nodes.len();
        for i in 0..n {
            for j in (i + 1)..n {
                if ancestors[i].contains(&j) || ancestors[j].contains(&i) {
                    continue;
                }
                let (a, b) = (graph.nodes[i], graph.nodes[j]);
                self.detector
                    .check_compatible(a, b)
                    .map_err(|source| PlanError::InvalidImpacts {
                        left: a.display_id.clone(),
                        right: b.display_id.clone(),
                        source,
                    })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileOperation;
    use chrono::Duration;

    fn task(list: Uuid, name: &str, order: i64) -> Task {
        let mut t = Task::new(list, name, name);
        t.created_at = t.created_at + Duration::milliseconds(order);
        t
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let list = Uuid::new_v4();
        let mut a = task(list, "A", 0);
        a.depends_on.insert(a.id);
        let err = WavePlanner::default()
            .plan(&[a], &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, PlanError::Cycle { ref members, .. } if members == &["A"]));
    }

    #[test]
    fn satisfied_external_dependency_is_ignored() {
        let list = Uuid::new_v4();
        let done = Uuid::new_v4();
        let a = task(list, "A", 0).with_dependency(done);
        let satisfied: HashSet<Uuid> = [done].into_iter().collect();
        let waves = WavePlanner::default().plan(&[a.clone()], &satisfied).unwrap();
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].task_ids, vec![a.id]);
    }

    #[test]
    fn invalid_pair_in_same_frontier_is_rejected() {
        let list = Uuid::new_v4();
        let a = task(list, "A", 0).with_impact("x.ts", FileOperation::Create);
        let b = task(list, "B", 1).with_impact("x.ts", FileOperation::Update);
        let err = WavePlanner::default()
            .plan(&[a, b], &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, PlanError::InvalidImpacts { .. }));
    }

    #[test]
    fn invalid_pair_is_caught_whichever_way_the_frontier_runs() {
        let list = Uuid::new_v4();
        // B outranks A and shares a path with it, so A is pushed to a later
        // wave before it is ever compared with C.
        let a = task(list, "A", 0)
            .with_impact("x.ts", FileOperation::Create)
            .with_impact("shared.ts", FileOperation::Update);
        let b = task(list, "B", 1)
            .with_impact("shared.ts", FileOperation::Update)
            .with_priority(5);
        let c = task(list, "C", 2)
            .with_impact("shared.ts", FileOperation::Read)
            .with_impact("x.ts", FileOperation::Update);

        let planner = WavePlanner::default();
        for order in [
            vec![a.clone(), b.clone(), c.clone()],
            vec![c.clone(), b.clone(), a.clone()],
            vec![b.clone(), c.clone(), a.clone()],
        ] {
            let err = planner.plan(&order, &HashSet::new()).unwrap_err();
            assert!(
                matches!(err, PlanError::InvalidImpacts { ref left, ref right, .. }
                    if left == "A" && right == "C"),
                "unexpected {err:?}"
            );
        }
    }

    #[test]
    fn create_then_update_across_waves_is_fine() {
        let list = Uuid::new_v4();
        let a = task(list, "A", 0).with_impact("x.ts", FileOperation::Create);
        let b = task(list, "B", 1)
            .with_impact("x.ts", FileOperation::Update)
            .with_dependency(a.id);
        let waves = WavePlanner::default()
            .plan(&[a.clone(), b.clone()], &HashSet::new())
            .unwrap();
        assert_eq!(waves[0].task_ids, vec![a.id]);
        assert_eq!(waves[1].task_ids, vec![b.id]);
    }
}
