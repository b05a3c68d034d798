//! Dependency graph construction, validation, and ordering.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::EngineError;
use crate::slot::{Registry, SlotId};
use crate::task::{TaskId, TaskNode};

/// Name used for external sources in producer conflicts.
const EXTERNAL_SOURCE: &str = "(external source)";

/// A producer-to-consumer dependency through one slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Edge {
    pub producer: usize,
    pub consumer: usize,
    pub slot: SlotId,
}

/// A validated, acyclic task graph. Task indices follow declaration order.
#[derive(Debug, Clone)]
pub struct BuildGraph {
    tasks: Vec<TaskNode>,
    index: BTreeMap<TaskId, usize>,
    edges: Vec<Edge>,
    producers: BTreeMap<SlotId, Vec<usize>>,
    supplied: BTreeSet<SlotId>,
    dependencies: Vec<BTreeSet<usize>>,
    dependents: Vec<BTreeSet<usize>>,
}

impl BuildGraph {
    pub fn tasks(&self) -> &[TaskNode] {
        &self.tasks
    }

    pub fn task(&self, index: usize) -> Option<&TaskNode> {
        self.tasks.get(index)
    }

    pub fn index_of(&self, id: &TaskId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// All edges, sorted by producer, consumer, then slot.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Tasks producing `slot`, in declaration order.
    pub fn producers_of(&self, slot: &SlotId) -> &[usize] {
        self.producers.get(slot).map_or(&[], Vec::as_slice)
    }

    /// Whether `slot` is supplied from outside the graph.
    pub fn is_supplied(&self, slot: &SlotId) -> bool {
        self.supplied.contains(slot)
    }

    pub fn supplied(&self) -> impl Iterator<Item = &SlotId> {
        self.supplied.iter()
    }

    /// Tasks that must finish before `index` can start.
    pub fn dependencies(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        self.dependencies.get(index).into_iter().flatten().copied()
    }

    /// Tasks waiting on `index`.
    pub fn dependents(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        self.dependents.get(index).into_iter().flatten().copied()
    }

    /// Task indices in dependency order.
    ///
    /// Among tasks whose dependencies are all satisfied, the one declared
    /// first comes first, so the order is deterministic.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .enumerate()
            .filter(|&(_, &count)| count == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for dependent in self.dependents(next) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
        order
    }

    /// Every task downstream of `index`, not including `index` itself.
    pub fn transitive_dependents(&self, index: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<usize> = self.dependents(index).collect();
        while let Some(next) = pending.pop() {
            if seen.insert(next) {
                pending.extend(self.dependents(next));
            }
        }
        seen
    }

    /// The subgraph holding `targets` and everything they transitively
    /// depend on.
    ///
    /// # Errors
    /// Returns [`EngineError::UnknownTask`] if a target is not in the graph.
    pub fn select(&self, targets: &[TaskId]) -> Result<Self, EngineError> {
        let mut keep = BTreeSet::new();
        let mut pending = Vec::new();
        for target in targets {
            let index = self
                .index_of(target)
                .ok_or_else(|| EngineError::UnknownTask { id: target.clone() })?;
            pending.push(index);
        }
        while let Some(next) = pending.pop() {
            if keep.insert(next) {
                pending.extend(self.dependencies(next));
            }
        }

        let remap: BTreeMap<usize, usize> = keep
            .iter()
            .enumerate()
            .map(|(new, &old)| (old, new))
            .collect();
        let tasks: Vec<TaskNode> = keep
            .iter()
            .filter_map(|&old| self.tasks.get(old).cloned())
            .collect();
        let edges: Vec<Edge> = self
            .edges
            .iter()
            .filter_map(|edge| {
                Some(Edge {
                    producer: *remap.get(&edge.producer)?,
                    consumer: *remap.get(&edge.consumer)?,
                    slot: edge.slot.clone(),
                })
            })
            .collect();
        let producers = self
            .producers
            .iter()
            .filter_map(|(slot, indices)| {
                let kept: Vec<usize> = indices.iter().filter_map(|i| remap.get(i).copied()).collect();
                (!kept.is_empty()).then(|| (slot.clone(), kept))
            })
            .collect();

        Ok(Self::assemble(tasks, edges, producers, self.supplied.clone()))
    }

    fn assemble(
        tasks: Vec<TaskNode>,
        edges: Vec<Edge>,
        producers: BTreeMap<SlotId, Vec<usize>>,
        supplied: BTreeSet<SlotId>,
    ) -> Self {
        let mut dependencies = vec![BTreeSet::new(); tasks.len()];
        let mut dependents = vec![BTreeSet::new(); tasks.len()];
        for edge in &edges {
            if let Some(deps) = dependencies.get_mut(edge.consumer) {
                deps.insert(edge.producer);
            }
            if let Some(deps) = dependents.get_mut(edge.producer) {
                deps.insert(edge.consumer);
            }
        }
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, task)| (task.id().clone(), i))
            .collect();
        Self {
            tasks,
            index,
            edges,
            producers,
            supplied,
            dependencies,
            dependents,
        }
    }
}

/// Builds a [`BuildGraph`] from task declarations against a registry.
#[derive(Debug)]
pub struct GraphBuilder<'r> {
    registry: &'r Registry,
    supplied: BTreeSet<SlotId>,
}

impl<'r> GraphBuilder<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            supplied: BTreeSet::new(),
        }
    }

    /// Mark `slot` as supplied from outside the graph.
    #[must_use]
    pub fn supply(mut self, slot: impl Into<SlotId>) -> Self {
        self.supplied.insert(slot.into());
        self
    }

    /// Validate `tasks` and connect producers to consumers.
    ///
    /// # Errors
    /// Returns the first problem found: an unknown slot, a duplicate task, a
    /// slot that is both input and output of one task, two producers for a
    /// non-appendable slot, an input nobody produces, or a cycle.
    pub fn build(self, tasks: Vec<TaskNode>) -> Result<BuildGraph, EngineError> {
        for slot in &self.supplied {
            self.registry.lookup(slot)?;
        }

        let mut seen = BTreeSet::new();
        for task in &tasks {
            if !seen.insert(task.id()) {
                return Err(EngineError::DuplicateTask {
                    id: task.id().clone(),
                });
            }
            for slot in task.inputs().iter().chain(task.outputs()) {
                self.registry.lookup(slot)?;
            }
            if let Some(slot) = task.inputs().iter().find(|s| task.outputs().contains(s)) {
                return Err(EngineError::SlotBothInputAndOutput {
                    task: task.id().clone(),
                    slot: slot.clone(),
                });
            }
        }

        let producers = self.collect_producers(&tasks)?;

        let mut edges = BTreeSet::new();
        for (consumer, task) in tasks.iter().enumerate() {
            for slot in task.inputs() {
                let slot_producers = producers.get(slot).map_or(&[][..], Vec::as_slice);
                if slot_producers.is_empty() && !self.supplied.contains(slot) {
                    return Err(EngineError::DanglingInput {
                        task: task.id().clone(),
                        slot: slot.clone(),
                    });
                }
                for &producer in slot_producers {
                    edges.insert(Edge {
                        producer,
                        consumer,
                        slot: slot.clone(),
                    });
                }
            }
        }

        let graph = BuildGraph::assemble(tasks, edges.into_iter().collect(), producers, self.supplied);
        detect_cycle(&graph)?;
        tracing::debug!(
            tasks = graph.len(),
            edges = graph.edges().len(),
            "built task graph"
        );
        Ok(graph)
    }

    fn collect_producers(
        &self,
        tasks: &[TaskNode],
    ) -> Result<BTreeMap<SlotId, Vec<usize>>, EngineError> {
        let mut producers: BTreeMap<SlotId, Vec<usize>> = BTreeMap::new();
        for (index, task) in tasks.iter().enumerate() {
            for slot_id in task.outputs() {
                let slot = self.registry.lookup(slot_id)?;
                let existing = producers.entry(slot_id.clone()).or_default();
                if !slot.is_appendable() {
                    let first = if self.supplied.contains(slot_id) {
                        Some(EXTERNAL_SOURCE.to_owned())
                    } else {
                        existing
                            .first()
                            .and_then(|&i| tasks.get(i))
                            .map(|t| t.id().to_string())
                    };
                    if let Some(first) = first {
                        return Err(EngineError::ConflictingProducer {
                            slot: slot_id.clone(),
                            first,
                            second: task.id().to_string(),
                        });
                    }
                }
                existing.push(index);
            }
        }
        Ok(producers)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Three-colour depth-first search along producer-to-consumer edges.
fn detect_cycle(graph: &BuildGraph) -> Result<(), EngineError> {
    let mut marks = vec![Mark::Unvisited; graph.len()];
    let mut stack = Vec::new();
    for start in 0..graph.len() {
        visit(graph, start, &mut marks, &mut stack)?;
    }
    Ok(())
}

fn visit(
    graph: &BuildGraph,
    node: usize,
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
) -> Result<(), EngineError> {
    match marks.get(node).copied() {
        Some(Mark::Done) | None => return Ok(()),
        Some(Mark::InProgress) => {
            let start = stack.iter().position(|&n| n == node).unwrap_or(0);
            let cycle = stack
                .get(start..)
                .unwrap_or(stack.as_slice())
                .iter()
                .chain(std::iter::once(&node))
                .filter_map(|&i| graph.task(i).map(|t| t.id().clone()))
                .collect();
            return Err(EngineError::CycleDetected { cycle });
        }
        Some(Mark::Unvisited) => {}
    }

    if let Some(mark) = marks.get_mut(node) {
        *mark = Mark::InProgress;
    }
    stack.push(node);
    for next in graph.dependents(node) {
        visit(graph, next, marks, stack)?;
    }
    stack.pop();
    if let Some(mark) = marks.get_mut(node) {
        *mark = Mark::Done;
    }
    Ok(())
}
