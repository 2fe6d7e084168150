use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::core::{DatasetId, ShuffleId};
use crate::error::EngineError;
use crate::lineage::{Dependency, LineageGraph, ShuffleDependency};

/// What the planner needs to know about data that already exists.
pub(crate) trait PlanProbe {
    /// Whether all of `partitions` of `dataset` are held in storage.
    fn is_materialized(&self, dataset: DatasetId, partitions: &[usize]) -> bool;

    /// Map partitions of `shuffle` whose output is not registered.
    fn missing_maps(&self, shuffle: ShuffleId, maps: usize) -> Vec<usize>;
}

#[derive(Clone)]
pub(crate) enum StageKind {
    /// Computes map output for a shuffle. `Stage::dataset` is the shuffle's
    /// parent.
    ShuffleMap(Arc<dyn ShuffleDependency>),
    /// Computes the partitions requested by the action.
    Result,
}

/// A set of tasks with no shuffle between them, one per partition.
#[derive(Clone)]
pub(crate) struct Stage {
    pub dataset: DatasetId,
    pub kind: StageKind,
    pub partitions: Vec<usize>,
    /// Stages that must finish before this one starts.
    pub parents: Vec<usize>,
}

impl Stage {
    pub(crate) fn shuffle(&self) -> Option<ShuffleId> {
        match &self.kind {
            StageKind::ShuffleMap(dependency) => Some(dependency.shuffle_id()),
            StageKind::Result => None,
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self.kind {
            StageKind::ShuffleMap(_) => "shuffle_map",
            StageKind::Result => "result",
        }
    }
}

impl LineageGraph {
    /// Splits the computation of `partitions` of `target` into stages at
    /// shuffle boundaries.
    ///
    /// Stages are returned in an order where every stage comes after its
    /// parents, and the result stage is last. Materialized datasets and
    /// shuffles whose map output is complete are not planned again.
    pub(crate) fn plan_for(
        &self,
        target: DatasetId,
        partitions: &[usize],
        probe: &dyn PlanProbe,
    ) -> Result<Vec<Stage>, EngineError> {
        self.check_acyclic()?;

        let mut planner = Planner {
            graph: self,
            probe,
            stages: Vec::new(),
            shuffles: HashMap::new(),
        };

        let parents = planner.parents_of(target, partitions)?;
        planner.stages.push(Stage {
            dataset: target,
            kind: StageKind::Result,
            partitions: partitions.to_vec(),
            parents,
        });

        Ok(planner.stages)
    }
}

struct Planner<'a> {
    graph: &'a LineageGraph,
    probe: &'a dyn PlanProbe,
    stages: Vec<Stage>,
    /// Shuffles already visited, with the stage planned for them if any.
    shuffles: HashMap<ShuffleId, Option<usize>>,
}

impl Planner<'_> {
    /// Walks the narrow ancestry of `root` and plans the map stages it reads.
    fn parents_of(
        &mut self,
        root: DatasetId,
        partitions: &[usize],
    ) -> Result<Vec<usize>, EngineError> {
        let mut parents = BTreeSet::new();
        let mut seen = HashSet::new();
        let mut stack = vec![root];

        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }

            let node = self.graph.node(id).ok_or_else(|| {
                EngineError::LineageInconsistency(format!("{id} is not part of the lineage"))
            })?;

            let wanted: Vec<usize> = if id == root {
                partitions.to_vec()
            } else {
                (0..node.partitions()).collect()
            };
            if self.probe.is_materialized(id, &wanted) {
                continue;
            }

            for dependency in node.dependencies() {
                match dependency {
                    Dependency::Narrow(parent) => {
                        if parent >= id || !self.graph.contains(parent) {
                            return Err(EngineError::LineageInconsistency(format!(
                                "{id} depends on {parent}, which was not derived before it"
                            )));
                        }
                        stack.push(parent);
                    }
                    Dependency::Shuffle(shuffle) => {
                        if let Some(stage) = self.shuffle_stage(id, shuffle)? {
                            parents.insert(stage);
                        }
                    }
                }
            }
        }

        Ok(parents.into_iter().collect())
    }

    fn shuffle_stage(
        &mut self,
        child: DatasetId,
        dependency: Arc<dyn ShuffleDependency>,
    ) -> Result<Option<usize>, EngineError> {
        let id = dependency.shuffle_id();
        if let Some(stage) = self.shuffles.get(&id) {
            return Ok(*stage);
        }

        let parent = dependency.parent();
        if parent >= child || !self.graph.contains(parent) {
            return Err(EngineError::LineageInconsistency(format!(
                "{child} reads {id} of {parent}, which was not derived before it"
            )));
        }

        let missing = self.probe.missing_maps(id, dependency.map_partitions());
        if missing.is_empty() {
            self.shuffles.insert(id, None);
            return Ok(None);
        }

        let parents = self.parents_of(parent, &missing)?;
        let index = self.stages.len();
        self.stages.push(Stage {
            dataset: parent,
            kind: StageKind::ShuffleMap(dependency),
            partitions: missing,
            parents,
        });
        self.shuffles.insert(id, Some(index));

        Ok(Some(index))
    }
}
