mod node;
pub(crate) mod ops;
mod plan;

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::Graph;
use petgraph::visit::{Dfs, EdgeRef, Reversed};
use serde::{Deserialize, Serialize};

use crate::core::{DatasetId, ShuffleId};
use crate::error::EngineError;
use crate::partitioner::PartitionerInfo;
use crate::storage::StorageLevel;

pub(crate) use node::{AnyIter, Dependency, Node, ShuffleDependency, TypedNode};
pub(crate) use plan::{PlanProbe, Stage, StageKind};

/// The transformation that produced a dataset, in a form that can be
/// inspected and serialized. The closures that implement it live next to it
/// in the lineage node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transform {
    Source {
        kind: SourceKind,
    },
    Map,
    Filter,
    FlatMap,
    MapPartitions,
    Union,
    Coalesce,
    /// Keyed aggregation within each partition. Used for map-side combining
    /// and for data already placed by the requested partitioner.
    Combine,
    Shuffle {
        shuffle: ShuffleId,
        partitioner: PartitionerInfo,
        aggregate: bool,
    },
}

impl Transform {
    pub fn label(&self) -> &'static str {
        match self {
            Transform::Source { kind } => kind.label(),
            Transform::Map => "map",
            Transform::Filter => "filter",
            Transform::FlatMap => "flat_map",
            Transform::MapPartitions => "map_partitions",
            Transform::Union => "union",
            Transform::Coalesce => "coalesce",
            Transform::Combine => "combine",
            Transform::Shuffle { aggregate: true, .. } => "shuffle_aggregate",
            Transform::Shuffle { .. } => "shuffle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Parallelize,
    Range,
    TextFile,
    Producer,
}

impl SourceKind {
    fn label(self) -> &'static str {
        match self {
            SourceKind::Parallelize => "parallelize",
            SourceKind::Range => "range",
            SourceKind::TextFile => "text_file",
            SourceKind::Producer => "producer",
        }
    }
}

#[derive(Clone)]
pub(crate) struct Vertex {
    pub node: Arc<dyn Node>,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Edge {
    Narrow,
    Shuffle(ShuffleId),
}

/// One dataset in the output of `explain`.
#[derive(Debug, Serialize)]
pub(crate) struct Explained<'a> {
    id: DatasetId,
    name: &'a str,
    transform: Transform,
    element: &'static str,
    partitions: usize,
    partitioner: Option<PartitionerInfo>,
    storage: StorageLevel,
    parents: Vec<(DatasetId, Edge)>,
}

/// Arena of every dataset derived in a context.
///
/// Nodes are only ever appended and edges always point from an older node to
/// a newer one. Jobs plan against an immutable snapshot of this graph.
#[derive(Clone, Default)]
pub(crate) struct LineageGraph {
    graph: Graph<Vertex, Edge>,
}

impl LineageGraph {
    /// Records a new dataset. Nothing is computed.
    pub(crate) fn derive(&mut self, name: String, node: Arc<dyn Node>) -> DatasetId {
        let dependencies = node.dependencies();
        let index = self.graph.add_node(Vertex { node, name });

        for dependency in dependencies {
            let (parent, edge) = match &dependency {
                Dependency::Narrow(parent) => (*parent, Edge::Narrow),
                Dependency::Shuffle(shuffle) => (shuffle.parent(), Edge::Shuffle(shuffle.shuffle_id())),
            };

            // A missing parent is reported when the dataset is planned.
            if parent.index() < index.index() {
                self.graph.add_edge(parent.node(), index, edge);
            } else {
                tracing::error!(dataset = index.index(), %parent, "dependency on a dataset that does not exist");
            }
        }

        DatasetId::from(index)
    }

    pub(crate) fn vertex(&self, id: DatasetId) -> Option<&Vertex> {
        self.graph.node_weight(id.node())
    }

    pub(crate) fn node(&self, id: DatasetId) -> Option<Arc<dyn Node>> {
        self.vertex(id).map(|vertex| vertex.node.clone())
    }

    pub(crate) fn name(&self, id: DatasetId) -> String {
        self.vertex(id)
            .map(|vertex| vertex.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub(crate) fn rename(&mut self, id: DatasetId, name: String) {
        if let Some(vertex) = self.graph.node_weight_mut(id.node()) {
            vertex.name = name;
        }
    }

    pub(crate) fn partitions(&self, id: DatasetId) -> usize {
        self.vertex(id).map_or(0, |vertex| vertex.node.partitions())
    }

    pub(crate) fn partitioner(&self, id: DatasetId) -> Option<PartitionerInfo> {
        self.vertex(id).and_then(|vertex| vertex.node.partitioner())
    }

    pub(crate) fn contains(&self, id: DatasetId) -> bool {
        self.vertex(id).is_some()
    }

    pub(crate) fn check_acyclic(&self) -> Result<(), EngineError> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|_| ())
            .map_err(|cycle| {
                EngineError::LineageInconsistency(format!(
                    "cycle through {}",
                    DatasetId::from(cycle.node_id())
                ))
            })
    }

    /// `id` and all of its ancestors, oldest first.
    pub(crate) fn explain(
        &self,
        id: DatasetId,
        level: impl Fn(DatasetId) -> StorageLevel,
    ) -> Vec<Explained<'_>> {
        if !self.contains(id) {
            return Vec::new();
        }

        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, id.node());
        let mut found = Vec::new();
        while let Some(index) = dfs.next(reversed) {
            found.push(index);
        }
        found.sort();

        found
            .into_iter()
            .map(|index| {
                let vertex = &self.graph[index];
                let mut parents: Vec<(DatasetId, Edge)> = self
                    .graph
                    .edges_directed(index, Direction::Incoming)
                    .map(|edge| (DatasetId::from(edge.source()), *edge.weight()))
                    .collect();
                parents.sort_by_key(|(parent, _)| *parent);

                let dataset = DatasetId::from(index);
                Explained {
                    id: dataset,
                    name: &vertex.name,
                    transform: vertex.node.transform(),
                    element: vertex.node.output_type_name(),
                    partitions: vertex.node.partitions(),
                    partitioner: vertex.node.partitioner(),
                    storage: level(dataset),
                    parents,
                }
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.graph.node_count()
    }
}

impl Display for LineageGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let vertex = &self.graph[index];
            let name = vertex.name.replace('"', "\\\"");
            writeln!(
                f,
                "    {}[\"{}\\n{} x{}\"]",
                index.index(),
                name,
                vertex.node.transform().label(),
                vertex.node.partitions()
            )?;
        }

        for edge in self.graph.edge_references() {
            let source = &self.graph[edge.source()];
            let type_name = source
                .node
                .output_type_name()
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            match edge.weight() {
                Edge::Narrow => writeln!(
                    f,
                    "    {} -- \"{}\" --> {}",
                    edge.source().index(),
                    type_name,
                    edge.target().index()
                )?,
                Edge::Shuffle(shuffle) => writeln!(
                    f,
                    "    {} == \"{}\" ==> {}",
                    edge.source().index(),
                    shuffle,
                    edge.target().index()
                )?,
            }
        }

        Ok(())
    }
}
