//! The entity dependency graph.

use dataport_schema::{FieldType, Schema};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;
use std::collections::HashMap;

/// Why an edge exists: which flavor of lookup field produced it.
///
/// The planner treats all kinds identically; the distinction is kept
/// for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Lookup,
    Owner,
    Customer,
    Parent,
}

impl EdgeKind {
    /// The edge kind for a lookup-like field type.
    pub fn from_field_type(field_type: FieldType) -> Option<Self> {
        match field_type {
            FieldType::Lookup => Some(EdgeKind::Lookup),
            FieldType::Owner => Some(EdgeKind::Owner),
            FieldType::Customer => Some(EdgeKind::Customer),
            FieldType::Parent => Some(EdgeKind::Parent),
            _ => None,
        }
    }
}

/// One dependency edge: `from` carries a lookup field targeting `to`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub field: String,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone)]
pub(crate) struct EdgeInfo {
    pub(crate) field: String,
    pub(crate) kind: EdgeKind,
}

/// Directed graph of entities connected by lookup edges.
///
/// Lookup fields targeting entities outside the schema produce no edge:
/// those references are not part of the migration and never constrain
/// ordering.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    pub(crate) graph: DiGraph<String, EdgeInfo>,
    pub(crate) nodes: HashMap<String, NodeIndex>,
    record_counts: HashMap<String, u64>,
}

impl DependencyGraph {
    /// Builds the graph from a schema. Node order follows schema order,
    /// which keeps downstream planning deterministic.
    pub fn from_schema(schema: &Schema) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();

        for entity in schema.entities() {
            let index = graph.add_node(entity.logical_name.clone());
            nodes.insert(entity.logical_name.clone(), index);
        }
        for entity in schema.entities() {
            let from = nodes[&entity.logical_name];
            for field in entity.lookup_fields() {
                let Some(target) = &field.target_entity else {
                    continue;
                };
                let Some(to) = nodes.get(target) else {
                    continue;
                };
                let kind = EdgeKind::from_field_type(field.field_type)
                    .expect("lookup_fields yields lookup-like types");
                graph.add_edge(
                    from,
                    *to,
                    EdgeInfo {
                        field: field.logical_name.clone(),
                        kind,
                    },
                );
            }
        }

        Self {
            graph,
            nodes,
            record_counts: HashMap::new(),
        }
    }

    /// Attaches per-entity record counts for load estimation.
    pub fn with_record_counts(
        mut self,
        counts: impl IntoIterator<Item = (String, u64)>,
    ) -> Self {
        self.record_counts = counts
            .into_iter()
            .map(|(entity, count)| (entity.to_ascii_lowercase(), count))
            .collect();
        self
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// The record count estimate for `entity`, when known.
    pub fn record_count(&self, entity: &str) -> Option<u64> {
        self.record_counts.get(&entity.to_ascii_lowercase()).copied()
    }

    /// Number of edges pointing at `entity`.
    pub fn in_degree(&self, entity: &str) -> usize {
        self.nodes
            .get(&entity.to_ascii_lowercase())
            .map(|index| {
                self.graph
                    .edges_directed(*index, Direction::Incoming)
                    .count()
            })
            .unwrap_or(0)
    }

    /// All edges as owned values, in insertion order.
    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.graph
            .edge_indices()
            .map(|edge| {
                let (from, to) = self.graph.edge_endpoints(edge).expect("valid edge");
                let info = &self.graph[edge];
                DependencyEdge {
                    from: self.graph[from].clone(),
                    to: self.graph[to].clone(),
                    field: info.field.clone(),
                    kind: info.kind,
                }
            })
            .collect()
    }
}
