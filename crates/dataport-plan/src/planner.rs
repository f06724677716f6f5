//! Tier assignment and deferred-field selection.

use crate::graph::DependencyGraph;
use dataport_schema::Schema;
use petgraph::algo::tarjan_scc;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// The ordered output of planning.
///
/// `tiers` sequences sets of entities; entities within a tier have no
/// dependency ordering between groups. Members of one cyclic group are
/// listed in `cyclic_groups` in their write order: the importer runs
/// them sequentially so every non-deferred intra-group edge is
/// satisfied at first-write time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    /// Entities per tier, lexicographically ordered within a tier.
    pub tiers: Vec<Vec<String>>,
    /// Fields nulled on initial write and assigned in the deferred
    /// phase, per entity.
    pub deferred_fields: BTreeMap<String, Vec<String>>,
    /// Ordered members of each cyclic group.
    pub cyclic_groups: Vec<Vec<String>>,
    /// Many-to-many relationship names, processed after deferred fields.
    pub many_to_many: Vec<String>,
}

impl ExecutionPlan {
    /// The tier index of `entity`.
    pub fn tier_of(&self, entity: &str) -> Option<usize> {
        let lowered = entity.to_ascii_lowercase();
        self.tiers
            .iter()
            .position(|tier| tier.iter().any(|name| *name == lowered))
    }

    /// Deferred fields of `entity`, or an empty slice.
    pub fn deferred_for(&self, entity: &str) -> &[String] {
        self.deferred_fields
            .get(&entity.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether `field` on `entity` is deferred.
    pub fn is_deferred(&self, entity: &str, field: &str) -> bool {
        let lowered = field.to_ascii_lowercase();
        self.deferred_for(entity).iter().any(|name| *name == lowered)
    }

    /// The ordered cyclic group containing `entity`, if any.
    pub fn group_of(&self, entity: &str) -> Option<&[String]> {
        let lowered = entity.to_ascii_lowercase();
        self.cyclic_groups
            .iter()
            .find(|group| group.iter().any(|name| *name == lowered))
            .map(Vec::as_slice)
    }

    /// Total entities across all tiers.
    pub fn entity_count(&self) -> usize {
        self.tiers.iter().map(Vec::len).sum()
    }
}

/// Builds execution plans from a dependency graph.
pub struct Planner {
    graph: DependencyGraph,
    many_to_many: Vec<String>,
}

impl Planner {
    pub fn new(schema: &Schema) -> Self {
        Self {
            graph: DependencyGraph::from_schema(schema),
            many_to_many: schema
                .many_to_many()
                .into_iter()
                .map(|relationship| relationship.name.clone())
                .collect(),
        }
    }

    /// Attaches record counts (typically from an archive manifest) for
    /// load estimation.
    pub fn with_record_counts(mut self, counts: impl IntoIterator<Item = (String, u64)>) -> Self {
        self.graph = self.graph.with_record_counts(counts);
        self
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Condenses the graph with Tarjan's algorithm, assigns each
    /// component the lowest tier consistent with its predecessors, and
    /// picks deferred fields inside cyclic components.
    pub fn plan(&self) -> ExecutionPlan {
        let graph = &self.graph.graph;

        // Components arrive in reverse topological order: every edge
        // target's component appears before the component of its source,
        // so tier values for successors are always known.
        let components = tarjan_scc(graph);
        let mut component_of: HashMap<NodeIndex, usize> = HashMap::new();
        for (id, members) in components.iter().enumerate() {
            for node in members {
                component_of.insert(*node, id);
            }
        }

        let mut component_tier = vec![0usize; components.len()];
        for (id, members) in components.iter().enumerate() {
            let mut tier = 0usize;
            for node in members {
                for target in graph.neighbors(*node) {
                    let target_component = component_of[&target];
                    if target_component != id {
                        tier = tier.max(component_tier[target_component] + 1);
                    }
                }
            }
            component_tier[id] = tier;
        }

        let tier_count = component_tier.iter().map(|tier| tier + 1).max().unwrap_or(0);
        let mut tiers: Vec<Vec<String>> = vec![Vec::new(); tier_count];
        let mut deferred_fields: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut cyclic_groups: Vec<Vec<String>> = Vec::new();

        for (id, members) in components.iter().enumerate() {
            for node in members {
                tiers[component_tier[id]].push(graph[*node].clone());
            }

            let has_self_edge = members
                .iter()
                .any(|node| graph.find_edge(*node, *node).is_some());
            if members.len() == 1 && !has_self_edge {
                continue;
            }

            // Cyclic group: order members by name (descending in-degree
            // breaks ties), then defer every intra-group edge that
            // points forward in the ordering, plus all self-edges.
            let mut ordered: Vec<NodeIndex> = members.clone();
            ordered.sort_by(|a, b| {
                graph[*a].cmp(&graph[*b]).then_with(|| {
                    self.graph
                        .in_degree(&graph[*b])
                        .cmp(&self.graph.in_degree(&graph[*a]))
                })
            });
            let position: HashMap<NodeIndex, usize> = ordered
                .iter()
                .enumerate()
                .map(|(position, node)| (*node, position))
                .collect();

            for node in &ordered {
                for edge in graph.edges(*node) {
                    let target = edge.target();
                    if component_of[&target] != id {
                        continue;
                    }
                    let is_self = target == *node;
                    if is_self || position[node] < position[&target] {
                        deferred_fields
                            .entry(graph[*node].clone())
                            .or_default()
                            .insert(edge.weight().field.clone());
                    }
                }
            }

            cyclic_groups.push(ordered.iter().map(|node| graph[*node].clone()).collect());
        }

        for tier in &mut tiers {
            tier.sort();
        }
        cyclic_groups.sort();

        let plan = ExecutionPlan {
            tiers,
            deferred_fields: deferred_fields
                .into_iter()
                .map(|(entity, fields)| (entity, fields.into_iter().collect()))
                .collect(),
            cyclic_groups,
            many_to_many: self.many_to_many.clone(),
        };
        tracing::debug!(
            tiers = plan.tiers.len(),
            entities = plan.entity_count(),
            deferred_entities = plan.deferred_fields.len(),
            "execution plan built"
        );
        plan
    }
}
