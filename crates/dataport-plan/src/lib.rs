//! Dependency analysis and execution planning.
//!
//! The planner turns a schema into an [`ExecutionPlan`]: entities are
//! nodes, lookup-like fields are edges, strongly-connected components
//! collapse into cyclic groups, and the condensed DAG is topologically
//! layered into tiers. Fields that close a cycle are marked deferred:
//! nulled on the initial write and assigned in a later phase once their
//! targets exist. Planning is deterministic: the same schema always
//! yields the same plan.

pub mod graph;
pub mod planner;

pub use graph::{DependencyEdge, DependencyGraph, EdgeKind};
pub use planner::{ExecutionPlan, Planner};
