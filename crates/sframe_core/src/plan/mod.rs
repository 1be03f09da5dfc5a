//! Lazy query plans.
//!
//! A plan is an immutable DAG of operator nodes built without touching
//! storage. The optimizer rewrites the DAG into a fused normal form and
//! the planner materializes it into a concrete table.

pub mod materialize;
pub mod node;
pub mod optimizer;
