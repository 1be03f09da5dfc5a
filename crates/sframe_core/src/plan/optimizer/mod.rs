//! Fixed-point plan rewriting.
//!
//! A registry of transforms is applied bottom-up over the DAG until no
//! transform fires or the pass cap is hit. Every transform must be
//! idempotent: reapplying it to its own output reports no-op, which is
//! what guarantees termination. Correctness never depends on any single
//! transform firing.

pub mod union_project;

use std::collections::HashMap;
use std::fmt::Debug;

use sframe_error::Result;
use tracing::{debug, warn};

use super::node::{PlanNode, PlanNodeRef, PlanNodeType};
use union_project::{FuseGeneralizedUnionProject, NormalizeProject, NormalizeUnion, TagDirectSources};

/// A single rewrite rule.
pub trait Transform: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap pre-filter on the node's type tag.
    fn transform_applies(&self, node_type: PlanNodeType) -> bool;

    /// Attempt the rewrite. Returns the replacement node, or `None` when
    /// the rule does not apply; the DAG is left untouched in that case.
    fn apply_transform(&self, node: &PlanNodeRef) -> Result<Option<PlanNodeRef>>;
}

/// Upper bound on whole-DAG rewrite passes.
const MAX_OPTIMIZER_PASSES: usize = 32;

/// Upper bound on consecutive rewrites of one node within a pass.
const MAX_NODE_REWRITES: usize = 16;

#[derive(Debug)]
pub struct Optimizer {
    transforms: Vec<Box<dyn Transform>>,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimizer {
    /// Optimizer with the standard rule set.
    pub fn new() -> Optimizer {
        Optimizer {
            transforms: vec![
                Box::new(NormalizeUnion),
                Box::new(NormalizeProject),
                Box::new(FuseGeneralizedUnionProject),
                Box::new(TagDirectSources),
            ],
        }
    }

    /// Optimizer with a custom rule set.
    pub fn with_transforms(transforms: Vec<Box<dyn Transform>>) -> Optimizer {
        Optimizer { transforms }
    }

    /// Rewrite the plan to fixed point.
    pub fn optimize(&self, root: PlanNodeRef) -> Result<PlanNodeRef> {
        let mut current = root;
        for pass in 0..MAX_OPTIMIZER_PASSES {
            let mut changed = false;
            let mut memo: HashMap<*const PlanNode, PlanNodeRef> = HashMap::new();
            current = self.rewrite_node(&current, &mut memo, &mut changed)?;
            if !changed {
                debug!(passes = pass + 1, "optimizer reached fixed point");
                return Ok(current);
            }
        }
        warn!(
            cap = MAX_OPTIMIZER_PASSES,
            "optimizer pass cap hit before fixed point"
        );
        Ok(current)
    }

    /// Bottom-up rewrite of one node, memoized by node identity so shared
    /// subexpressions stay shared in the rewritten DAG.
    fn rewrite_node(
        &self,
        node: &PlanNodeRef,
        memo: &mut HashMap<*const PlanNode, PlanNodeRef>,
        changed: &mut bool,
    ) -> Result<PlanNodeRef> {
        let key = PlanNodeRef::as_ptr(node);
        if let Some(done) = memo.get(&key) {
            return Ok(done.clone());
        }

        // Rewrite children first.
        let mut new_inputs = Vec::with_capacity(node.inputs().len());
        let mut inputs_changed = false;
        for input in node.inputs() {
            let rewritten = self.rewrite_node(input, memo, changed)?;
            inputs_changed |= !PlanNodeRef::ptr_eq(input, &rewritten);
            new_inputs.push(rewritten);
        }

        let mut current = if inputs_changed {
            PlanNode::build(node.kind().clone(), new_inputs)?
        } else {
            node.clone()
        };

        // Apply transforms until none fires on this node.
        'outer: for _ in 0..MAX_NODE_REWRITES {
            for transform in &self.transforms {
                if !transform.transform_applies(current.node_type()) {
                    continue;
                }
                if let Some(replacement) = transform.apply_transform(&current)? {
                    debug!(transform = transform.name(), "rewrote plan node");
                    current = replacement;
                    *changed = true;
                    continue 'outer;
                }
            }
            break;
        }

        memo.insert(key, current.clone());
        Ok(current)
    }
}
