//! Union/project normalization and fusion rules.
//!
//! Plain unions and projects are normalized into the generalized
//! union-project form; nested generalized union-projects are fused into
//! one node with a transitively composed index map; and fully
//! source-backed nodes are tagged with their literal underlying columns
//! so materialization can skip the copy.

use sframe_error::Result;

use crate::plan::node::{PlanNode, PlanNodeKind, PlanNodeRef, PlanNodeType};

use super::Transform;

/// UNION(inputs) -> GENERALIZED_UNION_PROJECT(inputs, identity map).
#[derive(Debug)]
pub struct NormalizeUnion;

impl Transform for NormalizeUnion {
    fn name(&self) -> &'static str {
        "normalize_union"
    }

    fn transform_applies(&self, node_type: PlanNodeType) -> bool {
        node_type == PlanNodeType::Union
    }

    fn apply_transform(&self, node: &PlanNodeRef) -> Result<Option<PlanNodeRef>> {
        let mut index_map = Vec::with_capacity(node.num_columns());
        for (input_id, input) in node.inputs().iter().enumerate() {
            for col_id in 0..input.num_columns() {
                index_map.push((input_id, col_id));
            }
        }
        let replacement =
            PlanNode::generalized_union_project(node.inputs().to_vec(), index_map)?;
        Ok(Some(replacement))
    }
}

/// PROJECT(child, indices) -> GENERALIZED_UNION_PROJECT([child], map).
#[derive(Debug)]
pub struct NormalizeProject;

impl Transform for NormalizeProject {
    fn name(&self) -> &'static str {
        "normalize_project"
    }

    fn transform_applies(&self, node_type: PlanNodeType) -> bool {
        node_type == PlanNodeType::Project
    }

    fn apply_transform(&self, node: &PlanNodeRef) -> Result<Option<PlanNodeRef>> {
        let indices = match node.kind() {
            PlanNodeKind::Project { indices } => indices,
            _ => return Ok(None),
        };
        let index_map = indices.iter().map(|&idx| (0, idx)).collect();
        let replacement =
            PlanNode::generalized_union_project(node.inputs().to_vec(), index_map)?;
        Ok(Some(replacement))
    }
}

/// Collapse GENERALIZED_UNION_PROJECT over GENERALIZED_UNION_PROJECT into
/// a single node.
///
/// The new input list is the de-duplicated union of the grandchildren's
/// inputs, de-duplicated by node identity in first-seen order; the index
/// map is composed so each output column points directly at the input
/// that produces it.
#[derive(Debug)]
pub struct FuseGeneralizedUnionProject;

impl Transform for FuseGeneralizedUnionProject {
    fn name(&self) -> &'static str {
        "fuse_generalized_union_project"
    }

    fn transform_applies(&self, node_type: PlanNodeType) -> bool {
        node_type == PlanNodeType::GeneralizedUnionProject
    }

    fn apply_transform(&self, node: &PlanNodeRef) -> Result<Option<PlanNodeRef>> {
        let index_map = match node.kind() {
            PlanNodeKind::GeneralizedUnionProject { index_map, .. } => index_map,
            _ => return Ok(None),
        };
        if index_map.is_empty() {
            // Zero output columns reference no grandchild; fusing would
            // leave the node without inputs. Keep the shape as-is.
            return Ok(None);
        }
        if !node
            .inputs()
            .iter()
            .any(|input| input.node_type() == PlanNodeType::GeneralizedUnionProject)
        {
            // Nothing nested; reapplying after a fuse reports no-op here.
            return Ok(None);
        }

        // Identity-keyed, first-seen-order input collection.
        let mut new_inputs: Vec<PlanNodeRef> = Vec::new();
        let mut intern = |input: &PlanNodeRef| -> usize {
            match new_inputs
                .iter()
                .position(|existing| PlanNodeRef::ptr_eq(existing, input))
            {
                Some(pos) => pos,
                None => {
                    new_inputs.push(input.clone());
                    new_inputs.len() - 1
                }
            }
        };

        let mut new_map = Vec::with_capacity(index_map.len());
        for &(input_id, col_id) in index_map {
            let input = &node.inputs()[input_id];
            match input.kind() {
                PlanNodeKind::GeneralizedUnionProject {
                    index_map: child_map,
                    ..
                } => {
                    let (child_input_id, child_col_id) = child_map[col_id];
                    let slot = intern(&input.inputs()[child_input_id]);
                    new_map.push((slot, child_col_id));
                }
                _ => {
                    let slot = intern(input);
                    new_map.push((slot, col_id));
                }
            }
        }

        let replacement = PlanNode::generalized_union_project(new_inputs, new_map)?;
        Ok(Some(replacement))
    }
}

/// Attach the direct source mapping to a generalized union-project whose
/// inputs are all full-coverage on-disk sources.
#[derive(Debug)]
pub struct TagDirectSources;

impl Transform for TagDirectSources {
    fn name(&self) -> &'static str {
        "tag_direct_sources"
    }

    fn transform_applies(&self, node_type: PlanNodeType) -> bool {
        node_type == PlanNodeType::GeneralizedUnionProject
    }

    fn apply_transform(&self, node: &PlanNodeRef) -> Result<Option<PlanNodeRef>> {
        let index_map = match node.kind() {
            PlanNodeKind::GeneralizedUnionProject {
                index_map,
                direct_source: None,
            } => index_map,
            // Already tagged (or not a gup): no-op.
            _ => return Ok(None),
        };

        let mut mapping = Vec::with_capacity(index_map.len());
        for &(input_id, col_id) in index_map {
            match node.inputs()[input_id].kind() {
                PlanNodeKind::Source(source) if source.covers_full_columns() => {
                    mapping.push(source.columns[col_id].clone());
                }
                _ => return Ok(None),
            }
        }

        let replacement = PlanNode::build(
            PlanNodeKind::GeneralizedUnionProject {
                index_map: index_map.clone(),
                direct_source: Some(mapping),
            },
            node.inputs().to_vec(),
        )?;
        Ok(Some(replacement))
    }
}

/// Inverse expansion: rewrite a generalized union-project back into
/// PROJECT(UNION(inputs), flat offsets), for stages that only understand
/// the simple shapes.
pub fn expand_to_union_project(node: &PlanNodeRef) -> Result<PlanNodeRef> {
    let index_map = match node.kind() {
        PlanNodeKind::GeneralizedUnionProject { index_map, .. } => index_map,
        _ => return Ok(node.clone()),
    };

    // Flat column offset of each input within the union.
    let mut offsets = Vec::with_capacity(node.inputs().len());
    let mut offset = 0;
    for input in node.inputs() {
        offsets.push(offset);
        offset += input.num_columns();
    }

    let union = PlanNode::union(node.inputs().to_vec())?;
    let flat: Vec<usize> = index_map
        .iter()
        .map(|&(input_id, col_id)| offsets[input_id] + col_id)
        .collect();
    PlanNode::project(union, flat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Sarray;
    use crate::plan::optimizer::Optimizer;
    use crate::values::{Value, ValueType};

    fn column(dir: &std::path::Path, name: &str, rows: i64) -> Sarray {
        Sarray::from_values(
            dir.join(name),
            ValueType::Integer,
            &(0..rows).map(Value::Integer).collect::<Vec<_>>(),
            2,
        )
        .unwrap()
    }

    fn gup_parts(node: &PlanNodeRef) -> (&[PlanNodeRef], &Vec<(usize, usize)>, bool) {
        match node.kind() {
            PlanNodeKind::GeneralizedUnionProject {
                index_map,
                direct_source,
            } => (node.inputs(), index_map, direct_source.is_some()),
            other => panic!("expected generalized union project, got {other:?}"),
        }
    }

    #[test]
    fn union_normalizes_to_identity_map() {
        let dir = tempfile::tempdir().unwrap();
        let a = PlanNode::source_column(column(dir.path(), "a", 5));
        let b = PlanNode::source_column(column(dir.path(), "b", 5));
        let union = PlanNode::union(vec![a, b]).unwrap();

        let optimized = Optimizer::new().optimize(union).unwrap();
        let (inputs, map, tagged) = gup_parts(&optimized);
        assert_eq!(2, inputs.len());
        assert_eq!(&vec![(0, 0), (1, 0)], map);
        assert!(tagged);
    }

    #[test]
    fn nested_gups_fuse_with_composed_map() {
        let dir = tempfile::tempdir().unwrap();
        let a = PlanNode::source_column(column(dir.path(), "a", 5));
        let b = PlanNode::source_column(column(dir.path(), "b", 5));

        // project(union(a, b), [1, 0, 1])
        let union = PlanNode::union(vec![a.clone(), b.clone()]).unwrap();
        let project = PlanNode::project(union, vec![1, 0, 1]).unwrap();

        let optimized = Optimizer::new().optimize(project).unwrap();
        let (inputs, map, _) = gup_parts(&optimized);
        // Inputs take first-seen order of the composed map traversal;
        // output column 0 resolves to b, so b is input 0.
        assert_eq!(2, inputs.len());
        assert!(PlanNodeRef::ptr_eq(&inputs[0], &b));
        assert!(PlanNodeRef::ptr_eq(&inputs[1], &a));
        assert_eq!(&vec![(0, 0), (1, 0), (0, 0)], map);
    }

    #[test]
    fn shared_input_deduped_by_identity_not_value() {
        let dir = tempfile::tempdir().unwrap();
        let shared = PlanNode::source_column(column(dir.path(), "a", 5));
        // Two unions over the same node: the fused node should carry the
        // shared input exactly once.
        let u1 = PlanNode::union(vec![shared.clone(), shared.clone()]).unwrap();
        let project = PlanNode::project(u1, vec![0, 1]).unwrap();

        let optimized = Optimizer::new().optimize(project).unwrap();
        let (inputs, map, _) = gup_parts(&optimized);
        assert_eq!(1, inputs.len());
        assert!(PlanNodeRef::ptr_eq(&inputs[0], &shared));
        assert_eq!(&vec![(0, 0), (0, 0)], map);
    }

    #[test]
    fn sliced_source_not_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let col = column(dir.path(), "a", 10);
        let frame = crate::table::Sframe::new(vec![("a".to_string(), col)]).unwrap();
        let sliced = PlanNode::source_slice(&frame, 1, 9).unwrap();
        let project = PlanNode::project(sliced, vec![0]).unwrap();

        let optimized = Optimizer::new().optimize(project).unwrap();
        let (_, _, tagged) = gup_parts(&optimized);
        assert!(!tagged);
    }

    #[test]
    fn empty_projection_over_union_keeps_an_input() {
        let dir = tempfile::tempdir().unwrap();
        let a = PlanNode::source_column(column(dir.path(), "a", 5));
        let b = PlanNode::source_column(column(dir.path(), "b", 5));
        let union = PlanNode::union(vec![a, b]).unwrap();
        let project = PlanNode::project(union, vec![]).unwrap();

        let optimized = Optimizer::new().optimize(project).unwrap();
        let (inputs, map, _) = gup_parts(&optimized);
        assert!(map.is_empty());
        assert_eq!(0, optimized.num_columns());
        assert!(!inputs.is_empty());
    }

    #[test]
    fn optimize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let a = PlanNode::source_column(column(dir.path(), "a", 5));
        let b = PlanNode::source_column(column(dir.path(), "b", 5));
        let union = PlanNode::union(vec![a.clone(), b]).unwrap();
        let plan = PlanNode::project(union, vec![0, 1, 0]).unwrap();

        let optimizer = Optimizer::new();
        let once = optimizer.optimize(plan).unwrap();
        let twice = optimizer.optimize(once.clone()).unwrap();
        // A second run fires no transform, so the node is unchanged.
        assert!(PlanNodeRef::ptr_eq(&once, &twice));
    }

    #[test]
    fn expansion_roundtrip_shape() {
        let dir = tempfile::tempdir().unwrap();
        let a = PlanNode::source_column(column(dir.path(), "a", 5));
        let b = PlanNode::source_column(column(dir.path(), "b", 5));
        let gup = PlanNode::generalized_union_project(
            vec![a, b],
            vec![(1, 0), (0, 0)],
        )
        .unwrap();

        let expanded = expand_to_union_project(&gup).unwrap();
        assert_eq!(PlanNodeType::Project, expanded.node_type());
        match expanded.kind() {
            PlanNodeKind::Project { indices } => assert_eq!(&vec![1, 0], indices),
            _ => unreachable!(),
        }
        assert_eq!(PlanNodeType::Union, expanded.inputs()[0].node_type());
    }
}
