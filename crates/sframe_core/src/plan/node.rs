//! Plan node DAG.
//!
//! Nodes are immutable once constructed and shared by `Arc`; "rewriting"
//! a node always means building a replacement and rewiring the parent.
//! Node identity (pointer equality) is what the optimizer's input
//! de-duplication keys on, never structural equality.

use std::sync::Arc;

use sframe_error::{Result, SframeError};

use crate::array::Sarray;
use crate::table::Sframe;
use crate::values::ValueType;

pub type PlanNodeRef = Arc<PlanNode>;

/// Type tag used by transform registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanNodeType {
    Source,
    Range,
    Project,
    Union,
    GeneralizedUnionProject,
}

/// A literal on-disk source, possibly a row-sliced view.
#[derive(Debug, Clone)]
pub struct SourceNode {
    pub columns: Vec<Sarray>,
    /// Column names carried over when the source wrapped a table.
    pub column_names: Option<Vec<String>>,
    pub begin_index: u64,
    pub end_index: u64,
}

impl SourceNode {
    /// Whether this source covers its underlying columns entirely (not a
    /// row-sliced view).
    pub fn covers_full_columns(&self) -> bool {
        self.begin_index == 0 && self.end_index == self.num_rows_total()
    }

    fn num_rows_total(&self) -> u64 {
        self.columns.first().map(|c| c.num_rows()).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub enum PlanNodeKind {
    Source(SourceNode),
    /// Synthesizes one integer column holding `start..stop`, lazily.
    Range { start: i64, stop: i64 },
    /// Select a column-index subset of the single input.
    Project { indices: Vec<usize> },
    /// Stack the columns of all (same-length) inputs side by side.
    Union,
    /// The fused normal form: output column `i` is fed by
    /// `inputs[index_map[i].0]`'s column `index_map[i].1`.
    GeneralizedUnionProject {
        index_map: Vec<(usize, usize)>,
        /// Cache: output column -> literal underlying column, attached by
        /// the optimizer when every input is a full-coverage source.
        direct_source: Option<Vec<Sarray>>,
    },
}

/// An immutable lazy operator node.
#[derive(Debug)]
pub struct PlanNode {
    kind: PlanNodeKind,
    inputs: Vec<PlanNodeRef>,
    output_types: Vec<ValueType>,
    /// Row count when inferable without execution; `None` otherwise.
    num_rows: Option<u64>,
}

impl PlanNode {
    /// Wrap a sealed table. Shares the table's column handles.
    pub fn source(frame: &Sframe) -> PlanNodeRef {
        frame.assert_aligned();
        let kind = PlanNodeKind::Source(SourceNode {
            columns: frame.columns().to_vec(),
            column_names: Some(frame.column_names().to_vec()),
            begin_index: 0,
            end_index: frame.num_rows(),
        });
        Self::build(kind, Vec::new()).expect("source construction is infallible")
    }

    /// Wrap a single column.
    pub fn source_column(column: Sarray) -> PlanNodeRef {
        let end = column.num_rows();
        let kind = PlanNodeKind::Source(SourceNode {
            columns: vec![column],
            column_names: None,
            begin_index: 0,
            end_index: end,
        });
        Self::build(kind, Vec::new()).expect("source construction is infallible")
    }

    /// Wrap a row-sliced view `[begin, end)` of a table's columns.
    pub fn source_slice(frame: &Sframe, begin: u64, end: u64) -> Result<PlanNodeRef> {
        frame.assert_aligned();
        if begin > end || end > frame.num_rows() {
            return Err(SframeError::new(format!(
                "Invalid source slice [{begin}, {end}) of {} rows",
                frame.num_rows()
            )));
        }
        let kind = PlanNodeKind::Source(SourceNode {
            columns: frame.columns().to_vec(),
            column_names: Some(frame.column_names().to_vec()),
            begin_index: begin,
            end_index: end,
        });
        Self::build(kind, Vec::new())
    }

    /// A lazily synthesized row-index column holding `start..stop`.
    pub fn range(start: i64, stop: i64) -> Result<PlanNodeRef> {
        if stop < start {
            return Err(SframeError::new(format!(
                "Invalid range [{start}, {stop})"
            )));
        }
        Self::build(PlanNodeKind::Range { start, stop }, Vec::new())
    }

    pub fn project(input: PlanNodeRef, indices: Vec<usize>) -> Result<PlanNodeRef> {
        for &idx in &indices {
            if idx >= input.num_columns() {
                return Err(SframeError::new(format!(
                    "Projection index {idx} out of range, input has {} columns",
                    input.num_columns()
                )));
            }
        }
        Self::build(PlanNodeKind::Project { indices }, vec![input])
    }

    pub fn union(inputs: Vec<PlanNodeRef>) -> Result<PlanNodeRef> {
        if inputs.is_empty() {
            return Err(SframeError::new("Union requires at least one input"));
        }
        let known: Vec<u64> = inputs.iter().filter_map(|i| i.num_rows()).collect();
        if known.windows(2).any(|w| w[0] != w[1]) {
            return Err(SframeError::new(
                "Union inputs must have identical row counts",
            ));
        }
        Self::build(PlanNodeKind::Union, inputs)
    }

    pub fn generalized_union_project(
        inputs: Vec<PlanNodeRef>,
        index_map: Vec<(usize, usize)>,
    ) -> Result<PlanNodeRef> {
        if inputs.is_empty() {
            return Err(SframeError::new(
                "Generalized union project requires at least one input",
            ));
        }
        for &(input_id, col_id) in &index_map {
            let input = inputs.get(input_id).ok_or_else(|| {
                SframeError::new(format!("Index map references missing input {input_id}"))
            })?;
            if col_id >= input.num_columns() {
                return Err(SframeError::new(format!(
                    "Index map references column {col_id} of input {input_id}, which has {} columns",
                    input.num_columns()
                )));
            }
        }
        let known: Vec<u64> = inputs.iter().filter_map(|i| i.num_rows()).collect();
        if known.windows(2).any(|w| w[0] != w[1]) {
            return Err(SframeError::new(
                "Generalized union project inputs must have identical row counts",
            ));
        }
        Self::build(
            PlanNodeKind::GeneralizedUnionProject {
                index_map,
                direct_source: None,
            },
            inputs,
        )
    }

    /// Rebuild a node from a kind and input list, recomputing metadata.
    /// Used by constructors and by the optimizer when rewiring inputs.
    pub(crate) fn build(kind: PlanNodeKind, inputs: Vec<PlanNodeRef>) -> Result<PlanNodeRef> {
        let output_types = Self::compute_output_types(&kind, &inputs)?;
        let num_rows = Self::infer_num_rows(&kind, &inputs);
        Ok(Arc::new(PlanNode {
            kind,
            inputs,
            output_types,
            num_rows,
        }))
    }

    fn compute_output_types(
        kind: &PlanNodeKind,
        inputs: &[PlanNodeRef],
    ) -> Result<Vec<ValueType>> {
        Ok(match kind {
            PlanNodeKind::Source(source) => {
                source.columns.iter().map(|c| c.value_type()).collect()
            }
            PlanNodeKind::Range { .. } => vec![ValueType::Integer],
            PlanNodeKind::Project { indices } => {
                let input = &inputs[0];
                indices
                    .iter()
                    .map(|&idx| input.output_types()[idx])
                    .collect()
            }
            PlanNodeKind::Union => inputs
                .iter()
                .flat_map(|i| i.output_types().iter().copied())
                .collect(),
            PlanNodeKind::GeneralizedUnionProject { index_map, .. } => index_map
                .iter()
                .map(|&(input_id, col_id)| inputs[input_id].output_types()[col_id])
                .collect(),
        })
    }

    fn infer_num_rows(kind: &PlanNodeKind, inputs: &[PlanNodeRef]) -> Option<u64> {
        match kind {
            PlanNodeKind::Source(source) => Some(source.end_index - source.begin_index),
            PlanNodeKind::Range { start, stop } => Some((stop - start) as u64),
            PlanNodeKind::Project { .. } => inputs[0].num_rows(),
            PlanNodeKind::Union | PlanNodeKind::GeneralizedUnionProject { .. } => {
                inputs.iter().find_map(|i| i.num_rows())
            }
        }
    }

    pub fn kind(&self) -> &PlanNodeKind {
        &self.kind
    }

    pub fn node_type(&self) -> PlanNodeType {
        match &self.kind {
            PlanNodeKind::Source(_) => PlanNodeType::Source,
            PlanNodeKind::Range { .. } => PlanNodeType::Range,
            PlanNodeKind::Project { .. } => PlanNodeType::Project,
            PlanNodeKind::Union => PlanNodeType::Union,
            PlanNodeKind::GeneralizedUnionProject { .. } => {
                PlanNodeType::GeneralizedUnionProject
            }
        }
    }

    pub fn inputs(&self) -> &[PlanNodeRef] {
        &self.inputs
    }

    /// Number of output columns. Always derived from the node's own
    /// semantics, never assumed equal to any input's column count.
    pub fn num_columns(&self) -> usize {
        self.output_types.len()
    }

    pub fn output_types(&self) -> &[ValueType] {
        &self.output_types
    }

    /// Output row count when inferable without executing the plan.
    pub fn num_rows(&self) -> Option<u64> {
        self.num_rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::Value;

    fn int_column(dir: &std::path::Path, name: &str, rows: i64) -> Sarray {
        Sarray::from_values(
            dir.join(name),
            ValueType::Integer,
            &(0..rows).map(Value::Integer).collect::<Vec<_>>(),
            2,
        )
        .unwrap()
    }

    #[test]
    fn metadata_inference() {
        let dir = tempfile::tempdir().unwrap();
        let col = int_column(dir.path(), "a", 10);
        let src = PlanNode::source_column(col);
        assert_eq!(Some(10), src.num_rows());
        assert_eq!(&[ValueType::Integer], src.output_types());

        let range = PlanNode::range(0, 10).unwrap();
        let union = PlanNode::union(vec![src.clone(), range]).unwrap();
        assert_eq!(2, union.num_columns());
        assert_eq!(Some(10), union.num_rows());

        let proj = PlanNode::project(union, vec![1, 1, 0]).unwrap();
        assert_eq!(3, proj.num_columns());
    }

    #[test]
    fn union_length_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = PlanNode::source_column(int_column(dir.path(), "a", 10));
        let b = PlanNode::source_column(int_column(dir.path(), "b", 5));
        assert!(PlanNode::union(vec![a, b]).is_err());
    }

    #[test]
    fn project_out_of_range_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = PlanNode::source_column(int_column(dir.path(), "a", 4));
        assert!(PlanNode::project(a, vec![1]).is_err());
    }

    #[test]
    fn gup_column_count_is_index_map_len() {
        let dir = tempfile::tempdir().unwrap();
        let a = PlanNode::source_column(int_column(dir.path(), "a", 4));
        let gup =
            PlanNode::generalized_union_project(vec![a], vec![(0, 0), (0, 0), (0, 0)]).unwrap();
        assert_eq!(3, gup.num_columns());
    }

    #[test]
    fn sliced_source_not_full_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let col = int_column(dir.path(), "a", 10);
        let frame = Sframe::new(vec![("a".to_string(), col)]).unwrap();
        let sliced = PlanNode::source_slice(&frame, 2, 7).unwrap();
        match sliced.kind() {
            PlanNodeKind::Source(s) => assert!(!s.covers_full_columns()),
            _ => unreachable!(),
        }
        assert_eq!(Some(5), sliced.num_rows());
    }
}
