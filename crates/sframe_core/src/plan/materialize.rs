//! Plan execution.
//!
//! Materialization optimizes the DAG, then executes it leaves-to-root.
//! Union, project, and generalized union-project are column-level
//! operators here, so execution mostly rewires shared column handles;
//! actual row copies happen only for sliced sources and range synthesis.

use std::collections::HashMap;

use sframe_error::{Result, SframeError};

use crate::array::writer::SarrayWriter;
use crate::array::Sarray;
use crate::config::EngineContext;
use crate::table::Sframe;
use crate::util::parallel_for;
use crate::values::{Value, ValueType};

use super::node::{PlanNode, PlanNodeKind, PlanNodeRef, SourceNode};
use super::optimizer::Optimizer;

/// Entry point for executing plans.
#[derive(Debug)]
pub struct Planner {
    ctx: EngineContext,
    optimizer: Optimizer,
}

impl Planner {
    pub fn new(ctx: EngineContext) -> Planner {
        Planner {
            ctx,
            optimizer: Optimizer::new(),
        }
    }

    /// Execute a plan into a concrete table.
    ///
    /// A root that is a pure source wrapping a sealed table is returned
    /// as-is without copying. Column names are preserved when the root
    /// node carries them; otherwise columns are named `X1`, `X2`, ....
    pub fn materialize(&self, root: &PlanNodeRef) -> Result<Sframe> {
        // Reuse an already-computed table outright.
        if let PlanNodeKind::Source(source) = root.kind() {
            if source.covers_full_columns() {
                return source_frame(source);
            }
        }

        let optimized = self.optimizer.optimize(root.clone())?;

        let mut memo: HashMap<*const PlanNode, Vec<Sarray>> = HashMap::new();
        let columns = self.execute(&optimized, &mut memo)?;

        let names: Vec<String> = match optimized.kind() {
            PlanNodeKind::Source(source) if source.column_names.is_some() => {
                source.column_names.clone().expect("checked")
            }
            _ => (1..=columns.len()).map(|i| format!("X{i}")).collect(),
        };
        Sframe::new(names.into_iter().zip(columns).collect())
    }

    /// Materialize a plan without optimizing it first. Reference path for
    /// testing optimizer correctness.
    pub fn materialize_naive(&self, root: &PlanNodeRef) -> Result<Sframe> {
        let mut memo: HashMap<*const PlanNode, Vec<Sarray>> = HashMap::new();
        let columns = self.execute(root, &mut memo)?;
        let names: Vec<String> = (1..=columns.len()).map(|i| format!("X{i}")).collect();
        Sframe::new(names.into_iter().zip(columns).collect())
    }

    /// Execute a node into its output columns, memoized by node identity
    /// so shared subexpressions run once.
    fn execute(
        &self,
        node: &PlanNodeRef,
        memo: &mut HashMap<*const PlanNode, Vec<Sarray>>,
    ) -> Result<Vec<Sarray>> {
        let key = PlanNodeRef::as_ptr(node);
        if let Some(columns) = memo.get(&key) {
            return Ok(columns.clone());
        }

        let columns = match node.kind() {
            PlanNodeKind::Source(source) => {
                if source.covers_full_columns() {
                    source.columns.clone()
                } else {
                    self.copy_source_slice(source)?
                }
            }
            PlanNodeKind::Range { start, stop } => {
                vec![self.write_range_column(*start, *stop)?]
            }
            PlanNodeKind::Project { indices } => {
                let input = self.execute(&node.inputs()[0], memo)?;
                indices.iter().map(|&idx| input[idx].clone()).collect()
            }
            PlanNodeKind::Union => {
                let mut all = Vec::with_capacity(node.num_columns());
                let mut row_count = None;
                for input in node.inputs() {
                    let cols = self.execute(input, memo)?;
                    if let Some(first) = cols.first() {
                        let rows = first.num_rows();
                        match row_count {
                            None => row_count = Some(rows),
                            Some(expected) => assert_eq!(
                                expected, rows,
                                "union executed over misaligned inputs"
                            ),
                        }
                    }
                    all.extend(cols);
                }
                all
            }
            PlanNodeKind::GeneralizedUnionProject {
                index_map,
                direct_source,
            } => {
                if let Some(mapping) = direct_source {
                    // Link outputs straight to the physical columns.
                    mapping.clone()
                } else {
                    let mut input_columns = Vec::with_capacity(node.inputs().len());
                    for input in node.inputs() {
                        input_columns.push(self.execute(input, memo)?);
                    }
                    index_map
                        .iter()
                        .map(|&(input_id, col_id)| input_columns[input_id][col_id].clone())
                        .collect()
                }
            }
        };

        memo.insert(key, columns.clone());
        Ok(columns)
    }

    /// Copy rows `[begin, end)` of each source column into fresh columns.
    fn copy_source_slice(&self, source: &SourceNode) -> Result<Vec<Sarray>> {
        let num_segments = self.ctx.config().default_num_segments.max(1);
        let rows = source.end_index - source.begin_index;
        let per_segment = rows.div_ceil(num_segments as u64).max(1);

        let mut out = Vec::with_capacity(source.columns.len());
        for column in &source.columns {
            let mut writer = SarrayWriter::open(
                self.ctx.scratch_prefix("slice"),
                column.value_type(),
                num_segments,
            )?;
            let handles: Vec<_> = (0..num_segments)
                .map(|seg| writer.segment_writer(seg))
                .collect::<Result<_>>()?;
            let reader = column.reader();

            let finished: Vec<(usize, _)> = crate::util::parallel_map(
                handles.len(),
                {
                    let handles = parking_lot::Mutex::new(
                        handles.into_iter().map(Some).collect::<Vec<_>>(),
                    );
                    move |seg| {
                        let mut seg_writer =
                            handles.lock()[seg].take().expect("segment taken once");
                        let start = source.begin_index + (seg as u64 * per_segment).min(rows);
                        let end = source.begin_index + ((seg as u64 + 1) * per_segment).min(rows);
                        let mut buf = Vec::new();
                        reader.read_rows(start, end, &mut buf)?;
                        seg_writer.write_values(&buf)?;
                        Ok((seg, seg_writer))
                    }
                },
            )?;
            for (seg, seg_writer) in finished {
                writer.return_segment_writer(seg, seg_writer)?;
            }
            out.push(writer.close()?);
        }
        Ok(out)
    }

    /// Write a synthesized integer column holding `start..stop`.
    fn write_range_column(&self, start: i64, stop: i64) -> Result<Sarray> {
        let num_segments = self.ctx.config().default_num_segments.max(1);
        let rows = (stop - start) as u64;
        let per_segment = rows.div_ceil(num_segments as u64).max(1);

        let mut writer = SarrayWriter::open(
            self.ctx.scratch_prefix("range"),
            ValueType::Integer,
            num_segments,
        )?;
        let handles = parking_lot::Mutex::new(
            (0..num_segments)
                .map(|seg| writer.segment_writer(seg).map(Some))
                .collect::<Result<Vec<_>>>()?,
        );

        let finished = parking_lot::Mutex::new(Vec::with_capacity(num_segments));
        parallel_for(num_segments, |seg| {
            let mut seg_writer = handles.lock()[seg].take().expect("segment taken once");
            let seg_start = start + ((seg as u64 * per_segment).min(rows) as i64);
            let seg_end = start + (((seg as u64 + 1) * per_segment).min(rows) as i64);
            for v in seg_start..seg_end {
                seg_writer.write_value(&Value::Integer(v))?;
            }
            finished.lock().push((seg, seg_writer));
            Ok(())
        })?;

        for (seg, seg_writer) in finished.into_inner() {
            writer.return_segment_writer(seg, seg_writer)?;
        }
        writer.close()
    }
}

fn source_frame(source: &SourceNode) -> Result<Sframe> {
    let names: Vec<String> = match &source.column_names {
        Some(names) => names.clone(),
        None => (1..=source.columns.len())
            .map(|i| format!("X{i}"))
            .collect(),
    };
    if names.len() != source.columns.len() {
        return Err(SframeError::new("Source column name count mismatch"));
    }
    Sframe::new(names.into_iter().zip(source.columns.iter().cloned()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn context(dir: &std::path::Path) -> EngineContext {
        EngineContext::new(EngineConfig::default(), dir.join("scratch")).unwrap()
    }

    fn int_frame(dir: &std::path::Path, name: &str, rows: i64) -> Sframe {
        let col = Sarray::from_values(
            dir.join(name),
            ValueType::Integer,
            &(0..rows).map(Value::Integer).collect::<Vec<_>>(),
            2,
        )
        .unwrap();
        Sframe::new(vec![(name.to_string(), col)]).unwrap()
    }

    #[test]
    fn pure_source_is_reused_not_copied() {
        let dir = tempfile::tempdir().unwrap();
        let frame = int_frame(dir.path(), "a", 10);
        let planner = Planner::new(context(dir.path()));

        let out = planner.materialize(&PlanNode::source(&frame)).unwrap();
        assert_eq!(frame.column_names(), out.column_names());
        assert!(out.column("a").unwrap().same_column(frame.column("a").unwrap()));
    }

    #[test]
    fn range_materializes_row_indices() {
        let dir = tempfile::tempdir().unwrap();
        let planner = Planner::new(context(dir.path()));
        let range = PlanNode::range(0, 2500).unwrap();

        let out = planner.materialize(&range).unwrap();
        assert_eq!(2500, out.num_rows());
        let expected: Vec<Value> = (0..2500).map(Value::Integer).collect();
        assert_eq!(expected, out.column_at(0).to_vec().unwrap());
    }

    #[test]
    fn sliced_source_copies_range() {
        let dir = tempfile::tempdir().unwrap();
        let frame = int_frame(dir.path(), "a", 100);
        let planner = Planner::new(context(dir.path()));

        let sliced = PlanNode::source_slice(&frame, 10, 25).unwrap();
        let out = planner.materialize(&sliced).unwrap();
        assert_eq!(15, out.num_rows());
        let expected: Vec<Value> = (10..25).map(Value::Integer).collect();
        assert_eq!(expected, out.column_at(0).to_vec().unwrap());
        // A sliced view is a copy, not the original column.
        assert!(!out.column_at(0).same_column(frame.column("a").unwrap()));
    }

    #[test]
    fn fused_plan_links_directly_to_sources() {
        let dir = tempfile::tempdir().unwrap();
        let a = int_frame(dir.path(), "a", 8);
        let b = int_frame(dir.path(), "b", 8);
        let planner = Planner::new(context(dir.path()));

        let union =
            PlanNode::union(vec![PlanNode::source(&a), PlanNode::source(&b)]).unwrap();
        let project = PlanNode::project(union, vec![1, 0]).unwrap();

        let out = planner.materialize(&project).unwrap();
        assert_eq!(2, out.num_columns());
        // Output columns are the physical source columns, no copy.
        assert!(out.column_at(0).same_column(b.column("b").unwrap()));
        assert!(out.column_at(1).same_column(a.column("a").unwrap()));
    }

    #[test]
    fn empty_projection() {
        let dir = tempfile::tempdir().unwrap();
        let frame = int_frame(dir.path(), "a", 8);
        let planner = Planner::new(context(dir.path()));

        let project = PlanNode::project(PlanNode::source(&frame), vec![]).unwrap();
        let out = planner.materialize(&project).unwrap();
        assert_eq!(0, out.num_columns());
    }

    #[test]
    fn optimized_matches_naive() {
        let dir = tempfile::tempdir().unwrap();
        let a = int_frame(dir.path(), "a", 12);
        let b = int_frame(dir.path(), "b", 12);
        let planner = Planner::new(context(dir.path()));

        let src_a = PlanNode::source(&a);
        let src_b = PlanNode::source(&b);
        let union = PlanNode::union(vec![src_a.clone(), src_b]).unwrap();
        let proj = PlanNode::project(union, vec![1, 1, 0]).unwrap();
        let outer = PlanNode::union(vec![proj, src_a]).unwrap();

        let optimized = planner.materialize(&outer).unwrap();
        let naive = planner.materialize_naive(&outer).unwrap();

        assert_eq!(naive.num_columns(), optimized.num_columns());
        for idx in 0..naive.num_columns() {
            assert_eq!(
                naive.column_at(idx).to_vec().unwrap(),
                optimized.column_at(idx).to_vec().unwrap()
            );
        }
    }
}
