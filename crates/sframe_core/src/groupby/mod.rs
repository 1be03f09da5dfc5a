//! Grouped aggregation.
//!
//! `groupby_aggregate` validates the request up front, projects the
//! table down to the columns it actually needs, routes rows into a
//! partitioned hash container, and writes one output segment per
//! partition. Output rows carry the key columns first, then one column
//! per aggregation, sorted by key within each segment.

pub mod aggregate;
pub mod container;

use ahash::AHashMap;
use sframe_error::{Result, SframeError};
use tracing::debug;

use crate::config::EngineContext;
use crate::groupby::aggregate::aggregator_for;
use crate::groupby::container::{AggregatorSpec, GroupbyContainer};
use crate::table::writer::SframeWriter;
use crate::table::Sframe;
use crate::util::parallel_for;
use crate::values::ValueType;

/// One requested aggregation: the operator name, its input columns, and
/// an optional explicit output column name.
#[derive(Debug, Clone)]
pub struct GroupDescriptor {
    pub columns: Vec<String>,
    pub op: String,
    pub output_name: Option<String>,
}

impl GroupDescriptor {
    pub fn new(op: impl Into<String>, column: impl Into<String>) -> GroupDescriptor {
        GroupDescriptor {
            columns: vec![column.into()],
            op: op.into(),
            output_name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> GroupDescriptor {
        self.output_name = Some(name.into());
        self
    }
}

/// Group `frame` by the key columns and compute every requested
/// aggregation per group.
pub fn groupby_aggregate(
    ctx: &EngineContext,
    frame: &Sframe,
    key_columns: &[String],
    groups: &[GroupDescriptor],
) -> Result<Sframe> {
    frame.assert_aligned();
    if key_columns.is_empty() {
        return Err(SframeError::new("Groupby requires at least one key column"));
    }

    // Operator lookup and arity first.
    let mut templates = Vec::with_capacity(groups.len());
    for group in groups {
        let template = aggregator_for(&group.op)?;
        if group.columns.len() != template.num_input_columns() {
            return Err(SframeError::new(format!(
                "Operator '{}' takes {} input column(s), got {}",
                group.op,
                template.num_input_columns(),
                group.columns.len()
            )));
        }
        templates.push(template);
    }

    // Output names: keys, then one per aggregation. Explicit names must
    // be unique; generated names dodge collisions with a numeric suffix.
    let mut names: Vec<String> = Vec::with_capacity(key_columns.len() + groups.len());
    for key in key_columns {
        if names.contains(key) {
            return Err(SframeError::new(format!("Duplicate key column '{key}'")));
        }
        names.push(key.clone());
    }
    for group in groups {
        let name = match &group.output_name {
            Some(name) => {
                if names.contains(name) {
                    return Err(SframeError::new(format!(
                        "Duplicate output column name '{name}'"
                    )));
                }
                name.clone()
            }
            None => {
                let base = format!("{} of {}", group.op, group.columns[0]);
                let mut candidate = base.clone();
                let mut suffix = 1;
                while names.contains(&candidate) {
                    candidate = format!("{base}.{suffix}");
                    suffix += 1;
                }
                candidate
            }
        };
        names.push(name);
    }

    // Column existence.
    for key in key_columns {
        if !frame.contains_column(key) {
            return Err(SframeError::new(format!(
                "Key column '{key}' does not exist"
            )));
        }
    }
    for group in groups {
        for column in &group.columns {
            if !frame.contains_column(column) {
                return Err(SframeError::new(format!(
                    "Aggregation column '{column}' does not exist"
                )));
            }
        }
    }

    // Type support, and output types via set_input_types. Only the
    // first input column is type-constrained; the companion column of a
    // two-column operator passes through untouched.
    let mut output_types: Vec<ValueType> = key_columns
        .iter()
        .map(|key| Ok(frame.column(key)?.value_type()))
        .collect::<Result<_>>()?;
    for (group, template) in groups.iter().zip(templates.iter_mut()) {
        let input_types: Vec<ValueType> = group
            .columns
            .iter()
            .map(|c| Ok(frame.column(c)?.value_type()))
            .collect::<Result<_>>()?;
        if !template.support_type(input_types[0]) {
            return Err(SframeError::new(format!(
                "Operator '{}' does not support column '{}' of type {}",
                group.op,
                group.columns[0],
                input_types[0].name()
            )));
        }
        output_types.push(template.set_input_types(&input_types)?);
    }

    // Project to the columns the aggregation touches, keys first.
    let mut positions: AHashMap<&str, usize> =
        AHashMap::with_hasher(crate::values::map_state());
    let mut projection: Vec<&str> = Vec::new();
    for key in key_columns {
        positions.insert(key, projection.len());
        projection.push(key);
    }
    let mut specs = Vec::with_capacity(groups.len());
    for (group, template) in groups.iter().zip(templates) {
        let input_columns = group
            .columns
            .iter()
            .map(|column| {
                *positions.entry(column).or_insert_with(|| {
                    projection.push(column);
                    projection.len() - 1
                })
            })
            .collect();
        specs.push(AggregatorSpec {
            template,
            input_columns,
        });
    }
    let projected = frame.select_columns(&projection)?;

    let num_workers = ctx.config().num_workers.max(1);
    let src_segments = frame
        .columns()
        .iter()
        .map(|c| c.num_segments())
        .max()
        .unwrap_or(1);
    let log2_workers = (usize::BITS - 1 - num_workers.leading_zeros()) as usize;
    let num_partitions = src_segments.max(num_workers * log2_workers.max(1));
    debug!(
        num_partitions,
        num_keys = key_columns.len(),
        num_groups = groups.len(),
        "starting groupby aggregation"
    );

    let container = GroupbyContainer::new(ctx, key_columns.len(), specs, num_partitions);
    let reader = projected.reader(num_workers);
    parallel_for(reader.num_segments(), |segment| {
        for row in reader.segment_iter(segment) {
            container.add(&row?)?;
        }
        Ok(())
    })?;

    let mut writer = SframeWriter::open(
        &names,
        &output_types,
        ctx.scratch_prefix("groupby-out"),
        num_partitions,
    )?;
    let outputs = (0..num_partitions)
        .map(|p| writer.segment_output(p))
        .collect::<Result<Vec<_>>>()?;
    let outputs = container.finalize(outputs)?;
    for output in outputs {
        writer.return_segment_output(output)?;
    }
    writer.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Sarray;
    use crate::config::EngineConfig;
    use crate::values::Value;

    fn context(dir: &std::path::Path) -> EngineContext {
        EngineContext::new(EngineConfig::default(), dir.join("scratch")).unwrap()
    }

    fn frame_from(
        dir: &std::path::Path,
        cols: &[(&str, ValueType, Vec<Value>)],
    ) -> Sframe {
        let mut pairs = Vec::new();
        for (name, ty, values) in cols {
            let arr =
                Sarray::from_values(dir.join(format!("in-{name}")), *ty, values, 2).unwrap();
            pairs.push((name.to_string(), arr));
        }
        Sframe::new(pairs).unwrap()
    }

    fn sorted_rows(frame: &Sframe) -> Vec<Vec<Value>> {
        let reader = frame.reader(1);
        let mut out = Vec::new();
        reader.read_rows(0, frame.num_rows(), &mut out).unwrap();
        out.sort();
        out
    }

    #[test]
    fn concrete_sum_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let frame = frame_from(
            dir.path(),
            &[
                (
                    "g",
                    ValueType::Integer,
                    vec![1.into(), 1.into(), 2.into(), 2.into(), 2.into()],
                ),
                (
                    "v",
                    ValueType::Integer,
                    vec![10.into(), 20.into(), 1.into(), 2.into(), 3.into()],
                ),
            ],
        );

        let out = groupby_aggregate(
            &ctx,
            &frame,
            &["g".to_string()],
            &[GroupDescriptor::new("sum", "v").named("s")],
        )
        .unwrap();

        assert_eq!(&["g".to_string(), "s".to_string()], out.column_names());
        assert_eq!(
            vec![
                vec![Value::Integer(1), Value::Integer(30)],
                vec![Value::Integer(2), Value::Integer(6)],
            ],
            sorted_rows(&out)
        );
    }

    #[test]
    fn generated_names_get_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let frame = frame_from(
            dir.path(),
            &[
                ("g", ValueType::Integer, vec![1.into(), 2.into()]),
                ("v", ValueType::Integer, vec![3.into(), 4.into()]),
            ],
        );

        let out = groupby_aggregate(
            &ctx,
            &frame,
            &["g".to_string()],
            &[
                GroupDescriptor::new("sum", "v"),
                GroupDescriptor::new("sum", "v"),
            ],
        )
        .unwrap();
        assert_eq!(
            &[
                "g".to_string(),
                "sum of v".to_string(),
                "sum of v.1".to_string()
            ],
            out.column_names()
        );
    }

    #[test]
    fn validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let frame = frame_from(
            dir.path(),
            &[
                ("g", ValueType::Integer, vec![1.into()]),
                ("s", ValueType::String, vec!["x".into()]),
            ],
        );

        // No keys.
        assert!(groupby_aggregate(&ctx, &frame, &[], &[]).is_err());
        // Missing key column.
        assert!(groupby_aggregate(&ctx, &frame, &["nope".to_string()], &[]).is_err());
        // Unknown operator.
        assert!(groupby_aggregate(
            &ctx,
            &frame,
            &["g".to_string()],
            &[GroupDescriptor::new("median", "g")]
        )
        .is_err());
        // Unsupported input type.
        assert!(groupby_aggregate(
            &ctx,
            &frame,
            &["g".to_string()],
            &[GroupDescriptor::new("sum", "s")]
        )
        .is_err());
        // Wrong arity for a two-column operator.
        assert!(groupby_aggregate(
            &ctx,
            &frame,
            &["g".to_string()],
            &[GroupDescriptor::new("argmax", "g")]
        )
        .is_err());
        // Explicit output name colliding with a key.
        assert!(groupby_aggregate(
            &ctx,
            &frame,
            &["g".to_string()],
            &[GroupDescriptor::new("count", "g").named("g")]
        )
        .is_err());
    }

    #[test]
    fn argmax_companion_column() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let frame = frame_from(
            dir.path(),
            &[
                (
                    "g",
                    ValueType::Integer,
                    vec![1.into(), 1.into(), 2.into(), 2.into()],
                ),
                (
                    "score",
                    ValueType::Integer,
                    vec![5.into(), 9.into(), 3.into(), 1.into()],
                ),
                (
                    "label",
                    ValueType::String,
                    vec!["a".into(), "b".into(), "c".into(), "d".into()],
                ),
            ],
        );

        let mut descriptor = GroupDescriptor::new("argmax", "score");
        descriptor.columns.push("label".to_string());
        let out = groupby_aggregate(&ctx, &frame, &["g".to_string()], &[descriptor]).unwrap();

        assert_eq!(
            &["g".to_string(), "argmax of score".to_string()],
            out.column_names()
        );
        assert_eq!(
            vec![
                vec![Value::Integer(1), Value::from("b")],
                vec![Value::Integer(2), Value::from("c")],
            ],
            sorted_rows(&out)
        );
    }

    #[test]
    fn keys_may_contain_undefined() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let frame = frame_from(
            dir.path(),
            &[
                (
                    "g",
                    ValueType::Integer,
                    vec![Value::Undefined, 1.into(), Value::Undefined],
                ),
                (
                    "v",
                    ValueType::Integer,
                    vec![10.into(), 20.into(), 30.into()],
                ),
            ],
        );

        let out = groupby_aggregate(
            &ctx,
            &frame,
            &["g".to_string()],
            &[GroupDescriptor::new("sum", "v").named("s")],
        )
        .unwrap();
        assert_eq!(
            vec![
                vec![Value::Undefined, Value::Integer(40)],
                vec![Value::Integer(1), Value::Integer(20)],
            ],
            sorted_rows(&out)
        );
    }

    #[test]
    fn result_independent_of_partition_count() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let n = 500i64;
        let frame = frame_from(
            dir.path(),
            &[
                (
                    "g",
                    ValueType::Integer,
                    (0..n).map(|i| Value::Integer(i % 7)).collect(),
                ),
                (
                    "v",
                    ValueType::Integer,
                    (0..n).map(Value::Integer).collect(),
                ),
            ],
        );

        let groups = [
            GroupDescriptor::new("sum", "v").named("s"),
            GroupDescriptor::new("count", "v").named("c"),
            GroupDescriptor::new("mean", "v").named("m"),
        ];
        let out = groupby_aggregate(&ctx, &frame, &["g".to_string()], &groups).unwrap();
        assert_eq!(7, out.num_rows());

        let rows = sorted_rows(&out);
        for row in rows {
            let Value::Integer(g) = row[0] else { panic!("key") };
            let expected_sum: i64 = (0..n).filter(|i| i % 7 == g).sum();
            let expected_count = (0..n).filter(|i| i % 7 == g).count() as i64;
            assert_eq!(Value::Integer(expected_sum), row[1]);
            assert_eq!(Value::Integer(expected_count), row[2]);
            assert_eq!(
                Value::Float(expected_sum as f64 / expected_count as f64),
                row[3]
            );
        }
    }
}
