//! External-memory sort.
//!
//! Sorting by key columns avoids moving value payloads through the
//! comparator: the key columns are sorted together with a synthesized row
//! index, the resulting permutation is inverted into a forward map, and
//! the value columns are scatter-permuted by the forward map in one
//! streaming pass. Small inputs and all-key tables skip the two-pass
//! machinery entirely.

pub mod permute;

use sframe_error::{Result, SframeError};
use tracing::debug;

use crate::array::Sarray;
use crate::config::EngineContext;
use crate::table::writer::SframeWriter;
use crate::table::Sframe;
use crate::util::parallel_for;
use crate::values::Value;

/// Row count at or below which the simple sort path is always taken.
const SORT_FAST_PATH_ROWS: u64 = 1000;

/// Value-column count below which all-small-typed tables take the simple
/// path.
const SORT_SMALL_VALUE_COLUMNS: usize = 20;

/// One sort key: column name plus direction.
#[derive(Debug, Clone)]
pub struct SortKey {
    pub column: String,
    pub ascending: bool,
}

impl SortKey {
    pub fn asc(column: impl Into<String>) -> SortKey {
        SortKey {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> SortKey {
        SortKey {
            column: column.into(),
            ascending: false,
        }
    }
}

/// Sort a table by key columns.
///
/// Output column order equals the input column order. Equal keys keep
/// their input row order (the sort is stable), so sorting an already
/// sorted table is a no-op on row content.
pub fn ec_sort(ctx: &EngineContext, frame: &Sframe, keys: &[SortKey]) -> Result<Sframe> {
    frame.assert_aligned();
    validate_keys(frame, keys)?;

    let num_rows = frame.num_rows();
    let key_indices: Vec<usize> = keys
        .iter()
        .map(|k| frame.column_index(&k.column))
        .collect::<Result<_>>()?;
    let value_indices: Vec<usize> = (0..frame.num_columns())
        .filter(|idx| !key_indices.contains(idx))
        .collect();

    // Path selection needs the cardinality; a lazy caller materializes
    // its plan before getting here.
    let types = frame.column_types();
    let take_simple_path = num_rows <= SORT_FAST_PATH_ROWS
        || value_indices.is_empty()
        || (value_indices.len() < SORT_SMALL_VALUE_COLUMNS
            && value_indices.iter().all(|&idx| types[idx].is_definitely_small()));

    if take_simple_path {
        debug!(num_rows, "sort taking simple path");
        simple_sort(ctx, frame, keys, &key_indices)
    } else {
        debug!(num_rows, "sort taking forward-map path");
        forward_map_sort(ctx, frame, keys, &key_indices, &value_indices)
    }
}

fn validate_keys(frame: &Sframe, keys: &[SortKey]) -> Result<()> {
    if keys.is_empty() {
        return Err(SframeError::new("Sort requires at least one key column"));
    }
    let mut seen: Vec<&str> = Vec::with_capacity(keys.len());
    for key in keys {
        if !frame.contains_column(&key.column) {
            return Err(SframeError::new(format!(
                "Sort key column '{}' does not exist",
                key.column
            )));
        }
        if seen.contains(&key.column.as_str()) {
            return Err(SframeError::new(format!(
                "Duplicate sort key column '{}'",
                key.column
            )));
        }
        seen.push(&key.column);
    }
    Ok(())
}

/// Rough per-value memory estimate for bucket sizing. Variable-width
/// types get a flat guess; exact sizes do not matter, only the order of
/// magnitude of buckets.
fn estimated_value_bytes(ty: crate::values::ValueType) -> u64 {
    if ty.is_definitely_small() {
        16
    } else {
        64
    }
}

fn compare_keys(a: &[Value], b: &[Value], key_indices: &[usize], keys: &[SortKey]) -> std::cmp::Ordering {
    for (key, &idx) in keys.iter().zip(key_indices) {
        let ord = a[idx].cmp(&b[idx]);
        let ord = if key.ascending { ord } else { ord.reverse() };
        if !ord.is_eq() {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

/// Sort the full rows in memory. Taken when rows are few or cheap enough
/// to move through the comparator directly.
fn simple_sort(
    ctx: &EngineContext,
    frame: &Sframe,
    keys: &[SortKey],
    key_indices: &[usize],
) -> Result<Sframe> {
    let reader = frame.reader(1);
    let mut rows = Vec::with_capacity(frame.num_rows() as usize);
    for segment in 0..reader.num_segments() {
        for row in reader.segment_iter(segment) {
            rows.push(row?);
        }
    }

    // Stable, so equal keys keep input order.
    rows.sort_by(|a, b| compare_keys(a, b, key_indices, keys));

    write_rows(ctx, frame, &rows)
}

/// The two-pass forward-map sort.
fn forward_map_sort(
    ctx: &EngineContext,
    frame: &Sframe,
    keys: &[SortKey],
    key_indices: &[usize],
    value_indices: &[usize],
) -> Result<Sframe> {
    let num_rows = frame.num_rows();

    // Pass 1: key columns paired with the row index, sorted by key. The
    // row index column is carried only to derive the permutation.
    let key_data: Vec<Vec<Value>> = key_indices
        .iter()
        .map(|&idx| frame.column_at(idx).to_vec())
        .collect::<Result<_>>()?;

    let mut order: Vec<u64> = (0..num_rows).collect();
    order.sort_by(|&a, &b| {
        for (key_pos, key) in keys.iter().enumerate() {
            let ord = key_data[key_pos][a as usize].cmp(&key_data[key_pos][b as usize]);
            let ord = if key.ascending { ord } else { ord.reverse() };
            if !ord.is_eq() {
                return ord;
            }
        }
        // Stability tie-break on the original row index.
        a.cmp(&b)
    });

    // `order` is the inverse map: output row i takes input row order[i].
    // Pass 2: invert it into the forward map, the scatter target of each
    // input row. (Equivalent to sorting (0..n, inverse) by the inverse
    // values, over two integer columns only.)
    let mut forward_map = vec![0u64; num_rows as usize];
    for (out_row, &in_row) in order.iter().enumerate() {
        forward_map[in_row as usize] = out_row as u64;
    }

    // Bucket count follows the memory budget: each bucket's resident
    // record batch has to fit the sort buffer during the gather pass.
    let types = frame.column_types();
    let row_bytes: u64 = value_indices
        .iter()
        .map(|&idx| estimated_value_bytes(types[idx]))
        .sum();
    let by_memory = (num_rows * row_bytes).div_ceil(ctx.config().sort_buffer_size as u64);
    let num_buckets = ctx
        .config()
        .default_num_segments
        .max(by_memory as usize)
        .max(1);
    let rows_per_bucket = num_rows.div_ceil(num_buckets as u64).max(1);

    // Value columns move exactly once, via the scatter.
    let value_columns: Vec<Sarray> = value_indices
        .iter()
        .map(|&idx| frame.column_at(idx).clone())
        .collect();
    let permuted =
        permute::permute_columns(ctx, &value_columns, &forward_map, num_buckets, rows_per_bucket)?;

    // Key columns are already in final order; write them with the same
    // segment boundaries as the permuted value columns.
    let mut sorted_keys = Vec::with_capacity(key_indices.len());
    for (key_pos, &idx) in key_indices.iter().enumerate() {
        let values = &key_data[key_pos];
        let mut writer = crate::array::writer::SarrayWriter::open(
            ctx.scratch_prefix("sortkey"),
            frame.column_at(idx).value_type(),
            num_buckets,
        )?;
        let handles = parking_lot::Mutex::new(
            (0..num_buckets)
                .map(|b| writer.segment_writer(b).map(Some))
                .collect::<Result<Vec<_>>>()?,
        );
        parallel_for(num_buckets, |bucket| {
            let mut seg = handles.lock()[bucket].take().expect("bucket taken once");
            let start = (bucket as u64 * rows_per_bucket).min(num_rows);
            let end = ((bucket as u64 + 1) * rows_per_bucket).min(num_rows);
            for out_row in start..end {
                seg.write_value(&values[order[out_row as usize] as usize])?;
            }
            handles.lock()[bucket] = Some(seg);
            Ok(())
        })?;
        for (bucket, slot) in handles.into_inner().into_iter().enumerate() {
            writer.return_segment_writer(bucket, slot.expect("bucket returned"))?;
        }
        sorted_keys.push(writer.close()?);
    }

    // Reassemble with columns at their original positions.
    let mut columns: Vec<Option<Sarray>> = vec![None; frame.num_columns()];
    for (key_pos, &idx) in key_indices.iter().enumerate() {
        columns[idx] = Some(sorted_keys[key_pos].clone());
    }
    for (value_pos, &idx) in value_indices.iter().enumerate() {
        columns[idx] = Some(permuted[value_pos].clone());
    }

    let pairs: Vec<(String, Sarray)> = frame
        .column_names()
        .iter()
        .cloned()
        .zip(columns.into_iter().map(|c| c.expect("all columns placed")))
        .collect();
    Sframe::new(pairs)
}

/// Write fully ordered rows out through an aligned table writer.
fn write_rows(ctx: &EngineContext, frame: &Sframe, rows: &[Vec<Value>]) -> Result<Sframe> {
    let num_segments = ctx.config().default_num_segments.max(1);
    let per_segment = (rows.len() as u64).div_ceil(num_segments as u64).max(1);

    let mut writer = SframeWriter::open(
        frame.column_names(),
        &frame.column_types(),
        ctx.scratch_prefix("sorted"),
        num_segments,
    )?;

    let outputs = parking_lot::Mutex::new(
        (0..num_segments)
            .map(|seg| writer.segment_output(seg).map(Some))
            .collect::<Result<Vec<_>>>()?,
    );
    parallel_for(num_segments, |seg| {
        let mut out = outputs.lock()[seg].take().expect("segment taken once");
        let start = ((seg as u64 * per_segment) as usize).min(rows.len());
        let end = (((seg as u64 + 1) * per_segment) as usize).min(rows.len());
        for row in &rows[start..end] {
            out.write_row(row)?;
        }
        outputs.lock()[seg] = Some(out);
        Ok(())
    })?;
    for slot in outputs.into_inner() {
        writer.return_segment_output(slot.expect("segment returned"))?;
    }
    writer.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::values::ValueType;

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

    #[test]
    fn concrete_scenario_small() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let frame = frame_from(
            dir.path(),
            &[
                (
                    "k",
                    ValueType::Integer,
                    vec![3.into(), 1.into(), 2.into()],
                ),
                (
                    "val",
                    ValueType::String,
                    vec!["c".into(), "a".into(), "b".into()],
                ),
            ],
        );

        let sorted = ec_sort(&ctx, &frame, &[SortKey::asc("k")]).unwrap();
        assert_eq!(&["k".to_string(), "val".to_string()], sorted.column_names());
        assert_eq!(
            vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)],
            sorted.column("k").unwrap().to_vec().unwrap()
        );
        assert_eq!(
            vec![Value::from("a"), Value::from("b"), Value::from("c")],
            sorted.column("val").unwrap().to_vec().unwrap()
        );
    }

    #[test]
    fn descending_key() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let frame = frame_from(
            dir.path(),
            &[(
                "k",
                ValueType::Integer,
                vec![2.into(), 3.into(), 1.into()],
            )],
        );
        let sorted = ec_sort(&ctx, &frame, &[SortKey::desc("k")]).unwrap();
        assert_eq!(
            vec![Value::Integer(3), Value::Integer(2), Value::Integer(1)],
            sorted.column("k").unwrap().to_vec().unwrap()
        );
    }

    #[test]
    fn validation_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let frame = frame_from(
            dir.path(),
            &[("k", ValueType::Integer, vec![1.into()])],
        );
        assert!(ec_sort(&ctx, &frame, &[]).is_err());
        assert!(ec_sort(&ctx, &frame, &[SortKey::asc("missing")]).is_err());
        assert!(
            ec_sort(&ctx, &frame, &[SortKey::asc("k"), SortKey::asc("k")]).is_err()
        );
    }

    #[test]
    fn general_path_matches_simple_path() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        // Strings are not "definitely small", so >1000 rows forces the
        // forward-map path; the same data sorted row-by-row in memory is
        // the reference.
        let n = 3000i64;
        let key_values: Vec<Value> = (0..n).map(|i| Value::Integer((i * 7919) % 101)).collect();
        let value_values: Vec<Value> = (0..n).map(|i| Value::from(format!("row{i}"))).collect();
        let frame = frame_from(
            dir.path(),
            &[
                ("k", ValueType::Integer, key_values.clone()),
                ("v", ValueType::String, value_values.clone()),
            ],
        );

        let sorted = ec_sort(&ctx, &frame, &[SortKey::asc("k")]).unwrap();

        let mut reference: Vec<(Value, Value)> = key_values
            .into_iter()
            .zip(value_values)
            .collect();
        reference.sort_by(|a, b| a.0.cmp(&b.0));

        let out_k = sorted.column("k").unwrap().to_vec().unwrap();
        let out_v = sorted.column("v").unwrap().to_vec().unwrap();
        for (i, (k, v)) in reference.into_iter().enumerate() {
            assert_eq!(k, out_k[i]);
            assert_eq!(v, out_v[i], "row {i} value mismatch");
        }
    }

    #[test]
    fn sort_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let frame = frame_from(
            dir.path(),
            &[
                (
                    "k",
                    ValueType::Integer,
                    vec![2.into(), 1.into(), 2.into(), 1.into()],
                ),
                (
                    "v",
                    ValueType::String,
                    vec!["p".into(), "q".into(), "r".into(), "s".into()],
                ),
            ],
        );

        let once = ec_sort(&ctx, &frame, &[SortKey::asc("k")]).unwrap();
        let twice = ec_sort(&ctx, &once, &[SortKey::asc("k")]).unwrap();
        for name in ["k", "v"] {
            assert_eq!(
                once.column(name).unwrap().to_vec().unwrap(),
                twice.column(name).unwrap().to_vec().unwrap()
            );
        }
        // Stability: equal keys keep input order.
        assert_eq!(
            vec![
                Value::from("q"),
                Value::from("s"),
                Value::from("p"),
                Value::from("r")
            ],
            once.column("v").unwrap().to_vec().unwrap()
        );
    }

    #[test]
    fn undefined_sorts_first_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let frame = frame_from(
            dir.path(),
            &[(
                "k",
                ValueType::Integer,
                vec![Value::Integer(5), Value::Undefined, Value::Integer(1)],
            )],
        );
        let sorted = ec_sort(&ctx, &frame, &[SortKey::asc("k")]).unwrap();
        assert_eq!(
            vec![Value::Undefined, Value::Integer(1), Value::Integer(5)],
            sorted.column("k").unwrap().to_vec().unwrap()
        );
    }
}
