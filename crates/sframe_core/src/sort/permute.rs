//! Forward-map scatter permutation.
//!
//! Moves value columns into sorted order with one sequential read and one
//! bucketed write per column, instead of pushing the values through the
//! sort comparator. Each bucket covers a contiguous range of output rows
//! and becomes one output segment.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write as _};
use std::path::PathBuf;

use sframe_error::{Result, ResultExt, SframeError};
use tracing::warn;

use crate::array::writer::SarrayWriter;
use crate::array::Sarray;
use crate::config::EngineContext;
use crate::util::parallel_for;
use crate::values::encoding::{decode_value, encode_value, read_u64, write_u64};
use crate::values::Value;

/// Scatter-permute `columns` by `forward_map`: input row `i` lands at
/// output row `forward_map[i]`.
///
/// The forward map must be a permutation of `0..len`. Output columns get
/// `num_buckets` segments of `rows_per_bucket` rows each (last one
/// short). Columns are processed in parallel; within a column the input
/// is read once sequentially.
pub fn permute_columns(
    ctx: &EngineContext,
    columns: &[Sarray],
    forward_map: &[u64],
    num_buckets: usize,
    rows_per_bucket: u64,
) -> Result<Vec<Sarray>> {
    debug_assert!(num_buckets > 0 && rows_per_bucket > 0);
    debug_assert!(columns.iter().all(|c| c.num_rows() as usize == forward_map.len()));

    let out = crate::util::parallel_map(columns.len(), |col_idx| {
        permute_one_column(ctx, &columns[col_idx], forward_map, num_buckets, rows_per_bucket)
    })?;
    Ok(out)
}

fn permute_one_column(
    ctx: &EngineContext,
    column: &Sarray,
    forward_map: &[u64],
    num_buckets: usize,
    rows_per_bucket: u64,
) -> Result<Sarray> {
    // Scatter phase: append (target row, value) records to bucket files.
    let mut bucket_paths = Vec::with_capacity(num_buckets);
    let mut bucket_files = Vec::with_capacity(num_buckets);
    for bucket in 0..num_buckets {
        let path = ctx.scratch_prefix(&format!("permute-b{bucket:04}"));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .context_fn(|| format!("Failed to create bucket file '{}'", path.display()))?;
        bucket_paths.push(path);
        bucket_files.push(BufWriter::new(file));
    }

    let reader = column.reader();
    let mut buf = Vec::new();
    let mut row = 0u64;
    let total = column.num_rows();
    let mut bucket_counts = vec![0u64; num_buckets];
    while row < total {
        let end = (row + 8192).min(total);
        reader.read_rows(row, end, &mut buf)?;
        for value in &buf {
            let target = forward_map[row as usize];
            let bucket = (target / rows_per_bucket) as usize;
            let out = &mut bucket_files[bucket];
            write_u64(out, target)?;
            encode_value(out, value)?;
            bucket_counts[bucket] += 1;
            row += 1;
        }
    }
    for file in &mut bucket_files {
        file.flush()?;
    }
    drop(bucket_files);

    // Gather phase: per bucket, order records by target row and write the
    // output segment.
    let mut writer = SarrayWriter::open(
        ctx.scratch_prefix("permuted"),
        column.value_type(),
        num_buckets,
    )?;
    let handles = parking_lot::Mutex::new(
        (0..num_buckets)
            .map(|b| writer.segment_writer(b).map(Some))
            .collect::<Result<Vec<_>>>()?,
    );

    parallel_for(num_buckets, |bucket| {
        let mut seg_writer = handles.lock()[bucket].take().expect("bucket taken once");
        let bucket_start = bucket as u64 * rows_per_bucket;
        let bucket_rows = total.saturating_sub(bucket_start).min(rows_per_bucket);

        let mut records = read_bucket(&bucket_paths[bucket], bucket_counts[bucket])?;
        if records.len() as u64 != bucket_rows {
            return Err(SframeError::new(format!(
                "Permute bucket {bucket} holds {} rows, expected {bucket_rows}; \
                 forward map is not a permutation",
                records.len()
            )));
        }
        records.sort_unstable_by_key(|(target, _)| *target);

        for (idx, (target, value)) in records.iter().enumerate() {
            // Duplicate targets pass the count check when they collide
            // inside one bucket; the sorted targets expose them here.
            if bucket_start + idx as u64 != *target {
                return Err(SframeError::new(format!(
                    "Permute bucket {bucket} target rows are not contiguous at \
                     output row {}; forward map is not a permutation",
                    bucket_start + idx as u64
                )));
            }
            seg_writer.write_value(value)?;
        }
        handles.lock()[bucket] = Some(seg_writer);
        Ok(())
    })?;

    for (bucket, slot) in handles.into_inner().into_iter().enumerate() {
        writer.return_segment_writer(bucket, slot.expect("bucket returned"))?;
    }

    // Spill cleanup is best-effort.
    for path in bucket_paths {
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to remove permute bucket file");
        }
    }

    writer.close()
}

fn read_bucket(path: &PathBuf, count: u64) -> Result<Vec<(u64, Value)>> {
    let file = File::open(path)
        .context_fn(|| format!("Failed to reopen bucket file '{}'", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let target = read_u64(&mut reader)?;
        let value = decode_value(&mut reader)?;
        records.push((target, value));
    }
    Ok(records)
}
