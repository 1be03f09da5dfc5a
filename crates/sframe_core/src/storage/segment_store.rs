//! Segment data file reader and writer.
//!
//! A segment file is a sequence of encoded values grouped into blocks,
//! followed by a footer listing the byte offset and row count of every
//! block. Blocks let a range read seek near its start row instead of
//! decoding the whole segment.
//!
//! Segment files are written fresh and never mutated in place. Once the
//! index file is written the file set is sealed and may be read by any
//! number of concurrent readers.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sframe_error::{Result, ResultExt, SframeError};

use super::index_file::{INDEX_FILE_VERSION, SegmentIndex};
use crate::values::encoding::{decode_value, encode_value, read_u64, write_u64};
use crate::values::{Value, ValueType};

/// Rows per block within a segment file.
pub const ROWS_PER_BLOCK: u64 = 1024;

const SEGMENT_FOOTER_MAGIC: u64 = 0x5346_5241_4d45_5631; // "SFRAMEV1"

/// Shared read handle over a sealed segment file set.
///
/// Cheap to clone; all clones reference the same index. `read_rows` may be
/// called concurrently from any number of threads.
#[derive(Debug, Clone)]
pub struct SegmentReader {
    index: Arc<SegmentIndex>,
    /// Cumulative row count at the start of each segment.
    segment_starts: Arc<Vec<u64>>,
}

impl SegmentReader {
    pub fn open(index: Arc<SegmentIndex>) -> SegmentReader {
        let mut starts = Vec::with_capacity(index.num_segments() + 1);
        let mut total = 0u64;
        for &rows in &index.segment_sizes {
            starts.push(total);
            total += rows;
        }
        starts.push(total);
        SegmentReader {
            index,
            segment_starts: Arc::new(starts),
        }
    }

    pub fn index(&self) -> &Arc<SegmentIndex> {
        &self.index
    }

    pub fn num_segments(&self) -> usize {
        self.index.num_segments()
    }

    pub fn num_rows(&self) -> u64 {
        *self.segment_starts.last().expect("at least one entry")
    }

    pub fn segment_size(&self, segment_id: usize) -> Result<u64> {
        self.index
            .segment_sizes
            .get(segment_id)
            .copied()
            .ok_or_else(|| {
                SframeError::new(format!(
                    "Segment id {segment_id} out of range, column has {} segments",
                    self.index.num_segments()
                ))
            })
    }

    /// Global row range covered by a segment.
    pub fn segment_row_range(&self, segment_id: usize) -> (u64, u64) {
        (
            self.segment_starts[segment_id],
            self.segment_starts[segment_id + 1],
        )
    }

    /// Read rows `[start, end)` in global row coordinates into `out`.
    ///
    /// Returns the number of rows actually read, which is fewer than
    /// requested when the range extends past the end of the column. That
    /// is not an error; read failures are.
    pub fn read_rows(&self, start: u64, end: u64, out: &mut Vec<Value>) -> Result<usize> {
        out.clear();
        let end = end.min(self.num_rows());
        if start >= end {
            return Ok(0);
        }
        out.reserve((end - start) as usize);

        // Find the first segment containing `start`.
        let mut segment_id = match self.segment_starts.binary_search(&start) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        };
        // Skip over empty segments.
        while self.segment_starts[segment_id + 1] <= start {
            segment_id += 1;
        }

        let mut row = start;
        while row < end {
            let (seg_start, seg_end) = self.segment_row_range(segment_id);
            let local_start = row - seg_start;
            let local_end = (end - seg_start).min(seg_end - seg_start);
            self.read_segment_rows(segment_id, local_start, local_end, out)?;
            row = seg_start + local_end;
            segment_id += 1;
        }

        Ok((end - start) as usize)
    }

    /// Read rows `[start, end)` local to one segment, appending to `out`.
    fn read_segment_rows(
        &self,
        segment_id: usize,
        start: u64,
        end: u64,
        out: &mut Vec<Value>,
    ) -> Result<()> {
        debug_assert!(end <= self.index.segment_sizes[segment_id]);
        if start >= end {
            return Ok(());
        }

        let path = self.index.segment_path(segment_id);
        let file = File::open(&path)
            .context_fn(|| format!("Failed to open segment file '{}'", path.display()))?;
        let mut reader = BufReader::new(file);

        let footer = read_footer(&mut reader, &path)?;

        // Seek to the block containing `start` and decode forward.
        let block_idx = (start / ROWS_PER_BLOCK) as usize;
        if block_idx >= footer.blocks.len() {
            return Err(SframeError::new(format!(
                "Segment file '{}' footer inconsistent with index",
                path.display()
            )));
        }
        let block = &footer.blocks[block_idx];
        reader.seek(SeekFrom::Start(block.offset))?;

        let mut row = block_idx as u64 * ROWS_PER_BLOCK;
        while row < end {
            let value = decode_value(&mut reader)
                .context_fn(|| format!("Failed to decode row in '{}'", path.display()))?;
            if row >= start {
                out.push(value);
            }
            row += 1;
        }
        Ok(())
    }

    /// Iterate a single segment's rows from its start.
    pub fn segment_iter(&self, segment_id: usize) -> Result<SegmentValueIter> {
        let rows = self.segment_size(segment_id)?;
        let path = self.index.segment_path(segment_id);
        let file = File::open(&path)
            .context_fn(|| format!("Failed to open segment file '{}'", path.display()))?;
        Ok(SegmentValueIter {
            reader: BufReader::new(file),
            remaining: rows,
        })
    }
}

/// Forward iterator over one segment's values.
#[derive(Debug)]
pub struct SegmentValueIter {
    reader: BufReader<File>,
    remaining: u64,
}

impl Iterator for SegmentValueIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(decode_value(&mut self.reader))
    }
}

#[derive(Debug)]
struct BlockEntry {
    offset: u64,
    #[allow(dead_code)]
    rows: u64,
}

#[derive(Debug)]
struct Footer {
    blocks: Vec<BlockEntry>,
}

fn read_footer(reader: &mut BufReader<File>, path: &Path) -> Result<Footer> {
    // Trailer: num_blocks, footer_start, magic.
    reader.seek(SeekFrom::End(-24))?;
    let num_blocks = read_u64(reader)?;
    let footer_start = read_u64(reader)?;
    let magic = read_u64(reader)?;
    if magic != SEGMENT_FOOTER_MAGIC {
        return Err(SframeError::new(format!(
            "Segment file '{}' has bad footer magic",
            path.display()
        )));
    }

    reader.seek(SeekFrom::Start(footer_start))?;
    let mut blocks = Vec::with_capacity(num_blocks as usize);
    for _ in 0..num_blocks {
        let offset = read_u64(reader)?;
        let rows = read_u64(reader)?;
        blocks.push(BlockEntry { offset, rows });
    }
    Ok(Footer { blocks })
}

/// Writer for a fresh segment file set.
///
/// Opens `num_segments` segment files up front. Each segment is owned by
/// exactly one logical writer at a time; take per-segment handles with
/// [`SegmentStoreWriter::segment_writer`] and hand them to worker threads.
/// After all segments are closed, [`SegmentStoreWriter::finalize`] seals
/// the column and writes the index file.
#[derive(Debug)]
pub struct SegmentStoreWriter {
    prefix: PathBuf,
    content_type: ValueType,
    segments: Vec<Option<SegmentWriter>>,
    closed_sizes: Vec<Option<u64>>,
    metadata: Vec<(String, String)>,
}

impl SegmentStoreWriter {
    /// Create segment files under `prefix` for writing.
    ///
    /// Fails if any file in the set already exists; file sets are never
    /// overwritten in place.
    pub fn open(
        prefix: impl Into<PathBuf>,
        content_type: ValueType,
        num_segments: usize,
    ) -> Result<SegmentStoreWriter> {
        let prefix: PathBuf = prefix.into();
        debug_assert!(num_segments > 0);

        if let Some(parent) = prefix.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context_fn(|| {
                    format!("Failed to create directory '{}'", parent.display())
                })?;
            }
        }

        let mut segments = Vec::with_capacity(num_segments);
        for segment_id in 0..num_segments {
            let name = format!(
                "{}.{segment_id:04}",
                prefix
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            );
            let path = prefix.with_file_name(name);
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .context_fn(|| {
                    format!("Failed to create segment file '{}'", path.display())
                })?;
            segments.push(Some(SegmentWriter {
                path,
                out: BufWriter::new(file),
                rows: 0,
                block_offsets: vec![0],
                bytes_written: 0,
            }));
        }

        Ok(SegmentStoreWriter {
            prefix,
            content_type,
            segments,
            closed_sizes: vec![None; num_segments],
            metadata: Vec::new(),
        })
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.push((key.into(), value.into()));
    }

    /// Take ownership of one segment's writer.
    ///
    /// Each segment can be taken exactly once.
    pub fn segment_writer(&mut self, segment_id: usize) -> Result<SegmentWriter> {
        let slot = self.segments.get_mut(segment_id).ok_or_else(|| {
            SframeError::new(format!(
                "Segment id {segment_id} out of range, writer has {} segments",
                self.closed_sizes.len()
            ))
        })?;
        slot.take().ok_or_else(|| {
            SframeError::new(format!("Segment {segment_id} writer already taken"))
        })
    }

    /// Return a segment writer after its segment is fully written.
    pub fn return_segment_writer(&mut self, segment_id: usize, writer: SegmentWriter) -> Result<()> {
        let rows = writer.close()?;
        self.closed_sizes[segment_id] = Some(rows);
        Ok(())
    }

    /// Convenience: write a full vector of values as one segment.
    pub fn write_segment(&mut self, segment_id: usize, values: &[Value]) -> Result<()> {
        let mut writer = self.segment_writer(segment_id)?;
        for value in values {
            writer.write_value(value)?;
        }
        self.return_segment_writer(segment_id, writer)
    }

    /// Seal the file set and write the index file.
    pub fn finalize(mut self) -> Result<SegmentIndex> {
        // Close any segments never taken; they are valid empty segments.
        for segment_id in 0..self.segments.len() {
            if let Some(writer) = self.segments[segment_id].take() {
                let rows = writer.close()?;
                self.closed_sizes[segment_id] = Some(rows);
            }
        }

        let mut segment_sizes = Vec::with_capacity(self.closed_sizes.len());
        for (segment_id, size) in self.closed_sizes.iter().enumerate() {
            match size {
                Some(rows) => segment_sizes.push(*rows),
                None => {
                    return Err(SframeError::new(format!(
                        "Segment {segment_id} was taken but never returned"
                    )));
                }
            }
        }

        let index = SegmentIndex {
            prefix: self.prefix,
            version: INDEX_FILE_VERSION,
            content_type: self.content_type,
            segment_sizes,
            metadata: self.metadata,
        };
        index.write()?;
        Ok(index)
    }
}

/// Mutable handle writing one segment's values.
#[derive(Debug)]
pub struct SegmentWriter {
    path: PathBuf,
    out: BufWriter<File>,
    rows: u64,
    /// Byte offset of the start of each block. Always holds one entry for
    /// the block currently being filled.
    block_offsets: Vec<u64>,
    bytes_written: u64,
}

impl SegmentWriter {
    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        let mut buf = Vec::new();
        encode_value(&mut buf, value)?;
        self.out.write_all(&buf).context_fn(|| {
            format!("Failed to write to segment file '{}'", self.path.display())
        })?;
        self.bytes_written += buf.len() as u64;
        self.rows += 1;
        if self.rows % ROWS_PER_BLOCK == 0 {
            self.block_offsets.push(self.bytes_written);
        }
        Ok(())
    }

    pub fn write_values(&mut self, values: &[Value]) -> Result<()> {
        for value in values {
            self.write_value(value)?;
        }
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Flush buffered data to the OS.
    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().context_fn(|| {
            format!("Failed to flush segment file '{}'", self.path.display())
        })
    }

    /// Write the block footer and close the file. Returns rows written.
    fn close(mut self) -> Result<u64> {
        // Trim the trailing empty block marker unless the segment is empty
        // and needs at least one block entry for the reader's seek.
        let mut blocks = self.block_offsets;
        if blocks.len() > 1 && self.rows % ROWS_PER_BLOCK == 0 && self.rows > 0 {
            blocks.pop();
        }

        let footer_start = self.bytes_written;
        for (block_idx, offset) in blocks.iter().enumerate() {
            let block_start_row = block_idx as u64 * ROWS_PER_BLOCK;
            let block_rows = self.rows.saturating_sub(block_start_row).min(ROWS_PER_BLOCK);
            write_u64(&mut self.out, *offset)?;
            write_u64(&mut self.out, block_rows)?;
        }
        write_u64(&mut self.out, blocks.len() as u64)?;
        write_u64(&mut self.out, footer_start)?;
        write_u64(&mut self.out, SEGMENT_FOOTER_MAGIC)?;

        self.out.flush().context_fn(|| {
            format!("Failed to flush segment file '{}'", self.path.display())
        })?;
        Ok(self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_column(dir: &Path, name: &str, segments: &[Vec<Value>]) -> SegmentReader {
        let mut writer = SegmentStoreWriter::open(
            dir.join(name),
            ValueType::Integer,
            segments.len(),
        )
        .unwrap();
        for (segment_id, values) in segments.iter().enumerate() {
            writer.write_segment(segment_id, values).unwrap();
        }
        let index = writer.finalize().unwrap();
        SegmentReader::open(Arc::new(index))
    }

    fn ints(range: std::ops::Range<i64>) -> Vec<Value> {
        range.map(Value::Integer).collect()
    }

    #[test]
    fn write_then_read_all() {
        let dir = tempfile::tempdir().unwrap();
        let reader = write_column(dir.path(), "col", &[ints(0..10), ints(10..25)]);

        assert_eq!(2, reader.num_segments());
        assert_eq!(25, reader.num_rows());

        let mut out = Vec::new();
        let n = reader.read_rows(0, 25, &mut out).unwrap();
        assert_eq!(25, n);
        assert_eq!(ints(0..25), out);
    }

    #[test]
    fn range_read_spans_segments() {
        let dir = tempfile::tempdir().unwrap();
        let reader = write_column(dir.path(), "col", &[ints(0..10), ints(10..25)]);

        let mut out = Vec::new();
        let n = reader.read_rows(8, 13, &mut out).unwrap();
        assert_eq!(5, n);
        assert_eq!(ints(8..13), out);
    }

    #[test]
    fn read_past_eof_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let reader = write_column(dir.path(), "col", &[ints(0..5)]);

        let mut out = Vec::new();
        let n = reader.read_rows(3, 100, &mut out).unwrap();
        assert_eq!(2, n);
        assert_eq!(ints(3..5), out);

        let n = reader.read_rows(10, 20, &mut out).unwrap();
        assert_eq!(0, n);
    }

    #[test]
    fn multi_block_segment_seeks() {
        let dir = tempfile::tempdir().unwrap();
        let rows = ROWS_PER_BLOCK as i64 * 3 + 17;
        let reader = write_column(dir.path(), "col", &[ints(0..rows)]);

        let mut out = Vec::new();
        let start = ROWS_PER_BLOCK * 2 + 100;
        let n = reader.read_rows(start, start + 50, &mut out).unwrap();
        assert_eq!(50, n);
        assert_eq!(ints(start as i64..start as i64 + 50), out);
    }

    #[test]
    fn empty_segments_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let reader = write_column(dir.path(), "col", &[vec![], ints(0..4), vec![]]);
        assert_eq!(4, reader.num_rows());

        let mut out = Vec::new();
        let n = reader.read_rows(0, 4, &mut out).unwrap();
        assert_eq!(4, n);
        assert_eq!(ints(0..4), out);
    }

    #[test]
    fn existing_files_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        write_column(dir.path(), "col", &[ints(0..5)]);
        let err = SegmentStoreWriter::open(dir.path().join("col"), ValueType::Integer, 1);
        assert!(err.is_err());
    }

    #[test]
    fn segment_writer_taken_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            SegmentStoreWriter::open(dir.path().join("col"), ValueType::Integer, 1).unwrap();
        let seg = writer.segment_writer(0).unwrap();
        assert!(writer.segment_writer(0).is_err());
        writer.return_segment_writer(0, seg).unwrap();
        writer.finalize().unwrap();
    }

    #[test]
    fn concurrent_reads() {
        let dir = tempfile::tempdir().unwrap();
        let reader = write_column(dir.path(), "col", &[ints(0..2000)]);

        std::thread::scope(|scope| {
            for t in 0..4 {
                let reader = reader.clone();
                scope.spawn(move || {
                    let mut out = Vec::new();
                    let start = t * 500;
                    reader.read_rows(start, start + 500, &mut out).unwrap();
                    assert_eq!(ints(start as i64..start as i64 + 500), out);
                });
            }
        });
    }
}
