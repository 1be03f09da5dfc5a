//! Parallel row iteration over a table.
//!
//! The reader divides the table into `parallelism` logical segments of
//! contiguous rows. Each segment yields a forward iterator of rows; the
//! segment is the unit of parallel consumption for sort and groupby.

use sframe_error::Result;

use crate::array::reader::SarrayReader;
use crate::values::Value;

use super::Sframe;

/// Rows buffered per column per refill.
const READ_CHUNK_ROWS: u64 = 1024;

#[derive(Debug)]
pub struct SframeReader {
    columns: Vec<SarrayReader>,
    /// Row range per logical segment.
    ranges: Vec<(u64, u64)>,
}

impl SframeReader {
    pub(crate) fn new(frame: &Sframe, parallelism: usize) -> SframeReader {
        frame.assert_aligned();
        let parallelism = parallelism.max(1);
        let num_rows = frame.num_rows();

        // Contiguous ranges of roughly equal size.
        let per_segment = num_rows.div_ceil(parallelism as u64).max(1);
        let mut ranges = Vec::with_capacity(parallelism);
        for seg in 0..parallelism as u64 {
            let start = (seg * per_segment).min(num_rows);
            let end = ((seg + 1) * per_segment).min(num_rows);
            ranges.push((start, end));
        }

        SframeReader {
            columns: frame.columns().iter().map(|c| c.reader()).collect(),
            ranges,
        }
    }

    pub fn num_segments(&self) -> usize {
        self.ranges.len()
    }

    pub fn num_rows(&self) -> u64 {
        self.ranges.last().map(|(_, end)| *end).unwrap_or(0)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn segment_row_range(&self, segment_id: usize) -> (u64, u64) {
        self.ranges[segment_id]
    }

    /// Forward iterator over one segment's rows.
    pub fn segment_iter(&self, segment_id: usize) -> SframeRowIter<'_> {
        let (start, end) = self.ranges[segment_id];
        SframeRowIter {
            columns: &self.columns,
            buffers: vec![Vec::new(); self.columns.len()],
            buffer_pos: 0,
            buffer_len: 0,
            next_row: start,
            end,
        }
    }

    /// Read rows `[start, end)` across all columns into row vectors.
    pub fn read_rows(&self, start: u64, end: u64, out: &mut Vec<Vec<Value>>) -> Result<usize> {
        out.clear();
        let mut col_buf = Vec::new();
        let mut rows_read = None;
        for (col_idx, column) in self.columns.iter().enumerate() {
            let n = column.read_rows(start, end, &mut col_buf)?;
            match rows_read {
                None => {
                    rows_read = Some(n);
                    out.resize_with(n, || Vec::with_capacity(self.columns.len()));
                }
                Some(expected) => debug_assert_eq!(expected, n),
            }
            for (row, value) in out.iter_mut().zip(col_buf.drain(..)) {
                debug_assert_eq!(col_idx, row.len());
                row.push(value);
            }
        }
        Ok(rows_read.unwrap_or(0))
    }
}

/// Forward iterator over a logical segment, yielding one `Vec<Value>` per
/// row. Reads are chunked per column under the hood.
#[derive(Debug)]
pub struct SframeRowIter<'a> {
    columns: &'a [SarrayReader],
    buffers: Vec<Vec<Value>>,
    buffer_pos: usize,
    buffer_len: usize,
    next_row: u64,
    end: u64,
}

impl SframeRowIter<'_> {
    fn refill(&mut self) -> Result<bool> {
        if self.next_row >= self.end {
            return Ok(false);
        }
        let chunk_end = (self.next_row + READ_CHUNK_ROWS).min(self.end);
        let mut len = 0;
        for (column, buffer) in self.columns.iter().zip(self.buffers.iter_mut()) {
            len = column.read_rows(self.next_row, chunk_end, buffer)?;
        }
        self.buffer_pos = 0;
        self.buffer_len = len;
        self.next_row = chunk_end;
        Ok(len > 0)
    }
}

impl Iterator for SframeRowIter<'_> {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer_pos >= self.buffer_len {
            match self.refill() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
        let row: Vec<Value> = self
            .buffers
            .iter()
            .map(|buf| buf[self.buffer_pos].clone())
            .collect();
        self.buffer_pos += 1;
        Some(Ok(row))
    }
}
