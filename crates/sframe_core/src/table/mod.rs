//! `Sframe`: an ordered mapping from column name to column.
//!
//! The mapping is copy-on-write: select/add/remove/rename return a new
//! lightweight header sharing the underlying column handles, so schema
//! operations are O(#columns) and never touch row data.

pub mod reader;
pub mod writer;

use sframe_error::{Result, SframeError};

use crate::array::Sarray;
use crate::values::ValueType;
use reader::SframeReader;

/// A table of named, equal-length columns.
#[derive(Debug, Clone)]
pub struct Sframe {
    names: Vec<String>,
    columns: Vec<Sarray>,
}

impl Sframe {
    pub fn empty() -> Sframe {
        Sframe {
            names: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Build a table from (name, column) pairs.
    ///
    /// Column lengths must agree; a mismatch is a caller bug and panics.
    pub fn new(pairs: Vec<(String, Sarray)>) -> Result<Sframe> {
        let mut frame = Sframe::empty();
        for (name, column) in pairs {
            frame = frame.add_column(column, &name)?;
        }
        Ok(frame)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_rows(&self) -> u64 {
        self.columns.first().map(|c| c.num_rows()).unwrap_or(0)
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn column_types(&self) -> Vec<ValueType> {
        self.columns.iter().map(|c| c.value_type()).collect()
    }

    pub fn columns(&self) -> &[Sarray] {
        &self.columns
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| SframeError::new(format!("Column '{name}' does not exist")))
    }

    pub fn column(&self, name: &str) -> Result<&Sarray> {
        Ok(&self.columns[self.column_index(name)?])
    }

    pub fn column_at(&self, idx: usize) -> &Sarray {
        &self.columns[idx]
    }

    /// New table with just the named columns, in the given order.
    /// Shares the underlying columns.
    pub fn select_columns(&self, names: &[impl AsRef<str>]) -> Result<Sframe> {
        let mut seen: Vec<&str> = Vec::with_capacity(names.len());
        let mut out = Sframe::empty();
        for name in names {
            let name = name.as_ref();
            if seen.contains(&name) {
                return Err(SframeError::new(format!(
                    "Duplicate column '{name}' in selection"
                )));
            }
            seen.push(name);
            let idx = self.column_index(name)?;
            out.names.push(name.to_string());
            out.columns.push(self.columns[idx].clone());
        }
        Ok(out)
    }

    /// New table with the column appended under `name`.
    pub fn add_column(&self, column: Sarray, name: &str) -> Result<Sframe> {
        if self.contains_column(name) {
            return Err(SframeError::new(format!("Column '{name}' already exists")));
        }
        // Length misalignment is a programming error in the caller.
        assert!(
            self.columns.is_empty() || column.num_rows() == self.num_rows(),
            "Column '{name}' has {} rows, table has {}",
            column.num_rows(),
            self.num_rows()
        );
        let mut out = self.clone();
        out.names.push(name.to_string());
        out.columns.push(column);
        Ok(out)
    }

    /// New table without the named column.
    pub fn remove_column(&self, name: &str) -> Result<Sframe> {
        let idx = self.column_index(name)?;
        let mut out = self.clone();
        out.names.remove(idx);
        out.columns.remove(idx);
        Ok(out)
    }

    /// New table with columns `old[i]` renamed to `new[i]`.
    pub fn rename_columns(&self, old: &[impl AsRef<str>], new: &[impl AsRef<str>]) -> Result<Sframe> {
        if old.len() != new.len() {
            return Err(SframeError::new(
                "rename_columns given mismatched name list lengths",
            ));
        }
        let mut out = self.clone();
        for (o, n) in old.iter().zip(new.iter()) {
            let idx = out.column_index(o.as_ref())?;
            out.names[idx] = n.as_ref().to_string();
        }
        let mut sorted = out.names.clone();
        sorted.sort();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(SframeError::new("rename_columns produced duplicate names"));
        }
        Ok(out)
    }

    /// Reader with `parallelism` logical segments of roughly equal size.
    pub fn reader(&self, parallelism: usize) -> SframeReader {
        SframeReader::new(self, parallelism)
    }

    /// Vertical concatenation: all rows of `self` followed by all rows of
    /// `other`. Column names and types must match exactly.
    ///
    /// This is a physical copy streamed through the scratch space, not a
    /// lazy view.
    pub fn append(&self, other: &Sframe, ctx: &crate::config::EngineContext) -> Result<Sframe> {
        if self.names != other.names {
            return Err(SframeError::new(
                "Cannot append tables with different column names",
            ));
        }
        if self.column_types() != other.column_types() {
            return Err(SframeError::new(
                "Cannot append tables with different column types",
            ));
        }

        let parallelism = ctx.config().num_workers;
        let readers = [self.reader(parallelism), other.reader(parallelism)];
        let num_segments = readers[0].num_segments() + readers[1].num_segments();
        let mut writer = writer::SframeWriter::open(
            &self.names,
            &self.column_types(),
            ctx.scratch_prefix("append"),
            num_segments.max(1),
        )?;

        let mut outputs = Vec::with_capacity(num_segments);
        for segment_id in 0..num_segments {
            outputs.push(parking_lot::Mutex::new(Some(writer.segment_output(segment_id)?)));
        }

        crate::util::parallel_for(num_segments, |segment_id| {
            let (reader, local_seg) = if segment_id < readers[0].num_segments() {
                (&readers[0], segment_id)
            } else {
                (&readers[1], segment_id - readers[0].num_segments())
            };
            let mut out = outputs[segment_id].lock().take().expect("output taken once");
            for row in reader.segment_iter(local_seg) {
                out.write_row(&row?)?;
            }
            *outputs[segment_id].lock() = Some(out);
            Ok(())
        })?;

        for slot in outputs {
            let out = slot.into_inner().expect("output returned");
            writer.return_segment_output(out)?;
        }
        writer.close()
    }

    /// Sanity-check column alignment. Misalignment indicates a bug in
    /// table construction, so this panics rather than returning an error.
    pub fn assert_aligned(&self) {
        if let Some(first) = self.columns.first() {
            for (name, col) in self.names.iter().zip(&self.columns) {
                assert!(
                    col.num_rows() == first.num_rows(),
                    "Column '{name}' misaligned: {} rows vs {}",
                    col.num_rows(),
                    first.num_rows()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::Value;

    fn test_frame(dir: &std::path::Path) -> Sframe {
        let a = Sarray::from_values(
            dir.join("a"),
            ValueType::Integer,
            &(0..6).map(Value::Integer).collect::<Vec<_>>(),
            2,
        )
        .unwrap();
        let b = Sarray::from_values(
            dir.join("b"),
            ValueType::String,
            &["x", "y", "z", "p", "q", "r"]
                .iter()
                .map(|s| Value::from(*s))
                .collect::<Vec<_>>(),
            3,
        )
        .unwrap();
        Sframe::new(vec![("a".to_string(), a), ("b".to_string(), b)]).unwrap()
    }

    #[test]
    fn select_is_identity_on_all_columns() {
        let dir = tempfile::tempdir().unwrap();
        let frame = test_frame(dir.path());
        let selected = frame.select_columns(frame.column_names()).unwrap();
        assert_eq!(frame.column_names(), selected.column_names());
        for (c1, c2) in frame.columns().iter().zip(selected.columns()) {
            assert!(c1.same_column(c2));
        }
    }

    #[test]
    fn header_ops_share_columns() {
        let dir = tempfile::tempdir().unwrap();
        let frame = test_frame(dir.path());

        let renamed = frame.rename_columns(&["a"], &["alpha"]).unwrap();
        assert!(renamed.contains_column("alpha"));
        assert!(renamed.column("alpha").unwrap().same_column(frame.column("a").unwrap()));

        let removed = frame.remove_column("a").unwrap();
        assert_eq!(1, removed.num_columns());
        assert_eq!(6, removed.num_rows());
        // Original untouched.
        assert_eq!(2, frame.num_columns());
    }

    #[test]
    fn duplicate_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let frame = test_frame(dir.path());
        assert!(frame.select_columns(&["a", "a"]).is_err());
        assert!(frame.rename_columns(&["a"], &["b"]).is_err());
        let col = frame.column("a").unwrap().clone();
        assert!(frame.add_column(col, "b").is_err());
    }

    #[test]
    #[should_panic(expected = "rows")]
    fn misaligned_add_panics() {
        let dir = tempfile::tempdir().unwrap();
        let frame = test_frame(dir.path());
        let short = Sarray::from_values(
            dir.path().join("short"),
            ValueType::Integer,
            &[Value::Integer(1)],
            1,
        )
        .unwrap();
        let _ = frame.add_column(short, "c");
    }
}
