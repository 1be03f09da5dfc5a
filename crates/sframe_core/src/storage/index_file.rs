//! The `.sidx` index file.
//!
//! An INI-like text file describing a column's segment file set: format
//! version, element type, per-segment row counts, and free-form metadata.
//! Segment data lives in sibling files `<prefix>.0000`, `<prefix>.0001`,
//! and so on.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use sframe_error::{Result, ResultExt, SframeError};

use crate::values::ValueType;

/// Index file format version this build reads and writes.
pub const INDEX_FILE_VERSION: u64 = 2;

/// Extension used for index files.
pub const INDEX_FILE_EXT: &str = "sidx";

/// Parsed contents of a column index file.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentIndex {
    /// Path prefix shared by the index file and its segment files.
    pub prefix: PathBuf,
    pub version: u64,
    pub content_type: ValueType,
    /// Row count per segment.
    pub segment_sizes: Vec<u64>,
    /// Free-form key/value metadata.
    pub metadata: Vec<(String, String)>,
}

impl SegmentIndex {
    /// Parse an index file from disk.
    ///
    /// Fails if the file is missing, malformed, or carries an unsupported
    /// version.
    pub fn open(index_path: impl AsRef<Path>) -> Result<SegmentIndex> {
        let index_path = index_path.as_ref();
        let content = fs::read_to_string(index_path)
            .context_fn(|| format!("Failed to read index file '{}'", index_path.display()))?;
        Self::parse(index_path, &content)
    }

    fn parse(index_path: &Path, content: &str) -> Result<SegmentIndex> {
        let mut version = None;
        let mut content_type = None;
        let mut num_segments = None;
        let mut segment_sizes: Vec<(usize, u64)> = Vec::new();
        let mut metadata = Vec::new();

        let mut section = "";
        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                section = rest.strip_suffix(']').ok_or_else(|| {
                    SframeError::new(format!("Malformed section header '{line}' in index file"))
                })?;
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                SframeError::new(format!("Malformed line '{line}' in index file"))
            })?;
            let (key, value) = (key.trim(), value.trim());

            match section {
                "sarray" => match key {
                    "version" => version = Some(value.parse::<u64>()?),
                    "num_segments" => num_segments = Some(value.parse::<usize>()?),
                    "content_type" => content_type = Some(ValueType::parse(value)?),
                    _ => {
                        // Unknown keys in [sarray] are ignored for forward
                        // compatibility.
                    }
                },
                "segment_sizes" => {
                    let seg_id = key.parse::<usize>()?;
                    segment_sizes.push((seg_id, value.parse::<u64>()?));
                }
                "metadata" => metadata.push((key.to_string(), value.to_string())),
                other => {
                    return Err(SframeError::new(format!(
                        "Unknown section '[{other}]' in index file '{}'",
                        index_path.display()
                    )));
                }
            }
        }

        let version =
            version.ok_or_else(|| SframeError::new("Index file missing version key"))?;
        if version != INDEX_FILE_VERSION {
            return Err(SframeError::new(format!(
                "Unsupported index file version {version}, expected {INDEX_FILE_VERSION}"
            )));
        }
        let content_type =
            content_type.ok_or_else(|| SframeError::new("Index file missing content_type"))?;
        let num_segments =
            num_segments.ok_or_else(|| SframeError::new("Index file missing num_segments"))?;

        segment_sizes.sort_by_key(|(id, _)| *id);
        if segment_sizes.len() != num_segments
            || segment_sizes.iter().enumerate().any(|(i, (id, _))| i != *id)
        {
            return Err(SframeError::new(format!(
                "Index file declares {num_segments} segments but segment sizes are inconsistent"
            )));
        }

        Ok(SegmentIndex {
            prefix: index_path.with_extension(""),
            version,
            content_type,
            segment_sizes: segment_sizes.into_iter().map(|(_, n)| n).collect(),
            metadata,
        })
    }

    /// Serialize and write the index file next to its segment files.
    pub fn write(&self) -> Result<()> {
        let mut out = String::new();
        writeln!(out, "[sarray]")?;
        writeln!(out, "version={}", self.version)?;
        writeln!(out, "num_segments={}", self.segment_sizes.len())?;
        writeln!(out, "content_type={}", self.content_type)?;
        writeln!(out, "[segment_sizes]")?;
        for (seg_id, rows) in self.segment_sizes.iter().enumerate() {
            writeln!(out, "{seg_id:04}={rows}")?;
        }
        if !self.metadata.is_empty() {
            writeln!(out, "[metadata]")?;
            for (k, v) in &self.metadata {
                writeln!(out, "{k}={v}")?;
            }
        }

        let path = self.index_path();
        fs::write(&path, out)
            .context_fn(|| format!("Failed to write index file '{}'", path.display()))?;
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.prefix.with_extension(INDEX_FILE_EXT)
    }

    /// Path of the data file backing a segment.
    pub fn segment_path(&self, segment_id: usize) -> PathBuf {
        debug_assert!(segment_id < self.segment_sizes.len());
        let name = format!(
            "{}.{segment_id:04}",
            self.prefix
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        self.prefix.with_file_name(name)
    }

    pub fn num_segments(&self) -> usize {
        self.segment_sizes.len()
    }

    pub fn num_rows(&self) -> u64 {
        self.segment_sizes.iter().sum()
    }
}
