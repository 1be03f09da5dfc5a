//! Engine configuration and execution context.
//!
//! All tunables and scratch-space bookkeeping live on an explicit context
//! object handed to the algorithms, never in process globals.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sframe_error::{Result, ResultExt};

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker parallelism for segment/partition fan-out.
    pub num_workers: usize,
    /// Default segment count for newly written columns/tables.
    pub default_num_segments: usize,
    /// Approximate memory budget for the sort forward-map buffers, in
    /// bytes.
    pub sort_buffer_size: usize,
    /// Distinct keys a groupby partition may hold in memory before its
    /// contents are spilled to disk.
    pub groupby_max_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let ncpu = num_cpus::get().max(1);
        EngineConfig {
            num_workers: ncpu,
            default_num_segments: ncpu,
            sort_buffer_size: 2 * 1024 * 1024 * 1024,
            groupby_max_buffer_size: 1024 * 1024,
        }
    }
}

/// Shared execution context: config plus a scratch directory for
/// intermediate file sets.
///
/// Dropping the context does not delete scratch files; own the directory's
/// lifetime at the call site (tests use a temp dir).
#[derive(Debug, Clone)]
pub struct EngineContext {
    config: EngineConfig,
    scratch_dir: PathBuf,
    next_id: Arc<AtomicU64>,
}

impl EngineContext {
    pub fn new(config: EngineConfig, scratch_dir: impl Into<PathBuf>) -> Result<EngineContext> {
        let scratch_dir: PathBuf = scratch_dir.into();
        std::fs::create_dir_all(&scratch_dir)
            .context_fn(|| format!("Failed to create scratch dir '{}'", scratch_dir.display()))?;
        Ok(EngineContext {
            config,
            scratch_dir,
            next_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Context with default config rooted at a fresh directory under the
    /// system temp dir.
    pub fn with_temp_scratch() -> Result<EngineContext> {
        let dir = std::env::temp_dir().join(format!(
            "sframe-{}-{:x}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0)
        ));
        EngineContext::new(EngineConfig::default(), dir)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// A fresh unique file prefix under the scratch directory.
    pub fn scratch_prefix(&self, tag: &str) -> PathBuf {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.scratch_dir.join(format!("{tag}-{id:08}"))
    }
}
