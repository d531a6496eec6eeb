// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Spilling sorted runs to disk and merging them back.
//!
//! Each call to [`Spiller::spill`] flushes the entire [`RowStore`] as
//! one *run*: an Arrow IPC stream of key-sorted batches in a
//! self-deleting temp file under the configured directory. After
//! [`Spiller::finalize`], [`Spiller::start_merge`] opens a k-way merge
//! across all runs. The sort buffer uses a single partition; there is
//! no hash split.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use arrow::compute::SortOptions;
use arrow::datatypes::SchemaRef;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::ipc::CompressionType;
use arrow::record_batch::RecordBatch;
use log::debug;
use tempfile::NamedTempFile;

use crate::error::Result;
use crate::memory_pool::human_readable_size;
use crate::precondition_err;
use crate::row::{RowPtr, RowStore};

mod merge;

pub use merge::{SpillMergeEntry, SpillMerger};

/// Rows per batch inside a spill run. Bounds the transient memory of a
/// flush and the granularity of the merge readers.
const SPILL_WRITE_BATCH_ROWS: usize = 1024;

/// Compression applied to spill run files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SpillCompression {
    #[default]
    Uncompressed,
    Lz4Frame,
    Zstd,
}

impl SpillCompression {
    fn to_ipc(self) -> Option<CompressionType> {
        match self {
            SpillCompression::Uncompressed => None,
            SpillCompression::Lz4Frame => Some(CompressionType::LZ4_FRAME),
            SpillCompression::Zstd => Some(CompressionType::ZSTD),
        }
    }
}

/// Configuration enabling disk spill for a sort buffer.
#[derive(Debug, Clone)]
pub struct SpillConfig {
    /// Directory the run files are created under. Created on first
    /// spill if missing.
    pub dir: PathBuf,
    /// Capacity of the buffered writer in front of each run file.
    pub write_buffer_size: usize,
    /// Compression applied to run files.
    pub compression: SpillCompression,
    /// Reservation growth step, as a percentage of current usage, the
    /// memory governor requests before giving up and spilling.
    pub spillable_reservation_growth_pct: usize,
    /// Probability in `[0, 100]` of spilling on each ingest, used by
    /// tests to force the spill path.
    pub test_spill_pct: u32,
}

impl SpillConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_buffer_size: 1024 * 1024,
            compression: SpillCompression::default(),
            spillable_reservation_growth_pct: 25,
            test_spill_pct: 0,
        }
    }
}

/// Counters observable through [`Spiller::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpillStats {
    /// Number of runs flushed to disk.
    pub spill_runs: usize,
    /// Total rows written across all runs.
    pub spilled_rows: usize,
    /// Approximate in-memory size of the spilled batches.
    pub spilled_bytes: usize,
    /// Partitions with spilled data. Always `<= 1` here.
    pub spilled_partitions: usize,
}

/// Writes key-sorted runs of a [`RowStore`] to disk and merges them
/// back in order.
///
/// The run files are owned by the spiller and deleted when it drops.
pub struct Spiller {
    schema: SchemaRef,
    compare_flags: Arc<[SortOptions]>,
    dir: PathBuf,
    write_buffer_size: usize,
    compression: SpillCompression,
    files: Vec<NamedTempFile>,
    finalized: bool,
    stats: SpillStats,
}

impl std::fmt::Debug for Spiller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spiller")
            .field("runs", &self.files.len())
            .field("finalized", &self.finalized)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Spiller {
    /// Create a spiller for runs of `schema`, ordered by its first
    /// `compare_flags.len()` columns.
    pub fn new(
        schema: SchemaRef,
        compare_flags: Vec<SortOptions>,
        config: &SpillConfig,
    ) -> Self {
        Self {
            schema,
            compare_flags: compare_flags.into(),
            dir: config.dir.clone(),
            write_buffer_size: config.write_buffer_size,
            compression: config.compression,
            files: Vec::new(),
            finalized: false,
            stats: SpillStats::default(),
        }
    }

    /// Flush the store's current contents as one sorted run. Returns
    /// the number of rows written. Clearing the store afterwards is the
    /// caller's duty.
    pub fn spill(&mut self, store: &RowStore) -> Result<usize> {
        if self.finalized {
            return precondition_err!("spill called after finalize_spill");
        }
        if store.num_rows() == 0 {
            return Ok(0);
        }

        let mut sorted: Vec<RowPtr> = store.rows().collect();
        let flags = Arc::clone(&self.compare_flags);
        sorted.sort_unstable_by(|l, r| {
            for (key, opts) in flags.iter().enumerate() {
                let ord = store.compare(*l, *r, key, *opts);
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });

        std::fs::create_dir_all(&self.dir)?;
        let file = tempfile::Builder::new()
            .prefix("sort-spill-")
            .suffix(".arrow")
            .tempfile_in(&self.dir)?;
        let options = IpcWriteOptions::default()
            .try_with_compression(self.compression.to_ipc())?;
        let out = BufWriter::with_capacity(
            self.write_buffer_size,
            File::create(file.path())?,
        );
        let mut writer =
            StreamWriter::try_new_with_options(out, &self.schema, options)?;

        let mut run_bytes = 0;
        for chunk in sorted.chunks(SPILL_WRITE_BATCH_ROWS) {
            let columns = (0..self.schema.fields().len())
                .map(|col| store.extract_column(chunk, col))
                .collect::<Result<Vec<_>>>()?;
            let batch = RecordBatch::try_new(Arc::clone(&self.schema), columns)?;
            run_bytes += batch.get_array_memory_size();
            writer.write(&batch)?;
        }
        writer.finish()?;
        writer.into_inner()?.flush()?;

        debug!(
            "spilled run of {} rows ({}) to {:?}",
            sorted.len(),
            human_readable_size(run_bytes),
            file.path(),
        );

        self.files.push(file);
        self.stats.spill_runs += 1;
        self.stats.spilled_rows += sorted.len();
        self.stats.spilled_bytes += run_bytes;
        self.stats.spilled_partitions = 1;
        Ok(sorted.len())
    }

    /// Close the run list; no further spills are allowed.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return precondition_err!("finalize_spill called twice");
        }
        self.finalized = true;
        Ok(())
    }

    /// Open a k-way merge over all runs, yielding rows in globally
    /// sorted order.
    pub fn start_merge(&self) -> Result<SpillMerger> {
        if !self.finalized {
            return precondition_err!("start_merge called before finalize_spill");
        }
        let paths = self
            .files
            .iter()
            .map(|file| file.path().to_path_buf())
            .collect();
        SpillMerger::try_new(paths, Arc::clone(&self.compare_flags))
    }

    /// Counters for the runs produced so far.
    pub fn stats(&self) -> &SpillStats {
        &self.stats
    }
}
