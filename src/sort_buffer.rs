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

//! [`SortBuffer`]: sort-and-spill buffer backing a streaming ORDER BY.
//!
//! The buffer ingests record batches, accumulates them row-wise in a
//! [`RowStore`] with the sort keys leading, and emits totally ordered
//! output in bounded batches. It sorts in memory when its reservation
//! allows and completes as an external k-way merge over spilled runs
//! when it does not:
//!
//! 1. each `add_input` is gated by a memory governor that grows the
//!    reservation cooperatively and spills when the pool refuses,
//! 2. `no_more_input` either sorts the row handles in place or flushes
//!    the in-memory remainder and opens the merge,
//! 3. `get_output` drains from whichever source until exhausted.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use arrow::array::ArrayRef;
use arrow::compute::{interleave, SortOptions};
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use log::{debug, warn};
use parking_lot::Mutex;
use rand::Rng;

use crate::error::Result;
use crate::memory_pool::{
    human_readable_size, MemoryConsumer, MemoryPool, MemoryReclaimer,
    MemoryReservation, NonReclaimableSectionGuard, ReclaimableSectionGuard,
};
use crate::row::{RowPtr, RowStore};
use crate::spill::{SpillConfig, SpillMerger, SpillStats, Spiller};
use crate::{aborted_err, internal_err, precondition_err, unconfigured_err};

/// Safety factor applied to the estimated incremental footprint of a
/// batch before asking the pool for more. The reservation must cover
/// this many times the estimate to skip the growth attempt.
pub const RESERVATION_HEADROOM_FACTOR: usize = 2;

/// Ceiling on the row count [`output_batch_rows`] derives from a byte
/// budget.
pub const MAX_OUTPUT_BATCH_ROWS: usize = 10_000;

/// Derive an output batch row count from the pipeline's preferred
/// output bytes and an estimated row size, used when constructing the
/// buffer at the operator layer.
pub fn output_batch_rows(
    preferred_output_batch_bytes: usize,
    estimated_row_bytes: usize,
) -> usize {
    if estimated_row_bytes == 0 {
        return MAX_OUTPUT_BATCH_ROWS;
    }
    (preferred_output_batch_bytes / estimated_row_bytes).clamp(1, MAX_OUTPUT_BATCH_ROWS)
}

static NEXT_SORT_BUFFER_ID: AtomicUsize = AtomicUsize::new(0);

/// One entry of the projection map: the bijection between a column's
/// position in the internal (keys-first) layout and its position in
/// the input schema.
#[derive(Debug, Clone, Copy)]
struct ColumnProjection {
    internal_idx: usize,
    input_idx: usize,
}

/// Mutable operator state, behind a mutex because the arbitrator
/// observes the buffer from another thread.
struct SortState {
    store: RowStore,
    reservation: MemoryReservation,
    num_input_rows: usize,
    num_output_rows: usize,
    no_more_input: bool,
    /// Key-sorted row handles; non-empty only on the in-memory path.
    sorted_rows: Vec<RowPtr>,
    spiller: Option<Spiller>,
    merger: Option<SpillMerger>,
    /// Emitter scratch for the spill path: the source batches and
    /// `(source, row)` pairs captured from the merger for one output
    /// batch.
    merge_sources: Vec<Arc<RecordBatch>>,
    merge_rows: Vec<(usize, usize)>,
    /// Set after a non-recoverable failure; every subsequent operation
    /// is refused.
    failed: bool,
}

/// Sort-and-spill buffer. See the [module docs](self).
///
/// Operations are never invoked concurrently on one instance, but the
/// memory arbitrator may reclaim from or abort the buffer between
/// operations through its [`MemoryReclaimer`] registration.
pub struct SortBuffer {
    input_schema: SchemaRef,
    /// Keys-first permutation of the input schema; also the schema of
    /// spilled runs (field names carried so runs are self-describing).
    internal_schema: SchemaRef,
    column_map: Vec<ColumnProjection>,
    /// `output_map[input_idx]` is the internal column emitted there.
    output_map: Vec<usize>,
    compare_flags: Vec<SortOptions>,
    output_batch_size: usize,
    pool: Arc<dyn MemoryPool>,
    non_reclaimable_section: Arc<AtomicBool>,
    spill_run_counter: Arc<AtomicU64>,
    spill_config: Option<SpillConfig>,
    spill_memory_threshold: usize,
    consumer_name: String,
    state: Mutex<SortState>,
}

impl std::fmt::Debug for SortBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SortBuffer")
            .field("name", &self.consumer_name)
            .field("num_input_rows", &state.num_input_rows)
            .field("num_output_rows", &state.num_output_rows)
            .field("no_more_input", &state.no_more_input)
            .field("spilled", &state.spiller.is_some())
            .finish()
    }
}

impl SortBuffer {
    /// Create a buffer sorting `input_schema` batches by the columns at
    /// `sort_column_indices` under the parallel `sort_compare_flags`.
    ///
    /// Returns an `Arc` because a weak reclamation handle is registered
    /// with `pool`. `non_reclaimable_section` is shared with the
    /// arbitrator; `spill_run_counter` is bumped on every spill that
    /// flushes rows. Without `spill_config` the buffer never spills;
    /// `spill_memory_threshold` of 0 disables the usage-threshold
    /// trigger.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input_schema: SchemaRef,
        sort_column_indices: &[usize],
        sort_compare_flags: Vec<SortOptions>,
        output_batch_size: usize,
        pool: Arc<dyn MemoryPool>,
        non_reclaimable_section: Arc<AtomicBool>,
        spill_run_counter: Arc<AtomicU64>,
        spill_config: Option<SpillConfig>,
        spill_memory_threshold: usize,
    ) -> Result<Arc<Self>> {
        let num_columns = input_schema.fields().len();
        if sort_column_indices.is_empty() {
            return precondition_err!("at least one sort column is required");
        }
        if sort_column_indices.len() != sort_compare_flags.len() {
            return precondition_err!(
                "{} sort columns but {} compare flags",
                sort_column_indices.len(),
                sort_compare_flags.len()
            );
        }
        if output_batch_size == 0 {
            return precondition_err!("output batch size must be positive");
        }
        let distinct: HashSet<usize> = sort_column_indices.iter().copied().collect();
        if distinct.len() != sort_column_indices.len() {
            return precondition_err!("sort columns must be distinct");
        }
        if let Some(out_of_range) =
            sort_column_indices.iter().find(|idx| **idx >= num_columns)
        {
            return precondition_err!(
                "sort column {out_of_range} out of range for {num_columns} columns"
            );
        }

        // Keys first, in priority order, then the payload columns in
        // their original relative order.
        let mut column_map = Vec::with_capacity(num_columns);
        let mut internal_fields = Vec::with_capacity(num_columns);
        for (internal_idx, input_idx) in sort_column_indices.iter().enumerate() {
            column_map.push(ColumnProjection {
                internal_idx,
                input_idx: *input_idx,
            });
            internal_fields.push(spill_field(&input_schema, *input_idx));
        }
        let mut internal_idx = sort_column_indices.len();
        for input_idx in 0..num_columns {
            if distinct.contains(&input_idx) {
                continue;
            }
            column_map.push(ColumnProjection {
                internal_idx,
                input_idx,
            });
            internal_fields.push(spill_field(&input_schema, input_idx));
            internal_idx += 1;
        }
        let internal_schema: SchemaRef = Arc::new(Schema::new(internal_fields));

        let mut output_map = vec![0; num_columns];
        for projection in &column_map {
            output_map[projection.input_idx] = projection.internal_idx;
        }

        let store = RowStore::try_new(
            Arc::clone(&internal_schema),
            sort_compare_flags.len(),
        )?;
        let consumer_name = format!(
            "SortBuffer[{}]",
            NEXT_SORT_BUFFER_ID.fetch_add(1, AtomicOrdering::Relaxed)
        );
        let reservation = MemoryConsumer::new(&consumer_name)
            .with_can_spill(spill_config.is_some())
            .register(&pool);

        let this = Arc::new(Self {
            input_schema,
            internal_schema,
            column_map,
            output_map,
            compare_flags: sort_compare_flags,
            output_batch_size,
            pool: Arc::clone(&pool),
            non_reclaimable_section,
            spill_run_counter,
            spill_config,
            spill_memory_threshold,
            consumer_name,
            state: Mutex::new(SortState {
                store,
                reservation,
                num_input_rows: 0,
                num_output_rows: 0,
                no_more_input: false,
                sorted_rows: Vec::new(),
                spiller: None,
                merger: None,
                merge_sources: Vec::new(),
                merge_rows: Vec::new(),
                failed: false,
            }),
        });
        let dyn_this: Arc<dyn MemoryReclaimer> = this.clone();
        let reclaimer: Weak<dyn MemoryReclaimer> = Arc::downgrade(&dyn_this);
        pool.register_reclaimer(reclaimer);
        Ok(this)
    }

    /// Schema of the emitted batches (the input schema).
    pub fn schema(&self) -> &SchemaRef {
        &self.input_schema
    }

    /// Rows ingested so far.
    pub fn num_input_rows(&self) -> usize {
        self.state.lock().num_input_rows
    }

    /// Rows emitted so far.
    pub fn num_output_rows(&self) -> usize {
        self.state.lock().num_output_rows
    }

    /// Counters of the spiller, if any spill happened.
    pub fn spill_stats(&self) -> Option<SpillStats> {
        self.state
            .lock()
            .spiller
            .as_ref()
            .map(|spiller| spiller.stats().clone())
    }

    /// Ingest one batch. Legal only before [`Self::no_more_input`].
    pub fn add_input(&self, input: &RecordBatch) -> Result<()> {
        let mut state = self.state.lock();
        self.check_runnable(&mut state)?;
        if state.no_more_input {
            return precondition_err!("add_input called after no_more_input");
        }
        if input.num_columns() != self.input_schema.fields().len() {
            return precondition_err!(
                "input batch has {} columns, expected {}",
                input.num_columns(),
                self.input_schema.fields().len()
            );
        }
        if input.num_rows() == 0 {
            return Ok(());
        }

        if let Err(e) = self.ensure_input_fits(&mut state, input) {
            self.fail(&mut state);
            return Err(e);
        }

        // The copy must not be torn by the arbitrator. There are no
        // partial-batch semantics: a failure mid-copy leaves rows the
        // counters do not account for, so the buffer aborts.
        let _section = NonReclaimableSectionGuard::new(&self.non_reclaimable_section);
        if let Err(e) = self.copy_input(&mut state, input) {
            self.fail(&mut state);
            return Err(e);
        }
        Ok(())
    }

    /// Copy every projected column of `input` into freshly allocated
    /// rows, then account for the new footprint.
    fn copy_input(&self, state: &mut SortState, input: &RecordBatch) -> Result<()> {
        let num_rows = input.num_rows();
        state.store.reserve(num_rows);
        let rows: Vec<RowPtr> = (0..num_rows).map(|_| state.store.new_row()).collect();
        for projection in &self.column_map {
            let column = input.column(projection.input_idx);
            for (batch_row, row) in rows.iter().enumerate() {
                state
                    .store
                    .store(column, batch_row, *row, projection.internal_idx)?;
            }
        }
        state.num_input_rows += num_rows;
        self.update_reservation(state)
    }

    /// Transition from ingest to emit. Legal exactly once.
    pub fn no_more_input(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.check_runnable(&mut state)?;
        if state.no_more_input {
            return precondition_err!("no_more_input called twice");
        }
        state.no_more_input = true;
        if state.num_input_rows == 0 {
            return Ok(());
        }

        if state.spiller.is_none() {
            // Sort handles to the rows instead of the rows themselves.
            debug_assert_eq!(state.num_input_rows, state.store.num_rows());
            let mut sorted: Vec<RowPtr> = state.store.rows().collect();
            let store = &state.store;
            let flags = &self.compare_flags;
            sorted.sort_unstable_by(|left, right| {
                for (key, opts) in flags.iter().enumerate() {
                    let ord = store.compare(*left, *right, key, *opts);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
            state.sorted_rows = sorted;
        } else if let Err(e) = self.finish_spill(&mut state) {
            self.fail(&mut state);
            return Err(e);
        }
        Ok(())
    }

    /// Spill the in-memory remainder so emit never mixes the two
    /// sources, then open the merge.
    fn finish_spill(&self, state: &mut SortState) -> Result<()> {
        self.spill_locked(state)?;
        let state = &mut *state;
        let Some(spiller) = state.spiller.as_mut() else {
            return internal_err!("spiller disappeared during finalize");
        };
        spiller.finalize()?;
        debug_assert!(spiller.stats().spilled_partitions <= 1);
        state.merger = Some(spiller.start_merge()?);
        state.merge_sources = Vec::with_capacity(self.output_batch_size);
        state.merge_rows = Vec::with_capacity(self.output_batch_size);
        Ok(())
    }

    /// Next output batch in global sort order, or `None` once all
    /// ingested rows were emitted. Legal only after
    /// [`Self::no_more_input`].
    pub fn get_output(&self) -> Result<Option<RecordBatch>> {
        let mut state = self.state.lock();
        self.check_runnable(&mut state)?;
        if !state.no_more_input {
            return precondition_err!("get_output called before no_more_input");
        }
        if state.num_output_rows == state.num_input_rows {
            return Ok(None);
        }

        let batch_size = (state.num_input_rows - state.num_output_rows)
            .min(self.output_batch_size);
        let result = if state.merger.is_some() {
            self.output_with_spill(&mut state, batch_size)
        } else {
            self.output_in_memory(&mut state, batch_size)
        };
        let batch = match result {
            Ok(batch) => batch,
            Err(e) => {
                self.fail(&mut state);
                return Err(e);
            }
        };
        state.num_output_rows += batch_size;
        Ok(Some(batch))
    }

    /// Explicitly flush the in-memory rows as a sorted run. A no-op on
    /// an empty store; fails without a spill configuration.
    pub fn spill(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.check_runnable(&mut state)?;
        if self.spill_config.is_none() {
            return unconfigured_err!(
                "spill called on {} without a spill configuration",
                self.consumer_name
            );
        }
        if state.no_more_input {
            return precondition_err!("spill called after no_more_input");
        }
        if let Err(e) = self.spill_locked(&mut state) {
            self.fail(&mut state);
            return Err(e);
        }
        Ok(())
    }

    /// Pre-flight gate of `add_input`: keep the store's footprint
    /// inside the reservation while preserving progress. Spilling is
    /// the last resort after cheap local checks and a cooperative
    /// reservation growth.
    fn ensure_input_fits(&self, state: &mut SortState, input: &RecordBatch) -> Result<()> {
        let Some(config) = self.spill_config.as_ref() else {
            // Spilling disabled: nothing to gate here, the reservation
            // update after the copy surfaces any refusal.
            return Ok(());
        };
        if state.store.num_rows() == 0 {
            // Nothing buffered, nothing to spill.
            return Ok(());
        }

        if config.test_spill_pct > 0
            && rand::thread_rng().gen_range(0..100) < config.test_spill_pct
        {
            self.spill_locked(state)?;
            return Ok(());
        }

        let current_usage = state.reservation.size();
        if self.spill_memory_threshold != 0
            && current_usage > self.spill_memory_threshold
        {
            debug!(
                "{} usage {} above spill threshold {}",
                self.consumer_name,
                human_readable_size(current_usage),
                human_readable_size(self.spill_memory_threshold)
            );
            self.spill_locked(state)?;
            return Ok(());
        }

        let (free_rows, free_var_bytes) = state.store.free_space();
        let out_of_line_bytes = state.store.var_used_size();
        let flat_input_bytes = input.get_array_memory_size();

        // The batch fits in the space already carved out.
        if free_rows > input.num_rows()
            && (out_of_line_bytes == 0 || free_var_bytes >= flat_input_bytes)
        {
            return Ok(());
        }

        let var_bytes_hint = if out_of_line_bytes > 0 {
            flat_input_bytes
        } else {
            0
        };
        let incremental = state.store.size_increment(input.num_rows(), var_bytes_hint);

        // Enough already-reserved-but-unused headroom.
        let available = state
            .reservation
            .size()
            .saturating_sub(state.store.memory_usage());
        if available > RESERVATION_HEADROOM_FACTOR * incremental {
            return Ok(());
        }

        let target = (RESERVATION_HEADROOM_FACTOR * incremental)
            .max(current_usage * config.spillable_reservation_growth_pct / 100);
        {
            // While the growth blocks, the arbitrator may reclaim from
            // this buffer.
            let _reclaimable =
                ReclaimableSectionGuard::new(&self.non_reclaimable_section);
            if state.reservation.try_grow(target).is_ok() {
                return Ok(());
            }
        }

        self.spill_locked(state)?;
        Ok(())
    }

    /// Track the store's actual footprint in the reservation after a
    /// copy; spill once and retry if the pool refuses the growth.
    fn update_reservation(&self, state: &mut SortState) -> Result<()> {
        let footprint = state.store.memory_usage();
        match state.reservation.try_resize(footprint) {
            Ok(()) => Ok(()),
            Err(refusal) => {
                if self.spill_config.is_none() {
                    return Err(refusal);
                }
                self.spill_locked(state)?;
                state.reservation.try_resize(state.store.memory_usage())
            }
        }
    }

    /// Flush the store as a sorted run, clear it, and give the freed
    /// bytes back to the pool. Returns the bytes freed.
    fn spill_locked(&self, state: &mut SortState) -> Result<usize> {
        let Some(config) = self.spill_config.as_ref() else {
            return unconfigured_err!(
                "spill requested on {} without a spill configuration",
                self.consumer_name
            );
        };
        if state.store.num_rows() == 0 {
            return Ok(0);
        }

        let state = &mut *state;
        let spiller = state.spiller.get_or_insert_with(|| {
            Spiller::new(
                Arc::clone(&self.internal_schema),
                self.compare_flags.clone(),
                config,
            )
        });
        let spilled_rows = spiller.spill(&state.store)?;
        self.spill_run_counter.fetch_add(1, AtomicOrdering::SeqCst);
        state.store.clear();

        let before = state.reservation.size();
        state.reservation.resize(state.store.memory_usage());
        let freed = before.saturating_sub(state.reservation.size());
        debug!(
            "{} spilled {} rows to disk, released {} ({} run(s) so far)",
            self.consumer_name,
            spilled_rows,
            human_readable_size(freed),
            spiller.stats().spill_runs,
        );
        Ok(freed)
    }

    fn output_in_memory(
        &self,
        state: &mut SortState,
        batch_size: usize,
    ) -> Result<RecordBatch> {
        let start = state.num_output_rows;
        let handles = &state.sorted_rows[start..start + batch_size];
        let columns = self
            .output_map
            .iter()
            .map(|internal_idx| state.store.extract_column(handles, *internal_idx))
            .collect::<Result<Vec<_>>>()?;
        Ok(RecordBatch::try_new(
            Arc::clone(&self.input_schema),
            columns,
        )?)
    }

    fn output_with_spill(
        &self,
        state: &mut SortState,
        batch_size: usize,
    ) -> Result<RecordBatch> {
        let state = &mut *state;
        let Some(merger) = state.merger.as_mut() else {
            return internal_err!("spill emit without an open merge");
        };

        state.merge_sources.clear();
        state.merge_rows.clear();
        for _ in 0..batch_size {
            let Some(entry) = merger.next_entry()? else {
                return internal_err!(
                    "spill merge drained before all input rows were emitted"
                );
            };
            let source = match state
                .merge_sources
                .iter()
                .position(|batch| Arc::ptr_eq(batch, &entry.batch))
            {
                Some(existing) => existing,
                None => {
                    state.merge_sources.push(Arc::clone(&entry.batch));
                    state.merge_sources.len() - 1
                }
            };
            state.merge_rows.push((source, entry.row));
        }

        // Gather-copy the captured (source, row) pairs column by
        // column, back in input order.
        let columns = self
            .output_map
            .iter()
            .map(|internal_idx| {
                let sources: Vec<&dyn arrow::array::Array> = state
                    .merge_sources
                    .iter()
                    .map(|batch| batch.column(*internal_idx).as_ref())
                    .collect();
                Ok(interleave(&sources, &state.merge_rows)?)
            })
            .collect::<Result<Vec<ArrayRef>>>()?;
        Ok(RecordBatch::try_new(
            Arc::clone(&self.input_schema),
            columns,
        )?)
    }

    /// Fail the current call if the pool aborted (releasing
    /// everything) or if an earlier failure left the buffer terminal.
    fn check_runnable(&self, state: &mut SortState) -> Result<()> {
        if self.pool.is_aborted() {
            self.release(state);
            return aborted_err!("{} aborted by the memory pool", self.consumer_name);
        }
        if state.failed {
            return precondition_err!(
                "{} is terminal after an earlier failure",
                self.consumer_name
            );
        }
        Ok(())
    }

    /// Abort the buffer after a non-recoverable failure: release
    /// everything and refuse all subsequent operations.
    fn fail(&self, state: &mut SortState) {
        self.release(state);
        state.failed = true;
    }

    fn release(&self, state: &mut SortState) {
        state.store.clear();
        state.sorted_rows = Vec::new();
        state.spiller = None;
        state.merger = None;
        state.merge_sources = Vec::new();
        state.merge_rows = Vec::new();
        state.reservation.free();
    }
}

impl MemoryReclaimer for SortBuffer {
    fn name(&self) -> &str {
        &self.consumer_name
    }

    fn can_reclaim(&self) -> bool {
        if self.spill_config.is_none()
            || self.non_reclaimable_section.load(AtomicOrdering::SeqCst)
        {
            return false;
        }
        // Never block the arbitrator: an operation in flight means the
        // buffer is not reclaimable right now.
        match self.state.try_lock() {
            Some(state) => !state.no_more_input && state.store.num_rows() > 0,
            None => false,
        }
    }

    fn reclaimable_bytes(&self) -> usize {
        if !self.can_reclaim() {
            return 0;
        }
        self.state
            .try_lock()
            .map(|state| state.reservation.size())
            .unwrap_or(0)
    }

    fn reclaim(&self, _target_bytes: usize) -> usize {
        if self.spill_config.is_none()
            || self.non_reclaimable_section.load(AtomicOrdering::SeqCst)
        {
            return 0;
        }
        let Some(mut state) = self.state.try_lock() else {
            return 0;
        };
        // Reclamation during emit is rejected: the merge already owns
        // transient buffers that must not be invalidated.
        if state.no_more_input || state.store.num_rows() == 0 {
            return 0;
        }
        match self.spill_locked(&mut state) {
            Ok(freed) => freed,
            Err(e) => {
                warn!("{} failed to reclaim: {e}", self.consumer_name);
                0
            }
        }
    }

    fn abort(&self) {
        let mut state = self.state.lock();
        self.release(&mut state);
    }
}

fn spill_field(schema: &SchemaRef, input_idx: usize) -> Field {
    let field = schema.field(input_idx);
    Field::new(field.name(), field.data_type().clone(), true)
}
