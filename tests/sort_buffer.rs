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

//! End-to-end tests of the sort buffer: total ordering, spill
//! equivalence, memory arbitration, and the operation state machine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use rand::{Rng, SeedableRng};
use sort_buffer::{
    ArbitratedMemoryPool, Error, MemoryPool, SortBuffer, SortOptions, SpillConfig,
    UnboundedMemoryPool,
};
use tempfile::TempDir;

fn int_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, true)]))
}

fn two_key_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k0", DataType::Int64, true),
        Field::new("k1", DataType::Utf8, true),
    ]))
}

fn int_batch(values: &[Option<i64>]) -> RecordBatch {
    let column: ArrayRef = Arc::new(Int64Array::from(values.to_vec()));
    RecordBatch::try_new(int_schema(), vec![column]).unwrap()
}

fn ints(values: &[i64]) -> RecordBatch {
    int_batch(&values.iter().map(|v| Some(*v)).collect::<Vec<_>>())
}

struct Fixture {
    buffer: Arc<SortBuffer>,
    spill_runs: Arc<AtomicU64>,
    // Keeps the spill directory alive for the buffer's lifetime
    _spill_dir: Option<TempDir>,
}

struct FixtureBuilder {
    schema: SchemaRef,
    sort_columns: Vec<usize>,
    flags: Vec<SortOptions>,
    output_batch_size: usize,
    pool: Arc<dyn MemoryPool>,
    spill_config: Option<(TempDir, SpillConfig)>,
    spill_memory_threshold: usize,
}

impl FixtureBuilder {
    fn new(schema: SchemaRef) -> Self {
        Self {
            schema,
            sort_columns: vec![0],
            flags: vec![SortOptions::default()],
            output_batch_size: 1024,
            pool: Arc::new(UnboundedMemoryPool::default()),
            spill_config: None,
            spill_memory_threshold: 0,
        }
    }

    fn sort_by(mut self, columns: &[usize], flags: &[SortOptions]) -> Self {
        self.sort_columns = columns.to_vec();
        self.flags = flags.to_vec();
        self
    }

    fn output_batch_size(mut self, size: usize) -> Self {
        self.output_batch_size = size;
        self
    }

    fn pool(mut self, pool: Arc<dyn MemoryPool>) -> Self {
        self.pool = pool;
        self
    }

    fn spillable(mut self, test_spill_pct: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SpillConfig::new(dir.path());
        config.test_spill_pct = test_spill_pct;
        self.spill_config = Some((dir, config));
        self
    }

    fn spill_memory_threshold(mut self, threshold: usize) -> Self {
        self.spill_memory_threshold = threshold;
        self
    }

    fn build(self) -> Fixture {
        let spill_runs = Arc::new(AtomicU64::new(0));
        let (dir, config) = match self.spill_config {
            Some((dir, config)) => (Some(dir), Some(config)),
            None => (None, None),
        };
        let buffer = SortBuffer::new(
            self.schema,
            &self.sort_columns,
            self.flags,
            self.output_batch_size,
            self.pool,
            Arc::new(AtomicBool::new(false)),
            Arc::clone(&spill_runs),
            config,
            self.spill_memory_threshold,
        )
        .unwrap();
        Fixture {
            buffer,
            spill_runs,
            _spill_dir: dir,
        }
    }
}

fn drain(buffer: &SortBuffer) -> Vec<RecordBatch> {
    let mut batches = Vec::new();
    while let Some(batch) = buffer.get_output().unwrap() {
        batches.push(batch);
    }
    batches
}

fn int_values(batches: &[RecordBatch]) -> Vec<Option<i64>> {
    let mut values = Vec::new();
    for batch in batches {
        let column = batch.column(0);
        let column = column.as_any().downcast_ref::<Int64Array>().unwrap();
        for row in 0..column.len() {
            values.push(if column.is_null(row) {
                None
            } else {
                Some(column.value(row))
            });
        }
    }
    values
}

#[test]
fn single_key_across_batches() {
    let fixture = FixtureBuilder::new(int_schema())
        .output_batch_size(3)
        .build();
    let buffer = &fixture.buffer;

    buffer.add_input(&ints(&[3, 1, 4])).unwrap();
    buffer.add_input(&ints(&[1, 5, 9, 2, 6])).unwrap();
    buffer.no_more_input().unwrap();

    let batches = drain(buffer);
    let sizes: Vec<usize> = batches.iter().map(|b| b.num_rows()).collect();
    assert_eq!(sizes, vec![3, 3, 2]);
    assert_eq!(
        int_values(&batches),
        [1, 1, 2, 3, 4, 5, 6, 9].map(Some).to_vec()
    );
    assert_eq!(buffer.num_input_rows(), 8);
    assert_eq!(buffer.num_output_rows(), 8);
}

#[test]
fn null_ordering() {
    let input = [Some(1), None, Some(2), None, Some(0)];

    let nulls_last = FixtureBuilder::new(int_schema())
        .sort_by(
            &[0],
            &[SortOptions {
                descending: false,
                nulls_first: false,
            }],
        )
        .build();
    nulls_last.buffer.add_input(&int_batch(&input)).unwrap();
    nulls_last.buffer.no_more_input().unwrap();
    assert_eq!(
        int_values(&drain(&nulls_last.buffer)),
        vec![Some(0), Some(1), Some(2), None, None]
    );

    let nulls_first = FixtureBuilder::new(int_schema())
        .sort_by(
            &[0],
            &[SortOptions {
                descending: false,
                nulls_first: true,
            }],
        )
        .build();
    nulls_first.buffer.add_input(&int_batch(&input)).unwrap();
    nulls_first.buffer.no_more_input().unwrap();
    assert_eq!(
        int_values(&drain(&nulls_first.buffer)),
        vec![None, None, Some(0), Some(1), Some(2)]
    );
}

#[test]
fn two_keys() {
    let schema = two_key_schema();
    let fixture = FixtureBuilder::new(schema.clone())
        .sort_by(&[0, 1], &[SortOptions::default(), SortOptions::default()])
        .build();
    let buffer = &fixture.buffer;

    let k0: ArrayRef = Arc::new(Int64Array::from(vec![1, 1, 0, 1]));
    let k1: ArrayRef = Arc::new(StringArray::from(vec!["b", "a", "z", "a"]));
    buffer
        .add_input(&RecordBatch::try_new(schema, vec![k0, k1]).unwrap())
        .unwrap();
    buffer.no_more_input().unwrap();

    let batches = drain(buffer);
    assert_eq!(batches.len(), 1);
    let k0 = batches[0].column(0);
    let k0 = k0.as_any().downcast_ref::<Int64Array>().unwrap();
    let k1 = batches[0].column(1);
    let k1 = k1.as_any().downcast_ref::<StringArray>().unwrap();
    let rows: Vec<(i64, &str)> = (0..4).map(|i| (k0.value(i), k1.value(i))).collect();
    assert_eq!(rows, vec![(0, "z"), (1, "a"), (1, "a"), (1, "b")]);
}

#[test]
fn forced_spill_produces_the_same_total_order() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut expected: Vec<i64> = Vec::with_capacity(300_000);
    let batches: Vec<RecordBatch> = (0..75)
        .map(|_| {
            let values: Vec<i64> = (0..4000).map(|_| rng.gen_range(-50_000..50_000)).collect();
            expected.extend_from_slice(&values);
            ints(&values)
        })
        .collect();
    expected.sort_unstable();

    let fixture = FixtureBuilder::new(int_schema())
        .output_batch_size(4096)
        .spillable(100)
        .build();
    let buffer = &fixture.buffer;

    for batch in &batches {
        buffer.add_input(batch).unwrap();
    }
    buffer.no_more_input().unwrap();

    let output = drain(buffer);
    assert!(output.iter().all(|b| b.num_rows() <= 4096));
    let values: Vec<i64> = int_values(&output).into_iter().flatten().collect();
    assert_eq!(values.len(), 300_000);
    assert_eq!(values, expected);

    let stats = buffer.spill_stats().unwrap();
    assert!(stats.spill_runs >= 1);
    assert_eq!(stats.spilled_rows, 300_000);
    assert_eq!(stats.spilled_partitions, 1);
    assert_eq!(
        fixture.spill_runs.load(Ordering::SeqCst),
        stats.spill_runs as u64
    );
}

#[test]
fn spill_equivalence_with_duplicates() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let batches: Vec<RecordBatch> = (0..10)
        .map(|_| {
            let values: Vec<i64> = (0..1000).map(|_| rng.gen_range(0..100)).collect();
            ints(&values)
        })
        .collect();

    let spilled = FixtureBuilder::new(int_schema()).spillable(100).build();
    let in_memory = FixtureBuilder::new(int_schema()).build();
    for batch in &batches {
        spilled.buffer.add_input(batch).unwrap();
        in_memory.buffer.add_input(batch).unwrap();
    }
    spilled.buffer.no_more_input().unwrap();
    in_memory.buffer.no_more_input().unwrap();

    assert_eq!(
        int_values(&drain(&spilled.buffer)),
        int_values(&drain(&in_memory.buffer))
    );
    assert!(spilled.buffer.spill_stats().unwrap().spill_runs >= 1);
    assert!(in_memory.buffer.spill_stats().is_none());
}

#[test]
fn memory_threshold_triggers_spill() {
    let with_threshold = FixtureBuilder::new(int_schema())
        .spillable(0)
        .spill_memory_threshold(1)
        .build();
    with_threshold.buffer.add_input(&ints(&[5, 2, 9])).unwrap();
    with_threshold.buffer.add_input(&ints(&[1, 8, 3])).unwrap();
    with_threshold.buffer.no_more_input().unwrap();

    let stats = with_threshold.buffer.spill_stats().unwrap();
    assert!(stats.spill_runs >= 1);
    assert_eq!(
        int_values(&drain(&with_threshold.buffer)),
        [1, 2, 3, 5, 8, 9].map(Some).to_vec()
    );

    // Threshold 0 disables the trigger; nothing else forces a spill.
    let unlimited = FixtureBuilder::new(int_schema()).spillable(0).build();
    unlimited.buffer.add_input(&ints(&[5, 2, 9])).unwrap();
    unlimited.buffer.add_input(&ints(&[1, 8, 3])).unwrap();
    unlimited.buffer.no_more_input().unwrap();
    assert!(unlimited.buffer.spill_stats().is_none());
    assert_eq!(
        int_values(&drain(&unlimited.buffer)),
        [1, 2, 3, 5, 8, 9].map(Some).to_vec()
    );
}

#[test]
fn reclaim_during_ingest_spills_and_continues() {
    let pool: Arc<dyn MemoryPool> = Arc::new(ArbitratedMemoryPool::new(64 << 20));
    let fixture = FixtureBuilder::new(int_schema())
        .pool(Arc::clone(&pool))
        .spillable(0)
        .build();
    let buffer = &fixture.buffer;

    buffer.add_input(&ints(&[30, 10])).unwrap();
    buffer.add_input(&ints(&[40, 20])).unwrap();

    // The arbitrator reclaims from another thread between operations.
    let reclaimed = pool.reclaim(usize::MAX);
    assert!(reclaimed > 0);
    assert!(buffer.spill_stats().unwrap().spill_runs >= 1);

    buffer.add_input(&ints(&[50, 0])).unwrap();
    buffer.no_more_input().unwrap();
    assert_eq!(
        int_values(&drain(buffer)),
        [0, 10, 20, 30, 40, 50].map(Some).to_vec()
    );
}

#[test]
fn reclaim_during_emit_is_rejected() {
    let pool: Arc<dyn MemoryPool> = Arc::new(ArbitratedMemoryPool::new(64 << 20));
    let fixture = FixtureBuilder::new(int_schema())
        .pool(Arc::clone(&pool))
        .output_batch_size(2)
        .spillable(100)
        .build();
    let buffer = &fixture.buffer;

    buffer.add_input(&ints(&[3, 1])).unwrap();
    buffer.add_input(&ints(&[4, 2])).unwrap();
    buffer.no_more_input().unwrap();

    let first = buffer.get_output().unwrap().unwrap();
    assert_eq!(int_values(&[first]), vec![Some(1), Some(2)]);

    // The merge owns transient buffers now; reclamation must refuse.
    assert_eq!(pool.reclaim(usize::MAX), 0);

    let rest = drain(buffer);
    assert_eq!(int_values(&rest), vec![Some(3), Some(4)]);
}

#[test]
fn output_batches_carry_the_input_schema() {
    let schema = two_key_schema();
    let fixture = FixtureBuilder::new(schema.clone())
        // sort by the payload-looking second column to force a
        // keys-first internal permutation
        .sort_by(&[1], &[SortOptions::default()])
        .build();
    let buffer = &fixture.buffer;

    let k0: ArrayRef = Arc::new(Int64Array::from(vec![1, 2]));
    let k1: ArrayRef = Arc::new(StringArray::from(vec!["b", "a"]));
    buffer
        .add_input(&RecordBatch::try_new(schema.clone(), vec![k0, k1]).unwrap())
        .unwrap();
    buffer.no_more_input().unwrap();

    let batches = drain(buffer);
    assert_eq!(batches[0].schema(), schema);
    let k0 = batches[0].column(0);
    let k0 = k0.as_any().downcast_ref::<Int64Array>().unwrap();
    assert_eq!(k0.values().as_ref(), &[2, 1]);
}

#[test]
fn draining_is_idempotent() {
    let fixture = FixtureBuilder::new(int_schema()).build();
    let buffer = &fixture.buffer;
    buffer.add_input(&ints(&[2, 1])).unwrap();
    buffer.no_more_input().unwrap();

    assert!(buffer.get_output().unwrap().is_some());
    assert!(buffer.get_output().unwrap().is_none());
    assert!(buffer.get_output().unwrap().is_none());
}

#[test]
fn empty_input_emits_nothing() {
    let fixture = FixtureBuilder::new(int_schema()).build();
    fixture.buffer.no_more_input().unwrap();
    assert!(fixture.buffer.get_output().unwrap().is_none());
}

#[test]
fn phase_violations() {
    let fixture = FixtureBuilder::new(int_schema()).build();
    let buffer = &fixture.buffer;

    assert!(matches!(
        buffer.get_output(),
        Err(Error::PreconditionViolated(_))
    ));

    buffer.add_input(&ints(&[1])).unwrap();
    buffer.no_more_input().unwrap();
    assert!(matches!(
        buffer.add_input(&ints(&[2])),
        Err(Error::PreconditionViolated(_))
    ));
    assert!(matches!(
        buffer.no_more_input(),
        Err(Error::PreconditionViolated(_))
    ));
}

#[test]
fn spill_without_configuration_fails() {
    let fixture = FixtureBuilder::new(int_schema()).build();
    fixture.buffer.add_input(&ints(&[1])).unwrap();
    assert!(matches!(
        fixture.buffer.spill(),
        Err(Error::Unconfigured(_))
    ));
}

#[test]
fn explicit_spill_during_ingest() {
    let fixture = FixtureBuilder::new(int_schema()).spillable(0).build();
    let buffer = &fixture.buffer;

    // no-op on an empty store: no run is recorded
    buffer.spill().unwrap();
    assert_eq!(fixture.spill_runs.load(Ordering::SeqCst), 0);

    buffer.add_input(&ints(&[2, 3])).unwrap();
    buffer.spill().unwrap();
    assert_eq!(fixture.spill_runs.load(Ordering::SeqCst), 1);

    buffer.add_input(&ints(&[1])).unwrap();
    buffer.no_more_input().unwrap();
    assert!(matches!(
        buffer.spill(),
        Err(Error::PreconditionViolated(_))
    ));
    assert_eq!(
        int_values(&drain(buffer)),
        vec![Some(1), Some(2), Some(3)]
    );
}

#[test]
fn growth_refused_without_spill_surfaces_oom() {
    let pool: Arc<dyn MemoryPool> = Arc::new(ArbitratedMemoryPool::new(1024));
    let fixture = FixtureBuilder::new(int_schema())
        .pool(Arc::clone(&pool))
        .build();

    let values: Vec<i64> = (0..10_000).collect();
    assert!(matches!(
        fixture.buffer.add_input(&ints(&values)),
        Err(Error::ResourcesExhausted(_))
    ));

    // The failure is terminal: resources are released and every
    // subsequent operation is refused.
    assert_eq!(pool.reserved(), 0);
    assert!(matches!(
        fixture.buffer.add_input(&ints(&[1])),
        Err(Error::PreconditionViolated(_))
    ));
    assert!(matches!(
        fixture.buffer.no_more_input(),
        Err(Error::PreconditionViolated(_))
    ));
}

#[test]
fn pool_abort_releases_the_buffer() {
    let pool: Arc<dyn MemoryPool> = Arc::new(ArbitratedMemoryPool::new(64 << 20));
    let fixture = FixtureBuilder::new(int_schema())
        .pool(Arc::clone(&pool))
        .spillable(0)
        .build();
    let buffer = &fixture.buffer;

    buffer.add_input(&ints(&[3, 1, 2])).unwrap();
    assert!(pool.reserved() > 0);

    pool.abort("query cancelled");
    assert!(matches!(
        buffer.add_input(&ints(&[4])),
        Err(Error::Aborted(_))
    ));
    assert!(matches!(buffer.get_output(), Err(Error::Aborted(_))));
    assert_eq!(pool.reserved(), 0);
}

#[test]
fn peak_pool_usage_is_observable() {
    let pool: Arc<dyn MemoryPool> = Arc::new(ArbitratedMemoryPool::new(64 << 20));
    let fixture = FixtureBuilder::new(int_schema())
        .pool(Arc::clone(&pool))
        .spillable(0)
        .build();
    let buffer = &fixture.buffer;

    buffer.add_input(&ints(&(0..5000).collect::<Vec<_>>())).unwrap();
    let peak_after_ingest = pool.peak_reserved();
    assert!(peak_after_ingest > 0);

    buffer.spill().unwrap();
    assert!(pool.reserved() < peak_after_ingest);
    assert_eq!(pool.peak_reserved(), peak_after_ingest);
}
