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

//! Priority-queue driven k-way merge over spill runs.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, BinaryArray, BooleanArray, Date32Array, Float32Array, Float64Array,
    Int16Array, Int32Array, Int64Array, Int8Array, StringArray,
};
use arrow::compute::SortOptions;
use arrow::datatypes::DataType;
use arrow::ipc::reader::StreamReader;
use arrow::record_batch::RecordBatch;

use crate::error::Result;

/// One row handed out by [`SpillMerger::next_entry`].
///
/// `end_of_batch` is true when `row` is the last row of `batch` in its
/// source run, i.e. the next entry from the same run comes from a
/// different batch.
#[derive(Debug, Clone)]
pub struct SpillMergeEntry {
    pub batch: Arc<RecordBatch>,
    pub row: usize,
    pub end_of_batch: bool,
}

/// Sequential reader over one spill run with a current position.
struct RunCursor {
    reader: StreamReader<BufReader<File>>,
    batch: Arc<RecordBatch>,
    row: usize,
}

impl RunCursor {
    /// Open a run; `None` if it holds no rows.
    fn try_new(path: &Path) -> Result<Option<Self>> {
        let mut reader = StreamReader::try_new(BufReader::new(File::open(path)?), None)?;
        match next_batch(&mut reader)? {
            Some(batch) => Ok(Some(Self {
                reader,
                batch: Arc::new(batch),
                row: 0,
            })),
            None => Ok(None),
        }
    }
}

/// Next non-empty batch of a run, or `None` when exhausted.
fn next_batch(
    reader: &mut StreamReader<BufReader<File>>,
) -> Result<Option<RecordBatch>> {
    for batch in reader.by_ref() {
        let batch = batch?;
        if batch.num_rows() > 0 {
            return Ok(Some(batch));
        }
    }
    Ok(None)
}

/// Heap node wrapping a cursor. Ordered by the cursor's current row,
/// *reversed*, so the std max-heap pops the smallest key next.
struct HeapEntry {
    cursor: RunCursor,
    flags: Arc<[SortOptions]>,
}

impl HeapEntry {
    fn key_cmp(&self, other: &Self) -> Ordering {
        compare_key_rows(
            &self.cursor.batch,
            self.cursor.row,
            &other.cursor.batch,
            other.cursor.row,
            &self.flags,
        )
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_cmp(other).reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key_cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// K-way merge across spill runs yielding `(batch, row, end_of_batch)`
/// triples in globally sorted order. The order among equal keys is
/// unspecified.
pub struct SpillMerger {
    heap: BinaryHeap<HeapEntry>,
}

impl std::fmt::Debug for SpillMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillMerger")
            .field("active_runs", &self.heap.len())
            .finish()
    }
}

impl SpillMerger {
    pub(crate) fn try_new(
        paths: Vec<PathBuf>,
        flags: Arc<[SortOptions]>,
    ) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(paths.len());
        for path in &paths {
            if let Some(cursor) = RunCursor::try_new(path)? {
                heap.push(HeapEntry {
                    cursor,
                    flags: Arc::clone(&flags),
                });
            }
        }
        Ok(Self { heap })
    }

    /// The globally next row, or `None` when all runs are drained.
    pub fn next_entry(&mut self) -> Result<Option<SpillMergeEntry>> {
        let Some(mut top) = self.heap.pop() else {
            return Ok(None);
        };

        let batch = Arc::clone(&top.cursor.batch);
        let row = top.cursor.row;
        let end_of_batch = row + 1 == batch.num_rows();

        if end_of_batch {
            if let Some(next) = next_batch(&mut top.cursor.reader)? {
                top.cursor.batch = Arc::new(next);
                top.cursor.row = 0;
                self.heap.push(top);
            }
        } else {
            top.cursor.row += 1;
            self.heap.push(top);
        }

        Ok(Some(SpillMergeEntry {
            batch,
            row,
            end_of_batch,
        }))
    }
}

/// Lexicographic comparison of two rows on the leading key columns
/// under the per-key flags.
pub(crate) fn compare_key_rows(
    left: &RecordBatch,
    left_row: usize,
    right: &RecordBatch,
    right_row: usize,
    flags: &[SortOptions],
) -> Ordering {
    for (key, opts) in flags.iter().enumerate() {
        let ord = compare_column_values(
            left.column(key).as_ref(),
            left_row,
            right.column(key).as_ref(),
            right_row,
            *opts,
        );
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

macro_rules! cmp_values {
    ($ARRAY:ident, $LEFT:ident, $LI:ident, $RIGHT:ident, $RI:ident) => {{
        let left = $LEFT.as_any().downcast_ref::<$ARRAY>().unwrap();
        let right = $RIGHT.as_any().downcast_ref::<$ARRAY>().unwrap();
        left.value($LI).cmp(&right.value($RI))
    }};
}

macro_rules! cmp_float_values {
    ($ARRAY:ident, $LEFT:ident, $LI:ident, $RIGHT:ident, $RI:ident) => {{
        let left = $LEFT.as_any().downcast_ref::<$ARRAY>().unwrap();
        let right = $RIGHT.as_any().downcast_ref::<$ARRAY>().unwrap();
        left.value($LI).total_cmp(&right.value($RI))
    }};
}

fn compare_column_values(
    left: &dyn Array,
    left_row: usize,
    right: &dyn Array,
    right_row: usize,
    opts: SortOptions,
) -> Ordering {
    match (left.is_null(left_row), right.is_null(right_row)) {
        (true, true) => return Ordering::Equal,
        (true, false) => {
            return if opts.nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, true) => {
            return if opts.nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, false) => {}
    }

    let ord = match left.data_type() {
        DataType::Boolean => {
            cmp_values!(BooleanArray, left, left_row, right, right_row)
        }
        DataType::Int8 => cmp_values!(Int8Array, left, left_row, right, right_row),
        DataType::Int16 => cmp_values!(Int16Array, left, left_row, right, right_row),
        DataType::Int32 => cmp_values!(Int32Array, left, left_row, right, right_row),
        DataType::Int64 => cmp_values!(Int64Array, left, left_row, right, right_row),
        DataType::Date32 => {
            cmp_values!(Date32Array, left, left_row, right, right_row)
        }
        DataType::Float32 => {
            cmp_float_values!(Float32Array, left, left_row, right, right_row)
        }
        DataType::Float64 => {
            cmp_float_values!(Float64Array, left, left_row, right, right_row)
        }
        DataType::Utf8 => cmp_values!(StringArray, left, left_row, right, right_row),
        DataType::Binary => {
            cmp_values!(BinaryArray, left, left_row, right, right_row)
        }
        _ => unimplemented!(),
    };
    if opts.descending {
        ord.reverse()
    } else {
        ord
    }
}
