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

//! Sort-and-spill buffer: the core of a streaming ORDER BY operator
//! over Arrow columnar batches.
//!
//! [`SortBuffer`] ingests an unbounded stream of record batches, sorts
//! all rows by a key prefix with per-key [`SortOptions`], and emits the
//! total order in fixed-size batches. It sorts in memory while its pool
//! reservation allows, spills its working set as sorted runs to a
//! scratch directory under memory pressure, and completes the sort as
//! an external k-way merge.
//!
//! ```
//! use std::sync::atomic::{AtomicBool, AtomicU64};
//! use std::sync::Arc;
//!
//! use arrow::array::{ArrayRef, Int64Array};
//! use arrow::datatypes::{DataType, Field, Schema};
//! use arrow::record_batch::RecordBatch;
//! use sort_buffer::{SortBuffer, SortOptions, UnboundedMemoryPool};
//!
//! # fn main() -> sort_buffer::Result<()> {
//! let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, true)]));
//! let buffer = SortBuffer::new(
//!     schema.clone(),
//!     &[0],
//!     vec![SortOptions::default()],
//!     1024,
//!     Arc::new(UnboundedMemoryPool::default()),
//!     Arc::new(AtomicBool::new(false)),
//!     Arc::new(AtomicU64::new(0)),
//!     None,
//!     0,
//! )?;
//!
//! let column: ArrayRef = Arc::new(Int64Array::from(vec![3, 1, 2]));
//! buffer.add_input(&RecordBatch::try_new(schema, vec![column])?)?;
//! buffer.no_more_input()?;
//! while let Some(batch) = buffer.get_output()? {
//!     assert!(batch.num_rows() <= 1024);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod memory_pool;
pub mod row;
pub mod sort_buffer;
pub mod spill;

pub use arrow::compute::SortOptions;

pub use error::{Error, Result};
pub use memory_pool::{
    ArbitratedMemoryPool, MemoryConsumer, MemoryPool, MemoryReclaimer,
    MemoryReservation, NonReclaimableSectionGuard, ReclaimableSectionGuard,
    UnboundedMemoryPool,
};
pub use row::{RowPtr, RowStore};
pub use sort_buffer::{output_batch_rows, SortBuffer};
pub use spill::{SpillCompression, SpillConfig, SpillMergeEntry, SpillMerger, SpillStats, Spiller};
