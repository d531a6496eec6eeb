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

//! [`RowStore`]: a row-wise accumulator for columnar input.
//!
//! Each row is a fixed-width slot: `[validity bitmap] [field words]`.
//! Fixed-length fields are stored directly at their layout offset.
//! Variable-length fields (`Utf8`, `Binary`) append their bytes to a
//! side arena and store `(arena offset << 32) | length` in an 8-byte
//! word, so every slot has the same width and a [`RowPtr`] handle stays
//! valid for the store's lifetime.
//!
//! Sort keys are the first `num_keys` columns of the store's schema, so
//! [`RowStore::compare`] indexes them directly.

use arrow::datatypes::{DataType, SchemaRef};

use crate::error::Result;
use crate::precondition_err;

mod bitmap;
mod reader;
mod writer;

/// Initial slot capacity of an empty store.
const MIN_ROW_CAPACITY: usize = 256;

/// Opaque handle to a row slot, stable for the lifetime of the
/// [`RowStore`] that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowPtr(pub(crate) usize);

/// Fixed row layout derived from a schema: validity bitmap width and
/// one offset per field.
#[derive(Debug)]
pub(crate) struct RowLayout {
    pub(crate) null_width: usize,
    pub(crate) field_offsets: Vec<usize>,
    /// Total slot width, rounded up to an 8-byte word boundary.
    pub(crate) row_width: usize,
}

impl RowLayout {
    fn try_new(schema: &SchemaRef) -> Result<Self> {
        let null_width = bitmap::null_width(schema.fields().len());
        let mut field_offsets = Vec::with_capacity(schema.fields().len());
        let mut cursor = null_width;
        for field in schema.fields() {
            let Some(width) = type_width(field.data_type()) else {
                return precondition_err!(
                    "unsupported column type {} for row storage",
                    field.data_type()
                );
            };
            field_offsets.push(cursor);
            cursor += width;
        }
        Ok(Self {
            null_width,
            field_offsets,
            row_width: (cursor + 7) & !7,
        })
    }
}

/// Slot bytes a field of `dt` occupies, or `None` if the type is not
/// in the supported set.
fn type_width(dt: &DataType) -> Option<usize> {
    use DataType::*;
    match dt {
        Boolean | Int8 => Some(1),
        Int16 => Some(2),
        Int32 | Float32 | Date32 => Some(4),
        Int64 | Float64 => Some(8),
        // (arena offset, length) packed in one word
        Utf8 | Binary => Some(8),
        _ => None,
    }
}

/// Bump arena for variable-length field bytes. Offsets are indices, so
/// they survive reallocation of the backing buffer.
#[derive(Debug, Default)]
struct VarArena {
    data: Vec<u8>,
}

impl VarArena {
    fn append(&mut self, bytes: &[u8]) -> usize {
        let offset = self.data.len();
        self.data.extend_from_slice(bytes);
        offset
    }

    fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    fn free_bytes(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    fn retained_size(&self) -> usize {
        self.data.capacity()
    }
}

/// Row-packed storage of tuples with typed per-key compare and columnar
/// extraction.
#[derive(Debug)]
pub struct RowStore {
    schema: SchemaRef,
    num_keys: usize,
    layout: RowLayout,
    /// Slot buffer, always sized to `row_capacity * row_width` and
    /// zero-initialized, so a fresh slot reads as all-null.
    rows: Vec<u8>,
    row_capacity: usize,
    num_rows: usize,
    var: VarArena,
}

impl RowStore {
    /// Create a store for `schema`, whose first `num_keys` columns are
    /// the sort keys.
    pub fn try_new(schema: SchemaRef, num_keys: usize) -> Result<Self> {
        if num_keys == 0 || num_keys > schema.fields().len() {
            return precondition_err!(
                "row store requires 1..={} key columns, got {num_keys}",
                schema.fields().len()
            );
        }
        let layout = RowLayout::try_new(&schema)?;
        Ok(Self {
            schema,
            num_keys,
            layout,
            rows: Vec::new(),
            row_capacity: 0,
            num_rows: 0,
            var: VarArena::default(),
        })
    }

    /// The store's (keys-first) schema.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Number of sort key columns.
    pub fn num_keys(&self) -> usize {
        self.num_keys
    }

    /// Number of rows currently stored.
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Ensure capacity for `additional` more rows.
    pub fn reserve(&mut self, additional: usize) {
        let needed = self.num_rows + additional;
        if needed <= self.row_capacity {
            return;
        }
        let new_capacity = needed.max(self.row_capacity * 2).max(MIN_ROW_CAPACITY);
        self.rows.resize(new_capacity * self.layout.row_width, 0);
        self.row_capacity = new_capacity;
    }

    /// Allocate an empty (all-null) row and return its handle.
    pub fn new_row(&mut self) -> RowPtr {
        if self.num_rows == self.row_capacity {
            self.reserve(1);
        }
        let ptr = RowPtr(self.num_rows);
        self.num_rows += 1;
        ptr
    }

    /// Row handles in insertion order.
    pub fn rows(&self) -> impl Iterator<Item = RowPtr> + '_ {
        (0..self.num_rows).map(RowPtr)
    }

    /// `(free row slots, free variable-length bytes)` available without
    /// growing.
    pub fn free_space(&self) -> (usize, usize) {
        (self.row_capacity - self.num_rows, self.var.free_bytes())
    }

    /// Bytes retained by the variable-length arena (used or free).
    pub fn var_retained_size(&self) -> usize {
        self.var.retained_size()
    }

    /// Variable-length bytes actually occupied.
    pub fn var_used_size(&self) -> usize {
        self.var.data.len()
    }

    /// Estimated additional allocation needed to fit `n_rows` more rows
    /// carrying `var_bytes_hint` variable-length bytes.
    pub fn size_increment(&self, n_rows: usize, var_bytes_hint: usize) -> usize {
        let (free_rows, free_var_bytes) = self.free_space();
        let mut bytes = 0;
        if n_rows > free_rows {
            bytes += (n_rows - free_rows) * self.layout.row_width;
        }
        if var_bytes_hint > free_var_bytes {
            bytes += var_bytes_hint - free_var_bytes;
        }
        bytes
    }

    /// Bytes held by the slot buffer and the arena.
    pub fn memory_usage(&self) -> usize {
        self.rows.capacity() + self.var.retained_size()
    }

    /// Drop all rows and release the backing memory. Previously issued
    /// [`RowPtr`]s must not be used afterwards.
    pub fn clear(&mut self) {
        self.rows = Vec::new();
        self.row_capacity = 0;
        self.num_rows = 0;
        self.var = VarArena::default();
    }

    pub(crate) fn slot(&self, row: RowPtr) -> &[u8] {
        let start = row.0 * self.layout.row_width;
        &self.rows[start..start + self.layout.row_width]
    }

    pub(crate) fn slot_mut(&mut self, row: RowPtr) -> &mut [u8] {
        let start = row.0 * self.layout.row_width;
        &mut self.rows[start..start + self.layout.row_width]
    }

    pub(crate) fn is_valid(&self, row: RowPtr, col: usize) -> bool {
        bitmap::get_bit(&self.slot(row)[..self.layout.null_width], col)
    }

    pub(crate) fn set_valid(&mut self, row: RowPtr, col: usize) {
        let null_width = self.layout.null_width;
        bitmap::set_bit(&mut self.slot_mut(row)[..null_width], col);
    }

    pub(crate) fn set_null(&mut self, row: RowPtr, col: usize) {
        let null_width = self.layout.null_width;
        bitmap::unset_bit(&mut self.slot_mut(row)[..null_width], col);
    }

    /// Read the `(offset, length)` word of a variable-length field.
    pub(crate) fn var_bytes(&self, row: RowPtr, col: usize) -> &[u8] {
        let offset = self.layout.field_offsets[col];
        let slot = self.slot(row);
        let word = u64::from_le_bytes(slot[offset..offset + 8].try_into().unwrap());
        self.var
            .slice((word >> 32) as usize, (word & u32::MAX as u64) as usize)
    }

    pub(crate) fn arena_append(&mut self, bytes: &[u8]) -> usize {
        self.var.append(bytes)
    }
}
