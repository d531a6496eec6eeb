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

//! Reading row slots back out: columnar extraction and typed per-key
//! compare.

use std::cmp::Ordering;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Date32Builder, Float32Builder,
    Float64Builder, Int16Builder, Int32Builder, Int64Builder, Int8Builder,
    StringBuilder,
};
use arrow::compute::SortOptions;
use arrow::datatypes::DataType;

use crate::error::{Error, Result};
use crate::row::{RowPtr, RowStore};

macro_rules! fn_get_primitive {
    ($NATIVE:ident, $WIDTH:literal) => {
        paste::paste! {
            fn [<get_ $NATIVE>](&self, row: RowPtr, col: usize) -> $NATIVE {
                let offset = self.layout.field_offsets[col];
                let slot = self.slot(row);
                $NATIVE::from_le_bytes(
                    slot[offset..offset + $WIDTH].try_into().unwrap(),
                )
            }
        }
    };
}

macro_rules! extract_primitive {
    ($SELF:ident, $ROWS:ident, $COL:ident, $BUILDER:ident, $GETTER:ident) => {{
        let mut builder = $BUILDER::with_capacity($ROWS.len());
        for &row in $ROWS {
            if $SELF.is_valid(row, $COL) {
                builder.append_value($SELF.$GETTER(row, $COL));
            } else {
                builder.append_null();
            }
        }
        Arc::new(builder.finish()) as ArrayRef
    }};
}

impl RowStore {
    fn_get_primitive!(i8, 1);
    fn_get_primitive!(i16, 2);
    fn_get_primitive!(i32, 4);
    fn_get_primitive!(i64, 8);
    fn_get_primitive!(f32, 4);
    fn_get_primitive!(f64, 8);

    fn get_bool(&self, row: RowPtr, col: usize) -> bool {
        let offset = self.layout.field_offsets[col];
        self.slot(row)[offset] != 0
    }

    /// Copy internal column `col` of the given rows into a freshly
    /// built array, in the order the handles appear in `rows`.
    pub fn extract_column(&self, rows: &[RowPtr], col: usize) -> Result<ArrayRef> {
        let array = match self.schema.field(col).data_type() {
            DataType::Boolean => {
                let mut builder = BooleanBuilder::with_capacity(rows.len());
                for &row in rows {
                    if self.is_valid(row, col) {
                        builder.append_value(self.get_bool(row, col));
                    } else {
                        builder.append_null();
                    }
                }
                Arc::new(builder.finish()) as ArrayRef
            }
            DataType::Int8 => extract_primitive!(self, rows, col, Int8Builder, get_i8),
            DataType::Int16 => {
                extract_primitive!(self, rows, col, Int16Builder, get_i16)
            }
            DataType::Int32 => {
                extract_primitive!(self, rows, col, Int32Builder, get_i32)
            }
            DataType::Int64 => {
                extract_primitive!(self, rows, col, Int64Builder, get_i64)
            }
            DataType::Float32 => {
                extract_primitive!(self, rows, col, Float32Builder, get_f32)
            }
            DataType::Float64 => {
                extract_primitive!(self, rows, col, Float64Builder, get_f64)
            }
            DataType::Date32 => {
                // Same 4-byte slot encoding as Int32
                extract_primitive!(self, rows, col, Date32Builder, get_i32)
            }
            DataType::Utf8 => {
                let mut builder = StringBuilder::with_capacity(rows.len(), 1024);
                for &row in rows {
                    if self.is_valid(row, col) {
                        let bytes = self.var_bytes(row, col);
                        let value = std::str::from_utf8(bytes).map_err(|e| {
                            Error::Internal(format!(
                                "row store holds invalid utf-8: {e}"
                            ))
                        })?;
                        builder.append_value(value);
                    } else {
                        builder.append_null();
                    }
                }
                Arc::new(builder.finish()) as ArrayRef
            }
            DataType::Binary => {
                let mut builder = BinaryBuilder::with_capacity(rows.len(), 1024);
                for &row in rows {
                    if self.is_valid(row, col) {
                        builder.append_value(self.var_bytes(row, col));
                    } else {
                        builder.append_null();
                    }
                }
                Arc::new(builder.finish()) as ArrayRef
            }
            _ => unimplemented!(),
        };
        Ok(array)
    }

    /// Compare two rows on key column `key` under `opts`.
    ///
    /// Null ordering follows `opts.nulls_first` independently of the
    /// direction; floats compare in IEEE total order (NaN greatest),
    /// matching arrow's sort kernels.
    pub fn compare(
        &self,
        left: RowPtr,
        right: RowPtr,
        key: usize,
        opts: SortOptions,
    ) -> Ordering {
        debug_assert!(key < self.num_keys);
        match (self.is_valid(left, key), self.is_valid(right, key)) {
            (false, false) => Ordering::Equal,
            (false, true) => {
                if opts.nulls_first {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (true, false) => {
                if opts.nulls_first {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (true, true) => {
                let ord = self.compare_values(left, right, key);
                if opts.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
        }
    }

    fn compare_values(&self, left: RowPtr, right: RowPtr, col: usize) -> Ordering {
        match self.schema.field(col).data_type() {
            DataType::Boolean => self.get_bool(left, col).cmp(&self.get_bool(right, col)),
            DataType::Int8 => self.get_i8(left, col).cmp(&self.get_i8(right, col)),
            DataType::Int16 => self.get_i16(left, col).cmp(&self.get_i16(right, col)),
            DataType::Int32 | DataType::Date32 => {
                self.get_i32(left, col).cmp(&self.get_i32(right, col))
            }
            DataType::Int64 => self.get_i64(left, col).cmp(&self.get_i64(right, col)),
            DataType::Float32 => {
                self.get_f32(left, col).total_cmp(&self.get_f32(right, col))
            }
            DataType::Float64 => {
                self.get_f64(left, col).total_cmp(&self.get_f64(right, col))
            }
            DataType::Utf8 | DataType::Binary => {
                self.var_bytes(left, col).cmp(self.var_bytes(right, col))
            }
            _ => unimplemented!(),
        }
    }
}
