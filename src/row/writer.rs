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

//! Writing decoded column values into row slots.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, Float32Array,
    Float64Array, Int16Array, Int32Array, Int64Array, Int8Array, StringArray,
};
use arrow::datatypes::DataType;

use crate::error::Result;
use crate::resources_err;
use crate::row::{RowPtr, RowStore};

macro_rules! fn_store_primitive {
    ($NATIVE:ident, $ARRAY:ident) => {
        paste::paste! {
            fn [<store_ $NATIVE>](
                &mut self,
                column: &ArrayRef,
                row_idx: usize,
                row: RowPtr,
                col: usize,
            ) {
                let values = column.as_any().downcast_ref::<$ARRAY>().unwrap();
                self.set_fixed(row, col, &values.value(row_idx).to_le_bytes());
            }
        }
    };
}

impl RowStore {
    /// Write one field of `column` (the value at `row_idx`) into `row`
    /// at internal column `col`. A null value only clears the validity
    /// bit.
    pub fn store(
        &mut self,
        column: &ArrayRef,
        row_idx: usize,
        row: RowPtr,
        col: usize,
    ) -> Result<()> {
        if column.is_null(row_idx) {
            self.set_null(row, col);
            return Ok(());
        }
        self.set_valid(row, col);

        let schema = Arc::clone(&self.schema);
        match schema.field(col).data_type() {
            DataType::Boolean => {
                let values = column.as_any().downcast_ref::<BooleanArray>().unwrap();
                self.set_fixed(row, col, &[values.value(row_idx) as u8]);
            }
            DataType::Int8 => self.store_i8(column, row_idx, row, col),
            DataType::Int16 => self.store_i16(column, row_idx, row, col),
            DataType::Int32 => self.store_i32(column, row_idx, row, col),
            DataType::Int64 => self.store_i64(column, row_idx, row, col),
            DataType::Float32 => self.store_f32(column, row_idx, row, col),
            DataType::Float64 => self.store_f64(column, row_idx, row, col),
            DataType::Date32 => {
                let values = column.as_any().downcast_ref::<Date32Array>().unwrap();
                self.set_fixed(row, col, &values.value(row_idx).to_le_bytes());
            }
            DataType::Utf8 => {
                let values = column.as_any().downcast_ref::<StringArray>().unwrap();
                self.store_var(row, col, values.value(row_idx).as_bytes())?;
            }
            DataType::Binary => {
                let values = column.as_any().downcast_ref::<BinaryArray>().unwrap();
                self.store_var(row, col, values.value(row_idx))?;
            }
            _ => unimplemented!(),
        }
        Ok(())
    }

    fn_store_primitive!(i8, Int8Array);
    fn_store_primitive!(i16, Int16Array);
    fn_store_primitive!(i32, Int32Array);
    fn_store_primitive!(i64, Int64Array);
    fn_store_primitive!(f32, Float32Array);
    fn_store_primitive!(f64, Float64Array);

    fn set_fixed(&mut self, row: RowPtr, col: usize, bytes: &[u8]) {
        let offset = self.layout.field_offsets[col];
        self.slot_mut(row)[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Append `bytes` to the arena and store the packed
    /// `(offset << 32) | length` word in the slot.
    fn store_var(&mut self, row: RowPtr, col: usize, bytes: &[u8]) -> Result<()> {
        if bytes.len() > u32::MAX as usize
            || self.var_used_size() + bytes.len() > u32::MAX as usize
        {
            return resources_err!(
                "variable-length arena exceeds the addressable {} bytes",
                u32::MAX
            );
        }
        let offset = self.arena_append(bytes);
        let word = (offset as u64) << 32 | bytes.len() as u64;
        self.set_fixed(row, col, &word.to_le_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{Field, Schema, SchemaRef};

    #[test]
    fn store_fixed_and_var_fields() {
        let schema: SchemaRef = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("v", DataType::Utf8, true),
        ]));
        let mut store = RowStore::try_new(schema, 1).unwrap();

        let keys: ArrayRef = Arc::new(Int64Array::from(vec![Some(7), None]));
        let names: ArrayRef =
            Arc::new(StringArray::from(vec![Some("abcdef"), Some("")]));

        let rows: Vec<RowPtr> = (0..2).map(|_| store.new_row()).collect();
        for (i, row) in rows.iter().enumerate() {
            store.store(&keys, i, *row, 0).unwrap();
            store.store(&names, i, *row, 1).unwrap();
        }

        assert!(store.is_valid(rows[0], 0));
        assert!(!store.is_valid(rows[1], 0));
        assert_eq!(store.var_bytes(rows[0], 1), b"abcdef");
        assert_eq!(store.var_bytes(rows[1], 1), b"");
        assert_eq!(store.var_used_size(), 6);
    }
}
