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

//! Helpers for the per-row validity bitmap at the head of each row
//! slot. A set bit marks the field as non-null.

/// Bytes needed to hold one validity bit per field.
pub(crate) fn null_width(field_count: usize) -> usize {
    (field_count + 7) / 8
}

pub(crate) fn get_bit(bits: &[u8], idx: usize) -> bool {
    bits[idx >> 3] & (1 << (idx & 7)) != 0
}

pub(crate) fn set_bit(bits: &mut [u8], idx: usize) {
    bits[idx >> 3] |= 1 << (idx & 7);
}

pub(crate) fn unset_bit(bits: &mut [u8], idx: usize) {
    bits[idx >> 3] &= !(1 << (idx & 7));
}
