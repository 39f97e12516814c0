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
//! Join-key canonicalization and level hashing.
//!
//! Responsibilities:
//! - Evaluates a side's key expression vector and encodes it into Arrow row
//!   format; the serialized bytes are the unit of key hashing and equality
//!   on both sides of the join.
//! - Computes the 32-bit partitioning fingerprint: CRC32C at level 0, seeded
//!   Murmur3 at deeper levels so recursive repartitioning redistributes rows
//!   that collided at the previous level.

use arrow::array::{Array, ArrayRef};
use arrow::datatypes::DataType;
use arrow::row::{RowConverter, Rows, SortField};

use crate::common::status::{ExecError, Result};
use crate::exec::chunk::Chunk;
use crate::exec::expr::{ExprArena, ExprId};
use crate::exec::join::{MAX_PARTITION_DEPTH, NUM_PARTITIONING_BITS, PARTITION_FANOUT};

/// Per-level hash seeds; level 0 seeds the CRC, deeper levels seed Murmur3.
const LEVEL_SEEDS: [u32; MAX_PARTITION_DEPTH + 1] = [
    0x9747b28c, 0x1b873593, 0xcc9e2d51, 0x85ebca6b, 0xc2b2ae35, 0x27d4eb2f, 0x165667b1,
    0xd3a2646c, 0xfd7046c5, 0xb55a4f09, 0x8f462907, 0x9e3779b9, 0x7feb352d, 0x846ca68b,
    0xe6546b64, 0x5bd1e995, 0x6a09e667,
];

/// Canonicalized keys for one chunk.
pub(crate) struct EncodedKeys {
    /// Arrow-row serialized key bytes, one row per input row.
    pub rows: Rows,
    /// True where some key that is not null-safe is null. Such rows can never
    /// produce an equality match.
    pub null_mask: Vec<bool>,
    pub has_null: bool,
}

/// Shared key codec for the build and probe sides of one join.
pub(crate) struct JoinKeyCodec {
    converter: RowConverter,
    key_types: Vec<DataType>,
    null_safe_eq: Vec<bool>,
}

impl JoinKeyCodec {
    pub(crate) fn new(key_types: Vec<DataType>, null_safe_eq: Vec<bool>) -> Result<Self> {
        if key_types.is_empty() {
            return Err(ExecError::internal("hash join requires equi-join keys"));
        }
        if key_types.len() != null_safe_eq.len() {
            return Err(ExecError::internal(format!(
                "join key null-safe flag count mismatch: key_types={} flags={}",
                key_types.len(),
                null_safe_eq.len()
            )));
        }
        let fields = key_types
            .iter()
            .map(|t| SortField::new(t.clone()))
            .collect::<Vec<_>>();
        let converter = RowConverter::new(fields).map_err(|e| {
            ExecError::internal(format!("join key row converter init failed: {e}"))
        })?;
        Ok(Self {
            converter,
            key_types,
            null_safe_eq,
        })
    }

    pub(crate) fn key_types(&self) -> &[DataType] {
        &self.key_types
    }

    pub(crate) fn null_safe_eq(&self) -> &[bool] {
        &self.null_safe_eq
    }

    /// Evaluate one side's key expressions against a chunk.
    pub(crate) fn eval_keys(
        &self,
        arena: &ExprArena,
        exprs: &[ExprId],
        chunk: &Chunk,
    ) -> Result<Vec<ArrayRef>> {
        if exprs.len() != self.key_types.len() {
            return Err(ExecError::internal(format!(
                "join key expression count mismatch: exprs={} key_types={}",
                exprs.len(),
                self.key_types.len()
            )));
        }
        let mut arrays = Vec::with_capacity(exprs.len());
        for (idx, expr) in exprs.iter().enumerate() {
            let array = arena.eval(*expr, chunk)?;
            if array.data_type() != &self.key_types[idx] {
                return Err(ExecError::internal(format!(
                    "join key {} type mismatch: expected {:?}, got {:?}",
                    idx,
                    self.key_types[idx],
                    array.data_type()
                )));
            }
            arrays.push(array);
        }
        Ok(arrays)
    }

    pub(crate) fn encode(
        &self,
        arena: &ExprArena,
        exprs: &[ExprId],
        chunk: &Chunk,
    ) -> Result<EncodedKeys> {
        let arrays = self.eval_keys(arena, exprs, chunk)?;
        self.encode_arrays(&arrays, chunk.len())
    }

    pub(crate) fn encode_arrays(
        &self,
        arrays: &[ArrayRef],
        num_rows: usize,
    ) -> Result<EncodedKeys> {
        let rows = self
            .converter
            .convert_columns(arrays)
            .map_err(|e| ExecError::internal(format!("join key row encoding failed: {e}")))?;

        let mut null_mask = vec![false; num_rows];
        let mut has_null = false;
        for (idx, array) in arrays.iter().enumerate() {
            if self.null_safe_eq[idx] || array.null_count() == 0 {
                continue;
            }
            for (row, flag) in null_mask.iter_mut().enumerate() {
                if !*flag && array.is_null(row) {
                    *flag = true;
                    has_null = true;
                }
            }
        }
        Ok(EncodedKeys {
            rows,
            null_mask,
            has_null,
        })
    }

    /// 32-bit fingerprints of the serialized keys at `level`.
    pub(crate) fn level_hashes(&self, rows: &Rows, level: usize) -> Result<Vec<u32>> {
        let seed = *LEVEL_SEEDS.get(level).ok_or_else(|| {
            ExecError::internal(format!(
                "partition level {} exceeds maximum depth {}",
                level, MAX_PARTITION_DEPTH
            ))
        })?;
        let mut hashes = Vec::with_capacity(rows.num_rows());
        if level == 0 {
            for row in rows.iter() {
                hashes.push(crc32c::crc32c_append(seed, row.data()));
            }
        } else {
            for row in rows.iter() {
                hashes.push(murmur3_32(row.data(), seed));
            }
        }
        Ok(hashes)
    }
}

/// Rough per-row byte width of the serialized key vector, for reservations
/// made before the keys are encoded.
pub(crate) fn estimated_key_width(key_types: &[DataType]) -> usize {
    key_types
        .iter()
        .map(|t| t.primitive_width().unwrap_or(16) + 1)
        .sum()
}

/// Partition index from the top bits of the fingerprint; the low bits address
/// hash-table buckets, so the two uses stay independent.
#[inline]
pub(crate) fn partition_index(hash: u32) -> usize {
    (hash >> (32 - NUM_PARTITIONING_BITS)) as usize
}

/// Group row positions by target partition. Rows flagged in `skip` are routed
/// elsewhere by the caller (e.g. null-aware streams) and excluded here.
pub(crate) fn partition_row_indices(hashes: &[u32], skip: &[bool]) -> Vec<Vec<u32>> {
    let mut out = vec![Vec::new(); PARTITION_FANOUT];
    for (row, hash) in hashes.iter().enumerate() {
        if skip.get(row).copied().unwrap_or(false) {
            continue;
        }
        out[partition_index(*hash)].push(row as u32);
    }
    out
}

/// Murmur3 x86_32 over the serialized key bytes.
pub(crate) fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut h1 = seed;
    let nblocks = data.len() / 4;
    for i in 0..nblocks {
        let k = u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap());
        let mut k1 = k.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = &data[nblocks * 4..];
    let mut k1 = 0u32;
    if tail.len() >= 3 {
        k1 ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        k1 ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        k1 ^= tail[0] as u32;
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85ebca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2ae35);
    h1 ^= h1 >> 16;
    h1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use crate::exec::expr::ExprNode;
    use arrow::array::Int32Array;
    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    fn chunk_with_keys(values: Vec<Option<i32>>, slot: SlotId) -> Chunk {
        let schema = Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("k", DataType::Int32, true),
            slot,
        )]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]).unwrap();
        Chunk::new(batch)
    }

    #[test]
    fn null_mask_respects_null_safe_flags() {
        let slot = SlotId::new(1);
        let mut arena = ExprArena::default();
        let key = arena.push_typed(ExprNode::SlotId(slot), DataType::Int32);
        let chunk = chunk_with_keys(vec![Some(1), None, Some(3)], slot);

        let codec = JoinKeyCodec::new(vec![DataType::Int32], vec![false]).unwrap();
        let encoded = codec.encode(&arena, &[key], &chunk).unwrap();
        assert_eq!(encoded.null_mask, vec![false, true, false]);
        assert!(encoded.has_null);

        let null_safe = JoinKeyCodec::new(vec![DataType::Int32], vec![true]).unwrap();
        let encoded = null_safe.encode(&arena, &[key], &chunk).unwrap();
        assert_eq!(encoded.null_mask, vec![false, false, false]);
        assert!(!encoded.has_null);
    }

    #[test]
    fn equal_keys_share_fingerprints_across_levels() {
        let slot = SlotId::new(1);
        let mut arena = ExprArena::default();
        let key = arena.push_typed(ExprNode::SlotId(slot), DataType::Int32);
        let codec = JoinKeyCodec::new(vec![DataType::Int32], vec![false]).unwrap();

        let left = codec
            .encode(&arena, &[key], &chunk_with_keys(vec![Some(42)], slot))
            .unwrap();
        let right = codec
            .encode(&arena, &[key], &chunk_with_keys(vec![Some(42), Some(7)], slot))
            .unwrap();

        for level in [0usize, 1, 2, MAX_PARTITION_DEPTH] {
            let l = codec.level_hashes(&left.rows, level).unwrap();
            let r = codec.level_hashes(&right.rows, level).unwrap();
            assert_eq!(l[0], r[0], "level {level}");
            assert_ne!(l[0], r[1], "level {level} should separate distinct keys");
        }
    }

    #[test]
    fn deeper_levels_use_an_independent_hash() {
        let slot = SlotId::new(1);
        let mut arena = ExprArena::default();
        let key = arena.push_typed(ExprNode::SlotId(slot), DataType::Int32);
        let codec = JoinKeyCodec::new(vec![DataType::Int32], vec![false]).unwrap();
        let encoded = codec
            .encode(&arena, &[key], &chunk_with_keys(vec![Some(11)], slot))
            .unwrap();
        let h0 = codec.level_hashes(&encoded.rows, 0).unwrap();
        let h1 = codec.level_hashes(&encoded.rows, 1).unwrap();
        let h2 = codec.level_hashes(&encoded.rows, 2).unwrap();
        assert_ne!(h0[0], h1[0]);
        assert_ne!(h1[0], h2[0]);
    }

    #[test]
    fn partition_index_uses_top_bits() {
        assert_eq!(partition_index(0), 0);
        assert_eq!(partition_index(u32::MAX), PARTITION_FANOUT - 1);
        assert_eq!(partition_index(1 << 28), 1);
    }

    #[test]
    fn partition_row_indices_skips_flagged_rows() {
        let hashes = vec![0u32, 1 << 28, 2 << 28];
        let skip = vec![false, true, false];
        let parts = partition_row_indices(&hashes, &skip);
        assert_eq!(parts[0], vec![0]);
        assert!(parts[1].is_empty());
        assert_eq!(parts[2], vec![2]);
    }

    #[test]
    fn murmur3_reference_vectors() {
        // Reference values for the x86_32 variant.
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e28b7);
        assert_eq!(murmur3_32(b"abcd", 0x9747b28c), murmur3_32(b"abcd", 0x9747b28c));
        assert_ne!(murmur3_32(b"abcd", 1), murmur3_32(b"abce", 1));
    }
}
