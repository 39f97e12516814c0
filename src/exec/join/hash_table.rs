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
//! Hash-table primitives for join key indexing.
//!
//! Responsibilities:
//! - Open-addressed bucket array over canonical key bytes with duplicate
//!   build rows chained through a link array.
//! - Tracks per-row matched bits (monotonic) and iterates unmatched build
//!   rows, including rows whose keys carry forbidden nulls; those rows are
//!   recorded but never linked into buckets, so they cannot match a probe.
//! - Exposes bucket prefetch hints for the probe pipeline.

use std::mem;
use std::sync::Arc;

use arrow::row::Rows;

use crate::common::status::{ExecError, Result};
use crate::runtime::mem_tracker::MemTracker;

const ROW_NONE: u32 = u32::MAX;

#[derive(Copy, Clone, Debug)]
struct Bucket {
    hash: u32,
    head: u32,
}

const EMPTY_BUCKET: Bucket = Bucket {
    hash: 0,
    head: ROW_NONE,
};

/// Hash-table container for join key buckets and build-row reference chains.
pub(crate) struct JoinHashTable {
    buckets: Vec<Bucket>,
    bucket_mask: usize,
    row_next: Vec<u32>,
    row_batch_index: Vec<u32>,
    row_in_batch: Vec<u32>,
    matched: Vec<bool>,
    key_rows: Vec<Rows>,
    row_count: usize,
    linked_rows: usize,
    distinct_keys: usize,
    mem_tracker: Option<Arc<MemTracker>>,
    accounted_bytes: i64,
}

impl JoinHashTable {
    pub(crate) fn with_capacity(expected_rows: usize) -> Self {
        let bucket_count = bucket_count_for(expected_rows);
        Self {
            buckets: vec![EMPTY_BUCKET; bucket_count],
            bucket_mask: bucket_count - 1,
            row_next: Vec::new(),
            row_batch_index: Vec::new(),
            row_in_batch: Vec::new(),
            matched: Vec::new(),
            key_rows: Vec::new(),
            row_count: 0,
            linked_rows: 0,
            distinct_keys: 0,
            mem_tracker: None,
            accounted_bytes: 0,
        }
    }

    /// Reservation estimate for a table over `num_rows` rows whose serialized
    /// keys occupy about `key_bytes` bytes.
    pub(crate) fn estimate_bytes(num_rows: usize, key_bytes: usize) -> usize {
        let buckets = bucket_count_for(num_rows) * mem::size_of::<Bucket>();
        let per_row = 3 * mem::size_of::<u32>() + mem::size_of::<bool>();
        buckets
            .saturating_add(num_rows.saturating_mul(per_row))
            .saturating_add(key_bytes)
    }

    /// Attach a tracker whose reservation for `bytes` was already consumed by
    /// the caller; the table releases it on drop.
    pub(crate) fn adopt_reservation(&mut self, tracker: Arc<MemTracker>, bytes: i64) {
        if let Some(current) = self.mem_tracker.as_ref() {
            current.release(self.accounted_bytes);
        }
        self.mem_tracker = Some(tracker);
        self.accounted_bytes = bytes;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.linked_rows == 0
    }

    pub(crate) fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Append one build batch. Rows flagged in `null_mask` are recorded for
    /// unmatched iteration but never linked into buckets.
    pub(crate) fn add_build_batch(
        &mut self,
        rows: Rows,
        null_mask: &[bool],
        hashes: &[u32],
    ) -> Result<()> {
        let num_rows = rows.num_rows();
        if hashes.len() != num_rows || null_mask.len() != num_rows {
            return Err(ExecError::internal(
                "join build batch hash/null mask length mismatch",
            ));
        }
        let next_row_count = self
            .row_count
            .checked_add(num_rows)
            .filter(|v| *v < ROW_NONE as usize)
            .ok_or_else(|| ExecError::internal("join build row count overflow"))?;
        let base_row_id = self.row_count as u32;
        let batch_index = u32::try_from(self.key_rows.len())
            .map_err(|_| ExecError::internal("join build batch count overflow"))?;

        self.row_next.resize(next_row_count, ROW_NONE);
        self.row_batch_index.resize(next_row_count, 0);
        self.row_in_batch.resize(next_row_count, 0);
        self.matched.resize(next_row_count, false);
        for row in 0..num_rows {
            let slot = base_row_id as usize + row;
            self.row_batch_index[slot] = batch_index;
            self.row_in_batch[slot] = row as u32;
        }
        self.row_count = next_row_count;
        self.key_rows.push(rows);

        for row in 0..num_rows {
            if null_mask[row] {
                continue;
            }
            self.insert_row(hashes[row], base_row_id + row as u32)?;
        }
        self.refresh_accounting();
        Ok(())
    }

    fn insert_row(&mut self, hash: u32, row_id: u32) -> Result<()> {
        self.maybe_grow()?;
        let (idx, chained) = self.find_slot(hash, row_id)?;
        if chained {
            let head = self.buckets[idx].head;
            self.row_next[row_id as usize] = head;
            self.buckets[idx].head = row_id;
        } else {
            self.buckets[idx] = Bucket { hash, head: row_id };
            self.distinct_keys += 1;
        }
        self.linked_rows += 1;
        Ok(())
    }

    fn find_slot(&self, hash: u32, row_id: u32) -> Result<(usize, bool)> {
        let key = self.key_bytes(row_id)?;
        let mut idx = (hash as usize) & self.bucket_mask;
        loop {
            let bucket = self.buckets[idx];
            if bucket.head == ROW_NONE {
                return Ok((idx, false));
            }
            if bucket.hash == hash && self.key_bytes(bucket.head)? == key {
                return Ok((idx, true));
            }
            idx = (idx + 1) & self.bucket_mask;
        }
    }

    /// Find the chain head for a probe key, or None when the key is absent.
    pub(crate) fn probe(&self, hash: u32, key: &[u8]) -> Result<Option<u32>> {
        if self.linked_rows == 0 {
            return Ok(None);
        }
        let mut idx = (hash as usize) & self.bucket_mask;
        loop {
            let bucket = self.buckets[idx];
            if bucket.head == ROW_NONE {
                return Ok(None);
            }
            if bucket.hash == hash && self.key_bytes(bucket.head)? == key {
                return Ok(Some(bucket.head));
            }
            idx = (idx + 1) & self.bucket_mask;
        }
    }

    /// Hint the cache that a probe for `hash` is imminent.
    #[inline]
    pub(crate) fn prefetch_bucket(&self, hash: u32) {
        let idx = (hash as usize) & self.bucket_mask;
        prefetch_read(self.buckets[idx..].as_ptr() as *const u8);
    }

    pub(crate) fn chain(&self, head: u32) -> ChainIter<'_> {
        ChainIter {
            row_next: &self.row_next,
            next: head,
        }
    }

    pub(crate) fn row_location(&self, row_id: u32) -> Result<(u32, u32)> {
        let slot = row_id as usize;
        let batch_idx = *self
            .row_batch_index
            .get(slot)
            .ok_or_else(|| ExecError::internal("join row id out of bounds"))?;
        let row_idx = *self
            .row_in_batch
            .get(slot)
            .ok_or_else(|| ExecError::internal("join row id out of bounds"))?;
        Ok((batch_idx, row_idx))
    }

    pub(crate) fn set_matched(&mut self, row_id: u32) {
        if let Some(flag) = self.matched.get_mut(row_id as usize) {
            *flag = true;
        }
    }

    pub(crate) fn is_matched(&self, row_id: u32) -> bool {
        self.matched.get(row_id as usize).copied().unwrap_or(false)
    }

    /// Unmatched build-row positions, grouped by build batch. Includes rows
    /// whose keys had forbidden nulls.
    pub(crate) fn unmatched_indices(&self) -> Vec<Vec<u32>> {
        let mut out = vec![Vec::new(); self.key_rows.len()];
        for row in 0..self.row_count {
            if self.matched[row] {
                continue;
            }
            let batch = self.row_batch_index[row] as usize;
            out[batch].push(self.row_in_batch[row]);
        }
        out
    }

    fn key_bytes(&self, row_id: u32) -> Result<&[u8]> {
        let slot = row_id as usize;
        let batch = *self
            .row_batch_index
            .get(slot)
            .ok_or_else(|| ExecError::internal("join row id out of bounds"))?;
        let row = *self
            .row_in_batch
            .get(slot)
            .ok_or_else(|| ExecError::internal("join row id out of bounds"))?;
        let rows = self
            .key_rows
            .get(batch as usize)
            .ok_or_else(|| ExecError::internal("join key batch out of bounds"))?;
        Ok(rows.row(row as usize).data())
    }

    fn maybe_grow(&mut self) -> Result<()> {
        if (self.distinct_keys + 1) * 2 <= self.buckets.len() {
            return Ok(());
        }
        let new_count = self
            .buckets
            .len()
            .checked_mul(2)
            .ok_or_else(|| ExecError::internal("join hash table bucket overflow"))?;
        let old = mem::replace(&mut self.buckets, vec![EMPTY_BUCKET; new_count]);
        self.bucket_mask = new_count - 1;
        for bucket in old {
            if bucket.head == ROW_NONE {
                continue;
            }
            let mut idx = (bucket.hash as usize) & self.bucket_mask;
            while self.buckets[idx].head != ROW_NONE {
                idx = (idx + 1) & self.bucket_mask;
            }
            self.buckets[idx] = bucket;
        }
        Ok(())
    }

    fn refresh_accounting(&mut self) {
        let Some(tracker) = self.mem_tracker.as_ref() else {
            return;
        };
        let bytes = self.tracked_bytes();
        let delta = bytes - self.accounted_bytes;
        if delta > 0 {
            tracker.consume(delta);
        } else if delta < 0 {
            tracker.release(-delta);
        }
        self.accounted_bytes = bytes;
    }

    pub(crate) fn tracked_bytes(&self) -> i64 {
        fn vec_bytes<T>(v: &Vec<T>) -> i64 {
            let bytes = v.capacity().saturating_mul(mem::size_of::<T>());
            i64::try_from(bytes).unwrap_or(i64::MAX)
        }

        let key_bytes: i64 = self
            .key_rows
            .iter()
            .map(|rows| i64::try_from(rows.size()).unwrap_or(i64::MAX))
            .sum();
        vec_bytes(&self.buckets)
            .saturating_add(vec_bytes(&self.row_next))
            .saturating_add(vec_bytes(&self.row_batch_index))
            .saturating_add(vec_bytes(&self.row_in_batch))
            .saturating_add(vec_bytes(&self.matched))
            .saturating_add(key_bytes)
    }
}

impl Drop for JoinHashTable {
    fn drop(&mut self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(self.accounted_bytes);
        }
    }
}

pub(crate) struct ChainIter<'a> {
    row_next: &'a [u32],
    next: u32,
}

impl Iterator for ChainIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.next == ROW_NONE {
            return None;
        }
        let current = self.next;
        self.next = self
            .row_next
            .get(current as usize)
            .copied()
            .unwrap_or(ROW_NONE);
        Some(current)
    }
}

fn bucket_count_for(expected_rows: usize) -> usize {
    expected_rows
        .saturating_mul(2)
        .next_power_of_two()
        .max(16)
}

/// Software prefetch: hint the CPU to start loading `addr` into cache.
#[inline]
fn prefetch_read(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch is a hint instruction with no side effects beyond the
    // cache; it cannot fault on any address.
    unsafe {
        use std::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
        _mm_prefetch(addr as *const i8, _MM_HINT_T0);
    }
    #[cfg(target_arch = "aarch64")]
    // SAFETY: PRFM is a hint instruction that cannot trap or fault.
    unsafe {
        std::arch::asm!(
            "prfm pldl1keep, [{addr}]",
            addr = in(reg) addr,
            options(nostack, preserves_flags, readonly),
        );
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = addr;
    }
}
