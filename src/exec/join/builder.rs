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
//! Build side of the partitioned hash join.
//!
//! Responsibilities:
//! - Consumes build input one pass per level, routing rows to the hash
//!   partitions by fingerprint and spilling the largest resident partition
//!   when a reservation is denied.
//! - Builds a hash table per resident partition, spilling survivors whose
//!   table does not fit, and re-enters the same pass for repartitioning a
//!   spilled partition one level deeper.
//! - Collects null-key build rows for the null-aware anti join at routing
//!   time; those rows bypass the partitions.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use crate::common::status::{ExecError, Result};
use crate::exec::chunk::Chunk;
use crate::exec::expr::{ExprArena, ExprId};
use crate::exec::join::hash_table::JoinHashTable;
use crate::exec::join::join_key::{
    JoinKeyCodec, estimated_key_width, partition_row_indices,
};
use crate::exec::join::partition::{BuildPartition, PartitionState};
use crate::exec::join::{ChunkSource, JoinType, MAX_PARTITION_DEPTH, PARTITION_FANOUT};
use crate::exec::spill::tuple_stream::TupleStream;
use crate::petrel_logging::debug;
use crate::runtime::mem_tracker::TrackedBytes;
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile};
use crate::runtime::runtime_state::RuntimeState;

pub(crate) struct JoinBuilder {
    arena: Arc<ExprArena>,
    join_type: JoinType,
    build_exprs: Vec<ExprId>,
    codec: Arc<JoinKeyCodec>,
    build_schema: SchemaRef,
    nulls_build: Option<TupleStream>,
    build_rows_partitioned: CounterRef,
    partitions_spilled: CounterRef,
    spill_bytes: CounterRef,
    max_partition_level: CounterRef,
}

impl JoinBuilder {
    pub(crate) fn new(
        arena: Arc<ExprArena>,
        join_type: JoinType,
        build_exprs: Vec<ExprId>,
        codec: Arc<JoinKeyCodec>,
        build_schema: SchemaRef,
        profile: &RuntimeProfile,
    ) -> Self {
        Self {
            arena,
            join_type,
            build_exprs,
            codec,
            build_schema,
            nulls_build: None,
            build_rows_partitioned: profile.counter("BuildRowsPartitioned", CounterUnit::Unit),
            partitions_spilled: profile.counter("PartitionsSpilled", CounterUnit::Unit),
            spill_bytes: profile.counter("SpillBytes", CounterUnit::Bytes),
            max_partition_level: profile.counter("MaxPartitionLevel", CounterUnit::Unit),
        }
    }

    /// Level-0 pass over the build child.
    pub(crate) fn partition_build(
        &mut self,
        state: &RuntimeState,
        source: &mut dyn ChunkSource,
    ) -> Result<Vec<BuildPartition>> {
        self.partition_pass(state, source, 0)
    }

    /// Re-enter partitioning for a spilled partition's build rows, one level
    /// deeper. Consumes the partition.
    pub(crate) fn repartition(
        &mut self,
        state: &RuntimeState,
        mut input: BuildPartition,
    ) -> Result<Vec<BuildPartition>> {
        let next_level = input.level() + 1;
        if next_level > MAX_PARTITION_DEPTH {
            return Err(ExecError::mem_limit(format!(
                "partition {} still does not fit at maximum depth {}",
                input.index(),
                MAX_PARTITION_DEPTH
            )));
        }
        input.set_state(PartitionState::Repartitioning);
        let mut stream = input
            .take_build_stream()
            .ok_or_else(|| ExecError::internal("repartition input has no build stream"))?;
        stream.prepare_for_read(true)?;
        debug!(
            "repartitioning build partition: index={} level={} rows={}",
            input.index(),
            input.level(),
            input.num_rows()
        );
        let partitions = self.partition_pass(state, &mut stream, next_level)?;
        input.close();
        Ok(partitions)
    }

    /// Try to bring a spilled partition back into memory and rebuild its hash
    /// table under the current reservation. Returns false (leaving the
    /// partition spilled, its stream rewound) when the budget is denied.
    pub(crate) fn try_rebuild(
        &mut self,
        state: &RuntimeState,
        part: &mut BuildPartition,
    ) -> Result<bool> {
        let tracker = state.mem_tracker();
        let stream = part
            .build_stream_mut()
            .ok_or_else(|| ExecError::internal("rebuild candidate has no build stream"))?;
        stream.prepare_for_read(false)?;

        let mut chunks = Vec::new();
        let mut adopted = 0i64;
        let mut fits = true;
        while let Some(chunk) = stream.next_chunk()? {
            let bytes = i64::try_from(chunk.logical_bytes()).unwrap_or(i64::MAX);
            if tracker.try_consume(bytes).is_err() {
                fits = false;
                break;
            }
            adopted += bytes;
            chunks.push(chunk);
        }
        if !fits {
            tracker.release(adopted);
            return Ok(false);
        }

        part.adopt_resident(chunks, adopted);
        drop(part.take_build_stream());
        match self.try_build_table(state, part) {
            Ok(()) => Ok(true),
            Err(ExecError::MemLimitExceeded(_)) => {
                // The rows fit but the table does not; push the partition
                // back out and let the caller repartition it.
                self.spill_partition(state, part)?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Spill the largest resident partition to free memory for probe-side
    /// reservations; false when nothing resident is left to spill.
    pub(crate) fn spill_largest_resident(
        &self,
        state: &RuntimeState,
        partitions: &mut [BuildPartition],
    ) -> Result<bool> {
        let Some(victim) = pick_spill_victim(partitions) else {
            return Ok(false);
        };
        self.spill_partition(state, &mut partitions[victim])?;
        Ok(true)
    }

    /// Null-key build rows collected for the null-aware anti join.
    pub(crate) fn take_nulls_build(&mut self) -> Option<TupleStream> {
        self.nulls_build.take()
    }

    pub(crate) fn reset(&mut self) {
        self.nulls_build = None;
    }

    fn partition_pass(
        &mut self,
        state: &RuntimeState,
        source: &mut dyn ChunkSource,
        level: usize,
    ) -> Result<Vec<BuildPartition>> {
        if level > MAX_PARTITION_DEPTH {
            return Err(ExecError::mem_limit(format!(
                "partitioning past maximum depth {MAX_PARTITION_DEPTH}"
            )));
        }
        let tracker = state.mem_tracker();
        let mut partitions = (0..PARTITION_FANOUT)
            .map(|i| {
                BuildPartition::new(
                    i,
                    level,
                    Arc::clone(&self.build_schema),
                    Arc::clone(tracker),
                )
            })
            .collect::<Vec<_>>();

        while let Some(chunk) = source.next_chunk(state)? {
            state.check_cancelled()?;
            if chunk.is_empty() {
                continue;
            }
            self.partition_chunk(state, &mut partitions, &chunk, level)?;
        }
        self.build_hash_tables(state, &mut partitions)?;
        self.max_partition_level.set_max(level as i64);

        let resident = partitions.iter().filter(|p| !p.is_spilled()).count();
        debug!(
            "build pass finished: level={} resident_partitions={} spilled_partitions={} rows={}",
            level,
            resident,
            PARTITION_FANOUT - resident,
            partitions.iter().map(|p| p.num_rows()).sum::<u64>()
        );
        Ok(partitions)
    }

    fn partition_chunk(
        &mut self,
        state: &RuntimeState,
        partitions: &mut [BuildPartition],
        chunk: &Chunk,
        level: usize,
    ) -> Result<()> {
        let encoded = self.codec.encode(&self.arena, &self.build_exprs, chunk)?;
        self.build_rows_partitioned.add(chunk.len() as i64);

        let no_skip = vec![false; chunk.len()];
        let skip = if self.join_type == JoinType::NullAwareLeftAnti && encoded.has_null {
            let null_rows = encoded
                .null_mask
                .iter()
                .enumerate()
                .filter_map(|(row, is_null)| is_null.then_some(row as u32))
                .collect::<Vec<_>>();
            let null_chunk = chunk.take_rows(&null_rows)?;
            self.append_nulls_build(state, null_chunk)?;
            &encoded.null_mask
        } else {
            &no_skip
        };

        let hashes = self.codec.level_hashes(&encoded.rows, level)?;
        let routed = partition_row_indices(&hashes, skip);
        for (idx, indices) in routed.iter().enumerate() {
            if indices.is_empty() {
                continue;
            }
            let sub = if indices.len() == chunk.len() {
                chunk.clone()
            } else {
                chunk.take_rows(indices)?
            };
            self.route_chunk(state, partitions, idx, sub)?;
        }
        Ok(())
    }

    fn route_chunk(
        &mut self,
        state: &RuntimeState,
        partitions: &mut [BuildPartition],
        target: usize,
        chunk: Chunk,
    ) -> Result<()> {
        loop {
            if partitions[target].is_spilled() {
                return partitions[target].append_spilled(chunk);
            }
            match partitions[target].append_resident(&chunk) {
                Ok(()) => return Ok(()),
                Err(ExecError::MemLimitExceeded(_)) => {
                    let Some(victim) = pick_spill_victim(partitions) else {
                        return Err(ExecError::mem_limit(format!(
                            "no resident partition left to spill for a build chunk of {} bytes",
                            chunk.logical_bytes()
                        )));
                    };
                    self.spill_partition(state, &mut partitions[victim])?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn build_hash_tables(
        &mut self,
        state: &RuntimeState,
        partitions: &mut [BuildPartition],
    ) -> Result<()> {
        for idx in 0..partitions.len() {
            if partitions[idx].is_spilled() {
                continue;
            }
            match self.try_build_table(state, &mut partitions[idx]) {
                Ok(()) => {}
                Err(ExecError::MemLimitExceeded(_)) => {
                    self.spill_partition(state, &mut partitions[idx])?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn try_build_table(&self, state: &RuntimeState, part: &mut BuildPartition) -> Result<()> {
        let tracker = state.mem_tracker();
        let num_rows = part.num_rows() as usize;
        let key_bytes = estimated_key_width(self.codec.key_types()).saturating_mul(num_rows);
        let estimate = JoinHashTable::estimate_bytes(num_rows, key_bytes);
        let gate = TrackedBytes::try_new(estimate, Arc::clone(tracker))?;

        let mut table = JoinHashTable::with_capacity(num_rows);
        for chunk in part.chunks() {
            let encoded = self.codec.encode(&self.arena, &self.build_exprs, chunk)?;
            let hashes = self.codec.level_hashes(&encoded.rows, part.level())?;
            table.add_build_batch(encoded.rows, &encoded.null_mask, &hashes)?;
        }
        drop(gate);

        let actual = table.tracked_bytes();
        tracker.try_consume(actual)?;
        table.adopt_reservation(Arc::clone(tracker), actual);
        part.set_hash_table(table);
        part.set_state(PartitionState::Resident);
        Ok(())
    }

    fn spill_partition(&self, state: &RuntimeState, part: &mut BuildPartition) -> Result<()> {
        if part.level() >= MAX_PARTITION_DEPTH {
            return Err(ExecError::mem_limit(format!(
                "partition {} at maximum depth {} would spill",
                part.index(),
                MAX_PARTITION_DEPTH
            )));
        }
        part.spill(state.spiller())?;
        if let Some(stream) = part.build_stream_mut() {
            stream.set_spill_counter(Arc::clone(&self.spill_bytes));
        }
        self.partitions_spilled.add(1);
        Ok(())
    }

    fn append_nulls_build(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        if self.nulls_build.is_none() {
            self.nulls_build = Some(TupleStream::new_pinned(
                Arc::clone(&self.build_schema),
                Arc::clone(state.spiller()),
                Arc::clone(state.mem_tracker()),
            ));
        }
        let Some(stream) = self.nulls_build.as_mut() else {
            return Err(ExecError::internal("nulls build stream missing"));
        };
        stream.append(chunk)
    }
}

/// Largest resident partition, ties broken by lowest index.
fn pick_spill_victim(partitions: &[BuildPartition]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, part) in partitions.iter().enumerate() {
        if part.is_spilled() || part.resident_bytes() == 0 {
            continue;
        }
        match best {
            Some(current) if partitions[current].resident_bytes() >= part.resident_bytes() => {}
            _ => best = Some(idx),
        }
    }
    best
}
