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
//! Partitioned, spill-capable hash join operator.
//!
//! Responsibilities:
//! - Consumes the build child once through the builder, then probes in
//!   chunks: resident partitions are probed through their hash tables while
//!   rows hashing to spilled partitions are appended to co-partitioned probe
//!   streams for a later pass.
//! - Drives the five-state machine across passes: spilled partitions are
//!   either re-admitted and probed in place or repartitioned one level
//!   deeper, bounded by the maximum partition depth.
//! - Emits join output per mode, including the post-probe unmatched-build
//!   scan and the null-aware anti-join finalization.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, UInt32Array, new_null_array};
use arrow::compute::take;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::common::status::{ExecError, Result};
use crate::exec::chunk::Chunk;
use crate::exec::expr::{ExprArena, ExprId};
use crate::exec::join::builder::JoinBuilder;
use crate::exec::join::join_key::{JoinKeyCodec, partition_index, partition_row_indices};
use crate::exec::join::partition::{BuildPartition, ProbePartition, SpilledPartition};
use crate::exec::join::{
    ChunkSource, JoinType, PARTITION_FANOUT, PrefetchMode, join_type_str,
};
use crate::exec::spill::tuple_stream::TupleStream;
use crate::petrel_logging::debug;
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile, ScopedTimer};
use crate::runtime::runtime_state::RuntimeState;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum HashJoinState {
    PartitioningBuild,
    PartitioningProbe,
    ProbingSpilledPartition,
    RepartitioningBuild,
    RepartitioningProbe,
}

fn state_str(state: HashJoinState) -> &'static str {
    match state {
        HashJoinState::PartitioningBuild => "PARTITIONING_BUILD",
        HashJoinState::PartitioningProbe => "PARTITIONING_PROBE",
        HashJoinState::ProbingSpilledPartition => "PROBING_SPILLED_PARTITION",
        HashJoinState::RepartitioningBuild => "REPARTITIONING_BUILD",
        HashJoinState::RepartitioningProbe => "REPARTITIONING_PROBE",
    }
}

/// Join-mode dispatch resolved once at construction, the interpreted
/// counterpart of per-mode compiled probe entry points.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ProbeFamily {
    Inner,
    Outer,
    LeftSemiAnti,
    RightSemiAnti,
}

fn probe_family(join_type: JoinType) -> ProbeFamily {
    match join_type {
        JoinType::Inner => ProbeFamily::Inner,
        JoinType::LeftOuter | JoinType::RightOuter | JoinType::FullOuter => ProbeFamily::Outer,
        JoinType::LeftSemi | JoinType::LeftAnti | JoinType::NullAwareLeftAnti => {
            ProbeFamily::LeftSemiAnti
        }
        JoinType::RightSemi | JoinType::RightAnti => ProbeFamily::RightSemiAnti,
    }
}

pub struct HashJoinParams {
    pub arena: Arc<ExprArena>,
    pub join_type: JoinType,
    pub probe_exprs: Vec<ExprId>,
    pub build_exprs: Vec<ExprId>,
    /// Non-equi conjuncts from the ON clause, evaluated per candidate pair.
    pub other_conjuncts: Vec<ExprId>,
    pub null_safe_eq: Vec<bool>,
    pub probe_schema: SchemaRef,
    pub build_schema: SchemaRef,
    pub prefetch_mode: PrefetchMode,
    pub node_id: i32,
}

#[derive(Default)]
struct CandidateGroup {
    probe_rows: Vec<u32>,
    build_rows: Vec<u32>,
    build_row_ids: Vec<u32>,
}

pub struct PartitionedHashJoinNode {
    name: String,
    arena: Arc<ExprArena>,
    join_type: JoinType,
    family: ProbeFamily,
    probe_exprs: Vec<ExprId>,
    other_conjuncts: Vec<ExprId>,
    probe_schema: SchemaRef,
    build_schema: SchemaRef,
    /// Probe columns followed by build columns, with the null-extended side
    /// widened to nullable. Conjuncts evaluate against this shape.
    pair_schema: SchemaRef,
    output_schema: SchemaRef,
    prefetch_mode: PrefetchMode,
    codec: Arc<JoinKeyCodec>,
    builder: JoinBuilder,
    profile: RuntimeProfile,
    probe_rows_partitioned: CounterRef,
    null_aware_eval_timer: CounterRef,
    spill_bytes: CounterRef,

    state: HashJoinState,
    prepared: bool,
    opened: bool,
    eos: bool,
    current_level: usize,
    partitions: Vec<Option<BuildPartition>>,
    probe_partitions: Vec<Option<ProbePartition>>,
    spilled_partitions: Vec<SpilledPartition>,
    input_probe: Option<TupleStream>,
    output_queue: VecDeque<Chunk>,

    null_probe_rows: Option<TupleStream>,
    null_aware_probe: Option<TupleStream>,
    nulls_build: Option<TupleStream>,
    matched_null_probe: Vec<bool>,
    null_probe_sealed: bool,
}

impl PartitionedHashJoinNode {
    pub fn new(params: HashJoinParams, profile: &RuntimeProfile) -> Result<Self> {
        let HashJoinParams {
            arena,
            join_type,
            probe_exprs,
            build_exprs,
            other_conjuncts,
            null_safe_eq,
            probe_schema,
            build_schema,
            prefetch_mode,
            node_id,
        } = params;

        if probe_exprs.is_empty() || probe_exprs.len() != build_exprs.len() {
            return Err(ExecError::internal(format!(
                "hash join requires matching equi-key vectors: probe={} build={}",
                probe_exprs.len(),
                build_exprs.len()
            )));
        }
        if join_type == JoinType::NullAwareLeftAnti && null_safe_eq.iter().any(|v| *v) {
            return Err(ExecError::internal(
                "null aware anti join does not support null-safe equality keys",
            ));
        }
        validate_disjoint_slots(&probe_schema, &build_schema)?;

        let key_types = build_exprs
            .iter()
            .map(|expr| {
                arena
                    .data_type(*expr)
                    .cloned()
                    .ok_or_else(|| ExecError::internal("build key expression missing type"))
            })
            .collect::<Result<Vec<_>>>()?;
        let codec = Arc::new(JoinKeyCodec::new(key_types, null_safe_eq)?);

        let pair_schema = combined_schema(&probe_schema, &build_schema, join_type);
        let output_schema = if join_type.outputs_probe_only() {
            Arc::clone(&probe_schema)
        } else if join_type.outputs_build_only() {
            Arc::clone(&build_schema)
        } else {
            Arc::clone(&pair_schema)
        };

        let name = format!("HASH_JOIN (id={})", node_id);
        let profile = profile.child(name.clone());
        profile.add_info_string("JoinType", join_type_str(join_type));
        let builder = JoinBuilder::new(
            Arc::clone(&arena),
            join_type,
            build_exprs,
            Arc::clone(&codec),
            Arc::clone(&build_schema),
            &profile,
        );
        let probe_rows_partitioned =
            profile.counter("ProbeRowsPartitioned", CounterUnit::Unit);
        let null_aware_eval_timer =
            profile.counter("NullAwareConjunctEvalTime", CounterUnit::TimeNs);
        let spill_bytes = profile.counter("SpillBytes", CounterUnit::Bytes);

        Ok(Self {
            name,
            arena,
            join_type,
            family: probe_family(join_type),
            probe_exprs,
            other_conjuncts,
            probe_schema,
            build_schema,
            pair_schema,
            output_schema,
            prefetch_mode,
            codec,
            builder,
            profile,
            probe_rows_partitioned,
            null_aware_eval_timer,
            spill_bytes,
            state: HashJoinState::PartitioningBuild,
            prepared: false,
            opened: false,
            eos: false,
            current_level: 0,
            partitions: Vec::new(),
            probe_partitions: Vec::new(),
            spilled_partitions: Vec::new(),
            input_probe: None,
            output_queue: VecDeque::new(),
            null_probe_rows: None,
            null_aware_probe: None,
            nulls_build: None,
            matched_null_probe: Vec::new(),
            null_probe_sealed: false,
        })
    }

    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    pub fn prepare(&mut self, state: &RuntimeState) -> Result<()> {
        state.check_cancelled()?;
        self.prepared = true;
        debug!(
            "{} prepared: join_type={} prefetch={:?} chunk_size={}",
            self.name,
            join_type_str(self.join_type),
            self.prefetch_mode,
            state.chunk_size()
        );
        Ok(())
    }

    /// Consume the entire build child and get ready for probing.
    pub fn open(&mut self, state: &RuntimeState, build_input: &mut dyn ChunkSource) -> Result<()> {
        if !self.prepared {
            return Err(ExecError::internal("open called before prepare"));
        }
        if self.opened {
            return Err(ExecError::internal("open called twice without reset"));
        }
        self.update_state(HashJoinState::PartitioningBuild);
        let partitions = self.builder.partition_build(state, build_input)?;
        self.install_partitions(state, partitions)?;
        self.nulls_build = self.builder.take_nulls_build();

        if self.join_type == JoinType::NullAwareLeftAnti {
            self.null_probe_rows = Some(TupleStream::new_pinned(
                Arc::clone(&self.probe_schema),
                Arc::clone(state.spiller()),
                Arc::clone(state.mem_tracker()),
            ));
            let mut null_aware = TupleStream::new_unpinned(
                Arc::clone(&self.probe_schema),
                Arc::clone(state.spiller()),
                Arc::clone(state.mem_tracker()),
            )?;
            null_aware.set_spill_counter(Arc::clone(&self.spill_bytes));
            self.null_aware_probe = Some(null_aware);
        }

        self.update_state(HashJoinState::PartitioningProbe);
        self.opened = true;
        Ok(())
    }

    /// Produce the next output chunk, pulling probe input as needed. `None`
    /// means the join is exhausted.
    pub fn get_next(
        &mut self,
        state: &RuntimeState,
        probe_input: &mut dyn ChunkSource,
    ) -> Result<Option<Chunk>> {
        if !self.opened {
            return Err(ExecError::internal("get_next called before open"));
        }
        loop {
            if let Some(chunk) = self.output_queue.pop_front() {
                return Ok(Some(chunk));
            }
            if self.eos {
                return Ok(None);
            }
            state.check_cancelled()?;

            let next = match self.state {
                HashJoinState::PartitioningProbe => probe_input.next_chunk(state)?,
                HashJoinState::ProbingSpilledPartition
                | HashJoinState::RepartitioningProbe => match self.input_probe.as_mut() {
                    Some(stream) => stream.next_chunk()?,
                    None => {
                        return Err(ExecError::internal(
                            "spilled-partition probe without an input stream",
                        ));
                    }
                },
                HashJoinState::PartitioningBuild | HashJoinState::RepartitioningBuild => {
                    return Err(ExecError::internal(format!(
                        "get_next in build state {}",
                        state_str(self.state)
                    )));
                }
            };

            match next {
                Some(chunk) => {
                    if !chunk.is_empty() {
                        self.process_probe_chunk(state, &chunk)?;
                    }
                }
                None => {
                    self.input_probe = None;
                    self.finish_probe_pass(state)?;
                    if !self.advance_to_next_spilled(state)? {
                        self.finalize_null_aware(state)?;
                        self.eos = true;
                    }
                }
            }
        }
    }

    /// Return to the prepared state so the node can be re-executed.
    pub fn reset(&mut self) -> Result<()> {
        self.builder.reset();
        self.state = HashJoinState::PartitioningBuild;
        self.opened = false;
        self.eos = false;
        self.current_level = 0;
        self.partitions.clear();
        self.probe_partitions.clear();
        self.spilled_partitions.clear();
        self.input_probe = None;
        self.output_queue.clear();
        self.null_probe_rows = None;
        self.null_aware_probe = None;
        self.nulls_build = None;
        self.matched_null_probe.clear();
        self.null_probe_sealed = false;
        Ok(())
    }

    pub fn close(&mut self) {
        debug!(
            "{} closed: state={} probe_rows_partitioned={} spill_bytes={} queued_outputs={}",
            self.name,
            state_str(self.state),
            self.probe_rows_partitioned.value(),
            self.spill_bytes.value(),
            self.output_queue.len()
        );
        let _ = self.reset();
        self.prepared = false;
    }

    pub fn debug_string(&self) -> String {
        let resident = self
            .partitions
            .iter()
            .flatten()
            .filter(|p| !p.is_spilled())
            .count();
        let spilled = self
            .partitions
            .iter()
            .flatten()
            .filter(|p| p.is_spilled())
            .count();
        format!(
            "{} state={} level={} resident_partitions={} spilled_partitions={} pending_spilled={} queued_outputs={}",
            self.name,
            state_str(self.state),
            self.current_level,
            resident,
            spilled,
            self.spilled_partitions.len(),
            self.output_queue.len()
        )
    }

    fn update_state(&mut self, next: HashJoinState) {
        debug!(
            "{} transition {} -> {}",
            self.name,
            state_str(self.state),
            state_str(next)
        );
        self.state = next;
        self.profile
            .add_info_string("HashJoinState", state_str(next));
    }

    /// Cache the pass's partitions and create probe companions for the
    /// spilled ones (prepare-for-probe). A denied write-buffer reservation is
    /// resolved by spilling another resident partition and retrying; the
    /// newly spilled partition then needs its own probe companion.
    fn install_partitions(
        &mut self,
        state: &RuntimeState,
        mut partitions: Vec<BuildPartition>,
    ) -> Result<()> {
        let mut probe_slots: Vec<Option<ProbePartition>> =
            (0..PARTITION_FANOUT).map(|_| None).collect();
        let mut idx = 0;
        while idx < partitions.len() {
            let slot = partitions[idx].index();
            if !partitions[idx].is_spilled() || probe_slots[slot].is_some() {
                idx += 1;
                continue;
            }
            match ProbePartition::new(
                Arc::clone(&self.probe_schema),
                state.spiller(),
                state.mem_tracker(),
            ) {
                Ok(mut probe) => {
                    probe
                        .stream_mut()
                        .set_spill_counter(Arc::clone(&self.spill_bytes));
                    probe_slots[slot] = Some(probe);
                    idx += 1;
                }
                Err(ExecError::MemLimitExceeded(msg)) => {
                    if !self.builder.spill_largest_resident(state, &mut partitions)? {
                        return Err(ExecError::mem_limit(format!(
                            "cannot reserve a probe write buffer: {msg}"
                        )));
                    }
                    idx = 0;
                }
                Err(e) => return Err(e),
            }
        }
        self.current_level = partitions.first().map(|p| p.level()).unwrap_or(0);
        self.partitions = partitions.into_iter().map(Some).collect();
        self.probe_partitions = probe_slots;
        Ok(())
    }

    fn process_probe_chunk(&mut self, state: &RuntimeState, chunk: &Chunk) -> Result<()> {
        let encoded = self.codec.encode(&self.arena, &self.probe_exprs, chunk)?;
        let mut deferred = vec![false; chunk.len()];

        // Null-aware anti join reroutes null-key probe rows.
        if self.join_type == JoinType::NullAwareLeftAnti && encoded.has_null {
            let null_rows: Vec<u32> = encoded
                .null_mask
                .iter()
                .enumerate()
                .filter_map(|(row, is_null)| is_null.then_some(row as u32))
                .collect();
            let sub = chunk.take_rows(&null_rows)?;
            self.null_probe_rows
                .as_mut()
                .ok_or_else(|| ExecError::internal("null probe stream missing"))?
                .append(sub)?;
            for (row, is_null) in encoded.null_mask.iter().enumerate() {
                if *is_null {
                    deferred[row] = true;
                }
            }
        }

        let hashes = self.codec.level_hashes(&encoded.rows, self.current_level)?;

        // Per-row dispatch: rows of spilled partitions go to the paired probe
        // stream; the append path runs on the reserved write buffer.
        let routed = partition_row_indices(&hashes, &deferred);
        for (idx, indices) in routed.iter().enumerate() {
            if indices.is_empty() {
                continue;
            }
            let spilled = match self.partitions.get(idx).and_then(|slot| slot.as_ref()) {
                Some(part) => part.is_spilled(),
                None => {
                    return Err(ExecError::internal(format!(
                        "probe row hashed to partition {idx} outside the active set",
                    )));
                }
            };
            if !spilled {
                continue;
            }
            let Some(probe_part) = self
                .probe_partitions
                .get_mut(idx)
                .and_then(|slot| slot.as_mut())
            else {
                return Err(ExecError::internal(
                    "spilled build partition has no probe partition",
                ));
            };
            let sub = chunk.take_rows(indices)?;
            probe_part.append(sub)?;
            self.probe_rows_partitioned.add(indices.len() as i64);
            for row in indices {
                deferred[*row as usize] = true;
            }
        }

        if self.prefetch_mode == PrefetchMode::Prefetch {
            for row in 0..chunk.len() {
                if deferred[row] || encoded.null_mask[row] {
                    continue;
                }
                let idx = partition_index(hashes[row]);
                if let Some(table) = self
                    .partitions
                    .get(idx)
                    .and_then(|slot| slot.as_ref())
                    .and_then(|part| part.hash_table())
                {
                    table.prefetch_bucket(hashes[row]);
                }
            }
        }

        // Gather matching (probe row, build row) candidates grouped by
        // (partition, build batch); conjuncts are evaluated per group.
        let mut groups: BTreeMap<(usize, usize), CandidateGroup> = BTreeMap::new();
        for row in 0..chunk.len() {
            if deferred[row] || encoded.null_mask[row] {
                continue;
            }
            let idx = partition_index(hashes[row]);
            let Some(part) = self.partitions.get(idx).and_then(|slot| slot.as_ref()) else {
                return Err(ExecError::internal(
                    "resident probe row lost its partition",
                ));
            };
            let Some(table) = part.hash_table() else {
                return Err(ExecError::internal(format!(
                    "partition {idx} is resident but reports no hash table",
                )));
            };
            if table.is_empty() {
                continue;
            }
            let key = encoded.rows.row(row);
            if let Some(head) = table.probe(hashes[row], key.data())? {
                for row_id in table.chain(head) {
                    let (batch_idx, row_in_batch) = table.row_location(row_id)?;
                    let group = groups.entry((idx, batch_idx as usize)).or_default();
                    group.probe_rows.push(row as u32);
                    group.build_rows.push(row_in_batch);
                    group.build_row_ids.push(row_id);
                }
            }
        }

        match self.family {
            ProbeFamily::Inner => self.process_inner(state, chunk, groups),
            ProbeFamily::Outer => self.process_outer(state, chunk, groups, &deferred),
            ProbeFamily::LeftSemiAnti => {
                self.process_left_semi_anti(state, chunk, groups, &deferred)
            }
            ProbeFamily::RightSemiAnti => self.process_right_semi_anti(state, chunk, groups),
        }
    }

    fn process_inner(
        &mut self,
        state: &RuntimeState,
        chunk: &Chunk,
        groups: BTreeMap<(usize, usize), CandidateGroup>,
    ) -> Result<()> {
        for ((part_idx, batch_idx), group) in groups {
            let build_chunk = self.build_chunk(part_idx, batch_idx)?;
            let mask = self.conjunct_pass_mask(chunk, &build_chunk, &group)?;
            let mut probe_rows = Vec::new();
            let mut build_rows = Vec::new();
            for (i, pass) in mask.iter().enumerate() {
                if *pass {
                    probe_rows.push(group.probe_rows[i]);
                    build_rows.push(group.build_rows[i]);
                }
            }
            if probe_rows.is_empty() {
                continue;
            }
            let batch = join_pair_batch(
                chunk,
                &build_chunk,
                &probe_rows,
                &build_rows,
                &self.pair_schema,
            )?;
            self.push_output(state, batch)?;
        }
        Ok(())
    }

    fn process_outer(
        &mut self,
        state: &RuntimeState,
        chunk: &Chunk,
        groups: BTreeMap<(usize, usize), CandidateGroup>,
        deferred: &[bool],
    ) -> Result<()> {
        let track_build = self.join_type.tracks_build_matches();
        let mut probe_matched = vec![false; chunk.len()];

        for ((part_idx, batch_idx), group) in groups {
            let build_chunk = self.build_chunk(part_idx, batch_idx)?;
            let mask = self.conjunct_pass_mask(chunk, &build_chunk, &group)?;
            let mut probe_rows = Vec::new();
            let mut build_rows = Vec::new();
            for (i, pass) in mask.iter().enumerate() {
                if !*pass {
                    continue;
                }
                probe_matched[group.probe_rows[i] as usize] = true;
                probe_rows.push(group.probe_rows[i]);
                build_rows.push(group.build_rows[i]);
                if track_build {
                    if let Some(table) = self
                        .partitions
                        .get_mut(part_idx)
                        .and_then(|slot| slot.as_mut())
                        .and_then(|part| part.hash_table_mut())
                    {
                        table.set_matched(group.build_row_ids[i]);
                    }
                }
            }
            if probe_rows.is_empty() {
                continue;
            }
            let batch = join_pair_batch(
                chunk,
                &build_chunk,
                &probe_rows,
                &build_rows,
                &self.pair_schema,
            )?;
            self.push_output(state, batch)?;
        }

        if matches!(self.join_type, JoinType::LeftOuter | JoinType::FullOuter) {
            let unmatched: Vec<u32> = (0..chunk.len())
                .filter(|row| !deferred[*row] && !probe_matched[*row])
                .map(|row| row as u32)
                .collect();
            if !unmatched.is_empty() {
                let batch = left_with_null_right(
                    chunk,
                    &unmatched,
                    &self.build_schema,
                    &self.pair_schema,
                )?;
                self.push_output(state, batch)?;
            }
        }
        Ok(())
    }

    fn process_left_semi_anti(
        &mut self,
        state: &RuntimeState,
        chunk: &Chunk,
        groups: BTreeMap<(usize, usize), CandidateGroup>,
        deferred: &[bool],
    ) -> Result<()> {
        let mut probe_matched = vec![false; chunk.len()];
        for ((part_idx, batch_idx), group) in groups {
            // A row with one passing match needs no further evaluation, but
            // candidates were gathered per batch; the mask keeps this simple.
            let build_chunk = self.build_chunk(part_idx, batch_idx)?;
            let mask = self.conjunct_pass_mask(chunk, &build_chunk, &group)?;
            for (i, pass) in mask.iter().enumerate() {
                if *pass {
                    probe_matched[group.probe_rows[i] as usize] = true;
                }
            }
        }

        match self.join_type {
            JoinType::LeftSemi => {
                let rows: Vec<u32> = (0..chunk.len())
                    .filter(|row| probe_matched[*row])
                    .map(|row| row as u32)
                    .collect();
                if !rows.is_empty() {
                    let sub = chunk.take_rows(&rows)?;
                    self.push_output(state, sub.batch)?;
                }
            }
            JoinType::LeftAnti => {
                let rows: Vec<u32> = (0..chunk.len())
                    .filter(|row| !deferred[*row] && !probe_matched[*row])
                    .map(|row| row as u32)
                    .collect();
                if !rows.is_empty() {
                    let sub = chunk.take_rows(&rows)?;
                    self.push_output(state, sub.batch)?;
                }
            }
            JoinType::NullAwareLeftAnti => {
                // No direct output: unmatched rows must still survive the
                // null-keyed build rows, so they queue for finalization.
                let rows: Vec<u32> = (0..chunk.len())
                    .filter(|row| !deferred[*row] && !probe_matched[*row])
                    .map(|row| row as u32)
                    .collect();
                if !rows.is_empty() {
                    let sub = chunk.take_rows(&rows)?;
                    self.null_aware_probe
                        .as_mut()
                        .ok_or_else(|| {
                            ExecError::internal("null aware probe stream missing")
                        })?
                        .append(sub)?;
                }
            }
            _ => {
                return Err(ExecError::internal(
                    "left semi/anti family dispatched for a non-left mode",
                ));
            }
        }
        Ok(())
    }

    fn process_right_semi_anti(
        &mut self,
        state: &RuntimeState,
        chunk: &Chunk,
        groups: BTreeMap<(usize, usize), CandidateGroup>,
    ) -> Result<()> {
        for ((part_idx, batch_idx), group) in groups {
            let build_chunk = self.build_chunk(part_idx, batch_idx)?;
            let mask = self.conjunct_pass_mask(chunk, &build_chunk, &group)?;
            let mut emit_rows = Vec::new();
            {
                let Some(table) = self
                    .partitions
                    .get_mut(part_idx)
                    .and_then(|slot| slot.as_mut())
                    .and_then(|part| part.hash_table_mut())
                else {
                    return Err(ExecError::internal(
                        "right semi/anti probe lost its hash table",
                    ));
                };
                for (i, pass) in mask.iter().enumerate() {
                    if !*pass {
                        continue;
                    }
                    let row_id = group.build_row_ids[i];
                    // First match wins; marked rows are skipped.
                    if table.is_matched(row_id) {
                        continue;
                    }
                    table.set_matched(row_id);
                    if self.join_type == JoinType::RightSemi {
                        emit_rows.push(group.build_rows[i]);
                    }
                }
            }
            if !emit_rows.is_empty() {
                let sub = build_chunk.take_rows(&emit_rows)?;
                self.push_output(state, sub.batch)?;
            }
        }
        Ok(())
    }

    /// End of one probe pass: run the null-probe evaluation over the pass's
    /// resident build rows, emit unmatched build output, and move spilled
    /// pairs onto the processing stack.
    fn finish_probe_pass(&mut self, state: &RuntimeState) -> Result<()> {
        if self.join_type == JoinType::NullAwareLeftAnti {
            self.seal_null_probe_rows();
            let resident_build: Vec<Vec<Chunk>> = self
                .partitions
                .iter()
                .flatten()
                .filter(|part| !part.is_spilled())
                .map(|part| part.chunks().to_vec())
                .collect();
            let _timer = ScopedTimer::new(Arc::clone(&self.null_aware_eval_timer));
            for chunks in resident_build {
                self.evaluate_null_probe_against(state, &chunks)?;
            }
        }

        let partitions = std::mem::take(&mut self.partitions);
        let mut probe_partitions = std::mem::take(&mut self.probe_partitions);
        probe_partitions.resize_with(partitions.len(), || None);

        for (slot, probe_slot) in partitions.into_iter().zip(probe_partitions) {
            let Some(mut part) = slot else { continue };
            if part.is_spilled() {
                let Some(probe) = probe_slot else {
                    return Err(ExecError::internal(
                        "spilled build partition has no probe partition at cleanup",
                    ));
                };
                debug!(
                    "{} queueing spilled partition: index={} level={} build_rows={} probe_rows={}",
                    self.name,
                    part.index(),
                    part.level(),
                    part.num_rows(),
                    probe.num_rows()
                );
                self.spilled_partitions.push(SpilledPartition {
                    build: part,
                    probe,
                });
            } else {
                if self.join_type.needs_unmatched_build_output() {
                    self.queue_unmatched_build(state, &part)?;
                }
                part.close();
            }
        }
        Ok(())
    }

    /// Pop the next spilled pair (most recent first) and either re-admit its
    /// build side or repartition one level deeper. Returns false when no
    /// spilled work remains.
    fn advance_to_next_spilled(&mut self, state: &RuntimeState) -> Result<bool> {
        let Some(SpilledPartition { mut build, probe }) = self.spilled_partitions.pop() else {
            return Ok(false);
        };
        state.check_cancelled()?;

        if self.builder.try_rebuild(state, &mut build)? {
            self.update_state(HashJoinState::ProbingSpilledPartition);
            self.current_level = build.level();
            let index = build.index();
            let mut slots: Vec<Option<BuildPartition>> =
                (0..PARTITION_FANOUT).map(|_| None).collect();
            slots[index] = Some(build);
            self.partitions = slots;
            self.probe_partitions = (0..PARTITION_FANOUT).map(|_| None).collect();
            let mut stream = probe.into_stream();
            stream.prepare_for_read(true)?;
            self.input_probe = Some(stream);
        } else {
            self.update_state(HashJoinState::RepartitioningBuild);
            let partitions = self.builder.repartition(state, build)?;
            self.install_partitions(state, partitions)?;
            self.update_state(HashJoinState::RepartitioningProbe);
            let mut stream = probe.into_stream();
            stream.prepare_for_read(true)?;
            self.input_probe = Some(stream);
        }
        Ok(true)
    }

    fn queue_unmatched_build(&mut self, state: &RuntimeState, part: &BuildPartition) -> Result<()> {
        let Some(table) = part.hash_table() else {
            return Err(ExecError::internal(
                "unmatched-build scan on a partition without a hash table",
            ));
        };
        let unmatched = table.unmatched_indices();
        for (batch_idx, indices) in unmatched.iter().enumerate() {
            if indices.is_empty() {
                continue;
            }
            let Some(build_chunk) = part.chunks().get(batch_idx) else {
                return Err(ExecError::internal(
                    "unmatched-build batch index out of bounds",
                ));
            };
            let batch = match self.join_type {
                JoinType::RightAnti => build_chunk.take_rows(indices)?.batch,
                JoinType::RightOuter | JoinType::FullOuter => null_left_with_right(
                    build_chunk,
                    indices,
                    &self.probe_schema,
                    &self.pair_schema,
                )?,
                _ => {
                    return Err(ExecError::internal(
                        "unmatched-build scan for a mode that does not emit build rows",
                    ));
                }
            };
            self.push_output(state, batch)?;
        }
        Ok(())
    }

    fn build_chunk(&self, part_idx: usize, batch_idx: usize) -> Result<Chunk> {
        let Some(part) = self.partitions.get(part_idx).and_then(|slot| slot.as_ref()) else {
            return Err(ExecError::internal("candidate group lost its partition"));
        };
        part.chunks()
            .get(batch_idx)
            .cloned()
            .ok_or_else(|| ExecError::internal("candidate group batch index out of bounds"))
    }

    /// True per candidate pair when every other-join conjunct evaluates to
    /// true; a null conjunct value does not pass.
    fn conjunct_pass_mask(
        &self,
        probe: &Chunk,
        build: &Chunk,
        group: &CandidateGroup,
    ) -> Result<Vec<bool>> {
        if self.other_conjuncts.is_empty() {
            return Ok(vec![true; group.probe_rows.len()]);
        }
        let batch = join_pair_batch(
            probe,
            build,
            &group.probe_rows,
            &group.build_rows,
            &self.pair_schema,
        )?;
        let candidate = Chunk::try_new(batch)?;
        self.conjunct_mask_over(&candidate)
    }

    fn conjunct_mask_over(&self, candidate: &Chunk) -> Result<Vec<bool>> {
        let mut mask = vec![true; candidate.len()];
        for conjunct in &self.other_conjuncts {
            let arr = self.arena.eval(*conjunct, candidate)?;
            let bools = arr
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| {
                    ExecError::expr("join conjunct must evaluate to a boolean array")
                })?;
            for (i, flag) in mask.iter_mut().enumerate() {
                if *flag && (!bools.is_valid(i) || !bools.value(i)) {
                    *flag = false;
                }
            }
        }
        Ok(mask)
    }

    /// Per entry of `probe_rows`: does any row of `build` pass the conjuncts
    /// against it? Used by the null-aware protocol.
    fn cross_match_any(
        &self,
        probe: &Chunk,
        probe_rows: &[u32],
        build: &Chunk,
    ) -> Result<Vec<bool>> {
        let n = probe_rows.len();
        if n == 0 || build.is_empty() {
            return Ok(vec![false; n]);
        }
        if self.other_conjuncts.is_empty() {
            return Ok(vec![true; n]);
        }
        let mut result = vec![false; n];
        let slice_rows = 1024usize;
        let mut start = 0usize;
        while start < build.len() {
            let len = slice_rows.min(build.len() - start);
            let build_slice = build.slice(start, len);
            let mut owners = Vec::new();
            let mut probe_idx = Vec::new();
            let mut build_idx = Vec::new();
            for (i, probe_row) in probe_rows.iter().enumerate() {
                if result[i] {
                    continue;
                }
                for b in 0..len {
                    owners.push(i);
                    probe_idx.push(*probe_row);
                    build_idx.push(b as u32);
                }
            }
            if owners.is_empty() {
                break;
            }
            let batch = join_pair_batch(
                probe,
                &build_slice,
                &probe_idx,
                &build_idx,
                &self.pair_schema,
            )?;
            let candidate = Chunk::try_new(batch)?;
            let mask = self.conjunct_mask_over(&candidate)?;
            for (i, pass) in mask.iter().enumerate() {
                if *pass {
                    result[owners[i]] = true;
                }
            }
            start += len;
        }
        Ok(result)
    }

    fn seal_null_probe_rows(&mut self) {
        if self.null_probe_sealed {
            return;
        }
        let total = self
            .null_probe_rows
            .as_ref()
            .map(|stream| stream.num_rows() as usize)
            .unwrap_or(0);
        self.matched_null_probe = vec![false; total];
        self.null_probe_sealed = true;
    }

    /// Mark null-keyed probe rows that pass the conjuncts against any of the
    /// given build rows; their null key makes the equality unknown, so any
    /// conjunct match disables anti emission.
    fn evaluate_null_probe_against(
        &mut self,
        state: &RuntimeState,
        build_chunks: &[Chunk],
    ) -> Result<()> {
        if self.matched_null_probe.is_empty()
            || self.matched_null_probe.iter().all(|m| *m)
            || build_chunks.iter().all(|c| c.is_empty())
        {
            return Ok(());
        }
        let probe_chunks: Vec<Chunk> = match self.null_probe_rows.as_ref() {
            Some(stream) => stream.pinned_chunks()?.to_vec(),
            None => return Ok(()),
        };
        let mut offset = 0usize;
        for probe_chunk in &probe_chunks {
            state.check_cancelled()?;
            for build_chunk in build_chunks {
                let pending: Vec<u32> = (0..probe_chunk.len())
                    .filter(|row| !self.matched_null_probe[offset + row])
                    .map(|row| row as u32)
                    .collect();
                if pending.is_empty() {
                    break;
                }
                let matched = self.cross_match_any(probe_chunk, &pending, build_chunk)?;
                for (i, m) in matched.iter().enumerate() {
                    if *m {
                        self.matched_null_probe[offset + pending[i] as usize] = true;
                    }
                }
            }
            offset += probe_chunk.len();
        }
        Ok(())
    }

    /// Null-aware finalization, run after all regular probing completes.
    fn finalize_null_aware(&mut self, state: &RuntimeState) -> Result<()> {
        if self.join_type != JoinType::NullAwareLeftAnti {
            return Ok(());
        }
        self.seal_null_probe_rows();
        let nulls_build = self.nulls_build.take();
        let build_chunks: Vec<Chunk> = match nulls_build.as_ref() {
            Some(stream) => stream.pinned_chunks()?.to_vec(),
            None => Vec::new(),
        };
        let has_null_build = build_chunks.iter().any(|c| !c.is_empty());

        // Null-keyed build rows participate in the null-probe evaluation too.
        {
            let _timer = ScopedTimer::new(Arc::clone(&self.null_aware_eval_timer));
            self.evaluate_null_probe_against(state, &build_chunks)?;
        }

        // First phase: probe rows without an equality match survive only when
        // no null-keyed build row passes the conjuncts.
        if let Some(mut stream) = self.null_aware_probe.take() {
            stream.prepare_for_read(true)?;
            while let Some(chunk) = stream.next_chunk()? {
                state.check_cancelled()?;
                let mut alive = vec![true; chunk.len()];
                if has_null_build {
                    let _timer = ScopedTimer::new(Arc::clone(&self.null_aware_eval_timer));
                    for build_chunk in &build_chunks {
                        let pending: Vec<u32> = (0..chunk.len())
                            .filter(|row| alive[*row])
                            .map(|row| row as u32)
                            .collect();
                        if pending.is_empty() {
                            break;
                        }
                        let matched = self.cross_match_any(&chunk, &pending, build_chunk)?;
                        for (i, m) in matched.iter().enumerate() {
                            if *m {
                                alive[pending[i] as usize] = false;
                            }
                        }
                    }
                }
                let survivors: Vec<u32> = (0..chunk.len())
                    .filter(|row| alive[*row])
                    .map(|row| row as u32)
                    .collect();
                if !survivors.is_empty() {
                    let sub = chunk.take_rows(&survivors)?;
                    self.push_output(state, sub.batch)?;
                }
            }
        }

        // Second phase: null-keyed probe rows that never matched.
        if let Some(stream) = self.null_probe_rows.take() {
            let mut offset = 0usize;
            for chunk in stream.pinned_chunks()? {
                let survivors: Vec<u32> = (0..chunk.len())
                    .filter(|row| !self.matched_null_probe[offset + row])
                    .map(|row| row as u32)
                    .collect();
                if !survivors.is_empty() {
                    let sub = chunk.take_rows(&survivors)?;
                    self.push_output(state, sub.batch)?;
                }
                offset += chunk.len();
            }
        }
        Ok(())
    }

    /// Queue an output batch, sliced to the configured chunk size.
    fn push_output(&mut self, state: &RuntimeState, batch: RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        let chunk = Chunk::try_new(batch)?;
        let capacity = state.chunk_size().max(1);
        let mut offset = 0usize;
        while offset < chunk.len() {
            let len = capacity.min(chunk.len() - offset);
            self.output_queue.push_back(chunk.slice(offset, len));
            offset += len;
        }
        Ok(())
    }
}

fn validate_disjoint_slots(probe: &SchemaRef, build: &SchemaRef) -> Result<()> {
    use crate::exec::chunk::field_slot_id;
    let mut seen = std::collections::HashSet::new();
    for field in probe.fields().iter().chain(build.fields().iter()) {
        let Some(slot) = field_slot_id(field.as_ref())? else {
            return Err(ExecError::internal(format!(
                "join schema field '{}' is missing a slot id",
                field.name()
            )));
        };
        if !seen.insert(slot) {
            return Err(ExecError::internal(format!(
                "join schemas share slot id {slot}",
            )));
        }
    }
    Ok(())
}

/// Probe columns followed by build columns; the side a mode null-extends is
/// widened to nullable.
fn combined_schema(probe: &SchemaRef, build: &SchemaRef, join_type: JoinType) -> SchemaRef {
    let probe_nullable = matches!(join_type, JoinType::RightOuter | JoinType::FullOuter);
    let build_nullable = matches!(join_type, JoinType::LeftOuter | JoinType::FullOuter);
    let mut fields = Vec::with_capacity(probe.fields().len() + build.fields().len());
    for field in probe.fields() {
        let f = field.as_ref().clone();
        fields.push(if probe_nullable { f.with_nullable(true) } else { f });
    }
    for field in build.fields() {
        let f = field.as_ref().clone();
        fields.push(if build_nullable { f.with_nullable(true) } else { f });
    }
    Arc::new(arrow::datatypes::Schema::new(fields))
}

fn join_pair_batch(
    left: &Chunk,
    right: &Chunk,
    left_rows: &[u32],
    right_rows: &[u32],
    schema: &SchemaRef,
) -> Result<RecordBatch> {
    let left_idx = UInt32Array::from(left_rows.to_vec());
    let right_idx = UInt32Array::from(right_rows.to_vec());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for column in left.columns() {
        columns.push(
            take(column, &left_idx, None)
                .map_err(|e| ExecError::internal(format!("join take failed: {e}")))?,
        );
    }
    for column in right.columns() {
        columns.push(
            take(column, &right_idx, None)
                .map_err(|e| ExecError::internal(format!("join take failed: {e}")))?,
        );
    }
    RecordBatch::try_new(Arc::clone(schema), columns)
        .map_err(|e| ExecError::internal(format!("join output batch failed: {e}")))
}

/// Probe rows extended with nulls for every build column.
fn left_with_null_right(
    probe: &Chunk,
    probe_rows: &[u32],
    build_schema: &SchemaRef,
    schema: &SchemaRef,
) -> Result<RecordBatch> {
    let idx = UInt32Array::from(probe_rows.to_vec());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for column in probe.columns() {
        columns.push(
            take(column, &idx, None)
                .map_err(|e| ExecError::internal(format!("join take failed: {e}")))?,
        );
    }
    for field in build_schema.fields() {
        columns.push(new_null_array(field.data_type(), probe_rows.len()));
    }
    RecordBatch::try_new(Arc::clone(schema), columns)
        .map_err(|e| ExecError::internal(format!("join output batch failed: {e}")))
}

/// Build rows extended with nulls for every probe column.
fn null_left_with_right(
    build: &Chunk,
    build_rows: &[u32],
    probe_schema: &SchemaRef,
    schema: &SchemaRef,
) -> Result<RecordBatch> {
    let idx = UInt32Array::from(build_rows.to_vec());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for field in probe_schema.fields() {
        columns.push(new_null_array(field.data_type(), build_rows.len()));
    }
    for column in build.columns() {
        columns.push(
            take(column, &idx, None)
                .map_err(|e| ExecError::internal(format!("join take failed: {e}")))?,
        );
    }
    RecordBatch::try_new(Arc::clone(schema), columns)
        .map_err(|e| ExecError::internal(format!("join output batch failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use crate::exec::expr::ExprNode;
    use crate::exec::join::MemoryChunkSource;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};

    const PROBE_K: SlotId = SlotId::new(1);
    const BUILD_K: SlotId = SlotId::new(3);

    fn probe_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("k", DataType::Int32, true),
            PROBE_K,
        )]))
    }

    fn build_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("k", DataType::Int32, true),
            BUILD_K,
        )]))
    }

    fn params(join_type: JoinType) -> HashJoinParams {
        let mut arena = ExprArena::default();
        let probe_key = arena.push_typed(ExprNode::SlotId(PROBE_K), DataType::Int32);
        let build_key = arena.push_typed(ExprNode::SlotId(BUILD_K), DataType::Int32);
        HashJoinParams {
            arena: Arc::new(arena),
            join_type,
            probe_exprs: vec![probe_key],
            build_exprs: vec![build_key],
            other_conjuncts: Vec::new(),
            null_safe_eq: vec![false],
            probe_schema: probe_schema(),
            build_schema: build_schema(),
            prefetch_mode: PrefetchMode::None,
            node_id: 1,
        }
    }

    fn chunk_of(values: Vec<Option<i32>>, schema: SchemaRef) -> Chunk {
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int32Array::from(values)) as ArrayRef],
        )
        .unwrap();
        Chunk::new(batch)
    }

    #[test]
    fn output_schema_follows_join_mode() {
        let profile = RuntimeProfile::new("test");
        let inner = PartitionedHashJoinNode::new(params(JoinType::Inner), &profile).unwrap();
        assert_eq!(inner.output_schema().fields().len(), 2);
        let semi = PartitionedHashJoinNode::new(params(JoinType::LeftSemi), &profile).unwrap();
        assert_eq!(semi.output_schema().fields().len(), 1);
        let right_anti =
            PartitionedHashJoinNode::new(params(JoinType::RightAnti), &profile).unwrap();
        assert_eq!(right_anti.output_schema().fields().len(), 1);
        let left_outer =
            PartitionedHashJoinNode::new(params(JoinType::LeftOuter), &profile).unwrap();
        // The build side of a left-outer join is null-extended.
        assert!(left_outer.output_schema().field(1).is_nullable());
    }

    #[test]
    fn lifecycle_guards_are_enforced() {
        let profile = RuntimeProfile::new("test");
        let state = RuntimeState::default();
        let mut node = PartitionedHashJoinNode::new(params(JoinType::Inner), &profile).unwrap();
        let mut probe = MemoryChunkSource::new(vec![]);
        assert!(node.get_next(&state, &mut probe).is_err());

        let mut build = MemoryChunkSource::new(vec![]);
        assert!(node.open(&state, &mut build).is_err());

        node.prepare(&state).unwrap();
        let mut build = MemoryChunkSource::new(vec![]);
        node.open(&state, &mut build).unwrap();
        let mut build_again = MemoryChunkSource::new(vec![]);
        assert!(node.open(&state, &mut build_again).is_err());
    }

    #[test]
    fn naaj_rejects_null_safe_keys() {
        let profile = RuntimeProfile::new("test");
        let mut p = params(JoinType::NullAwareLeftAnti);
        p.null_safe_eq = vec![true];
        assert!(PartitionedHashJoinNode::new(p, &profile).is_err());
    }

    #[test]
    fn duplicate_slot_ids_are_rejected() {
        let profile = RuntimeProfile::new("test");
        let mut p = params(JoinType::Inner);
        p.build_schema = probe_schema();
        assert!(PartitionedHashJoinNode::new(p, &profile).is_err());
    }

    #[test]
    fn empty_build_inner_join_yields_nothing() {
        let profile = RuntimeProfile::new("test");
        let state = RuntimeState::default();
        let mut node = PartitionedHashJoinNode::new(params(JoinType::Inner), &profile).unwrap();
        node.prepare(&state).unwrap();
        let mut build = MemoryChunkSource::new(vec![]);
        node.open(&state, &mut build).unwrap();
        let mut probe = MemoryChunkSource::new(vec![chunk_of(vec![Some(1), Some(2)], probe_schema())]);
        assert!(node.get_next(&state, &mut probe).unwrap().is_none());
        assert!(node.get_next(&state, &mut probe).unwrap().is_none());
    }

    fn spilling_state(limit: i64, block_size: u64) -> (RuntimeState, tempfile::TempDir) {
        use crate::exec::spill::ipc_serde::SpillCodec;
        use crate::exec::spill::spiller::{SpillStorageConfig, Spiller};
        use crate::runtime::mem_tracker::MemTracker;

        crate::petrel_logging::init();
        let dir = tempfile::tempdir().unwrap();
        let storage = SpillStorageConfig {
            local_dirs: vec![dir.path().to_path_buf()],
            dir_max_bytes: 0,
            block_size_bytes: block_size,
            ipc_compression: SpillCodec::None,
        };
        let spiller = Arc::new(Spiller::new_with_storage(storage, SpillCodec::None).unwrap());
        let state = RuntimeState::new(
            1024,
            MemTracker::new_root_with_limit("query", limit),
            spiller,
        );
        (state, dir)
    }

    /// Int32 keys whose fingerprints land in partition 0 for the first
    /// `levels` hash levels.
    fn keys_in_partition_zero(count: usize, levels: usize) -> Vec<i32> {
        let codec = JoinKeyCodec::new(vec![DataType::Int32], vec![false]).unwrap();
        let mut out = Vec::new();
        let mut next = 0i32;
        while out.len() < count {
            let candidates: Vec<i32> = (next..next + 8192).collect();
            next += 8192;
            let array: ArrayRef = Arc::new(Int32Array::from(candidates.clone()));
            let encoded = codec.encode_arrays(&[array], candidates.len()).unwrap();
            let mut keep = vec![true; candidates.len()];
            for level in 0..levels {
                let hashes = codec.level_hashes(&encoded.rows, level).unwrap();
                for (i, hash) in hashes.iter().enumerate() {
                    if partition_index(*hash) != 0 {
                        keep[i] = false;
                    }
                }
            }
            for (i, key) in candidates.iter().enumerate() {
                if keep[i] && out.len() < count {
                    out.push(*key);
                }
            }
        }
        out
    }

    fn drain(
        node: &mut PartitionedHashJoinNode,
        state: &RuntimeState,
        probe: &mut MemoryChunkSource,
    ) -> Result<Vec<Chunk>> {
        let mut out = Vec::new();
        while let Some(chunk) = node.get_next(state, probe)? {
            out.push(chunk);
        }
        Ok(out)
    }

    #[test]
    fn recursive_repartition_distributes_at_level_two() {
        // Keys collide into one partition at levels 0 and 1 and only spread
        // at level 2; the budget rejects a table over the full key set.
        let (state, _dir) = spilling_state(64 * 1024, 1024);
        let profile = RuntimeProfile::new("query");
        let mut node =
            PartitionedHashJoinNode::new(params(JoinType::Inner), &profile).unwrap();
        node.prepare(&state).unwrap();

        let keys = keys_in_partition_zero(2000, 2);
        let as_options: Vec<Option<i32>> = keys.iter().copied().map(Some).collect();
        let mut build = MemoryChunkSource::new(vec![chunk_of(
            as_options.clone(),
            build_schema(),
        )]);
        node.open(&state, &mut build).unwrap();

        let mut probe = MemoryChunkSource::new(vec![chunk_of(as_options, probe_schema())]);
        let out = drain(&mut node, &state, &mut probe).unwrap();
        let rows: usize = out.iter().map(|c| c.len()).sum();
        assert_eq!(rows, keys.len());

        let max_level = node
            .profile()
            .counter_value("MaxPartitionLevel")
            .unwrap_or(0);
        assert!(max_level >= 2, "expected recursion, got level {max_level}");
        assert!(node.profile().counter_value("PartitionsSpilled").unwrap() >= 1);
    }

    #[test]
    fn partition_depth_exhaustion_fails_with_mem_limit() {
        // A single repeated key can never redistribute; once the partition
        // reaches the maximum depth and still does not fit, the query fails
        // instead of dropping rows.
        let (state, _dir) = spilling_state(12 * 1024, 1024);
        let profile = RuntimeProfile::new("query");
        let mut node =
            PartitionedHashJoinNode::new(params(JoinType::Inner), &profile).unwrap();
        node.prepare(&state).unwrap();

        let values: Vec<Option<i32>> = std::iter::repeat(Some(42)).take(512).collect();
        let mut build = MemoryChunkSource::new(vec![chunk_of(values, build_schema())]);
        node.open(&state, &mut build).unwrap();

        let mut probe = MemoryChunkSource::new(vec![chunk_of(
            vec![Some(42), Some(7)],
            probe_schema(),
        )]);
        let err = drain(&mut node, &state, &mut probe).expect_err("depth exhausted");
        assert!(matches!(err, ExecError::MemLimitExceeded(_)), "got {err}");
    }

    #[test]
    fn reset_allows_reexecution() {
        let profile = RuntimeProfile::new("test");
        let state = RuntimeState::default();
        let mut node = PartitionedHashJoinNode::new(params(JoinType::Inner), &profile).unwrap();
        node.prepare(&state).unwrap();
        let mut build = MemoryChunkSource::new(vec![chunk_of(vec![Some(1)], build_schema())]);
        node.open(&state, &mut build).unwrap();
        let mut probe = MemoryChunkSource::new(vec![chunk_of(vec![Some(1)], probe_schema())]);
        let out = node.get_next(&state, &mut probe).unwrap();
        assert!(out.is_some());

        node.reset().unwrap();
        let mut build = MemoryChunkSource::new(vec![chunk_of(vec![Some(1)], build_schema())]);
        node.open(&state, &mut build).unwrap();
        let mut probe = MemoryChunkSource::new(vec![chunk_of(vec![Some(1)], probe_schema())]);
        let out = node.get_next(&state, &mut probe).unwrap();
        assert!(out.is_some());
    }
}
