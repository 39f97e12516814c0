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
//! Partitioned hash-join operator module.
//!
//! Responsibilities:
//! - Exposes the join-mode enum, partitioning constants, chunk input trait,
//!   and the build and probe components of the spill-capable partitioned
//!   hash join.

use std::collections::VecDeque;

use crate::common::status::Result;
use crate::exec::chunk::Chunk;
use crate::exec::spill::tuple_stream::TupleStream;
use crate::runtime::runtime_state::RuntimeState;

pub(crate) mod builder;
pub(crate) mod hash_table;
pub(crate) mod join_key;
pub mod node;
pub(crate) mod partition;

pub use node::{HashJoinParams, PartitionedHashJoinNode};

/// Number of hash partitions produced by one partitioning pass.
pub const PARTITION_FANOUT: usize = 16;
/// log2 of the fanout; the partition index is this many top bits of the hash.
pub const NUM_PARTITIONING_BITS: u32 = 4;
/// Deepest allowed recursion level. A partition at this level that would
/// still spill fails the query instead.
pub const MAX_PARTITION_DEPTH: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftSemi,
    LeftAnti,
    RightSemi,
    RightAnti,
    NullAwareLeftAnti,
}

impl JoinType {
    /// Modes whose output includes build rows that never matched.
    pub fn needs_unmatched_build_output(self) -> bool {
        matches!(self, Self::RightOuter | Self::FullOuter | Self::RightAnti)
    }

    /// Modes that track per-build-row match bits.
    pub fn tracks_build_matches(self) -> bool {
        matches!(
            self,
            Self::RightOuter | Self::FullOuter | Self::RightSemi | Self::RightAnti
        )
    }

    /// Modes whose output carries only probe-side columns.
    pub fn outputs_probe_only(self) -> bool {
        matches!(
            self,
            Self::LeftSemi | Self::LeftAnti | Self::NullAwareLeftAnti
        )
    }

    /// Modes whose output carries only build-side columns.
    pub fn outputs_build_only(self) -> bool {
        matches!(self, Self::RightSemi | Self::RightAnti)
    }
}

pub fn join_type_str(join_type: JoinType) -> &'static str {
    match join_type {
        JoinType::Inner => "INNER",
        JoinType::LeftOuter => "LEFT_OUTER",
        JoinType::RightOuter => "RIGHT_OUTER",
        JoinType::FullOuter => "FULL_OUTER",
        JoinType::LeftSemi => "LEFT_SEMI",
        JoinType::LeftAnti => "LEFT_ANTI",
        JoinType::RightSemi => "RIGHT_SEMI",
        JoinType::RightAnti => "RIGHT_ANTI",
        JoinType::NullAwareLeftAnti => "NULL_AWARE_LEFT_ANTI",
    }
}

/// Whether probe lookups issue software prefetches for their hash buckets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrefetchMode {
    None,
    Prefetch,
}

/// Pull-based chunk input for the operator's children and spilled streams.
pub trait ChunkSource {
    fn next_chunk(&mut self, state: &RuntimeState) -> Result<Option<Chunk>>;
}

/// In-memory chunk source, mainly for tests and small inputs.
pub struct MemoryChunkSource {
    chunks: VecDeque<Chunk>,
}

impl MemoryChunkSource {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks: chunks.into(),
        }
    }
}

impl ChunkSource for MemoryChunkSource {
    fn next_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(self.chunks.pop_front())
    }
}

impl ChunkSource for TupleStream {
    fn next_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        TupleStream::next_chunk(self)
    }
}
