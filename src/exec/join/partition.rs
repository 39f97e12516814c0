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
//! Build and probe partitions of the partitioned hash join.
//!
//! Responsibilities:
//! - `BuildPartition` owns one hash bucket's build rows: resident chunks plus
//!   a hash table, or a spilled build stream, with the level and lifecycle
//!   state that drive repartitioning decisions.
//! - `ProbePartition` is the probe-side companion of a spilled build
//!   partition; its stream is unpinned with a reserved write buffer so
//!   appends cannot fail for memory reasons.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use crate::common::status::{ExecError, Result};
use crate::exec::chunk::Chunk;
use crate::exec::join::hash_table::JoinHashTable;
use crate::exec::spill::spiller::Spiller;
use crate::exec::spill::tuple_stream::TupleStream;
use crate::petrel_logging::debug;
use crate::runtime::mem_tracker::MemTracker;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PartitionState {
    Building,
    Resident,
    Spilled,
    Repartitioning,
    Closed,
}

pub(crate) struct BuildPartition {
    index: usize,
    level: usize,
    state: PartitionState,
    schema: SchemaRef,
    tracker: Arc<MemTracker>,
    chunks: Vec<Chunk>,
    accounted_bytes: i64,
    build_stream: Option<TupleStream>,
    hash_table: Option<JoinHashTable>,
    num_rows: u64,
}

impl BuildPartition {
    pub(crate) fn new(
        index: usize,
        level: usize,
        schema: SchemaRef,
        tracker: Arc<MemTracker>,
    ) -> Self {
        Self {
            index,
            level,
            state: PartitionState::Building,
            schema,
            tracker,
            chunks: Vec::new(),
            accounted_bytes: 0,
            build_stream: None,
            hash_table: None,
            num_rows: 0,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn level(&self) -> usize {
        self.level
    }

    pub(crate) fn set_state(&mut self, state: PartitionState) {
        self.state = state;
    }

    pub(crate) fn is_spilled(&self) -> bool {
        matches!(
            self.state,
            PartitionState::Spilled | PartitionState::Repartitioning
        )
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == PartitionState::Closed
    }

    pub(crate) fn num_rows(&self) -> u64 {
        self.num_rows
    }

    pub(crate) fn resident_bytes(&self) -> i64 {
        self.accounted_bytes
    }

    pub(crate) fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub(crate) fn hash_table(&self) -> Option<&JoinHashTable> {
        self.hash_table.as_ref()
    }

    pub(crate) fn hash_table_mut(&mut self) -> Option<&mut JoinHashTable> {
        self.hash_table.as_mut()
    }

    pub(crate) fn set_hash_table(&mut self, table: JoinHashTable) {
        self.hash_table = Some(table);
    }

    pub(crate) fn build_stream_mut(&mut self) -> Option<&mut TupleStream> {
        self.build_stream.as_mut()
    }

    pub(crate) fn take_build_stream(&mut self) -> Option<TupleStream> {
        self.build_stream.take()
    }

    /// Append rows while resident. The chunk is only adopted when the
    /// reservation succeeds, so the caller can retry after spilling a victim
    /// partition.
    pub(crate) fn append_resident(&mut self, chunk: &Chunk) -> Result<()> {
        if self.is_spilled() {
            return Err(ExecError::internal(
                "append_resident on a spilled partition",
            ));
        }
        if chunk.is_empty() {
            return Ok(());
        }
        let bytes = i64::try_from(chunk.logical_bytes()).unwrap_or(i64::MAX);
        self.tracker.try_consume(bytes)?;
        self.accounted_bytes += bytes;
        self.num_rows += chunk.len() as u64;
        self.chunks.push(chunk.clone());
        Ok(())
    }

    /// Append rows after the partition spilled; buffered by the stream's
    /// reserved write buffer.
    pub(crate) fn append_spilled(&mut self, chunk: Chunk) -> Result<()> {
        let stream = self.build_stream.as_mut().ok_or_else(|| {
            ExecError::internal("spilled partition is missing its build stream")
        })?;
        self.num_rows += chunk.len() as u64;
        stream.append(chunk)
    }

    /// Move resident rows to an unpinned build stream, dropping the hash
    /// table. Returns the bytes written to disk by the flush.
    pub(crate) fn spill(&mut self, spiller: &Arc<Spiller>) -> Result<u64> {
        if self.is_spilled() {
            return Ok(0);
        }
        debug!(
            "spilling build partition: index={} level={} rows={} resident_bytes={}",
            self.index, self.level, self.num_rows, self.accounted_bytes
        );
        self.hash_table = None;
        let resident = std::mem::take(&mut self.chunks);
        self.tracker.release(self.accounted_bytes);
        self.accounted_bytes = 0;

        let mut stream = TupleStream::new_unpinned(
            Arc::clone(&self.schema),
            Arc::clone(spiller),
            Arc::clone(&self.tracker),
        )?;
        for chunk in resident {
            stream.append(chunk)?;
        }
        let spilled = stream.spilled_bytes();
        self.build_stream = Some(stream);
        self.state = PartitionState::Spilled;
        Ok(spilled)
    }

    /// Re-admit rows the caller read back from the build stream under an
    /// already-consumed reservation.
    pub(crate) fn adopt_resident(&mut self, chunks: Vec<Chunk>, accounted_bytes: i64) {
        self.chunks = chunks;
        self.accounted_bytes = accounted_bytes;
        self.state = PartitionState::Resident;
    }

    pub(crate) fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.hash_table = None;
        self.chunks.clear();
        self.tracker.release(self.accounted_bytes);
        self.accounted_bytes = 0;
        self.build_stream = None;
        self.state = PartitionState::Closed;
    }
}

impl Drop for BuildPartition {
    fn drop(&mut self) {
        self.close();
    }
}

/// The probe-side partition paired with a spilled build partition. Probe rows
/// hashing to the spilled bucket are appended here for a later pass.
pub(crate) struct ProbePartition {
    stream: TupleStream,
}

impl ProbePartition {
    /// Create the probe companion with its write buffer reserved up front, so
    /// the per-row append path never allocates.
    pub(crate) fn new(
        schema: SchemaRef,
        spiller: &Arc<Spiller>,
        tracker: &Arc<MemTracker>,
    ) -> Result<Self> {
        let stream =
            TupleStream::new_unpinned(schema, Arc::clone(spiller), Arc::clone(tracker))?;
        Ok(Self { stream })
    }

    pub(crate) fn num_rows(&self) -> u64 {
        self.stream.num_rows()
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TupleStream {
        &mut self.stream
    }

    pub(crate) fn into_stream(self) -> TupleStream {
        self.stream
    }

    pub(crate) fn append(&mut self, chunk: Chunk) -> Result<()> {
        self.stream.append(chunk)
    }
}

/// A co-partitioned (build, probe) pair whose build side did not fit in
/// memory; queued for a later pass. Owning both sides as one value makes the
/// build-outlives-probe relationship structural.
pub(crate) struct SpilledPartition {
    pub(crate) build: BuildPartition,
    pub(crate) probe: ProbePartition,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use crate::exec::spill::ipc_serde::SpillCodec;
    use crate::exec::spill::spiller::SpillStorageConfig;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    fn schema() -> SchemaRef {
        SchemaRef::new(Schema::new(vec![field_with_slot_id(
            Field::new("k", DataType::Int32, false),
            SlotId::new(1),
        )]))
    }

    fn chunk_of(values: &[i32]) -> Chunk {
        let batch =
            RecordBatch::try_new(schema(), vec![Arc::new(Int32Array::from(values.to_vec()))])
                .unwrap();
        Chunk::new(batch)
    }

    fn spiller_in(dir: &std::path::Path) -> Arc<Spiller> {
        let storage = SpillStorageConfig {
            local_dirs: vec![dir.to_path_buf()],
            dir_max_bytes: 0,
            block_size_bytes: 1024,
            ipc_compression: SpillCodec::None,
        };
        Arc::new(Spiller::new_with_storage(storage, SpillCodec::None).unwrap())
    }

    #[test]
    fn spill_moves_rows_to_stream_and_releases_memory() {
        let temp = tempfile::tempdir().unwrap();
        let tracker = MemTracker::new_root("t");
        let spiller = spiller_in(temp.path());
        let mut partition = BuildPartition::new(0, 0, schema(), tracker.clone());

        partition.append_resident(&chunk_of(&[1, 2, 3])).unwrap();
        let resident_bytes = partition.resident_bytes();
        assert!(resident_bytes > 0);
        assert_eq!(tracker.current(), resident_bytes);

        partition.spill(&spiller).unwrap();
        assert!(partition.is_spilled());
        assert_eq!(partition.resident_bytes(), 0);
        // Only the stream's write buffer remains accounted.
        assert_eq!(tracker.current(), 1024);

        partition.append_spilled(chunk_of(&[4])).unwrap();
        assert_eq!(partition.num_rows(), 4);

        let stream = partition.build_stream_mut().expect("build stream");
        stream.prepare_for_read(false).unwrap();
        let mut rows = 0;
        while let Some(chunk) = stream.next_chunk().unwrap() {
            rows += chunk.len();
        }
        assert_eq!(rows, 4);
    }

    #[test]
    fn close_releases_all_accounting() {
        let tracker = MemTracker::new_root("t");
        let mut partition = BuildPartition::new(1, 0, schema(), tracker.clone());
        partition.append_resident(&chunk_of(&[1, 2])).unwrap();
        partition.close();
        assert_eq!(tracker.current(), 0);
        assert!(partition.is_closed());
    }

    #[test]
    fn probe_partition_has_write_buffer() {
        let temp = tempfile::tempdir().unwrap();
        let tracker = MemTracker::new_root("t");
        let spiller = spiller_in(temp.path());
        let mut probe = ProbePartition::new(schema(), &spiller, &tracker).unwrap();
        assert!(probe.stream_mut().has_reserved_write_buffer());
        probe.append(chunk_of(&[7, 8])).unwrap();
        assert_eq!(probe.num_rows(), 2);
    }
}
