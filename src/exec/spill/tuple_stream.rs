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
//! Spillable append-only chunk stream.
//!
//! Responsibilities:
//! - Accumulates chunks in memory while pinned, under the owner's tracker.
//! - `unpin` flushes resident chunks to spill blocks and reserves exactly one
//!   write buffer, after which appends buffer in the reservation and flush to
//!   disk block by block; an unpinned append cannot fail for memory reasons.
//! - `prepare_for_read` seals the stream; reading replays chunks in append
//!   order, deleting blocks behind the cursor in delete-on-read mode.

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use crate::common::status::{ExecError, Result};
use crate::exec::chunk::Chunk;
use crate::exec::spill::block_reader::BlockReader;
use crate::exec::spill::spiller::{SpillFile, Spiller};
use crate::runtime::mem_tracker::{MemTracker, TrackedBytes};
use crate::runtime::profile::CounterRef;

#[derive(Debug)]
struct ReadCursor {
    mem_pos: usize,
    block_idx: usize,
    block_stream: Option<BlockReader>,
}

#[derive(Debug)]
pub struct TupleStream {
    schema: SchemaRef,
    spiller: Arc<Spiller>,
    tracker: Arc<MemTracker>,
    pinned: bool,
    mem_chunks: Vec<Chunk>,
    mem_bytes: i64,
    write_buffer: Vec<Chunk>,
    write_buffer_bytes: u64,
    write_reservation: Option<TrackedBytes>,
    blocks: VecDeque<SpillFile>,
    num_rows: u64,
    spilled_bytes: u64,
    sealed: bool,
    delete_on_read: bool,
    blocks_deleted: bool,
    read: Option<ReadCursor>,
    spill_counter: Option<CounterRef>,
}

impl TupleStream {
    /// Create a pinned stream whose contents stay in memory.
    pub fn new_pinned(schema: SchemaRef, spiller: Arc<Spiller>, tracker: Arc<MemTracker>) -> Self {
        Self {
            schema,
            spiller,
            tracker,
            pinned: true,
            mem_chunks: Vec::new(),
            mem_bytes: 0,
            write_buffer: Vec::new(),
            write_buffer_bytes: 0,
            write_reservation: None,
            blocks: VecDeque::new(),
            num_rows: 0,
            spilled_bytes: 0,
            sealed: false,
            delete_on_read: false,
            blocks_deleted: false,
            read: None,
            spill_counter: None,
        }
    }

    /// Create an unpinned stream with its write buffer already reserved.
    pub fn new_unpinned(
        schema: SchemaRef,
        spiller: Arc<Spiller>,
        tracker: Arc<MemTracker>,
    ) -> Result<Self> {
        let mut stream = Self::new_pinned(schema, spiller, tracker);
        stream.unpin()?;
        Ok(stream)
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    pub fn spilled_bytes(&self) -> u64 {
        self.spilled_bytes
    }

    pub fn bytes_pinned(&self) -> i64 {
        self.mem_bytes
    }

    pub fn has_reserved_write_buffer(&self) -> bool {
        self.write_reservation.is_some()
    }

    /// Bytes written to disk are also added to this counter.
    pub fn set_spill_counter(&mut self, counter: CounterRef) {
        self.spill_counter = Some(counter);
    }

    /// Pinned-only view of the buffered chunks, for multi-pass consumers.
    pub fn pinned_chunks(&self) -> Result<&[Chunk]> {
        if !self.pinned {
            return Err(ExecError::internal(
                "pinned_chunks on an unpinned tuple stream",
            ));
        }
        Ok(&self.mem_chunks)
    }

    pub fn append(&mut self, chunk: Chunk) -> Result<()> {
        if self.sealed {
            return Err(ExecError::internal("append to a sealed tuple stream"));
        }
        if chunk.is_empty() {
            return Ok(());
        }
        if self.pinned {
            let bytes = i64::try_from(chunk.logical_bytes()).unwrap_or(i64::MAX);
            self.tracker.try_consume(bytes)?;
            self.mem_bytes += bytes;
            self.num_rows += chunk.len() as u64;
            self.mem_chunks.push(chunk);
            return Ok(());
        }
        self.num_rows += chunk.len() as u64;
        // Unpinned: the write buffer reservation was made at unpin time, so
        // this path performs no reservation and cannot fail for memory.
        self.write_buffer_bytes += chunk.logical_bytes() as u64;
        self.write_buffer.push(chunk);
        if self.write_buffer_bytes >= self.block_size() {
            self.flush_write_buffer()?;
        }
        Ok(())
    }

    /// Flush resident chunks to spill blocks and switch to buffered writes.
    pub fn unpin(&mut self) -> Result<()> {
        if !self.pinned {
            return Ok(());
        }
        if self.sealed {
            return Err(ExecError::internal("unpin of a sealed tuple stream"));
        }
        self.pinned = false;
        let resident = std::mem::take(&mut self.mem_chunks);
        self.spill_grouped(resident)?;
        self.tracker.release(self.mem_bytes);
        self.mem_bytes = 0;
        let block_size = usize::try_from(self.block_size()).unwrap_or(usize::MAX);
        self.write_reservation = Some(TrackedBytes::try_new(
            block_size,
            Arc::clone(&self.tracker),
        )?);
        Ok(())
    }

    /// Seal the stream for reading. Re-preparing rewinds to the start, which
    /// is only legal while no block has been destroyed by a previous
    /// delete-on-read pass.
    pub fn prepare_for_read(&mut self, delete_on_read: bool) -> Result<()> {
        if self.blocks_deleted {
            return Err(ExecError::internal(
                "tuple stream cannot rewind: blocks were deleted on read",
            ));
        }
        if !self.sealed {
            if !self.pinned && !self.write_buffer.is_empty() {
                self.flush_write_buffer()?;
            }
            // The write buffer is returned to the operator budget; the stream
            // no longer accepts appends.
            self.write_reservation = None;
            self.sealed = true;
        }
        self.delete_on_read = delete_on_read;
        self.read = Some(ReadCursor {
            mem_pos: 0,
            block_idx: 0,
            block_stream: None,
        });
        Ok(())
    }

    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if !self.sealed {
            return Err(ExecError::internal(
                "next_chunk on a tuple stream not prepared for read",
            ));
        }
        let Some(mut cursor) = self.read.take() else {
            return Ok(None);
        };
        if self.pinned {
            if cursor.mem_pos < self.mem_chunks.len() {
                let chunk = self.mem_chunks[cursor.mem_pos].clone();
                cursor.mem_pos += 1;
                self.read = Some(cursor);
                return Ok(Some(chunk));
            }
            self.read = Some(cursor);
            return Ok(None);
        }
        loop {
            if cursor.block_stream.is_none() {
                let Some(block) = self.blocks.get(cursor.block_idx) else {
                    self.read = Some(cursor);
                    return Ok(None);
                };
                let reader = self.spiller.open_block(&self.schema, block)?;
                cursor.block_stream = Some(reader);
            }
            let reader = cursor.block_stream.as_mut().expect("block reader");
            match reader.next_batch()? {
                Some(batch) => {
                    let chunk = Chunk::try_new(batch)?;
                    self.read = Some(cursor);
                    return Ok(Some(chunk));
                }
                None => {
                    cursor.block_stream = None;
                    if self.delete_on_read {
                        if let Some(block) = self.blocks.pop_front() {
                            self.spiller.remove_block(&block);
                            self.blocks_deleted = true;
                        }
                    } else {
                        cursor.block_idx += 1;
                    }
                }
            }
        }
    }

    fn block_size(&self) -> u64 {
        let configured = self.spiller.block_size_bytes();
        if configured == 0 {
            8 * 1024 * 1024
        } else {
            configured
        }
    }

    fn flush_write_buffer(&mut self) -> Result<()> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        let chunks = std::mem::take(&mut self.write_buffer);
        self.write_buffer_bytes = 0;
        let file = self.spiller.spill_chunks(self.schema.clone(), &chunks)?;
        self.record_block(file);
        Ok(())
    }

    /// Write `chunks` as a sequence of blocks, each near the block size.
    fn spill_grouped(&mut self, chunks: Vec<Chunk>) -> Result<()> {
        let block_size = self.block_size();
        let mut group = Vec::new();
        let mut group_bytes = 0u64;
        for chunk in chunks {
            group_bytes += chunk.logical_bytes() as u64;
            group.push(chunk);
            if group_bytes >= block_size {
                let file = self.spiller.spill_chunks(self.schema.clone(), &group)?;
                self.record_block(file);
                group.clear();
                group_bytes = 0;
            }
        }
        if !group.is_empty() {
            let file = self.spiller.spill_chunks(self.schema.clone(), &group)?;
            self.record_block(file);
        }
        Ok(())
    }

    fn record_block(&mut self, file: SpillFile) {
        let bytes = file.file_bytes();
        self.spilled_bytes += bytes;
        if let Some(counter) = self.spill_counter.as_ref() {
            counter.add(i64::try_from(bytes).unwrap_or(i64::MAX));
        }
        self.blocks.push_back(file);
    }
}

impl Drop for TupleStream {
    fn drop(&mut self) {
        self.tracker.release(self.mem_bytes);
        self.read = None;
        for block in self.blocks.drain(..) {
            self.spiller.remove_block(&block);
        }
    }
}
