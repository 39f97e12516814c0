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
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::common::status::{ExecError, Result};
use crate::exec::spill::block_format::{BlockHeader, MessageEntry, read_index};
use crate::exec::spill::ipc_serde::{ChunkCodec, schema_fingerprint};

/// Replays the messages of one spill block file in write order.
#[derive(Debug)]
pub struct BlockReader {
    file: File,
    codec: ChunkCodec,
    pending: VecDeque<MessageEntry>,
}

impl BlockReader {
    /// Open a block and verify it was written for `schema`.
    pub fn open(path: &Path, schema: &SchemaRef) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| {
            ExecError::io(format!("spill block {} open failed: {e}", path.display()))
        })?;
        let header = BlockHeader::read_from(&mut file)?;
        if header.schema_fingerprint != schema_fingerprint(schema.as_ref()) {
            return Err(ExecError::io(format!(
                "spill block {} was written for a different schema",
                path.display()
            )));
        }
        let pending: VecDeque<MessageEntry> = read_index(&mut file, &header)?.into();
        let codec = ChunkCodec::new(header.codec)?;
        Ok(Self {
            file,
            codec,
            pending,
        })
    }

    pub fn remaining_messages(&self) -> usize {
        self.pending.len()
    }

    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        let Some(entry) = self.pending.pop_front() else {
            return Ok(None);
        };
        self.file
            .seek(SeekFrom::Start(entry.offset))
            .map_err(|e| ExecError::io(format!("spill message seek failed: {e}")))?;
        let mut message = vec![0u8; entry.length as usize];
        self.file
            .read_exact(&mut message)
            .map_err(|e| ExecError::io(format!("spill message read failed: {e}")))?;
        let batch = self.codec.decode(&message)?;
        if batch.num_rows() as u32 != entry.num_rows {
            return Err(ExecError::io(format!(
                "spill message row count mismatch: index says {}, message holds {}",
                entry.num_rows,
                batch.num_rows()
            )));
        }
        Ok(Some(batch))
    }
}
