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
//! Spill block writer.
//!
//! Responsibilities:
//! - Writes groups of chunks as block files (header, stream-framed IPC
//!   messages, trailing index) into the rotating spill directories, charging
//!   each file against its directory's byte budget.
//! - Opens blocks for replay and deletes them, returning the bytes to the
//!   directory budget.

use std::fs::OpenOptions;
use std::io::{Seek, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use arrow::datatypes::SchemaRef;

use crate::common::config;
use crate::common::status::{ExecError, Result};
use crate::exec::chunk::Chunk;
use crate::exec::spill::block_format::{
    BlockHeader, BlockMeta, HEADER_LEN, MessageEntry, write_index,
};
use crate::exec::spill::block_reader::BlockReader;
use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::ipc_serde::{ChunkCodec, SpillCodec, schema_fingerprint};
use crate::petrel_logging::warn;

#[derive(Debug, Clone)]
pub struct SpillStorageConfig {
    pub local_dirs: Vec<PathBuf>,
    pub dir_max_bytes: u64,
    pub block_size_bytes: u64,
    pub ipc_compression: SpillCodec,
}

impl SpillStorageConfig {
    pub fn from_app_config() -> Result<Self> {
        if !config::spill_enable() {
            return Err(ExecError::internal("spill storage is disabled in config"));
        }
        let ipc_compression = config::spill_ipc_compression().parse::<SpillCodec>()?;
        let local_dirs: Vec<PathBuf> =
            config::spill_local_dirs().iter().map(PathBuf::from).collect();
        let dir_max_bytes = config::spill_dir_max_bytes();
        let block_size_bytes = config::spill_block_size_bytes();
        Ok(Self {
            local_dirs,
            dir_max_bytes,
            block_size_bytes,
            ipc_compression,
        })
    }
}

/// Handle to one written block file.
#[derive(Debug, Clone)]
pub struct SpillFile {
    pub path: PathBuf,
    pub meta: BlockMeta,
    dir_slot: usize,
}

impl SpillFile {
    pub fn file_bytes(&self) -> u64 {
        self.meta.header.index_offset + self.meta.header.index_length
    }
}

#[derive(Debug)]
struct SpillStorage {
    dirs: DirManager,
    codec: ChunkCodec,
    block_size_bytes: u64,
    next_block: AtomicU64,
    pid: u32,
}

/// Writes groups of chunks as spill block files and opens them for reading.
///
/// A default-constructed spiller has no storage attached; any attempt to
/// spill through it reports an internal error. Operators running without a
/// spill-enabled runtime never reach that path.
#[derive(Debug, Default)]
pub struct Spiller {
    storage: Option<SpillStorage>,
}

impl Spiller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with_storage(storage: SpillStorageConfig, codec: SpillCodec) -> Result<Self> {
        let dirs = DirManager::new(storage.local_dirs, storage.dir_max_bytes)?;
        Ok(Self {
            storage: Some(SpillStorage {
                dirs,
                codec: ChunkCodec::new(codec)?,
                block_size_bytes: storage.block_size_bytes,
                next_block: AtomicU64::new(0),
                pid: std::process::id(),
            }),
        })
    }

    pub fn new_from_config() -> Result<Self> {
        let storage = SpillStorageConfig::from_app_config()?;
        let codec = storage.ipc_compression;
        Self::new_with_storage(storage, codec)
    }

    pub fn is_enabled(&self) -> bool {
        self.storage.is_some()
    }

    pub fn block_size_bytes(&self) -> u64 {
        self.storage
            .as_ref()
            .map(|s| s.block_size_bytes)
            .unwrap_or(0)
    }

    fn storage(&self) -> Result<&SpillStorage> {
        self.storage
            .as_ref()
            .ok_or_else(|| ExecError::internal("spill storage is not configured"))
    }

    /// Write `chunks` as one block file and return its handle. Empty chunks
    /// are dropped; an all-empty group still produces a valid, empty block.
    pub fn spill_chunks(&self, schema: SchemaRef, chunks: &[Chunk]) -> Result<SpillFile> {
        let storage = self.storage()?;

        let (dir_slot, dir) = storage.dirs.acquire_dir()?;
        let sequence = storage.next_block.fetch_add(1, Ordering::AcqRel);
        let path = dir.join(format!("petrel-spill-{:x}-{:06x}.blk", storage.pid, sequence));
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                ExecError::io(format!("spill block {} create failed: {e}", path.display()))
            })?;

        let mut header =
            BlockHeader::placeholder(storage.codec.codec(), schema_fingerprint(schema.as_ref()));
        header.write_to(&mut file)?;

        // Messages land right after the header; track the offset ourselves so
        // every entry is known before the index is written.
        let mut cursor = HEADER_LEN as u64;
        let mut index = Vec::new();
        for chunk in chunks {
            if chunk.is_empty() {
                continue;
            }
            let message = storage.codec.encode(&chunk.batch)?;
            let length = u32::try_from(message.bytes.len())
                .map_err(|_| ExecError::internal("spill message overflows the length field"))?;
            file.write_all(&message.bytes)
                .map_err(|e| ExecError::io(format!("spill message write failed: {e}")))?;
            index.push(MessageEntry {
                offset: cursor,
                length,
                num_rows: message.num_rows,
            });
            cursor += length as u64;
        }

        header.num_messages = u32::try_from(index.len())
            .map_err(|_| ExecError::internal("spill block message count overflows u32"))?;
        header.index_offset = cursor;
        header.index_length = write_index(&mut file, &index)?;

        file.rewind()
            .map_err(|e| ExecError::io(format!("spill block header rewind failed: {e}")))?;
        header.write_to(&mut file)?;
        file.flush()
            .map_err(|e| ExecError::io(format!("spill block flush failed: {e}")))?;

        let meta = BlockMeta { header, index };
        let spill_file = SpillFile {
            path,
            meta,
            dir_slot,
        };
        storage.dirs.charge(dir_slot, spill_file.file_bytes());
        Ok(spill_file)
    }

    pub fn open_block(&self, schema: &SchemaRef, file: &SpillFile) -> Result<BlockReader> {
        BlockReader::open(&file.path, schema)
    }

    /// Delete a block file and return its bytes to the directory budget.
    /// Best effort: a failed unlink is logged, not fatal.
    pub fn remove_block(&self, file: &SpillFile) {
        if let Err(e) = std::fs::remove_file(&file.path) {
            warn!("spill block {} unlink failed: {e}", file.path.display());
            return;
        }
        if let Some(storage) = self.storage.as_ref() {
            storage.dirs.release(file.dir_slot, file.file_bytes());
        }
    }
}
