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
//! Chunk serialization for spill blocks.
//!
//! Each spill message is a self-contained Arrow IPC stream holding exactly
//! one record batch, optionally compressed. Framing every message as its own
//! stream costs a repeated schema header per message but keeps messages
//! independently decodable, which is what the block index promises.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use arrow::datatypes::Schema;
use arrow::ipc::CompressionType;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::record_batch::RecordBatch;

use crate::common::status::{ExecError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillCodec {
    None,
    Lz4,
    Zstd,
}

impl SpillCodec {
    /// Stable single-byte id stored in the block header.
    pub fn id(self) -> u8 {
        match self {
            SpillCodec::None => b'n',
            SpillCodec::Lz4 => b'l',
            SpillCodec::Zstd => b'z',
        }
    }

    fn compression(self) -> Option<CompressionType> {
        match self {
            SpillCodec::None => None,
            SpillCodec::Lz4 => Some(CompressionType::LZ4_FRAME),
            SpillCodec::Zstd => Some(CompressionType::ZSTD),
        }
    }
}

impl TryFrom<u8> for SpillCodec {
    type Error = ExecError;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            b'n' => Ok(SpillCodec::None),
            b'l' => Ok(SpillCodec::Lz4),
            b'z' => Ok(SpillCodec::Zstd),
            other => Err(ExecError::io(format!(
                "spill block carries unknown codec id 0x{other:02x}"
            ))),
        }
    }
}

impl FromStr for SpillCodec {
    type Err = ExecError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(SpillCodec::None),
            "lz4" => Ok(SpillCodec::Lz4),
            "zstd" => Ok(SpillCodec::Zstd),
            other => Err(ExecError::internal(format!(
                "spill.ipc_compression '{other}' is not one of none/lz4/zstd"
            ))),
        }
    }
}

impl fmt::Display for SpillCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpillCodec::None => "none",
            SpillCodec::Lz4 => "lz4",
            SpillCodec::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct EncodedMessage {
    pub bytes: Vec<u8>,
    pub num_rows: u32,
}

/// Encoder/decoder for single-batch spill messages.
#[derive(Debug, Clone)]
pub struct ChunkCodec {
    codec: SpillCodec,
    write_options: IpcWriteOptions,
}

impl ChunkCodec {
    pub fn new(codec: SpillCodec) -> Result<Self> {
        let write_options = IpcWriteOptions::default()
            .try_with_compression(codec.compression())
            .map_err(|e| {
                ExecError::internal(format!("spill codec {codec} is unavailable: {e}"))
            })?;
        Ok(Self {
            codec,
            write_options,
        })
    }

    pub fn codec(&self) -> SpillCodec {
        self.codec
    }

    pub fn encode(&self, batch: &RecordBatch) -> Result<EncodedMessage> {
        let num_rows = u32::try_from(batch.num_rows())
            .map_err(|_| ExecError::internal("spill message row count overflows u32"))?;
        let mut writer = StreamWriter::try_new_with_options(
            Vec::new(),
            batch.schema().as_ref(),
            self.write_options.clone(),
        )
        .map_err(|e| ExecError::io(format!("spill message writer init failed: {e}")))?;
        writer
            .write(batch)
            .map_err(|e| ExecError::io(format!("spill message encode failed: {e}")))?;
        writer
            .finish()
            .map_err(|e| ExecError::io(format!("spill message finish failed: {e}")))?;
        let bytes = writer
            .into_inner()
            .map_err(|e| ExecError::io(format!("spill message unwrap failed: {e}")))?;
        Ok(EncodedMessage { bytes, num_rows })
    }

    pub fn decode(&self, message: &[u8]) -> Result<RecordBatch> {
        let reader = StreamReader::try_new(Cursor::new(message), None)
            .map_err(|e| ExecError::io(format!("spill message reader init failed: {e}")))?;
        let mut batch = None;
        for next in reader {
            let next =
                next.map_err(|e| ExecError::io(format!("spill message decode failed: {e}")))?;
            if batch.replace(next).is_some() {
                return Err(ExecError::io(
                    "spill message holds more than one record batch",
                ));
            }
        }
        batch.ok_or_else(|| ExecError::io("spill message holds no record batch"))
    }
}

/// Schema identity check for block files: enough bits to catch a stream read
/// with the wrong schema, not a cryptographic commitment.
pub fn schema_fingerprint(schema: &Schema) -> u64 {
    let rendered = schema.to_string();
    let body = crc32c::crc32c(rendered.as_bytes()) as u64;
    let shape = crc32c::crc32c(&(schema.fields().len() as u32).to_le_bytes()) as u64;
    (shape << 32) | body
}
