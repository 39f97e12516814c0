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
//! On-disk layout of one spill block file.
//!
//! A block file is a header, a run of length-prefixed IPC messages, and a
//! trailing message index:
//!
//! ```text
//! +--------+-----------+-----------+-----+-------+
//! | header | message 0 | message 1 | ... | index |
//! +--------+-----------+-----------+-----+-------+
//! ```
//!
//! The header is written twice: once as a placeholder when the file is
//! created and again, with the final message count and index position, after
//! the index lands. The index is an array of fixed-width entries so a reader
//! can jump to any message without scanning.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::common::status::{ExecError, Result};
use crate::exec::spill::ipc_serde::SpillCodec;

/// Magic and format revision, fused: bump the digit on layout changes.
const MAGIC: [u8; 4] = *b"PBK1";

/// magic(4) + codec(1) + pad(3) + messages(4) + index offset(8)
/// + index length(8) + schema fingerprint(8)
pub(crate) const HEADER_LEN: usize = 36;
/// offset(8) + length(4) + rows(4)
pub(crate) const ENTRY_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub codec: SpillCodec,
    pub num_messages: u32,
    pub index_offset: u64,
    pub index_length: u64,
    pub schema_fingerprint: u64,
}

#[derive(Debug, Clone)]
pub struct MessageEntry {
    pub offset: u64,
    pub length: u32,
    pub num_rows: u32,
}

#[derive(Debug, Clone)]
pub struct BlockMeta {
    pub header: BlockHeader,
    pub index: Vec<MessageEntry>,
}

impl BlockMeta {
    pub fn num_rows(&self) -> u64 {
        self.index.iter().map(|e| e.num_rows as u64).sum()
    }
}

impl BlockHeader {
    pub fn placeholder(codec: SpillCodec, schema_fingerprint: u64) -> Self {
        Self {
            codec,
            num_messages: 0,
            index_offset: 0,
            index_length: 0,
            schema_fingerprint,
        }
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&MAGIC);
        buf.push(self.codec.id());
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&self.num_messages.to_le_bytes());
        buf.extend_from_slice(&self.index_offset.to_le_bytes());
        buf.extend_from_slice(&self.index_length.to_le_bytes());
        buf.extend_from_slice(&self.schema_fingerprint.to_le_bytes());
        debug_assert_eq!(buf.len(), HEADER_LEN);
        out.write_all(&buf)
            .map_err(|e| ExecError::io(format!("spill block header write failed: {e}")))
    }

    pub fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_LEN];
        input
            .read_exact(&mut buf)
            .map_err(|e| ExecError::io(format!("spill block header read failed: {e}")))?;
        let mut fields = FieldReader::new(&buf);

        let magic = fields.bytes::<4>();
        if magic != MAGIC {
            return Err(ExecError::io(format!(
                "not a spill block file (magic {:02x?})",
                magic
            )));
        }
        let codec = SpillCodec::try_from(fields.u8())?;
        if fields.bytes::<3>() != [0u8; 3] {
            return Err(ExecError::io("spill block header padding is not zero"));
        }
        Ok(Self {
            codec,
            num_messages: fields.u32(),
            index_offset: fields.u64(),
            index_length: fields.u64(),
            schema_fingerprint: fields.u64(),
        })
    }
}

impl MessageEntry {
    fn write_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.num_rows.to_le_bytes());
    }
}

/// Serialize the index and return its byte length.
pub fn write_index<W: Write>(out: &mut W, entries: &[MessageEntry]) -> Result<u64> {
    let mut buf = Vec::with_capacity(entries.len() * ENTRY_LEN);
    for entry in entries {
        entry.write_into(&mut buf);
    }
    out.write_all(&buf)
        .map_err(|e| ExecError::io(format!("spill block index write failed: {e}")))?;
    Ok(buf.len() as u64)
}

/// Read the index the header points at.
pub fn read_index<R: Read + Seek>(input: &mut R, header: &BlockHeader) -> Result<Vec<MessageEntry>> {
    let expected = header.num_messages as u64 * ENTRY_LEN as u64;
    if header.index_length != expected {
        return Err(ExecError::io(format!(
            "spill block index length {} does not match {} messages",
            header.index_length, header.num_messages
        )));
    }
    input
        .seek(SeekFrom::Start(header.index_offset))
        .map_err(|e| ExecError::io(format!("spill block index seek failed: {e}")))?;
    let mut buf = vec![0u8; header.index_length as usize];
    input
        .read_exact(&mut buf)
        .map_err(|e| ExecError::io(format!("spill block index read failed: {e}")))?;

    let mut entries = Vec::with_capacity(header.num_messages as usize);
    for raw in buf.chunks_exact(ENTRY_LEN) {
        let mut fields = FieldReader::new(raw);
        entries.push(MessageEntry {
            offset: fields.u64(),
            length: fields.u32(),
            num_rows: fields.u32(),
        });
    }
    Ok(entries)
}

/// Little-endian field cursor over a fixed buffer. Lengths are checked by the
/// callers' fixed-size reads, so the takes themselves cannot run past the end.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.bytes::<4>())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.bytes::<8>())
    }
}
