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
//! Spill directory rotation with a per-directory byte cap.
//!
//! Block files rotate across the configured directories. Each directory
//! carries a soft byte budget (`dir_max_bytes`, 0 = unbounded) maintained by
//! charge/release calls from the spiller; a directory at its budget is
//! skipped, and when every directory is exhausted the spill fails rather
//! than filling the disks.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::common::status::{ExecError, Result};

#[derive(Debug)]
struct SpillDir {
    path: PathBuf,
    used_bytes: AtomicU64,
}

#[derive(Debug)]
pub struct DirManager {
    dirs: Vec<SpillDir>,
    dir_max_bytes: u64,
    cursor: AtomicUsize,
}

impl DirManager {
    pub fn new(paths: Vec<PathBuf>, dir_max_bytes: u64) -> Result<Self> {
        if paths.is_empty() {
            return Err(ExecError::internal(
                "spill storage needs at least one directory in spill.local_dirs",
            ));
        }
        let mut dirs = Vec::with_capacity(paths.len());
        for path in paths {
            if path.as_os_str().is_empty() {
                return Err(ExecError::internal(
                    "spill.local_dirs entries must be non-empty paths",
                ));
            }
            std::fs::create_dir_all(&path).map_err(|e| {
                ExecError::io(format!("spill directory {} unusable: {e}", path.display()))
            })?;
            dirs.push(SpillDir {
                path,
                used_bytes: AtomicU64::new(0),
            });
        }
        Ok(Self {
            dirs,
            dir_max_bytes,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn dir_max_bytes(&self) -> u64 {
        self.dir_max_bytes
    }

    fn has_room(&self, dir: &SpillDir) -> bool {
        self.dir_max_bytes == 0 || dir.used_bytes.load(Ordering::Acquire) < self.dir_max_bytes
    }

    /// Next directory in rotation with budget left, as (slot, path).
    pub fn acquire_dir(&self) -> Result<(usize, &Path)> {
        let start = self.cursor.fetch_add(1, Ordering::AcqRel);
        for probe in 0..self.dirs.len() {
            let slot = (start + probe) % self.dirs.len();
            let dir = &self.dirs[slot];
            if self.has_room(dir) {
                return Ok((slot, dir.path.as_path()));
            }
        }
        Err(ExecError::io(format!(
            "all {} spill directories are at their {}-byte budget",
            self.dirs.len(),
            self.dir_max_bytes
        )))
    }

    /// Record bytes written into a directory's budget.
    pub fn charge(&self, slot: usize, bytes: u64) {
        if let Some(dir) = self.dirs.get(slot) {
            dir.used_bytes.fetch_add(bytes, Ordering::AcqRel);
        }
    }

    /// Return bytes to a directory's budget after its block is deleted.
    pub fn release(&self, slot: usize, bytes: u64) {
        if let Some(dir) = self.dirs.get(slot) {
            let mut current = dir.used_bytes.load(Ordering::Acquire);
            loop {
                let next = current.saturating_sub(bytes);
                match dir.used_bytes.compare_exchange(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(actual) => current = actual,
                }
            }
        }
    }
}
