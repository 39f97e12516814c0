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
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::config;
use crate::common::status::{ExecError, Result};
use crate::exec::spill::spiller::Spiller;
use crate::runtime::mem_tracker::MemTracker;

/// Per-operator-instance execution context.
///
/// Carries the settings an operator consults on its hot path: the output
/// chunk size, the memory tracker its reservations charge against, the spill
/// storage handle, and the cooperative cancellation flag. Cancellation is
/// checked at batch boundaries only; no state changes mid-batch.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    chunk_size: usize,
    mem_tracker: Arc<MemTracker>,
    spiller: Arc<Spiller>,
    cancelled: Arc<AtomicBool>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            chunk_size: config::chunk_size(),
            mem_tracker: MemTracker::new_root("query"),
            spiller: Arc::new(Spiller::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl RuntimeState {
    pub fn new(
        chunk_size: usize,
        mem_tracker: Arc<MemTracker>,
        spiller: Arc<Spiller>,
    ) -> Self {
        Self {
            chunk_size: if chunk_size == 0 {
                config::chunk_size()
            } else {
                chunk_size
            },
            mem_tracker,
            spiller,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_mem_limit(limit: i64) -> Self {
        Self {
            mem_tracker: MemTracker::new_root_with_limit("query", limit),
            ..Self::default()
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn spiller(&self) -> &Arc<Spiller> {
        &self.spiller
    }

    pub fn set_spiller(&mut self, spiller: Arc<Spiller>) {
        self.spiller = spiller;
    }

    /// Handle the engine cancels through when a query-level deadline fires.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ExecError::Cancelled)
        } else {
            Ok(())
        }
    }
}
