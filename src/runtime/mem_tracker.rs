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
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::common::status::{ExecError, Result};

/// Tracks a logically accounted byte buffer that can be transferred across trackers.
///
/// Used for reservations that outlive the code path that created them, such as
/// a spilled probe stream's write buffer.
#[derive(Debug)]
pub struct TrackedBytes {
    bytes: i64,
    tracker: Arc<MemTracker>,
}

impl TrackedBytes {
    pub fn new(bytes: usize, tracker: Arc<MemTracker>) -> Self {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        tracker.consume(bytes);
        Self { bytes, tracker }
    }

    /// Reserve under the tracker's limit; fails without consuming anything.
    pub fn try_new(bytes: usize, tracker: Arc<MemTracker>) -> Result<Self> {
        let bytes_i64 = i64::try_from(bytes).unwrap_or(i64::MAX);
        tracker.try_consume(bytes_i64)?;
        Ok(Self {
            bytes: bytes_i64,
            tracker,
        })
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }

    pub fn transfer_to(&mut self, tracker: Arc<MemTracker>) {
        if Arc::ptr_eq(&self.tracker, &tracker) {
            return;
        }
        self.tracker.release(self.bytes);
        tracker.consume(self.bytes);
        self.tracker = tracker;
    }
}

impl Drop for TrackedBytes {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

/// Tracks logical memory usage for a component and its ancestors.
///
/// This is a lightweight accounting utility that only records bytes explicitly
/// reported by the caller. It does NOT reflect real process RSS or allocator
/// statistics. A tracker with `limit >= 0` rejects `try_consume` calls that
/// would push it or any limited ancestor past the limit.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    limit: i64,
    parent: Option<Arc<MemTracker>>,
    current: AtomicI64,
    peak: AtomicI64,
    allocated: AtomicI64,
    deallocated: AtomicI64,
    children: Mutex<Vec<Weak<MemTracker>>>,
}

impl MemTracker {
    /// Create a root tracker with no parent and no limit.
    pub fn new_root(label: impl Into<String>) -> Arc<Self> {
        Self::build(label, -1, None)
    }

    /// Create a root tracker enforcing `limit` bytes.
    pub fn new_root_with_limit(label: impl Into<String>, limit: i64) -> Arc<Self> {
        Self::build(label, limit, None)
    }

    /// Create a child tracker with the provided parent.
    pub fn new_child(label: impl Into<String>, parent: &Arc<MemTracker>) -> Arc<Self> {
        Self::build(label, -1, Some(Arc::clone(parent)))
    }

    /// Create a limited child tracker with the provided parent.
    pub fn new_child_with_limit(
        label: impl Into<String>,
        limit: i64,
        parent: &Arc<MemTracker>,
    ) -> Arc<Self> {
        Self::build(label, limit, Some(Arc::clone(parent)))
    }

    fn build(label: impl Into<String>, limit: i64, parent: Option<Arc<MemTracker>>) -> Arc<Self> {
        let tracker = Arc::new(Self {
            label: label.into(),
            limit,
            parent: parent.clone(),
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicI64::new(0),
            deallocated: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
        });
        if let Some(parent) = parent.as_ref() {
            parent
                .children
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Arc::downgrade(&tracker));
        }
        tracker
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn deallocated(&self) -> i64 {
        self.deallocated.load(Ordering::Relaxed)
    }

    pub fn children(&self) -> Vec<Arc<MemTracker>> {
        let mut out = Vec::new();
        let guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        for weak in guard.iter() {
            if let Some(child) = weak.upgrade() {
                out.push(child);
            }
        }
        out
    }

    /// Headroom under the tightest limit along the ancestor chain, or
    /// `i64::MAX` when no ancestor is limited.
    pub fn spare_capacity(&self) -> i64 {
        let mut spare = i64::MAX;
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            if current.limit >= 0 {
                spare = spare.min(current.limit - current.current());
            }
            tracker = current.parent.as_deref();
        }
        spare
    }

    /// Increase consumption for this tracker and all ancestors.
    pub fn consume(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let new_value = current.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            current.allocated.fetch_add(bytes, Ordering::AcqRel);
            current.update_peak(new_value);
            tracker = current.parent.as_deref();
        }
    }

    /// Consume `bytes` if it fits under every limit along the ancestor chain.
    /// On denial nothing is consumed and `MemLimitExceeded` carries the
    /// offending tracker's label and occupancy.
    pub fn try_consume(&self, bytes: i64) -> Result<()> {
        if bytes <= 0 {
            return Ok(());
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            if current.limit >= 0 && current.current() + bytes > current.limit {
                return Err(ExecError::mem_limit(format!(
                    "tracker '{}' denied reservation of {} bytes (current={} limit={})",
                    current.label,
                    bytes,
                    current.current(),
                    current.limit
                )));
            }
            tracker = current.parent.as_deref();
        }
        self.consume(bytes);
        Ok(())
    }

    /// Decrease consumption for this tracker and all ancestors.
    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            current.current.fetch_sub(bytes, Ordering::AcqRel);
            current.deallocated.fetch_add(bytes, Ordering::AcqRel);
            tracker = current.parent.as_deref();
        }
    }

    fn update_peak(&self, value: i64) {
        let mut prev = self.peak.load(Ordering::Relaxed);
        while value > prev {
            match self
                .peak
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}
