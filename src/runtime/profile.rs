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
//! Runtime counter tree for operator observability.
//!
//! Responsibilities:
//! - Holds named, unit-tagged counters and free-form info strings per
//!   operator, with child profiles for sub-components.
//! - Provides a scoped timer for accumulating wall time into a counter.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CounterUnit {
    Unit,
    Bytes,
    TimeNs,
}

#[derive(Debug)]
pub struct Counter {
    unit: CounterUnit,
    value: AtomicI64,
}

pub type CounterRef = Arc<Counter>;

impl Counter {
    pub fn unit(&self) -> CounterUnit {
        self.unit
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Raise the counter to `value` if it is larger than the current value.
    pub fn set_max(&self, value: i64) {
        let mut prev = self.value.load(Ordering::Relaxed);
        while value > prev {
            match self
                .value
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeProfile {
    inner: Arc<RuntimeProfileInner>,
}

#[derive(Debug)]
struct RuntimeProfileInner {
    name: RwLock<String>,
    counters: Mutex<HashMap<String, CounterRef>>,
    info_strings: Mutex<BTreeMap<String, String>>,
    children: Mutex<Vec<RuntimeProfile>>,
    child_map: Mutex<HashMap<String, RuntimeProfile>>,
}

impl RuntimeProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RuntimeProfileInner {
                name: RwLock::new(name.into()),
                counters: Mutex::new(HashMap::new()),
                info_strings: Mutex::new(BTreeMap::new()),
                children: Mutex::new(Vec::new()),
                child_map: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner
            .name
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Get or create a counter. An existing counter keeps its original unit.
    pub fn counter(&self, name: &str, unit: CounterUnit) -> CounterRef {
        let mut guard = self.inner.counters.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(guard.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Counter {
                unit,
                value: AtomicI64::new(0),
            })
        }))
    }

    pub fn counter_value(&self, name: &str) -> Option<i64> {
        let guard = self.inner.counters.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(name).map(|c| c.value())
    }

    pub fn add_info_string(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut guard = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.insert(key.into(), value.into());
    }

    pub fn info_string(&self, key: &str) -> Option<String> {
        let guard = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned()
    }

    pub fn children(&self) -> Vec<RuntimeProfile> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn child(&self, name: impl Into<String>) -> RuntimeProfile {
        let name = name.into();
        if let Some(existing) = self
            .inner
            .child_map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&name)
            .cloned()
        {
            return existing;
        }
        let child = RuntimeProfile::new(name.clone());
        self.inner
            .child_map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, child.clone());
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(child.clone());
        child
    }

    /// Render the profile tree for logs and debug strings.
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        self.pretty_into(&mut out, 0);
        out
    }

    fn pretty_into(&self, out: &mut String, indent: usize) {
        let pad = "  ".repeat(indent);
        let _ = writeln!(out, "{}{}:", pad, self.name());
        {
            let info = self
                .inner
                .info_strings
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for (key, value) in info.iter() {
                let _ = writeln!(out, "{}  {} = {}", pad, key, value);
            }
        }
        {
            let counters = self.inner.counters.lock().unwrap_or_else(|e| e.into_inner());
            let mut names: Vec<&String> = counters.keys().collect();
            names.sort();
            for name in names {
                let counter = &counters[name];
                let suffix = match counter.unit() {
                    CounterUnit::Unit => "",
                    CounterUnit::Bytes => " bytes",
                    CounterUnit::TimeNs => " ns",
                };
                let _ = writeln!(out, "{}  {}: {}{}", pad, name, counter.value(), suffix);
            }
        }
        for child in self.children() {
            child.pretty_into(out, indent + 1);
        }
    }
}

/// Adds the elapsed wall time to a `TimeNs` counter when dropped.
pub struct ScopedTimer {
    counter: CounterRef,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(counter: CounterRef) -> Self {
        Self {
            counter,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        self.counter.add(clamp_u128_to_i64(self.start.elapsed().as_nanos()));
    }
}

pub fn clamp_u128_to_i64(value: u128) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::{CounterUnit, RuntimeProfile, ScopedTimer};

    #[test]
    fn counters_accumulate_and_render() {
        let profile = RuntimeProfile::new("HASH_JOIN (id=3)");
        let rows = profile.counter("ProbeRowsPartitioned", CounterUnit::Unit);
        rows.add(10);
        rows.add(5);
        profile.add_info_string("HashJoinState", "PARTITIONING_PROBE");
        assert_eq!(profile.counter_value("ProbeRowsPartitioned"), Some(15));
        let rendered = profile.pretty();
        assert!(rendered.contains("ProbeRowsPartitioned: 15"));
        assert!(rendered.contains("HashJoinState = PARTITIONING_PROBE"));
    }

    #[test]
    fn scoped_timer_adds_elapsed_time() {
        let profile = RuntimeProfile::new("op");
        let timer_counter = profile.counter("EvalTime", CounterUnit::TimeNs);
        {
            let _timer = ScopedTimer::new(timer_counter.clone());
        }
        assert!(timer_counter.value() >= 0);
    }

    #[test]
    fn set_max_keeps_largest() {
        let profile = RuntimeProfile::new("op");
        let level = profile.counter("MaxPartitionLevel", CounterUnit::Unit);
        level.set_max(2);
        level.set_max(1);
        assert_eq!(level.value(), 2);
    }
}
