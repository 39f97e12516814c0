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
use crate::petrel_config::config as petrel_app_config;

pub(crate) fn chunk_size() -> usize {
    let configured = petrel_app_config()
        .ok()
        .map(|c| c.runtime.chunk_size)
        .unwrap_or(0);
    if configured == 0 { 4096 } else { configured }
}

pub(crate) fn spill_enable() -> bool {
    petrel_app_config()
        .ok()
        .map(|c| c.spill.enable)
        .unwrap_or(false)
}

pub(crate) fn spill_local_dirs() -> Vec<String> {
    petrel_app_config()
        .ok()
        .map(|c| c.spill.local_dirs.clone())
        .unwrap_or_default()
}

pub(crate) fn spill_dir_max_bytes() -> u64 {
    petrel_app_config()
        .ok()
        .map(|c| c.spill.dir_max_bytes)
        .unwrap_or(0)
}

pub(crate) fn spill_block_size_bytes() -> u64 {
    let configured = petrel_app_config()
        .ok()
        .map(|c| c.spill.block_size_bytes)
        .unwrap_or(0);
    if configured == 0 {
        8 * 1024 * 1024
    } else {
        configured
    }
}

pub(crate) fn spill_ipc_compression() -> String {
    let configured = petrel_app_config()
        .ok()
        .map(|c| c.spill.ipc_compression.clone())
        .unwrap_or_default();
    if configured.is_empty() {
        "none".to_string()
    } else {
        configured
    }
}
