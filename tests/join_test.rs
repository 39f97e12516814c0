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
//! End-to-end tests for the partitioned hash join operator.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int32Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use petrel::common::ids::SlotId;
use petrel::common::status::ExecError;
use petrel::exec::chunk::{Chunk, field_with_slot_id};
use petrel::exec::expr::{ExprArena, ExprId, ExprNode};
use petrel::exec::join::{
    HashJoinParams, JoinType, MemoryChunkSource, PartitionedHashJoinNode, PrefetchMode,
};
use petrel::exec::spill::ipc_serde::SpillCodec;
use petrel::exec::spill::spiller::{SpillStorageConfig, Spiller};
use petrel::runtime::mem_tracker::MemTracker;
use petrel::runtime::profile::RuntimeProfile;
use petrel::runtime::runtime_state::RuntimeState;

const PROBE_K: SlotId = SlotId::new(1);
const PROBE_W: SlotId = SlotId::new(2);
const BUILD_K: SlotId = SlotId::new(3);
const BUILD_V: SlotId = SlotId::new(4);

fn probe_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        field_with_slot_id(Field::new("k", DataType::Int32, true), PROBE_K),
        field_with_slot_id(Field::new("w", DataType::Utf8, true), PROBE_W),
    ]))
}

fn build_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        field_with_slot_id(Field::new("k", DataType::Int32, true), BUILD_K),
        field_with_slot_id(Field::new("v", DataType::Utf8, true), BUILD_V),
    ]))
}

fn probe_chunk(rows: &[(Option<i32>, &str)]) -> Chunk {
    let keys: Vec<Option<i32>> = rows.iter().map(|(k, _)| *k).collect();
    let names: Vec<Option<&str>> = rows.iter().map(|(_, w)| Some(*w)).collect();
    let batch = RecordBatch::try_new(
        probe_schema(),
        vec![
            Arc::new(Int32Array::from(keys)) as ArrayRef,
            Arc::new(StringArray::from(names)) as ArrayRef,
        ],
    )
    .unwrap();
    Chunk::new(batch)
}

fn build_chunk(rows: &[(Option<i32>, &str)]) -> Chunk {
    let keys: Vec<Option<i32>> = rows.iter().map(|(k, _)| *k).collect();
    let names: Vec<Option<&str>> = rows.iter().map(|(_, v)| Some(*v)).collect();
    let batch = RecordBatch::try_new(
        build_schema(),
        vec![
            Arc::new(Int32Array::from(keys)) as ArrayRef,
            Arc::new(StringArray::from(names)) as ArrayRef,
        ],
    )
    .unwrap();
    Chunk::new(batch)
}

struct JoinSetup {
    arena: Arc<ExprArena>,
    probe_key: ExprId,
    build_key: ExprId,
}

fn key_exprs() -> JoinSetup {
    let mut arena = ExprArena::default();
    let probe_key = arena.push_typed(ExprNode::SlotId(PROBE_K), DataType::Int32);
    let build_key = arena.push_typed(ExprNode::SlotId(BUILD_K), DataType::Int32);
    JoinSetup {
        arena: Arc::new(arena),
        probe_key,
        build_key,
    }
}

fn join_params(join_type: JoinType, setup: &JoinSetup) -> HashJoinParams {
    HashJoinParams {
        arena: Arc::clone(&setup.arena),
        join_type,
        probe_exprs: vec![setup.probe_key],
        build_exprs: vec![setup.build_key],
        other_conjuncts: Vec::new(),
        null_safe_eq: vec![false],
        probe_schema: probe_schema(),
        build_schema: build_schema(),
        prefetch_mode: PrefetchMode::Prefetch,
        node_id: 7,
    }
}

fn run_join(
    node: &mut PartitionedHashJoinNode,
    state: &RuntimeState,
    build: Vec<Chunk>,
    probe: Vec<Chunk>,
) -> Vec<Chunk> {
    petrel::petrel_logging::init();
    node.prepare(state).expect("prepare");
    let mut build_source = MemoryChunkSource::new(build);
    node.open(state, &mut build_source).expect("open");
    let mut probe_source = MemoryChunkSource::new(probe);
    let mut out = Vec::new();
    while let Some(chunk) = node.get_next(state, &mut probe_source).expect("get_next") {
        out.push(chunk);
    }
    out
}

fn string_column(chunk: &Chunk, slot: SlotId) -> Vec<Option<String>> {
    let col = chunk.column_by_slot_id(slot).unwrap();
    let arr = col.as_any().downcast_ref::<StringArray>().unwrap();
    (0..arr.len())
        .map(|i| {
            if arr.is_null(i) {
                None
            } else {
                Some(arr.value(i).to_string())
            }
        })
        .collect()
}

fn int_column(chunk: &Chunk, slot: SlotId) -> Vec<Option<i32>> {
    let col = chunk.column_by_slot_id(slot).unwrap();
    let arr = col.as_any().downcast_ref::<Int32Array>().unwrap();
    (0..arr.len())
        .map(|i| {
            if arr.is_null(i) {
                None
            } else {
                Some(arr.value(i))
            }
        })
        .collect()
}

fn collect_w_v(chunks: &[Chunk]) -> Vec<(Option<String>, Option<String>)> {
    let mut out = Vec::new();
    for chunk in chunks {
        let w = string_column(chunk, PROBE_W);
        let v = string_column(chunk, BUILD_V);
        out.extend(w.into_iter().zip(v));
    }
    out.sort();
    out
}

fn spilling_state(limit: i64, block_size: u64, dir: &std::path::Path) -> RuntimeState {
    let storage = SpillStorageConfig {
        local_dirs: vec![dir.to_path_buf()],
        dir_max_bytes: 0,
        block_size_bytes: block_size,
        ipc_compression: SpillCodec::Lz4,
    };
    let spiller = Arc::new(Spiller::new_with_storage(storage, SpillCodec::Lz4).unwrap());
    RuntimeState::new(
        1024,
        MemTracker::new_root_with_limit("query", limit),
        spiller,
    )
}

#[test]
fn inner_join_fits_in_memory() {
    let setup = key_exprs();
    let profile = RuntimeProfile::new("query");
    let state = RuntimeState::default();
    let mut node =
        PartitionedHashJoinNode::new(join_params(JoinType::Inner, &setup), &profile).unwrap();

    let build = vec![build_chunk(&[(Some(1), "a"), (Some(2), "b"), (Some(2), "c")])];
    let probe = vec![probe_chunk(&[(Some(2), "x"), (Some(3), "y")])];
    let out = run_join(&mut node, &state, build, probe);

    assert_eq!(
        collect_w_v(&out),
        vec![
            (Some("x".to_string()), Some("b".to_string())),
            (Some("x".to_string()), Some("c".to_string())),
        ]
    );
}

#[test]
fn left_outer_join_null_extends_unmatched_probe() {
    let setup = key_exprs();
    let profile = RuntimeProfile::new("query");
    let state = RuntimeState::default();
    let mut node =
        PartitionedHashJoinNode::new(join_params(JoinType::LeftOuter, &setup), &profile).unwrap();

    let build = vec![build_chunk(&[(Some(1), "a"), (Some(2), "b"), (Some(2), "c")])];
    let probe = vec![probe_chunk(&[(Some(2), "x"), (Some(3), "y")])];
    let out = run_join(&mut node, &state, build, probe);

    assert_eq!(
        collect_w_v(&out),
        vec![
            (Some("x".to_string()), Some("b".to_string())),
            (Some("x".to_string()), Some("c".to_string())),
            (Some("y".to_string()), None),
        ]
    );
}

#[test]
fn right_anti_join_emits_unmatched_build_rows() {
    let setup = key_exprs();
    let profile = RuntimeProfile::new("query");
    let state = RuntimeState::default();
    let mut node =
        PartitionedHashJoinNode::new(join_params(JoinType::RightAnti, &setup), &profile).unwrap();

    let build = vec![build_chunk(&[(Some(1), "a"), (Some(2), "b"), (Some(2), "c")])];
    let probe = vec![probe_chunk(&[(Some(2), "x"), (Some(3), "y")])];
    let out = run_join(&mut node, &state, build, probe);

    let mut values = Vec::new();
    for chunk in &out {
        values.extend(string_column(chunk, BUILD_V));
    }
    values.sort();
    assert_eq!(values, vec![Some("a".to_string())]);
}

#[test]
fn right_outer_join_null_extends_unmatched_build() {
    let setup = key_exprs();
    let profile = RuntimeProfile::new("query");
    let state = RuntimeState::default();
    let mut node =
        PartitionedHashJoinNode::new(join_params(JoinType::RightOuter, &setup), &profile)
            .unwrap();

    let build = vec![build_chunk(&[(Some(1), "a"), (Some(2), "b")])];
    let probe = vec![probe_chunk(&[(Some(2), "x"), (Some(3), "y")])];
    let out = run_join(&mut node, &state, build, probe);

    assert_eq!(
        collect_w_v(&out),
        vec![
            (None, Some("a".to_string())),
            (Some("x".to_string()), Some("b".to_string())),
        ]
    );
}

#[test]
fn full_outer_join_null_extends_both_sides() {
    let setup = key_exprs();
    let profile = RuntimeProfile::new("query");
    let state = RuntimeState::default();
    let mut node =
        PartitionedHashJoinNode::new(join_params(JoinType::FullOuter, &setup), &profile).unwrap();

    let build = vec![build_chunk(&[(Some(1), "a"), (Some(2), "b")])];
    let probe = vec![probe_chunk(&[(Some(2), "x"), (Some(3), "y")])];
    let out = run_join(&mut node, &state, build, probe);

    assert_eq!(
        collect_w_v(&out),
        vec![
            (None, Some("a".to_string())),
            (Some("x".to_string()), Some("b".to_string())),
            (Some("y".to_string()), None),
        ]
    );
}

#[test]
fn semi_and_anti_partition_the_probe_side() {
    let setup = key_exprs();
    let state = RuntimeState::default();
    let build_rows = [(Some(1), "a"), (Some(2), "b"), (Some(2), "c")];
    let probe_rows = [
        (Some(1), "p"),
        (Some(2), "q"),
        (Some(5), "r"),
        (None, "s"),
    ];

    let profile = RuntimeProfile::new("query");
    let mut semi =
        PartitionedHashJoinNode::new(join_params(JoinType::LeftSemi, &setup), &profile).unwrap();
    let semi_out = run_join(
        &mut semi,
        &state,
        vec![build_chunk(&build_rows)],
        vec![probe_chunk(&probe_rows)],
    );
    let mut semi_w = Vec::new();
    for chunk in &semi_out {
        semi_w.extend(string_column(chunk, PROBE_W));
    }
    semi_w.sort();
    assert_eq!(semi_w, vec![Some("p".to_string()), Some("q".to_string())]);

    let mut anti =
        PartitionedHashJoinNode::new(join_params(JoinType::LeftAnti, &setup), &profile).unwrap();
    let anti_out = run_join(
        &mut anti,
        &state,
        vec![build_chunk(&build_rows)],
        vec![probe_chunk(&probe_rows)],
    );
    let mut anti_w = Vec::new();
    for chunk in &anti_out {
        anti_w.extend(string_column(chunk, PROBE_W));
    }
    anti_w.sort();
    // Semi and anti outputs are disjoint and together cover the probe side.
    assert_eq!(anti_w, vec![Some("r".to_string()), Some("s".to_string())]);
}

#[test]
fn right_semi_join_emits_each_matched_build_row_once() {
    let setup = key_exprs();
    let profile = RuntimeProfile::new("query");
    let state = RuntimeState::default();
    let mut node =
        PartitionedHashJoinNode::new(join_params(JoinType::RightSemi, &setup), &profile).unwrap();

    let build = vec![build_chunk(&[(Some(1), "a"), (Some(2), "b"), (Some(2), "c")])];
    // Key 2 appears twice on the probe side; each build row must still come
    // out exactly once.
    let probe = vec![probe_chunk(&[(Some(2), "x"), (Some(2), "y")])];
    let out = run_join(&mut node, &state, build, probe);

    let mut values = Vec::new();
    for chunk in &out {
        values.extend(string_column(chunk, BUILD_V));
    }
    values.sort();
    assert_eq!(values, vec![Some("b".to_string()), Some("c".to_string())]);
}

#[test]
fn duplicate_keys_produce_the_cross_product_within_a_group() {
    let setup = key_exprs();
    let profile = RuntimeProfile::new("query");
    let state = RuntimeState::default();
    let mut node =
        PartitionedHashJoinNode::new(join_params(JoinType::Inner, &setup), &profile).unwrap();

    let build = vec![build_chunk(&[(Some(7), "b1"), (Some(7), "b2")])];
    let probe = vec![probe_chunk(&[(Some(7), "p1"), (Some(7), "p2")])];
    let out = run_join(&mut node, &state, build, probe);

    let pairs = collect_w_v(&out);
    assert_eq!(pairs.len(), 4);
    for w in ["p1", "p2"] {
        for v in ["b1", "b2"] {
            assert!(pairs.contains(&(Some(w.to_string()), Some(v.to_string()))));
        }
    }
}

#[test]
fn empty_probe_side_boundaries() {
    let setup = key_exprs();
    let state = RuntimeState::default();
    let build_rows = [(Some(1), "a"), (Some(2), "b")];

    let profile = RuntimeProfile::new("query");
    let mut inner =
        PartitionedHashJoinNode::new(join_params(JoinType::Inner, &setup), &profile).unwrap();
    let out = run_join(&mut inner, &state, vec![build_chunk(&build_rows)], vec![]);
    assert!(out.is_empty());

    let mut right_outer =
        PartitionedHashJoinNode::new(join_params(JoinType::RightOuter, &setup), &profile)
            .unwrap();
    let out = run_join(
        &mut right_outer,
        &state,
        vec![build_chunk(&build_rows)],
        vec![],
    );
    assert_eq!(
        collect_w_v(&out),
        vec![(None, Some("a".to_string())), (None, Some("b".to_string()))]
    );
}

#[test]
fn empty_build_side_boundaries() {
    let setup = key_exprs();
    let state = RuntimeState::default();
    let probe_rows = [(Some(1), "x"), (Some(2), "y")];

    let profile = RuntimeProfile::new("query");
    let mut left_outer =
        PartitionedHashJoinNode::new(join_params(JoinType::LeftOuter, &setup), &profile).unwrap();
    let out = run_join(
        &mut left_outer,
        &state,
        vec![],
        vec![probe_chunk(&probe_rows)],
    );
    assert_eq!(
        collect_w_v(&out),
        vec![
            (Some("x".to_string()), None),
            (Some("y".to_string()), None),
        ]
    );

    let mut anti =
        PartitionedHashJoinNode::new(join_params(JoinType::LeftAnti, &setup), &profile).unwrap();
    let out = run_join(&mut anti, &state, vec![], vec![probe_chunk(&probe_rows)]);
    let mut names = Vec::new();
    for chunk in &out {
        names.extend(string_column(chunk, PROBE_W));
    }
    names.sort();
    assert_eq!(names, vec![Some("x".to_string()), Some("y".to_string())]);
}

#[test]
fn inner_join_applies_other_join_conjuncts() {
    let mut arena = ExprArena::default();
    let probe_key = arena.push_typed(ExprNode::SlotId(PROBE_K), DataType::Int32);
    let build_key = arena.push_typed(ExprNode::SlotId(BUILD_K), DataType::Int32);
    // ON clause residual: w < v (lexicographic on the payload strings).
    let probe_w = arena.push_typed(ExprNode::SlotId(PROBE_W), DataType::Utf8);
    let build_v = arena.push_typed(ExprNode::SlotId(BUILD_V), DataType::Utf8);
    let residual = arena.push_typed(ExprNode::Lt(probe_w, build_v), DataType::Boolean);
    let arena = Arc::new(arena);

    let params = HashJoinParams {
        arena: Arc::clone(&arena),
        join_type: JoinType::Inner,
        probe_exprs: vec![probe_key],
        build_exprs: vec![build_key],
        other_conjuncts: vec![residual],
        null_safe_eq: vec![false],
        probe_schema: probe_schema(),
        build_schema: build_schema(),
        prefetch_mode: PrefetchMode::None,
        node_id: 8,
    };
    let profile = RuntimeProfile::new("query");
    let state = RuntimeState::default();
    let mut node = PartitionedHashJoinNode::new(params, &profile).unwrap();

    let build = vec![build_chunk(&[(Some(1), "m"), (Some(1), "z")])];
    let probe = vec![probe_chunk(&[(Some(1), "p"), (Some(1), "a")])];
    let out = run_join(&mut node, &state, build, probe);

    assert_eq!(
        collect_w_v(&out),
        vec![
            (Some("a".to_string()), Some("m".to_string())),
            (Some("a".to_string()), Some("z".to_string())),
            (Some("p".to_string()), Some("z".to_string())),
        ]
    );
}

#[test]
fn null_safe_equality_keys_match_null_to_null() {
    let setup = key_exprs();
    let mut params = join_params(JoinType::Inner, &setup);
    params.null_safe_eq = vec![true];
    let profile = RuntimeProfile::new("query");
    let state = RuntimeState::default();
    let mut node = PartitionedHashJoinNode::new(params, &profile).unwrap();

    let build = vec![build_chunk(&[(None, "bn"), (Some(1), "b1")])];
    let probe = vec![probe_chunk(&[(None, "pn"), (Some(1), "p1")])];
    let out = run_join(&mut node, &state, build, probe);

    assert_eq!(
        collect_w_v(&out),
        vec![
            (Some("p1".to_string()), Some("b1".to_string())),
            (Some("pn".to_string()), Some("bn".to_string())),
        ]
    );
}

#[test]
fn forced_spill_preserves_the_join_multiset() {
    let temp = tempfile::tempdir().unwrap();
    let state = spilling_state(512 * 1024, 4096, temp.path());
    let setup = key_exprs();
    let profile = RuntimeProfile::new("query");
    let mut node =
        PartitionedHashJoinNode::new(join_params(JoinType::Inner, &setup), &profile).unwrap();

    const ROWS: i32 = 60_000;
    let mut build_chunks = Vec::new();
    for start in (0..ROWS).step_by(4096) {
        let end = (start + 4096).min(ROWS);
        let build_rows: Vec<(Option<i32>, String)> =
            (start..end).map(|k| (Some(k), format!("b{k}"))).collect();
        let borrowed: Vec<(Option<i32>, &str)> = build_rows
            .iter()
            .map(|(k, v)| (*k, v.as_str()))
            .collect();
        build_chunks.push(build_chunk(&borrowed));
    }

    // Probe in a scrambled order; the output multiset must not depend on it.
    let mut probe_keys: Vec<i32> = (0..ROWS).collect();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    probe_keys.shuffle(&mut rng);
    let mut probe_chunks = Vec::new();
    for window in probe_keys.chunks(4096) {
        let probe_rows: Vec<(Option<i32>, String)> = window
            .iter()
            .map(|k| (Some(*k), format!("p{k}")))
            .collect();
        let borrowed: Vec<(Option<i32>, &str)> = probe_rows
            .iter()
            .map(|(k, w)| (*k, w.as_str()))
            .collect();
        probe_chunks.push(probe_chunk(&borrowed));
    }

    let out = run_join(&mut node, &state, build_chunks, probe_chunks);

    let mut pairs: Vec<(Option<i32>, Option<i32>)> = Vec::new();
    for chunk in &out {
        let pk = int_column(chunk, PROBE_K);
        let bk = int_column(chunk, BUILD_K);
        pairs.extend(pk.into_iter().zip(bk));
    }
    assert_eq!(pairs.len(), ROWS as usize);
    pairs.sort();
    for (i, (p, b)) in pairs.iter().enumerate() {
        assert_eq!(*p, Some(i as i32));
        assert_eq!(*b, Some(i as i32));
    }

    let join_profile = node.profile();
    assert!(join_profile.counter_value("PartitionsSpilled").unwrap() >= 1);
    assert!(join_profile.counter_value("SpillBytes").unwrap() > 0);
    assert!(join_profile.counter_value("ProbeRowsPartitioned").unwrap() > 0);
    assert_eq!(
        join_profile.counter_value("BuildRowsPartitioned").unwrap(),
        ROWS as i64
    );
}

#[test]
fn null_aware_anti_join_with_build_null_suppresses_all_output() {
    let setup = key_exprs();
    let profile = RuntimeProfile::new("query");
    let state = RuntimeState::default();
    let mut node = PartitionedHashJoinNode::new(
        join_params(JoinType::NullAwareLeftAnti, &setup),
        &profile,
    )
    .unwrap();

    let build = vec![build_chunk(&[(Some(1), "b1"), (None, "bn")])];
    let probe = vec![probe_chunk(&[(Some(1), "p1"), (Some(2), "p2"), (None, "pn")])];
    let out = run_join(&mut node, &state, build, probe);

    // A null build key makes every NOT IN outcome unknown-or-false.
    assert!(out.iter().all(|c| c.is_empty()), "expected no output rows");
}

#[test]
fn null_aware_anti_join_without_build_nulls_behaves_like_not_in() {
    let setup = key_exprs();
    let profile = RuntimeProfile::new("query");
    let state = RuntimeState::default();
    let mut node = PartitionedHashJoinNode::new(
        join_params(JoinType::NullAwareLeftAnti, &setup),
        &profile,
    )
    .unwrap();

    let build = vec![build_chunk(&[(Some(1), "b1"), (Some(3), "b3")])];
    let probe = vec![probe_chunk(&[(Some(1), "p1"), (Some(2), "p2"), (None, "pn")])];
    let out = run_join(&mut node, &state, build, probe);

    let mut names = Vec::new();
    for chunk in &out {
        names.extend(string_column(chunk, PROBE_W));
    }
    names.sort();
    // p2 has no equal build key; pn is NULL and the build side is non-empty,
    // so NULL NOT IN (1, 3) is unknown and pn is dropped.
    assert_eq!(names, vec![Some("p2".to_string())]);
}

#[test]
fn null_aware_anti_join_conjuncts_limit_null_matches() {
    let mut arena = ExprArena::default();
    let probe_key = arena.push_typed(ExprNode::SlotId(PROBE_K), DataType::Int32);
    let build_key = arena.push_typed(ExprNode::SlotId(BUILD_K), DataType::Int32);
    let probe_w = arena.push_typed(ExprNode::SlotId(PROBE_W), DataType::Utf8);
    let build_v = arena.push_typed(ExprNode::SlotId(BUILD_V), DataType::Utf8);
    let residual = arena.push_typed(ExprNode::Eq(probe_w, build_v), DataType::Boolean);
    let arena = Arc::new(arena);

    let params = HashJoinParams {
        arena,
        join_type: JoinType::NullAwareLeftAnti,
        probe_exprs: vec![probe_key],
        build_exprs: vec![build_key],
        other_conjuncts: vec![residual],
        null_safe_eq: vec![false],
        probe_schema: probe_schema(),
        build_schema: build_schema(),
        prefetch_mode: PrefetchMode::None,
        node_id: 9,
    };
    let profile = RuntimeProfile::new("query");
    let state = RuntimeState::default();
    let mut node = PartitionedHashJoinNode::new(params, &profile).unwrap();

    // The null build key only disables probe rows whose payload matches the
    // conjunct ("x"); the others survive the anti join.
    let build = vec![build_chunk(&[(None, "x")])];
    let probe = vec![probe_chunk(&[(Some(1), "x"), (Some(2), "y"), (None, "x"), (None, "y")])];
    let out = run_join(&mut node, &state, build, probe);

    let mut rows = Vec::new();
    for chunk in &out {
        let k = int_column(chunk, PROBE_K);
        let w = string_column(chunk, PROBE_W);
        rows.extend(k.into_iter().zip(w));
    }
    rows.sort();
    assert_eq!(
        rows,
        vec![
            (None, Some("y".to_string())),
            (Some(2), Some("y".to_string())),
        ]
    );
}

#[test]
fn spilled_left_outer_join_is_complete() {
    let temp = tempfile::tempdir().unwrap();
    let state = spilling_state(256 * 1024, 4096, temp.path());
    let setup = key_exprs();
    let profile = RuntimeProfile::new("query");
    let mut node =
        PartitionedHashJoinNode::new(join_params(JoinType::LeftOuter, &setup), &profile).unwrap();

    const ROWS: i32 = 20_000;
    let mut build_chunks = Vec::new();
    let mut probe_chunks = Vec::new();
    for start in (0..ROWS).step_by(2048) {
        let end = (start + 2048).min(ROWS);
        // Build side only covers even keys.
        let build_rows: Vec<(Option<i32>, String)> = (start..end)
            .filter(|k| k % 2 == 0)
            .map(|k| (Some(k), format!("b{k}")))
            .collect();
        let borrowed: Vec<(Option<i32>, &str)> = build_rows
            .iter()
            .map(|(k, v)| (*k, v.as_str()))
            .collect();
        build_chunks.push(build_chunk(&borrowed));

        let probe_rows: Vec<(Option<i32>, String)> =
            (start..end).map(|k| (Some(k), format!("p{k}"))).collect();
        let borrowed: Vec<(Option<i32>, &str)> = probe_rows
            .iter()
            .map(|(k, w)| (*k, w.as_str()))
            .collect();
        probe_chunks.push(probe_chunk(&borrowed));
    }

    let out = run_join(&mut node, &state, build_chunks, probe_chunks);
    let mut matched = 0usize;
    let mut null_extended = 0usize;
    for chunk in &out {
        for v in string_column(chunk, BUILD_V) {
            match v {
                Some(_) => matched += 1,
                None => null_extended += 1,
            }
        }
    }
    assert_eq!(matched, (ROWS / 2) as usize);
    assert_eq!(null_extended, (ROWS / 2) as usize);
}

#[test]
fn cancellation_unwinds_mid_probe() {
    let setup = key_exprs();
    let profile = RuntimeProfile::new("query");
    let state = RuntimeState::default();
    let mut node =
        PartitionedHashJoinNode::new(join_params(JoinType::Inner, &setup), &profile).unwrap();
    node.prepare(&state).unwrap();

    let mut build = MemoryChunkSource::new(vec![build_chunk(&[(Some(1), "a")])]);
    node.open(&state, &mut build).unwrap();

    state.cancel();
    let mut probe = MemoryChunkSource::new(vec![probe_chunk(&[(Some(1), "x")])]);
    let err = node.get_next(&state, &mut probe).expect_err("cancelled");
    assert_eq!(err, ExecError::Cancelled);
}
