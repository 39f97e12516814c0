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
//! Expression arena for join keys and join conjuncts.
//!
//! Responsibilities:
//! - Stores expression nodes in an arena addressed by `ExprId` and evaluates
//!   them vectorized over a `Chunk` to an Arrow array.
//! - Covers the node kinds the join operator binds: slot references,
//!   literals, comparisons (including null-safe equality), boolean
//!   connectives, and null tests.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, NullArray, StringArray,
};
use arrow::compute::kernels::boolean::{and_kleene, is_null, is_not_null, not, or_kleene};
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq, not_distinct};
use arrow::datatypes::DataType;

use crate::common::ids::SlotId;
use crate::common::status::{ExecError, Result};
use crate::exec::chunk::Chunk;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExprId(pub usize);

#[derive(Clone, Debug, PartialEq)]
pub enum LiteralValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

#[derive(Clone, Debug)]
pub enum ExprNode {
    Literal(LiteralValue),
    /// Slot id resolved against the chunk's slot map.
    SlotId(SlotId),
    Eq(ExprId, ExprId),
    /// Null-safe equality (`<=>`): null compares equal to null.
    EqForNull(ExprId, ExprId),
    Ne(ExprId, ExprId),
    Lt(ExprId, ExprId),
    Le(ExprId, ExprId),
    Gt(ExprId, ExprId),
    Ge(ExprId, ExprId),
    And(ExprId, ExprId),
    Or(ExprId, ExprId),
    Not(ExprId),
    IsNull(ExprId),
    IsNotNull(ExprId),
}

#[derive(Clone, Debug, Default)]
pub struct ExprArena {
    nodes: Vec<ExprNode>,
    types: Vec<DataType>,
}

impl ExprArena {
    pub fn push(&mut self, node: ExprNode) -> ExprId {
        self.push_typed(node, DataType::Null)
    }

    pub fn push_typed(&mut self, node: ExprNode, data_type: DataType) -> ExprId {
        let id = ExprId(self.nodes.len());
        self.nodes.push(node);
        self.types.push(data_type);
        id
    }

    pub fn node(&self, id: ExprId) -> Option<&ExprNode> {
        self.nodes.get(id.0)
    }

    pub fn data_type(&self, id: ExprId) -> Option<&DataType> {
        self.types.get(id.0)
    }

    pub fn eval(&self, id: ExprId, chunk: &Chunk) -> Result<ArrayRef> {
        let node = self
            .nodes
            .get(id.0)
            .ok_or_else(|| ExecError::expr(format!("expr id {} out of bounds", id.0)))?;
        match node {
            ExprNode::Literal(value) => eval_literal(value, chunk.len()),
            ExprNode::SlotId(slot_id) => chunk
                .column_by_slot_id(*slot_id)
                .map_err(|e| ExecError::expr(e.to_string())),
            ExprNode::Eq(l, r) => self.eval_cmp(*l, *r, chunk, |a, b| {
                eq(a, b).map_err(|e| ExecError::expr(e.to_string()))
            }),
            ExprNode::EqForNull(l, r) => self.eval_cmp(*l, *r, chunk, |a, b| {
                not_distinct(a, b).map_err(|e| ExecError::expr(e.to_string()))
            }),
            ExprNode::Ne(l, r) => self.eval_cmp(*l, *r, chunk, |a, b| {
                neq(a, b).map_err(|e| ExecError::expr(e.to_string()))
            }),
            ExprNode::Lt(l, r) => self.eval_cmp(*l, *r, chunk, |a, b| {
                lt(a, b).map_err(|e| ExecError::expr(e.to_string()))
            }),
            ExprNode::Le(l, r) => self.eval_cmp(*l, *r, chunk, |a, b| {
                lt_eq(a, b).map_err(|e| ExecError::expr(e.to_string()))
            }),
            ExprNode::Gt(l, r) => self.eval_cmp(*l, *r, chunk, |a, b| {
                gt(a, b).map_err(|e| ExecError::expr(e.to_string()))
            }),
            ExprNode::Ge(l, r) => self.eval_cmp(*l, *r, chunk, |a, b| {
                gt_eq(a, b).map_err(|e| ExecError::expr(e.to_string()))
            }),
            ExprNode::And(l, r) => {
                let l = self.eval_bool(*l, chunk)?;
                let r = self.eval_bool(*r, chunk)?;
                let out = and_kleene(&l, &r).map_err(|e| ExecError::expr(e.to_string()))?;
                Ok(Arc::new(out))
            }
            ExprNode::Or(l, r) => {
                let l = self.eval_bool(*l, chunk)?;
                let r = self.eval_bool(*r, chunk)?;
                let out = or_kleene(&l, &r).map_err(|e| ExecError::expr(e.to_string()))?;
                Ok(Arc::new(out))
            }
            ExprNode::Not(child) => {
                let child = self.eval_bool(*child, chunk)?;
                let out = not(&child).map_err(|e| ExecError::expr(e.to_string()))?;
                Ok(Arc::new(out))
            }
            ExprNode::IsNull(child) => {
                let child = self.eval(*child, chunk)?;
                let out = is_null(child.as_ref()).map_err(|e| ExecError::expr(e.to_string()))?;
                Ok(Arc::new(out))
            }
            ExprNode::IsNotNull(child) => {
                let child = self.eval(*child, chunk)?;
                let out =
                    is_not_null(child.as_ref()).map_err(|e| ExecError::expr(e.to_string()))?;
                Ok(Arc::new(out))
            }
        }
    }

    fn eval_cmp<F>(&self, left: ExprId, right: ExprId, chunk: &Chunk, cmp: F) -> Result<ArrayRef>
    where
        F: Fn(&ArrayRef, &ArrayRef) -> Result<BooleanArray>,
    {
        let l = self.eval(left, chunk)?;
        let r = self.eval(right, chunk)?;
        if l.data_type() != r.data_type() {
            return Err(ExecError::expr(format!(
                "comparison type mismatch: {:?} vs {:?}",
                l.data_type(),
                r.data_type()
            )));
        }
        let result = cmp(&l, &r)?;
        Ok(Arc::new(result))
    }

    fn eval_bool(&self, id: ExprId, chunk: &Chunk) -> Result<BooleanArray> {
        let arr = self.eval(id, chunk)?;
        arr.as_any()
            .downcast_ref::<BooleanArray>()
            .cloned()
            .ok_or_else(|| {
                ExecError::expr(format!(
                    "boolean operand expected, got {:?}",
                    arr.data_type()
                ))
            })
    }
}

fn eval_literal(value: &LiteralValue, len: usize) -> Result<ArrayRef> {
    match value {
        LiteralValue::Null => Ok(Arc::new(NullArray::new(len))),
        LiteralValue::Bool(v) => Ok(Arc::new(BooleanArray::from(vec![*v; len]))),
        LiteralValue::Int32(v) => Ok(Arc::new(Int32Array::from(vec![*v; len]))),
        LiteralValue::Int64(v) => Ok(Arc::new(Int64Array::from(vec![*v; len]))),
        LiteralValue::Float64(v) => Ok(Arc::new(Float64Array::from(vec![*v; len]))),
        LiteralValue::Utf8(v) => Ok(Arc::new(StringArray::from(vec![v.as_str(); len]))),
    }
}
