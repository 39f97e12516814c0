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
//! Typed error channel for the execution paths.
//!
//! Responsibilities:
//! - Classifies execution failures so callers can distinguish memory
//!   exhaustion, spill I/O, cancellation, expression evaluation, and broken
//!   internal invariants.
//! - Provides the `Result` alias threaded through the exec and runtime
//!   modules.

use std::fmt;

/// Error raised by the execution layer. All variants are fatal for the query
/// except that the build side recovers from `MemLimitExceeded` locally by
/// spilling additional partitions and retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// A memory reservation was denied, or recursing past the maximum
    /// partition depth would still spill.
    MemLimitExceeded(String),
    /// A spill stream read or write failed. Never retried.
    Io(String),
    /// The cancellation flag was observed at a batch boundary.
    Cancelled,
    /// Expression evaluation failed.
    ExprEval(String),
    /// An internal invariant was violated; reported with context.
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ExecError>;

impl ExecError {
    pub fn mem_limit(msg: impl Into<String>) -> Self {
        Self::MemLimitExceeded(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn expr(msg: impl Into<String>) -> Self {
        Self::ExprEval(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::MemLimitExceeded(_) => "MEM_LIMIT_EXCEEDED",
            Self::Io(_) => "IO_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::ExprEval(_) => "EXPR_EVAL_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemLimitExceeded(msg) => write!(f, "memory limit exceeded: {msg}"),
            Self::Io(msg) => write!(f, "io error: {msg}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::ExprEval(msg) => write!(f, "expression evaluation failed: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ExecError {}

#[cfg(test)]
mod tests {
    use super::ExecError;

    #[test]
    fn display_carries_context() {
        let err = ExecError::mem_limit("hash table rebuild needs 4096 bytes");
        assert_eq!(
            err.to_string(),
            "memory limit exceeded: hash table rebuild needs 4096 bytes"
        );
        assert_eq!(err.kind_str(), "MEM_LIMIT_EXCEEDED");
    }

    #[test]
    fn cancelled_has_fixed_message() {
        assert_eq!(ExecError::Cancelled.to_string(), "cancelled");
    }
}
