//! Lifecycle handlers: one submodule per RPC method family. Every
//! mutating handler follows the same uniform shape: validate params,
//! `try_lock`, allocate ancillary resources, submit a worker job, then
//! release/unlock/respond on completion.

pub mod create;
pub mod delete;
pub mod disk;
pub mod hotplug;
pub mod list;
pub mod metrics;
pub mod network;
pub mod ping;
pub mod snapshot;
pub mod start;
pub mod stop;
pub mod storage;
pub mod vnc;

use crate::error::{EngineError, EngineResult};
use crate::types::VmIdentity;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Deserializes `params` into `T`, mapping any shape mismatch (missing or
/// ill-typed fields) to `-32602`.
pub(crate) fn parse_params<T: DeserializeOwned>(params: Value) -> EngineResult<T> {
    serde_json::from_value(params).map_err(|e| EngineError::InvalidParams(e.to_string()))
}

/// Pulls the `vm_id` string out of a raw params object without requiring
/// a dedicated params struct. Used by handlers whose only input is the
/// VM identity (`vm.stop`, `vm.delete`).
pub(crate) fn require_vm_id(params: &Value) -> EngineResult<VmIdentity> {
    params
        .get("vm_id")
        .and_then(Value::as_str)
        .map(VmIdentity::from)
        .ok_or_else(|| EngineError::InvalidParams("missing 'vm_id'".to_string()))
}
