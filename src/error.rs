//! Error handling: a `thiserror`-derived `EngineError` at the RPC boundary,
//! mapped to JSON-RPC 2.0 error codes. Lower-level glue code (process
//! spawning, ioctl-ish plumbing) still uses `simple_error`'s
//! `try_with!`/`bail!`/`require_with!` macros; those bubble up into an
//! `EngineError` at the module boundary via `map_err`. Malformed-JSON and
//! malformed-envelope errors never reach this type; `rpc::protocol`
//! catches those before a request is ever dispatched into application code.

use crate::types::OperationKind;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("vm {vm_id} is busy ({conflicting})")]
    Busy {
        vm_id: String,
        conflicting: OperationKind,
    },

    #[error("{0}")]
    ResourceExhausted(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Storage(String),

    #[error("{0}")]
    Hypervisor(String),

    /// Application-level validation/state failures that are neither lock
    /// conflicts, resource exhaustion, storage, nor hypervisor errors (e.g.
    /// a rejected `vm.limit` on an inactive VM, a missing VNC graphics
    /// element) but still belong in the generic `-32000` bucket.
    #[error("{0}")]
    Application(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// JSON-RPC 2.0 error code.
    pub fn rpc_code(&self) -> i64 {
        match self {
            EngineError::MethodNotFound(_) => -32601,
            EngineError::InvalidParams(_) => -32602,
            EngineError::Busy { .. }
            | EngineError::ResourceExhausted(_)
            | EngineError::NotFound(_)
            | EngineError::Storage(_)
            | EngineError::Hypervisor(_)
            | EngineError::Application(_) => -32000,
            EngineError::Internal(_) => -32603,
        }
    }
}

impl From<simple_error::SimpleError> for EngineError {
    fn from(e: simple_error::SimpleError) -> Self {
        EngineError::Internal(e.to_string())
    }
}
