//! `vm.stop`: idempotent on an already-inactive VM, otherwise a forced
//! `destroy` with no graceful ACPI wait.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::rpc::dispatcher::HandlerFuture;
use crate::types::{OperationKind, VmIdentity};
use serde_json::Value;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub fn handle(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let ident = super::require_vm_id(&params)?;
        let _guard = engine.locks.try_lock(ident.as_str(), OperationKind::Stopping)?;

        let engine_for_job = engine.clone();
        let ident_for_job = ident.clone();
        let rx = engine
            .workers
            .submit(alive, move || stop_job(&engine_for_job, &ident_for_job));
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        engine.topology.free_vm(ident.as_str());
        Ok(Value::Null)
    })
}

fn stop_job(engine: &Engine, ident: &VmIdentity) -> crate::error::EngineResult<()> {
    let gateway = engine.gateway_factory.connect()?;
    match gateway.is_active(ident) {
        Ok(true) => gateway.destroy(ident),
        Ok(false) => Ok(()),
        Err(e) => Err(e),
    }
}
