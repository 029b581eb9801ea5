//! `vm.delete`: dual-existence check, force-destroy plus undefine,
//! exorcism, then recursive zvol destroy.

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::rpc::dispatcher::HandlerFuture;
use crate::storage::exorcism;
use crate::types::{DomainState, OperationKind, UndefineFlags, VmIdentity};
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub fn handle(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let ident = super::require_vm_id(&params)?;
        let _guard = engine.locks.try_lock(ident.as_str(), OperationKind::Deleting)?;

        let engine_for_job = engine.clone();
        let ident_for_job = ident.clone();
        let rx = engine
            .workers
            .submit(alive, move || delete_job(&engine_for_job, &ident_for_job));
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        engine.topology.free_vm(ident.as_str());
        Ok(json!({ "deleted": true }))
    })
}

fn delete_job(engine: &Engine, ident: &VmIdentity) -> EngineResult<()> {
    let pool = &engine.config.zfs_pool;

    let gateway = engine.gateway_factory.connect()?;
    let domain = gateway.lookup(ident)?;

    // The zvol dataset is always named, never UUID-addressed, so when
    // `ident` is a UUID the resolved domain name is the only way to find
    // it. Fall back to the identity string itself (the caller may have
    // passed the name directly, or the domain record is already gone and
    // only an orphaned zvol remains).
    let vm_name = domain
        .as_ref()
        .map(|d| d.name.clone())
        .unwrap_or_else(|| ident.as_str().to_string());
    let device_path = engine.storage.zvol_device_path(pool, &vm_name);
    let zvol_exists = device_path.exists();

    if domain.is_none() && !zvol_exists {
        return Err(EngineError::NotFound("Entity not found".to_string()));
    }

    if let Some(info) = domain {
        if matches!(
            info.state,
            DomainState::Running | DomainState::Blocked | DomainState::Paused
        ) {
            gateway.destroy(ident)?;
        }
        let flags = UndefineFlags::SNAPSHOTS_METADATA | UndefineFlags::MANAGED_SAVE;
        gateway.undefine(ident, flags)?;
    }

    exorcism::exorcise(&device_path);

    if let Err(e) = engine.storage.destroy_zvol_recursive(pool, &vm_name) {
        return Err(EngineError::Storage(format!(
            "VM XML deleted, but ZFS destroy failed: {}",
            e
        )));
    }

    Ok(())
}
