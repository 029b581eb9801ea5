//! `vm.snapshot.*`: direct delegation to the storage driver. `list` is
//! read-only and bypasses the Operation Lock Table.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::rpc::dispatcher::HandlerFuture;
use crate::types::OperationKind;
use log::warn;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Deserialize)]
struct SnapParams {
    vm_id: String,
    snap_name: String,
}

pub fn create(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: SnapParams = super::parse_params(params)?;
        let _guard = engine.locks.try_lock(&req.vm_id, OperationKind::Snapshotting)?;

        let engine_for_job = engine.clone();
        let rx = engine.workers.submit(alive, move || {
            engine_for_job
                .storage
                .snapshot_create(&engine_for_job.config.zfs_pool, &req.vm_id, &req.snap_name)
        });
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        Ok(json!(true))
    })
}

/// Rollback carries a warning that the VM should be stopped first, logged
/// here; rollback still proceeds regardless of domain state.
pub fn rollback(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: SnapParams = super::parse_params(params)?;
        let _guard = engine.locks.try_lock(&req.vm_id, OperationKind::Snapshotting)?;
        warn!(
            "vm.snapshot.rollback: {} should be stopped before rolling back to {}",
            req.vm_id, req.snap_name
        );

        let engine_for_job = engine.clone();
        let rx = engine.workers.submit(alive, move || {
            engine_for_job
                .storage
                .snapshot_rollback(&engine_for_job.config.zfs_pool, &req.vm_id, &req.snap_name)
        });
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        Ok(json!(true))
    })
}

pub fn delete(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: SnapParams = super::parse_params(params)?;
        let _guard = engine.locks.try_lock(&req.vm_id, OperationKind::Snapshotting)?;

        let engine_for_job = engine.clone();
        let rx = engine.workers.submit(alive, move || {
            engine_for_job
                .storage
                .snapshot_destroy(&engine_for_job.config.zfs_pool, &req.vm_id, &req.snap_name)
        });
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        Ok(json!(true))
    })
}

#[derive(Deserialize)]
struct SnapListParams {
    vm_id: String,
}

pub fn list(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: SnapListParams = super::parse_params(params)?;

        let engine_for_job = engine.clone();
        let rx = engine.workers.submit(alive, move || {
            engine_for_job
                .storage
                .snapshot_list(&engine_for_job.config.zfs_pool, &req.vm_id)
        });
        let snaps = rx
            .await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        Ok(json!(snaps))
    })
}
