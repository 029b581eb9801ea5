//! `storage.pool.list` / `storage.zvol.list` / `storage.zvol.create` /
//! `storage.zvol.delete`: thin delegations to the storage driver, operating
//! on arbitrary dataset paths rather than the `<pool>/vms/<name>` VM-owned
//! convention.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::rpc::dispatcher::HandlerFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub fn pool_list(engine: Arc<Engine>, _params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let engine_for_job = engine.clone();
        let rx = engine.workers.submit(alive, move || engine_for_job.storage.pool_list());
        let pools = rx
            .await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;
        serde_json::to_value(pools).map_err(|e| EngineError::Internal(e.to_string()))
    })
}

pub fn zvol_list(engine: Arc<Engine>, _params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let engine_for_job = engine.clone();
        let pool = engine.config.zfs_pool.clone();
        let rx = engine
            .workers
            .submit(alive, move || engine_for_job.storage.zvol_list(&pool));
        let zvols = rx
            .await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;
        serde_json::to_value(zvols).map_err(|e| EngineError::Internal(e.to_string()))
    })
}

#[derive(Deserialize)]
struct ZvolCreateParams {
    zvol_path: String,
    size: String,
}

pub fn zvol_create(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: ZvolCreateParams = super::parse_params(params)?;
        let engine_for_job = engine.clone();
        let rx = engine.workers.submit(alive, move || {
            engine_for_job.storage.create_zvol_at_path(&req.zvol_path, &req.size)
        });
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;
        Ok(json!({}))
    })
}

#[derive(Deserialize)]
struct ZvolDeleteParams {
    zvol_path: String,
}

pub fn zvol_delete(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: ZvolDeleteParams = super::parse_params(params)?;
        let engine_for_job = engine.clone();
        let rx = engine
            .workers
            .submit(alive, move || engine_for_job.storage.destroy_zvol_at_path(&req.zvol_path));
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;
        Ok(json!({}))
    })
}
