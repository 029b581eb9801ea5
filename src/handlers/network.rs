//! `network.create` / `network.delete`: not a VM-scoped operation, so it
//! does not touch the Operation Lock Table. Delegates to
//! `network::BridgeDriver`.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::rpc::dispatcher::HandlerFuture;
use crate::types::is_valid_identifier;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Deserialize)]
struct NetworkCreateParams {
    bridge_name: String,
    mode: String,
    #[serde(default)]
    cidr: Option<String>,
    #[serde(default)]
    physical_if: Option<String>,
}

pub fn create(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: NetworkCreateParams = super::parse_params(params)?;
        if !is_valid_identifier(&req.bridge_name) {
            return Err(EngineError::InvalidParams(format!(
                "invalid bridge_name: {:?}",
                req.bridge_name
            )));
        }

        let engine_for_job = engine.clone();
        let rx = engine.workers.submit(alive, move || {
            engine_for_job.bridge_driver.create_bridge(
                &req.bridge_name,
                &req.mode,
                req.cidr.as_deref(),
                req.physical_if.as_deref(),
            )
        });
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        Ok(Value::Null)
    })
}

#[derive(Deserialize)]
struct NetworkDeleteParams {
    bridge_name: String,
}

pub fn delete(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: NetworkDeleteParams = super::parse_params(params)?;

        let engine_for_job = engine.clone();
        let rx = engine
            .workers
            .submit(alive, move || engine_for_job.bridge_driver.delete_bridge(&req.bridge_name));
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        Ok(Value::Null)
    })
}
