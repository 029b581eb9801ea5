//! `vm.list`: enumerate every domain. Read-only, so it bypasses the
//! Operation Lock Table entirely.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::rpc::dispatcher::HandlerFuture;
use serde_json::Value;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub fn handle(engine: Arc<Engine>, _params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let engine_for_job = engine.clone();
        let rx = engine
            .workers
            .submit(alive, move || engine_for_job.gateway_factory.connect()?.list_all());
        let summaries = rx
            .await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;
        serde_json::to_value(summaries).map_err(|e| EngineError::Internal(e.to_string()))
    })
}
