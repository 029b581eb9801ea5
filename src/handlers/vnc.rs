//! `get_vnc_info`: read-only, requires an active VM, extracts the VNC
//! graphics element's port (and optional websocket port) from the live
//! XML.

use crate::domain_xml::find_vnc_graphics;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::rpc::dispatcher::HandlerFuture;
use crate::types::VmIdentity;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Deserialize)]
struct VncParams {
    vm_id: String,
}

pub fn handle(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: VncParams = super::parse_params(params)?;
        let ident = VmIdentity::from(req.vm_id);

        let engine_for_job = engine.clone();
        let ident_for_job = ident.clone();
        let rx = engine
            .workers
            .submit(alive, move || vnc_job(&engine_for_job, &ident_for_job));
        let (port, websocket) = rx
            .await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        let mut result = serde_json::Map::new();
        result.insert("vnc_port".to_string(), json!(port));
        if let Some(ws) = websocket {
            result.insert("websocket_port".to_string(), json!(ws));
        }
        Ok(Value::Object(result))
    })
}

fn vnc_job(engine: &Engine, ident: &VmIdentity) -> EngineResult<(String, Option<i64>)> {
    let gateway = engine.gateway_factory.connect()?;
    if !gateway.is_active(ident)? {
        return Err(EngineError::Application("VM is not active".to_string()));
    }
    let xml = gateway.get_live_xml(ident)?;
    find_vnc_graphics(&xml)
        .ok_or_else(|| EngineError::Application("VNC Graphics adapter not found".to_string()))
}
