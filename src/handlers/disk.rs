//! `device.disk.attach` / `device.disk.detach`. Detach re-extracts the
//! exact live-XML element substring rather than reconstructing it, since
//! the hypervisor rejects reconstructed XML on detach.

use crate::domain_xml::{build_disk_attach_xml, find_disk_element_by_target};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::rpc::dispatcher::HandlerFuture;
use crate::types::{OperationKind, Scope, VmIdentity};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn default_bus() -> String {
    "virtio".to_string()
}

#[derive(Deserialize)]
struct AttachParams {
    vm_id: String,
    source: String,
    target: String,
    #[serde(default = "default_bus")]
    bus: String,
}

pub fn attach(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: AttachParams = super::parse_params(params)?;
        let ident = VmIdentity::from(req.vm_id);
        let _guard = engine.locks.try_lock(ident.as_str(), OperationKind::Attaching)?;

        let engine_for_job = engine.clone();
        let ident_for_job = ident.clone();
        let rx = engine.workers.submit(alive, move || {
            let xml = build_disk_attach_xml(&req.source, &req.target, &req.bus);
            engine_for_job
                .gateway_factory
                .connect()?
                .attach_device(&ident_for_job, &xml, Scope::LIVE | Scope::CONFIG)
        });
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        Ok(json!({}))
    })
}

#[derive(Deserialize)]
struct DetachParams {
    vm_id: String,
    target: String,
}

pub fn detach(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: DetachParams = super::parse_params(params)?;
        let ident = VmIdentity::from(req.vm_id);
        let _guard = engine.locks.try_lock(ident.as_str(), OperationKind::Attaching)?;

        let engine_for_job = engine.clone();
        let ident_for_job = ident.clone();
        let rx = engine
            .workers
            .submit(alive, move || detach_job(&engine_for_job, &ident_for_job, &req.target));
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        Ok(json!({}))
    })
}

fn detach_job(engine: &Engine, ident: &VmIdentity, target: &str) -> EngineResult<()> {
    let gateway = engine.gateway_factory.connect()?;
    let xml = gateway.get_live_xml(ident)?;
    let disk_xml = find_disk_element_by_target(&xml, target).ok_or_else(|| {
        EngineError::Application(format!("disk target '{}' not present in live XML", target))
    })?;
    gateway.detach_device(ident, &disk_xml, Scope::LIVE)
}
