//! `vm.start`: allocate exclusive pCPUs, boot the domain, pin vCPUs
//! (warn-only on failure), and optionally attach a live bridge interface.
//! Any failure after boot forces a destroy; any failure at all frees the
//! CPU allocation.

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::rpc::dispatcher::HandlerFuture;
use crate::types::{OperationKind, Scope, VmIdentity};
use log::warn;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Deserialize)]
struct StartParams {
    vm_id: String,
    #[serde(default)]
    numa_node: Option<u32>,
    #[serde(default)]
    vcpu_count: Option<u32>,
    #[serde(default)]
    bridge_name: Option<String>,
}

pub fn handle(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: StartParams = super::parse_params(params)?;
        let ident = VmIdentity::from(req.vm_id);

        let _guard = engine.locks.try_lock(ident.as_str(), OperationKind::Starting)?;

        // vcpu_count here is independent of whatever the domain XML was
        // built with at create time; if the caller omits it, fall back to
        // what the domain currently reports.
        let vcpu_count = match req.vcpu_count {
            Some(n) => n,
            None => {
                let engine_for_lookup = engine.clone();
                let ident_for_lookup = ident.clone();
                let rx = engine.workers.submit(Arc::new(AtomicBool::new(true)), move || {
                    lookup_vcpu_count(&engine_for_lookup, &ident_for_lookup)
                });
                rx.await
                    .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??
            }
        };

        let cores = engine
            .topology
            .allocate_exclusive(ident.as_str(), req.numa_node, vcpu_count)?;

        let engine_for_job = engine.clone();
        let ident_for_job = ident.clone();
        let bridge_name = req.bridge_name;
        let cores_for_job = cores.clone();
        let rx = engine.workers.submit(alive, move || {
            start_job(&engine_for_job, &ident_for_job, &cores_for_job, bridge_name.as_deref())
        });
        let result = rx
            .await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))?;

        if result.is_err() {
            engine.topology.free_vm(ident.as_str());
        }
        result?;

        Ok(Value::Null)
    })
}

fn lookup_vcpu_count(engine: &Engine, ident: &VmIdentity) -> EngineResult<u32> {
    let gateway = engine.gateway_factory.connect()?;
    let info = gateway.info(ident)?;
    Ok(info.vcpu_count.max(1))
}

fn start_job(
    engine: &Engine,
    ident: &VmIdentity,
    cores: &[u32],
    bridge_name: Option<&str>,
) -> EngineResult<()> {
    let gateway = engine.gateway_factory.connect()?;
    gateway
        .lookup(ident)?
        .ok_or_else(|| EngineError::NotFound(ident.to_string()))?;
    gateway.start(ident)?;

    for (vcpu_index, pcpu) in cores.iter().enumerate() {
        if let Err(e) = gateway.pin_vcpu(ident, vcpu_index as u32, *pcpu) {
            warn!(
                "vm.start: pin_vcpu({}, {}) failed for {}, forcing destroy: {}",
                vcpu_index, pcpu, ident, e
            );
            let _ = gateway.destroy(ident);
            return Err(e);
        }
    }

    if let Some(bridge) = bridge_name {
        let xml = crate::domain_xml::build_bridge_interface_xml(bridge, cores.len().max(1) as u32);
        if let Err(e) = gateway.attach_device(ident, &xml, Scope::LIVE) {
            warn!(
                "vm.start: live bridge attach failed for {}, forcing destroy: {}",
                ident, e
            );
            let _ = gateway.destroy(ident);
            return Err(e);
        }
    }

    Ok(())
}
