//! `vm.create`: create the backing zvol, build the domain descriptor, and
//! define it with libvirt, rolling the zvol back if define fails.

use crate::domain_xml::build_domain_xml;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::rpc::dispatcher::HandlerFuture;
use crate::types::{OperationKind, VmConfig};
use log::{info, warn};
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub fn handle(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let config: VmConfig = super::parse_params(params)?;
        config.validate().map_err(EngineError::Application)?;

        let _guard = engine.locks.try_lock(&config.name, OperationKind::Creating)?;

        let engine_for_job = engine.clone();
        let rx = engine
            .workers
            .submit(alive, move || create_job(&engine_for_job, config));
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        Ok(json!(true))
    })
}

fn create_job(engine: &Engine, config: VmConfig) -> EngineResult<()> {
    let pool = &engine.config.zfs_pool;
    info!("vm.create: {} starting", config.name);

    engine
        .storage
        .create_zvol(pool, &config.name, config.disk_size_gb())?;

    let device_path = engine.storage.zvol_device_path(pool, &config.name);
    let xml = build_domain_xml(&config, &device_path.to_string_lossy());

    let gateway = engine.gateway_factory.connect()?;
    if let Err(e) = gateway.define(&xml) {
        warn!(
            "vm.create: define failed for {}, rolling back zvol: {}",
            config.name, e
        );
        if let Err(rollback_err) = engine.storage.destroy_zvol(pool, &config.name) {
            warn!(
                "vm.create: zvol rollback for {} also failed, manual reconciliation required: {}",
                config.name, rollback_err
            );
        }
        return Err(e);
    }

    info!("vm.create: {} defined", config.name);
    Ok(())
}
