//! `vm.limit` / `vm.set_memory` / `vm.set_vcpu`: live memory/vCPU hotplug
//! and scheduler/cgroup resource limits.

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::rpc::dispatcher::HandlerFuture;
use crate::types::{MemLimit, OperationKind, SchedQuota, Scope, VmIdentity};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Deserialize)]
struct SetMemoryParams {
    vm_id: String,
    memory_mb: u64,
}

pub fn set_memory(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: SetMemoryParams = super::parse_params(params)?;
        let ident = VmIdentity::from(req.vm_id);
        let _guard = engine.locks.try_lock(ident.as_str(), OperationKind::Tuning)?;

        let engine_for_job = engine.clone();
        let memory_kib = req.memory_mb.saturating_mul(1024);
        let rx = engine.workers.submit(alive, move || {
            engine_for_job
                .gateway_factory
                .connect()?
                .set_memory(&ident, memory_kib, Scope::LIVE | Scope::CONFIG)
        });
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        Ok(Value::Null)
    })
}

#[derive(Deserialize)]
struct SetVcpuParams {
    vm_id: String,
    vcpu_count: u32,
}

pub fn set_vcpu(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: SetVcpuParams = super::parse_params(params)?;
        let ident = VmIdentity::from(req.vm_id);
        let _guard = engine.locks.try_lock(ident.as_str(), OperationKind::Tuning)?;

        let engine_for_job = engine.clone();
        let rx = engine.workers.submit(alive, move || {
            engine_for_job
                .gateway_factory
                .connect()?
                .set_vcpus(&ident, req.vcpu_count, Scope::LIVE | Scope::CONFIG)
        });
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        Ok(Value::Null)
    })
}

#[derive(Deserialize)]
struct LimitParams {
    vm_id: String,
    #[serde(default)]
    cpu: Option<i64>,
    #[serde(default)]
    mem: Option<i64>,
}

pub fn limit(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let req: LimitParams = super::parse_params(params)?;
        let ident = VmIdentity::from(req.vm_id);
        let _guard = engine.locks.try_lock(ident.as_str(), OperationKind::Tuning)?;

        let engine_for_job = engine.clone();
        let ident_for_job = ident.clone();
        let rx = engine.workers.submit(alive, move || {
            limit_job(&engine_for_job, &ident_for_job, req.cpu, req.mem)
        });
        rx.await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        Ok(Value::Null)
    })
}

fn limit_job(engine: &Engine, ident: &VmIdentity, cpu: Option<i64>, mem: Option<i64>) -> EngineResult<()> {
    let gateway = engine.gateway_factory.connect()?;
    if !gateway.is_active(ident)? {
        return Err(EngineError::Application(
            "VM is not active. Cannot apply live limits.".to_string(),
        ));
    }

    if let Some(cpu_pct) = cpu {
        let quota = if cpu_pct < 0 {
            SchedQuota::Unlimited
        } else {
            SchedQuota::MicrosPer100Ms(cpu_pct * 1000)
        };
        gateway.set_scheduler_quota(ident, quota)?;
    }

    if let Some(mem_mb) = mem {
        let limit = if mem_mb < 0 {
            MemLimit::Unlimited
        } else {
            MemLimit::Kib((mem_mb as u64) * 1024)
        };
        gateway.set_memory_hard_limit(ident, limit)?;
    }

    Ok(())
}
