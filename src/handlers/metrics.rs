//! `vm.metrics`: reads the telemetry daemon's cache first and falls back
//! to a synchronous two-sample computation on a cache miss. Both paths
//! report `cpu`/`mem` clamped to `[0, 100]`.

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::rpc::dispatcher::HandlerFuture;
use crate::types::{DomainState, VmIdentity};
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `(cpu_time_delta_ns * 100) / (wall_ns * vcpu_count)`, clamped to
/// `[0, 100]`. Shared with `daemons::sample_all`.
pub(crate) fn cpu_percent(cpu_delta_ns: u64, wall_ns: u64, vcpu_count: u32) -> u32 {
    if wall_ns == 0 || vcpu_count == 0 {
        return 0;
    }
    let pct = (cpu_delta_ns as u128 * 100) / (wall_ns as u128 * vcpu_count as u128);
    pct.min(100) as u32
}

/// RSS over `used_mem_kib`, clamped to `[0, 100]`.
pub(crate) fn mem_percent(rss_kib: Option<u64>, used_mem_kib: u64) -> u32 {
    if used_mem_kib == 0 {
        return 0;
    }
    match rss_kib {
        Some(rss) => ((rss as u128 * 100) / used_mem_kib as u128).min(100) as u32,
        None => 0,
    }
}

pub fn handle(engine: Arc<Engine>, params: Value, alive: Arc<AtomicBool>) -> HandlerFuture {
    Box::pin(async move {
        let ident = super::require_vm_id(&params)?;

        if let Some(cached) = engine.metrics_cache.get(ident.as_str()) {
            return Ok(json!({ "cpu": cached.cpu, "mem": cached.mem }));
        }

        let engine_for_job = engine.clone();
        let ident_for_job = ident.clone();
        let rx = engine
            .workers
            .submit(alive, move || sample_live(&engine_for_job, &ident_for_job));
        let (cpu, mem) = rx
            .await
            .map_err(|_| EngineError::Internal("worker task dropped".to_string()))??;

        Ok(json!({ "cpu": cpu, "mem": mem }))
    })
}

fn sample_live(engine: &Engine, ident: &VmIdentity) -> EngineResult<(u32, u32)> {
    let gateway = engine.gateway_factory.connect()?;
    let first = gateway.info(ident)?;
    if !matches!(first.state, DomainState::Running | DomainState::Blocked) {
        return Ok((0, 0));
    }

    let t0 = Instant::now();
    std::thread::sleep(Duration::from_millis(100));
    let second = gateway.info(ident)?;
    let wall_ns = t0.elapsed().as_nanos() as u64;
    let cpu_delta = second.cpu_time_ns.saturating_sub(first.cpu_time_ns);
    let cpu = cpu_percent(cpu_delta, wall_ns, second.vcpu_count.max(1));

    let stats = gateway.memory_stats(ident)?;
    let mem = mem_percent(stats.rss_kib, second.used_mem_kib);

    Ok((cpu, mem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_percent_clamped_to_hundred() {
        assert_eq!(cpu_percent(1_000_000_000, 1_000_000, 1), 100);
    }

    #[test]
    fn cpu_percent_zero_wall_time_is_zero() {
        assert_eq!(cpu_percent(500, 0, 2), 0);
    }

    #[test]
    fn mem_percent_none_rss_is_zero() {
        assert_eq!(mem_percent(None, 4096), 0);
    }

    #[test]
    fn mem_percent_half_rss() {
        assert_eq!(mem_percent(Some(2048), 4096), 50);
    }
}
