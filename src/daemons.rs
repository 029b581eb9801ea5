//! Background daemons: two `tokio::spawn`ed loops started by `engine::run`
//! alongside the accept loop, each running free apart from the primary
//! control flow.

use crate::engine::Engine;
use crate::handlers::metrics::{cpu_percent, mem_percent};
use crate::types::OperationKind;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug)]
pub struct CachedMetrics {
    pub cpu: u32,
    pub mem: u32,
    pub sampled_at: Instant,
}

/// Telemetry cache-provider: `vm.metrics` reads this first, falling back to
/// a live two-sample computation only on a miss.
#[derive(Default)]
pub struct MetricsCache {
    entries: Mutex<HashMap<String, CachedMetrics>>,
}

impl MetricsCache {
    pub fn new() -> Self {
        MetricsCache::default()
    }

    pub fn get(&self, vm_id: &str) -> Option<CachedMetrics> {
        self.entries.lock().unwrap().get(vm_id).copied()
    }

    fn set(&self, vm_id: &str, cpu: u32, mem: u32) {
        self.entries.lock().unwrap().insert(
            vm_id.to_string(),
            CachedMetrics {
                cpu,
                mem,
                sampled_at: Instant::now(),
            },
        );
    }

    fn retain_known(&self, vm_ids: &[String]) {
        let known: std::collections::HashSet<&String> = vm_ids.iter().collect();
        self.entries.lock().unwrap().retain(|k, _| known.contains(k));
    }
}

/// Periodically samples every defined VM's CPU/memory usage and refreshes
/// `engine.metrics_cache`. Uses the same two-sample `info()` delta as
/// `handlers::metrics::sample_live`, but amortized over the whole fleet on
/// one timer rather than per-request.
pub fn spawn_telemetry(engine: Arc<Engine>) {
    let interval = Duration::from_secs(engine.config.telemetry_interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = sample_all(&engine).await {
                warn!("telemetry sweep failed: {}", e);
            }
        }
    });
}

async fn sample_all(engine: &Arc<Engine>) -> crate::error::EngineResult<()> {
    let engine_for_job = engine.clone();
    let alive = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let rx = engine.workers.submit(alive, move || -> crate::error::EngineResult<()> {
        let gateway = engine_for_job.gateway_factory.connect()?;
        let summaries = gateway.list_all()?;
        let ids: Vec<String> = summaries.iter().map(|s| s.uuid.clone()).collect();

        for summary in &summaries {
            let ident = crate::types::VmIdentity::from(summary.uuid.clone());
            if summary.state != "running" {
                engine_for_job.metrics_cache.set(ident.as_str(), 0, 0);
                continue;
            }
            let first = match gateway.info(&ident) {
                Ok(i) => i,
                Err(e) => {
                    debug!("telemetry: info() failed for {}: {}", ident.as_str(), e);
                    continue;
                }
            };
            std::thread::sleep(Duration::from_millis(100));
            let second = match gateway.info(&ident) {
                Ok(i) => i,
                Err(_) => continue,
            };
            let wall_ns = Duration::from_millis(100).as_nanos() as u64;
            let cpu_delta = second.cpu_time_ns.saturating_sub(first.cpu_time_ns);
            let cpu = cpu_percent(cpu_delta, wall_ns, second.vcpu_count.max(1));
            let mem = match gateway.memory_stats(&ident) {
                Ok(stats) => mem_percent(stats.rss_kib, second.used_mem_kib),
                Err(_) => 0,
            };
            engine_for_job.metrics_cache.set(ident.as_str(), cpu, mem);
        }

        engine_for_job.metrics_cache.retain_known(&ids);
        Ok(())
    });
    rx.await
        .map_err(|_| crate::error::EngineError::Internal("telemetry worker dropped".to_string()))?
}

/// Reconciles the Topology Allocator's in-memory bookkeeping against
/// reality: frees any CPU allocation whose VM is no longer active, so a
/// crashed client (or a process that died mid-`vm.stop`) doesn't leak
/// exclusive cores forever.
pub fn spawn_self_heal(engine: Arc<Engine>) {
    let interval = Duration::from_secs(engine.config.self_heal_interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = heal_once(&engine).await {
                warn!("self-heal sweep failed: {}", e);
            }
        }
    });
}

async fn heal_once(engine: &Arc<Engine>) -> crate::error::EngineResult<()> {
    let engine_for_job = engine.clone();
    let alive = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let rx = engine.workers.submit(alive, move || -> crate::error::EngineResult<()> {
        let gateway = engine_for_job.gateway_factory.connect()?;
        for vm_id in engine_for_job.topology.allocated_vm_ids() {
            // Non-blocking: a VM with a live operation in flight is simply
            // skipped this sweep rather than waited on, so self-heal never
            // contends with a dispatcher-driven operation on the same VM.
            let guard = match engine_for_job.locks.try_lock(&vm_id, OperationKind::Tuning) {
                Ok(guard) => guard,
                Err(_) => continue,
            };
            let ident = crate::types::VmIdentity::from(vm_id.clone());
            let active = gateway.is_active(&ident).unwrap_or(false);
            if !active {
                warn!("self-heal: reclaiming cores for inactive VM {}", vm_id);
                engine_for_job.topology.free_vm(&vm_id);
            }
            drop(guard);
        }
        Ok(())
    });
    rx.await
        .map_err(|_| crate::error::EngineError::Internal("self-heal worker dropped".to_string()))?
}
