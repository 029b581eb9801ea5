//! Engine bootstrap: wires every component together and runs the accept
//! loop around `tokio::select!`.

use crate::config::EngineConfig;
use crate::daemons::{spawn_self_heal, spawn_telemetry, MetricsCache};
use crate::hypervisor::{GatewayFactory, LibvirtGatewayFactory};
use crate::lock_table::OperationLockTable;
use crate::network::{BridgeDriver, IpRouteBridgeDriver};
use crate::rpc::dispatcher::{handle_connection, MethodTable};
use crate::storage::driver::{Driver, ZfsCliDriver};
use crate::topology::{fake_topology, scan_host_topology, TopologyAllocator};
use crate::worker::WorkerPool;
use log::{error, info};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};

pub struct Engine {
    pub config: EngineConfig,
    pub topology: TopologyAllocator,
    pub locks: OperationLockTable,
    pub storage: Arc<dyn Driver>,
    pub gateway_factory: Arc<dyn GatewayFactory>,
    pub workers: WorkerPool,
    pub metrics_cache: MetricsCache,
    pub bridge_driver: Arc<dyn BridgeDriver>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let topology = TopologyAllocator::new();
        let cores = match config.fake_topology_cores {
            Some(n) => fake_topology(n, config.fake_topology_numa_nodes),
            None => scan_host_topology(),
        };
        for core in cores {
            topology.add_core(core.id, core.numa_node, core.isolated);
        }

        let workers = WorkerPool::new(config.worker_threads);

        Engine {
            gateway_factory: Arc::new(LibvirtGatewayFactory {
                uri: config.libvirt_uri.clone(),
            }),
            storage: Arc::new(ZfsCliDriver::new()),
            bridge_driver: Arc::new(IpRouteBridgeDriver::new()),
            topology,
            locks: OperationLockTable::new(),
            workers,
            metrics_cache: MetricsCache::new(),
            config,
        }
    }

    /// Binds the control socket, starts the background daemons, and serves
    /// connections until SIGINT or SIGTERM.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let socket_path = self.config.socket_path.clone();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        set_socket_mode(&socket_path, self.config.socket_mode);
        info!("listening on {}", socket_path.display());

        let table = Arc::new(MethodTable::new());
        spawn_telemetry(self.clone());
        spawn_self_heal(self.clone());

        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let engine = self.clone();
                            let table = table.clone();
                            tokio::spawn(async move {
                                handle_connection(engine, table, stream).await;
                            });
                        }
                        Err(e) => error!("accept failed: {}", e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
            }
        }

        self.workers.shutdown();
        let _ = std::fs::remove_file(&socket_path);
        Ok(())
    }
}

#[cfg(unix)]
fn set_socket_mode(path: &std::path::Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        error!("failed to set socket mode on {}: {}", path.display(), e);
    }
}

/// End-to-end RPC scenarios driven straight through the dispatcher against
/// an `Engine` wired entirely with fakes (no socket, no real libvirt/ZFS).
/// Same dual-existence/lock/rollback behavior a real client connection
/// would observe.
#[cfg(test)]
mod lifecycle_tests {
    use super::*;
    use crate::hypervisor::fake::{FakeGatewayFactory, FakeLibvirtState};
    use crate::network::fake::FakeBridgeDriver;
    use crate::rpc::dispatcher::{process_line, MethodTable};
    use crate::storage::fake::FakeDriver;
    use serde_json::Value;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    /// Returns the engine alongside the shared fake-libvirt state and the
    /// concrete `FakeDriver`, so tests that need to inject a hypervisor
    /// failure or inspect zvol existence can reach them without
    /// downcasting the `Arc<dyn ...>` trait objects stored on `Engine`.
    fn test_engine() -> (Arc<Engine>, Arc<Mutex<FakeLibvirtState>>, Arc<FakeDriver>) {
        let mut config = EngineConfig::default();
        config.fake_topology_cores = Some(8);
        let topology = TopologyAllocator::new();
        for core in fake_topology(8, 2) {
            topology.add_core(core.id, core.numa_node, core.isolated);
        }
        let gateway_factory = FakeGatewayFactory::new();
        let gw_state = gateway_factory.state.clone();
        let storage = Arc::new(FakeDriver::new());
        let engine = Arc::new(Engine {
            config,
            topology,
            locks: OperationLockTable::new(),
            storage: storage.clone(),
            gateway_factory: Arc::new(gateway_factory),
            workers: WorkerPool::new(2),
            metrics_cache: MetricsCache::new(),
            bridge_driver: Arc::new(FakeBridgeDriver::new()),
        });
        (engine, gw_state, storage)
    }

    async fn call(engine: &Arc<Engine>, table: &MethodTable, line: &str) -> Value {
        let alive = Arc::new(AtomicBool::new(true));
        process_line(engine, table, line, alive)
            .await
            .expect("request with an id always yields a response")
    }

    #[tokio::test]
    async fn create_start_list_stop_delete_happy_path() {
        let (engine, _gw_state, _storage) = test_engine();
        let table = MethodTable::new();

        let resp = call(
            &engine,
            &table,
            r#"{"jsonrpc":"2.0","method":"vm.create","params":{"name":"vm-1","vcpu":2,"memory_mb":1024,"disk_size_gb":10},"id":1}"#,
        )
        .await;
        assert_eq!(resp["result"], serde_json::json!(true));

        let resp = call(
            &engine,
            &table,
            r#"{"jsonrpc":"2.0","method":"vm.start","params":{"vm_id":"vm-1"},"id":2}"#,
        )
        .await;
        assert_eq!(resp["result"], Value::Null, "vm.start failed: {:?}", resp);

        let resp = call(
            &engine,
            &table,
            r#"{"jsonrpc":"2.0","method":"vm.list","params":{},"id":3}"#,
        )
        .await;
        let list = resp["result"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["name"], "vm-1");
        assert_eq!(list[0]["state"], "running");

        let resp = call(
            &engine,
            &table,
            r#"{"jsonrpc":"2.0","method":"vm.stop","params":{"vm_id":"vm-1"},"id":4}"#,
        )
        .await;
        assert_eq!(resp["result"], Value::Null);

        let resp = call(
            &engine,
            &table,
            r#"{"jsonrpc":"2.0","method":"vm.delete","params":{"vm_id":"vm-1"},"id":5}"#,
        )
        .await;
        assert_eq!(resp["result"]["deleted"], serde_json::json!(true));

        let resp = call(
            &engine,
            &table,
            r#"{"jsonrpc":"2.0","method":"vm.list","params":{},"id":6}"#,
        )
        .await;
        assert_eq!(resp["result"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn concurrent_conflicting_stops_exactly_one_wins() {
        let (engine, _gw_state, _storage) = test_engine();
        let table = Arc::new(MethodTable::new());

        call(
            &engine,
            &table,
            r#"{"jsonrpc":"2.0","method":"vm.create","params":{"name":"vm-2"},"id":1}"#,
        )
        .await;
        call(
            &engine,
            &table,
            r#"{"jsonrpc":"2.0","method":"vm.start","params":{"vm_id":"vm-2"},"id":2}"#,
        )
        .await;

        let e1 = engine.clone();
        let t1 = table.clone();
        let e2 = engine.clone();
        let t2 = table.clone();
        let (r1, r2) = tokio::join!(
            async move {
                let alive = Arc::new(AtomicBool::new(true));
                process_line(
                    &e1,
                    &t1,
                    r#"{"jsonrpc":"2.0","method":"vm.stop","params":{"vm_id":"vm-2"},"id":3}"#,
                    alive,
                )
                .await
                .unwrap()
            },
            async move {
                let alive = Arc::new(AtomicBool::new(true));
                process_line(
                    &e2,
                    &t2,
                    r#"{"jsonrpc":"2.0","method":"vm.stop","params":{"vm_id":"vm-2"},"id":4}"#,
                    alive,
                )
                .await
                .unwrap()
            }
        );

        let results = [r1, r2];
        let successes = results.iter().filter(|r| r.get("result").is_some()).count();
        let busy_failures = results
            .iter()
            .filter(|r| {
                r.get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .map(|m| m.contains("busy"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(successes, 1, "expected exactly one success: {:?}", results);
        assert_eq!(busy_failures, 1, "expected exactly one busy error: {:?}", results);
    }

    #[tokio::test]
    async fn create_rollback_on_define_failure_leaves_no_zvol() {
        let (engine, gw_state, storage) = test_engine();
        let table = MethodTable::new();
        gw_state.lock().unwrap().fail_next = Some("duplicate domain name".to_string());

        let resp = call(
            &engine,
            &table,
            r#"{"jsonrpc":"2.0","method":"vm.create","params":{"name":"vm-3"},"id":1}"#,
        )
        .await;
        assert_eq!(resp["error"]["code"], serde_json::json!(-32000));
        assert!(!storage.zvol_exists(&engine.config.zfs_pool, "vm-3"));
    }
}
