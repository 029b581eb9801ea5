//! Engine configuration and CLI flag parsing, using the same `clap` v2
//! builder style as the rest of this codebase's command-line tools.

use clap::{crate_version, App, Arg};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub socket_path: PathBuf,
    pub socket_mode: u32,
    pub zfs_pool: String,
    pub worker_threads: usize,
    pub libvirt_uri: String,
    pub self_heal_interval_secs: u64,
    pub telemetry_interval_secs: u64,
    /// `--fake-topology N` dev/CI override: populate the allocator with
    /// `N` synthetic isolated cores instead of scanning `/sys`. `None`
    /// means scan the real host topology.
    pub fake_topology_cores: Option<u32>,
    pub fake_topology_numa_nodes: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            socket_path: PathBuf::from("/tmp/purecvisor.sock"),
            socket_mode: 0o666,
            zfs_pool: "tank".to_string(),
            worker_threads: 4,
            libvirt_uri: "qemu:///system".to_string(),
            self_heal_interval_secs: 5,
            telemetry_interval_secs: 2,
            fake_topology_cores: None,
            fake_topology_numa_nodes: 2,
        }
    }
}

impl EngineConfig {
    pub fn from_args() -> EngineConfig {
        let defaults = EngineConfig::default();
        let default_socket = defaults.socket_path.to_string_lossy().into_owned();
        let default_workers = defaults.worker_threads.to_string();

        let matches = App::new("purecvisord")
            .version(crate_version!())
            .about("Single-host hypervisor control-plane daemon")
            .arg(
                Arg::with_name("socket")
                    .long("socket")
                    .value_name("PATH")
                    .help("Unix socket path to listen on")
                    .default_value(&default_socket),
            )
            .arg(
                Arg::with_name("zfs-pool")
                    .long("zfs-pool")
                    .value_name("NAME")
                    .help("ZFS pool backing VM zvols")
                    .default_value(&defaults.zfs_pool),
            )
            .arg(
                Arg::with_name("worker-threads")
                    .long("worker-threads")
                    .value_name("N")
                    .help("Number of blocking worker threads")
                    .default_value(&default_workers),
            )
            .arg(
                Arg::with_name("libvirt-uri")
                    .long("libvirt-uri")
                    .value_name("URI")
                    .help("libvirt connection URI")
                    .default_value(&defaults.libvirt_uri),
            )
            .arg(
                Arg::with_name("fake-topology")
                    .long("fake-topology")
                    .value_name("N")
                    .help("Populate the allocator with N synthetic isolated cores instead of scanning /sys (dev/CI only)"),
            )
            .get_matches();

        let socket_path = PathBuf::from(matches.value_of("socket").unwrap_or(&default_socket));
        let zfs_pool = matches
            .value_of("zfs-pool")
            .unwrap_or(&defaults.zfs_pool)
            .to_string();
        let worker_threads = matches
            .value_of("worker-threads")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.worker_threads);
        let libvirt_uri = matches
            .value_of("libvirt-uri")
            .unwrap_or(&defaults.libvirt_uri)
            .to_string();
        let fake_topology_cores = matches
            .value_of("fake-topology")
            .and_then(|v| v.parse::<u32>().ok());

        EngineConfig {
            socket_path,
            zfs_pool,
            worker_threads,
            libvirt_uri,
            fake_topology_cores,
            ..defaults
        }
    }

    pub fn zvol_dataset(&self, vm_name: &str) -> String {
        format!("{}/vms/{}", self.zfs_pool, vm_name)
    }

    pub fn zvol_device_path(&self, vm_name: &str) -> PathBuf {
        PathBuf::from(format!("/dev/zvol/{}", self.zvol_dataset(vm_name)))
    }
}
