//! Storage driver: zvol/snapshot/pool lifecycle by shelling out to
//! `zfs`/`zpool`, parsing their tab/newline-delimited list output.

use crate::error::{EngineError, EngineResult};
use crate::types::{PoolInfo, ZvolInfo};
use simple_error::{bail, try_with};
use std::path::PathBuf;
use std::process::Command;

/// Abstracts ZFS access behind a trait so lifecycle handlers are testable
/// without a real ZFS pool.
pub trait Driver: Send + Sync {
    fn create_zvol(&self, pool: &str, vm_name: &str, size_gb: u64) -> EngineResult<()>;
    fn destroy_zvol(&self, pool: &str, vm_name: &str) -> EngineResult<()>;
    /// `vm.delete`'s final reclamation step uses `-R`, not the `-r` of the
    /// generic `destroy_zvol` contract (it also drops dependent clones),
    /// so it gets its own trait method rather than a hidden flag.
    fn destroy_zvol_recursive(&self, pool: &str, vm_name: &str) -> EngineResult<()>;
    fn zvol_device_path(&self, pool: &str, vm_name: &str) -> PathBuf;

    /// `storage.zvol.create`/`storage.zvol.delete` operate on an arbitrary
    /// dataset path rather than a VM-owned one, so they bypass the
    /// `<pool>/vms/<name>` naming convention entirely.
    fn create_zvol_at_path(&self, dataset_path: &str, size_spec: &str) -> EngineResult<()>;
    fn destroy_zvol_at_path(&self, dataset_path: &str) -> EngineResult<()>;

    fn snapshot_create(&self, pool: &str, vm_name: &str, snap_name: &str) -> EngineResult<()>;
    fn snapshot_rollback(&self, pool: &str, vm_name: &str, snap_name: &str) -> EngineResult<()>;
    fn snapshot_destroy(&self, pool: &str, vm_name: &str, snap_name: &str) -> EngineResult<()>;
    fn snapshot_list(&self, pool: &str, vm_name: &str) -> EngineResult<Vec<String>>;

    fn pool_list(&self) -> EngineResult<Vec<PoolInfo>>;
    fn zvol_list(&self, pool: &str) -> EngineResult<Vec<ZvolInfo>>;
}

/// Real implementation: the `zfs(8)`/`zpool(8)` CLIs. Each call blocks on
/// a child process, so it must only ever run on a worker-pool thread,
/// never on the tokio event loop.
pub struct ZfsCliDriver;

impl ZfsCliDriver {
    pub fn new() -> Self {
        ZfsCliDriver
    }

    fn dataset(pool: &str, vm_name: &str) -> String {
        format!("{}/vms/{}", pool, vm_name)
    }

    fn snapshot_target(pool: &str, vm_name: &str, snap_name: &str) -> String {
        format!("{}@{}", Self::dataset(pool, vm_name), snap_name)
    }

    fn run(args: &[&str]) -> EngineResult<String> {
        let program = args[0];
        let output = try_with!(
            Command::new(program).args(&args[1..]).output(),
            "failed to spawn {}",
            program
        );
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} {} failed: {}",
                program,
                args[1..].join(" "),
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// `zfs destroy` on an absent dataset exits non-zero with "dataset does
    /// not exist" on stderr. Destroy is supposed to be idempotent, so that
    /// specific failure is not a real error.
    fn is_missing_dataset_error(msg: &str) -> bool {
        msg.contains("dataset does not exist") || msg.contains("could not find any snapshots")
    }
}

impl Default for ZfsCliDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for ZfsCliDriver {
    fn create_zvol(&self, pool: &str, vm_name: &str, size_gb: u64) -> EngineResult<()> {
        let dataset = Self::dataset(pool, vm_name);
        let size_arg = format!("{}G", size_gb);
        self.create_zvol_at_path(&dataset, &size_arg)
    }

    fn destroy_zvol(&self, pool: &str, vm_name: &str) -> EngineResult<()> {
        let dataset = Self::dataset(pool, vm_name);
        match Self::run(&["zfs", "destroy", "-r", &dataset]) {
            Ok(_) => Ok(()),
            Err(e) if Self::is_missing_dataset_error(&e.to_string()) => Ok(()),
            Err(e) => Err(EngineError::Storage(e.to_string())),
        }
    }

    fn destroy_zvol_recursive(&self, pool: &str, vm_name: &str) -> EngineResult<()> {
        let dataset = Self::dataset(pool, vm_name);
        Self::run(&["zfs", "destroy", "-R", &dataset])
            .map(|_| ())
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    fn zvol_device_path(&self, pool: &str, vm_name: &str) -> PathBuf {
        PathBuf::from(format!("/dev/zvol/{}", Self::dataset(pool, vm_name)))
    }

    fn create_zvol_at_path(&self, dataset_path: &str, size_spec: &str) -> EngineResult<()> {
        Self::run(&["zfs", "create", "-V", size_spec, dataset_path])
            .map(|_| ())
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    fn destroy_zvol_at_path(&self, dataset_path: &str) -> EngineResult<()> {
        Self::run(&["zfs", "destroy", "-r", dataset_path])
            .map(|_| ())
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    fn snapshot_create(&self, pool: &str, vm_name: &str, snap_name: &str) -> EngineResult<()> {
        let target = Self::snapshot_target(pool, vm_name, snap_name);
        Self::run(&["zfs", "snapshot", &target])
            .map(|_| ())
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    fn snapshot_rollback(&self, pool: &str, vm_name: &str, snap_name: &str) -> EngineResult<()> {
        let target = Self::snapshot_target(pool, vm_name, snap_name);
        Self::run(&["zfs", "rollback", "-r", &target])
            .map(|_| ())
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    fn snapshot_destroy(&self, pool: &str, vm_name: &str, snap_name: &str) -> EngineResult<()> {
        let target = Self::snapshot_target(pool, vm_name, snap_name);
        Self::run(&["zfs", "destroy", &target])
            .map(|_| ())
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    fn snapshot_list(&self, pool: &str, vm_name: &str) -> EngineResult<Vec<String>> {
        let dataset = Self::dataset(pool, vm_name);
        let stdout = Self::run(&[
            "zfs", "list", "-t", "snapshot", "-H", "-o", "name", &dataset,
        ])
        .map_err(|e| EngineError::Storage(e.to_string()))?;

        Ok(stdout
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .filter_map(|line| line.rsplit('@').next())
            .filter(|name| !name.is_empty())
            .map(|name| name.to_string())
            .collect())
    }

    fn pool_list(&self) -> EngineResult<Vec<PoolInfo>> {
        let stdout = Self::run(&[
            "zpool", "list", "-H", "-o", "name,size,alloc,free,health",
        ])
        .map_err(|e| EngineError::Storage(e.to_string()))?;

        Ok(stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let fields: Vec<&str> = line.split('\t').collect();
                if fields.len() < 5 {
                    return None;
                }
                Some(PoolInfo {
                    name: fields[0].to_string(),
                    size: fields[1].to_string(),
                    alloc: fields[2].to_string(),
                    free: fields[3].to_string(),
                    health: fields[4].to_string(),
                })
            })
            .collect())
    }

    fn zvol_list(&self, pool: &str) -> EngineResult<Vec<ZvolInfo>> {
        let prefix = format!("{}/vms", pool);
        let stdout = Self::run(&[
            "zfs",
            "list",
            "-H",
            "-t",
            "volume",
            "-o",
            "name,volsize,used",
            "-r",
            &prefix,
        ])
        .map_err(|e| EngineError::Storage(e.to_string()))?;

        Ok(stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let fields: Vec<&str> = line.split('\t').collect();
                if fields.len() < 3 {
                    return None;
                }
                let name = fields[0].rsplit('/').next().unwrap_or(fields[0]).to_string();
                Some(ZvolInfo {
                    name,
                    volsize: fields[1].to_string(),
                    used: fields[2].to_string(),
                })
            })
            .collect())
    }
}
