//! Shared data model: VM identity/config, domain descriptor inputs,
//! storage entities, and the handful of plain value types that cross the
//! RPC boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A client-supplied VM identity. Lookups try this as a UUID first, then
/// fall back to treating it as a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmIdentity(pub String);

impl VmIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Loose UUID-shape check used only to order lookup attempts; a false
    /// negative just means we try the name lookup first, which is safe.
    pub fn looks_like_uuid(&self) -> bool {
        let s = &self.0;
        s.len() == 36
            && s.as_bytes()
                .iter()
                .enumerate()
                .all(|(i, b)| match i {
                    8 | 13 | 18 | 23 => *b == b'-',
                    _ => b.is_ascii_hexdigit(),
                })
    }
}

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VmIdentity {
    fn from(s: String) -> Self {
        VmIdentity(s)
    }
}

impl From<&str> for VmIdentity {
    fn from(s: &str) -> Self {
        VmIdentity(s.to_string())
    }
}

/// VM config (input). Invariants (`vcpu_count >= 1`, etc.) are enforced by
/// `validate()`, not by `Deserialize` itself, so that a
/// malformed-but-present field is reported as `-32000` (validation) rather
/// than `-32602` (wrong JSON shape).
#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    pub name: String,
    #[serde(default = "default_vcpu_count", alias = "vcpu")]
    pub vcpu_count: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_size_gb: Option<u64>,
    #[serde(default)]
    pub iso_path: Option<String>,
    #[serde(default)]
    pub network_bridge: Option<String>,
}

fn default_vcpu_count() -> u32 {
    1
}

fn default_memory_mb() -> u64 {
    512
}

/// Conservative identifier regex shared by VM names and bridge names:
/// letters, digits, `-`, `_`, max 64 chars, must not start with a digit or
/// dash so it can never be mistaken for a number or a CLI flag.
pub fn is_valid_identifier(s: &str) -> bool {
    lazy_static::lazy_static! {
        static ref IDENT_RE: regex::Regex =
            regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]{0,63}$").unwrap();
    }
    IDENT_RE.is_match(s)
}

impl VmConfig {
    /// Default disk size from policy, applied here rather than via serde
    /// default so the policy value is a single named constant, not
    /// scattered literals.
    pub const DEFAULT_DISK_SIZE_GB: u64 = 20;

    pub fn disk_size_gb(&self) -> u64 {
        self.disk_size_gb.unwrap_or(Self::DEFAULT_DISK_SIZE_GB)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_identifier(&self.name) {
            return Err(format!("invalid vm name: {:?}", self.name));
        }
        if self.vcpu_count < 1 {
            return Err("vcpu_count must be >= 1".into());
        }
        if self.memory_mb < 1 {
            return Err("memory_mb must be >= 1".into());
        }
        if self.disk_size_gb() < 1 {
            return Err("disk_size_gb must be >= 1".into());
        }
        if let Some(bridge) = &self.network_bridge {
            if !is_valid_identifier(bridge) {
                return Err(format!("invalid network_bridge name: {:?}", bridge));
            }
        }
        Ok(())
    }
}

/// Per-VM lifecycle operation kind. `Idle` is never stored in the lock
/// table; it is the implicit state of any VM identity absent from the
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Creating,
    Starting,
    Stopping,
    Deleting,
    Snapshotting,
    Tuning,
    Attaching,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Creating => "CREATING",
            OperationKind::Starting => "STARTING",
            OperationKind::Stopping => "STOPPING",
            OperationKind::Deleting => "DELETING",
            OperationKind::Snapshotting => "SNAPSHOTTING",
            OperationKind::Tuning => "TUNING",
            OperationKind::Attaching => "ATTACHING",
        };
        write!(f, "{}", s)
    }
}

/// Host core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCore {
    pub id: u32,
    pub numa_node: u32,
    pub isolated: bool,
}

/// Hypervisor-reported domain power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Unknown,
}

impl DomainState {
    /// The coarse three-way mapping `vm.list` reports: "running" /
    /// "shutoff" / "unknown".
    pub fn coarse(&self) -> &'static str {
        match self {
            DomainState::Running | DomainState::Blocked => "running",
            DomainState::Shutoff | DomainState::Shutdown | DomainState::Crashed => "shutoff",
            DomainState::Paused | DomainState::Unknown => "unknown",
        }
    }
}

/// Snapshot of hypervisor-reported domain counters. Carries the domain's
/// persistent `name` alongside the counters so callers that looked a VM up
/// by UUID (the zvol dataset is always named, never UUID-addressed) can
/// still resolve the name they need for storage operations.
#[derive(Debug, Clone)]
pub struct DomainInfo {
    pub name: String,
    pub state: DomainState,
    pub max_mem_kib: u64,
    pub used_mem_kib: u64,
    pub vcpu_count: u32,
    pub cpu_time_ns: u64,
}

/// `memory_stats` result; only the field the metrics handler needs
/// (resident set size) is modeled.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub rss_kib: Option<u64>,
}

/// `vm.list` entry.
#[derive(Debug, Clone, Serialize)]
pub struct VmSummary {
    pub uuid: String,
    pub name: String,
    pub state: String,
}

/// `storage.pool.list` entry.
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub name: String,
    pub size: String,
    pub alloc: String,
    pub free: String,
    pub health: String,
}

/// `storage.zvol.list` entry.
#[derive(Debug, Clone, Serialize)]
pub struct ZvolInfo {
    pub name: String,
    pub volsize: String,
    pub used: String,
}

/// Hypervisor scope for hotplug operations: live domain, persistent config,
/// or both. Modeled with `bitflags` since libvirt itself expresses these as
/// an OR-able flag word.
bitflags::bitflags! {
    pub struct Scope: u32 {
        const LIVE = 0b01;
        const CONFIG = 0b10;
    }
}

/// `vm.limit` target for scheduler CPU quota.
#[derive(Debug, Clone, Copy)]
pub enum SchedQuota {
    Unlimited,
    MicrosPer100Ms(i64),
}

/// `vm.limit`/hotplug target for the memory cgroup hard limit.
#[derive(Debug, Clone, Copy)]
pub enum MemLimit {
    Unlimited,
    Kib(u64),
}

bitflags::bitflags! {
    /// Undefine flags: `SNAPSHOTS_METADATA|MANAGED_SAVE`, with a
    /// plain-undefine fallback when both fail.
    pub struct UndefineFlags: u32 {
        const SNAPSHOTS_METADATA = 0b01;
        const MANAGED_SAVE = 0b10;
    }
}
