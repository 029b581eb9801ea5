//! Hypervisor gateway: a thin wrapper around libvirt. Each gateway
//! instance is built by a worker-pool job and holds exactly one libvirt
//! connection for the lifetime of that job, isolating blocking calls and
//! avoiding a class of thread-safety issues in the underlying library.
//! The connection is never shared across jobs or cached on the `Engine`.

pub mod libvirt_gateway;

use crate::error::EngineResult;
use crate::types::{
    DomainInfo, MemLimit, MemoryStats, SchedQuota, Scope, UndefineFlags, VmIdentity, VmSummary,
};

pub use libvirt_gateway::LibvirtGateway;

/// Object-safe seam so lifecycle handlers can be unit-tested against a
/// fake implementation instead of a real libvirtd. Every method
/// re-resolves `ident` against the connection it holds, looking the
/// domain up once per worker job and operating on the returned pointer
/// for the rest of that job.
pub trait Gateway: Send {
    fn lookup(&self, ident: &VmIdentity) -> EngineResult<Option<DomainInfo>>;
    fn define(&self, xml: &str) -> EngineResult<String>;
    fn start(&self, ident: &VmIdentity) -> EngineResult<()>;
    fn destroy(&self, ident: &VmIdentity) -> EngineResult<()>;
    fn shutdown_graceful(&self, ident: &VmIdentity) -> EngineResult<()>;
    fn undefine(&self, ident: &VmIdentity, flags: UndefineFlags) -> EngineResult<()>;
    fn is_active(&self, ident: &VmIdentity) -> EngineResult<bool>;
    fn info(&self, ident: &VmIdentity) -> EngineResult<DomainInfo>;
    fn set_memory(&self, ident: &VmIdentity, kib: u64, scope: Scope) -> EngineResult<()>;
    fn set_vcpus(&self, ident: &VmIdentity, n: u32, scope: Scope) -> EngineResult<()>;
    fn set_scheduler_quota(&self, ident: &VmIdentity, quota: SchedQuota) -> EngineResult<()>;
    fn set_memory_hard_limit(&self, ident: &VmIdentity, limit: MemLimit) -> EngineResult<()>;
    fn pin_vcpu(&self, ident: &VmIdentity, vcpu_index: u32, pcpu: u32) -> EngineResult<()>;
    fn attach_device(&self, ident: &VmIdentity, xml: &str, scope: Scope) -> EngineResult<()>;
    fn detach_device(&self, ident: &VmIdentity, xml: &str, scope: Scope) -> EngineResult<()>;
    fn get_live_xml(&self, ident: &VmIdentity) -> EngineResult<String>;
    fn memory_stats(&self, ident: &VmIdentity) -> EngineResult<MemoryStats>;
    fn list_all(&self) -> EngineResult<Vec<VmSummary>>;
}

/// Produces one `Gateway` per call, each opening its own connection.
/// Implemented as a trait (rather than a bare closure type) so the engine
/// can hold it as `Arc<dyn GatewayFactory>` alongside the other
/// `Arc<dyn ...>` component handles.
pub trait GatewayFactory: Send + Sync {
    fn connect(&self) -> EngineResult<Box<dyn Gateway>>;
}

pub struct LibvirtGatewayFactory {
    pub uri: String,
}

impl GatewayFactory for LibvirtGatewayFactory {
    fn connect(&self) -> EngineResult<Box<dyn Gateway>> {
        Ok(Box::new(LibvirtGateway::connect(&self.uri)?))
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use crate::types::DomainState;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    pub struct FakeDomain {
        pub uuid: String,
        pub name: String,
        pub state: DomainState,
        pub max_mem_kib: u64,
        pub used_mem_kib: u64,
        pub vcpu_count: u32,
        pub xml: String,
    }

    #[derive(Default)]
    pub struct FakeLibvirtState {
        pub domains: HashMap<String, FakeDomain>,
        pub fail_next: Option<String>,
    }

    /// Shared in-memory libvirt stand-in. Cloning a `FakeGateway` shares
    /// the same underlying state, which is how tests simulate "the next
    /// job's gateway sees what the previous job's gateway wrote", matching
    /// real libvirt's server-side persistence across fresh connections.
    pub struct FakeGateway {
        pub state: Arc<Mutex<FakeLibvirtState>>,
    }

    impl FakeGateway {
        pub fn new() -> Self {
            FakeGateway {
                state: Arc::new(Mutex::new(FakeLibvirtState::default())),
            }
        }

        pub fn shared(state: Arc<Mutex<FakeLibvirtState>>) -> Self {
            FakeGateway { state }
        }

        fn resolve<'a>(
            state: &'a FakeLibvirtState,
            ident: &VmIdentity,
        ) -> Option<&'a FakeDomain> {
            if ident.looks_like_uuid() {
                if let Some(d) = state.domains.get(ident.as_str()) {
                    return Some(d);
                }
            }
            state.domains.values().find(|d| d.name == ident.as_str())
        }
    }

    impl Default for FakeGateway {
        fn default() -> Self {
            Self::new()
        }
    }

    /// `GatewayFactory` over a shared `FakeLibvirtState`, so every worker
    /// job in a test "connects" to the same fake libvirtd, matching how
    /// the real `LibvirtGatewayFactory` hands out independent connections
    /// that all talk to the one actual libvirtd.
    pub struct FakeGatewayFactory {
        pub state: Arc<Mutex<FakeLibvirtState>>,
    }

    impl FakeGatewayFactory {
        pub fn new() -> Self {
            FakeGatewayFactory {
                state: Arc::new(Mutex::new(FakeLibvirtState::default())),
            }
        }
    }

    impl Default for FakeGatewayFactory {
        fn default() -> Self {
            Self::new()
        }
    }

    impl GatewayFactory for FakeGatewayFactory {
        fn connect(&self) -> EngineResult<Box<dyn Gateway>> {
            Ok(Box::new(FakeGateway::shared(self.state.clone())))
        }
    }

    impl Gateway for FakeGateway {
        fn lookup(&self, ident: &VmIdentity) -> EngineResult<Option<DomainInfo>> {
            let state = self.state.lock().unwrap();
            Ok(Self::resolve(&state, ident).map(|d| DomainInfo {
                name: d.name.clone(),
                state: d.state,
                max_mem_kib: d.max_mem_kib,
                used_mem_kib: d.used_mem_kib,
                vcpu_count: d.vcpu_count,
                cpu_time_ns: 0,
            }))
        }

        fn define(&self, xml: &str) -> EngineResult<String> {
            let mut state = self.state.lock().unwrap();
            if let Some(reason) = state.fail_next.take() {
                return Err(crate::error::EngineError::Hypervisor(reason));
            }
            let uuid = format!("uuid-{}", state.domains.len() + 1);
            let name = extract_tag(xml, "name").unwrap_or_else(|| "unnamed".to_string());
            state.domains.insert(
                uuid.clone(),
                FakeDomain {
                    uuid: uuid.clone(),
                    name,
                    state: DomainState::Shutoff,
                    max_mem_kib: 0,
                    used_mem_kib: 0,
                    vcpu_count: 1,
                    xml: xml.to_string(),
                },
            );
            Ok(uuid)
        }

        fn start(&self, ident: &VmIdentity) -> EngineResult<()> {
            let mut state = self.state.lock().unwrap();
            let uuid = Self::resolve(&state, ident)
                .map(|d| d.uuid.clone())
                .ok_or_else(|| crate::error::EngineError::NotFound(ident.to_string()))?;
            state.domains.get_mut(&uuid).unwrap().state = DomainState::Running;
            Ok(())
        }

        fn destroy(&self, ident: &VmIdentity) -> EngineResult<()> {
            let mut state = self.state.lock().unwrap();
            let uuid = Self::resolve(&state, ident)
                .map(|d| d.uuid.clone())
                .ok_or_else(|| crate::error::EngineError::NotFound(ident.to_string()))?;
            state.domains.get_mut(&uuid).unwrap().state = DomainState::Shutoff;
            Ok(())
        }

        fn shutdown_graceful(&self, ident: &VmIdentity) -> EngineResult<()> {
            self.destroy(ident)
        }

        fn undefine(&self, ident: &VmIdentity, _flags: UndefineFlags) -> EngineResult<()> {
            let mut state = self.state.lock().unwrap();
            let uuid = Self::resolve(&state, ident)
                .map(|d| d.uuid.clone())
                .ok_or_else(|| crate::error::EngineError::NotFound(ident.to_string()))?;
            state.domains.remove(&uuid);
            Ok(())
        }

        fn is_active(&self, ident: &VmIdentity) -> EngineResult<bool> {
            Ok(self
                .info(ident)
                .map(|i| i.state == DomainState::Running)
                .unwrap_or(false))
        }

        fn info(&self, ident: &VmIdentity) -> EngineResult<DomainInfo> {
            self.lookup(ident)?
                .ok_or_else(|| crate::error::EngineError::NotFound(ident.to_string()))
        }

        fn set_memory(&self, ident: &VmIdentity, kib: u64, _scope: Scope) -> EngineResult<()> {
            let mut state = self.state.lock().unwrap();
            let uuid = Self::resolve(&state, ident)
                .map(|d| d.uuid.clone())
                .ok_or_else(|| crate::error::EngineError::NotFound(ident.to_string()))?;
            state.domains.get_mut(&uuid).unwrap().max_mem_kib = kib;
            Ok(())
        }

        fn set_vcpus(&self, ident: &VmIdentity, n: u32, _scope: Scope) -> EngineResult<()> {
            let mut state = self.state.lock().unwrap();
            let uuid = Self::resolve(&state, ident)
                .map(|d| d.uuid.clone())
                .ok_or_else(|| crate::error::EngineError::NotFound(ident.to_string()))?;
            state.domains.get_mut(&uuid).unwrap().vcpu_count = n;
            Ok(())
        }

        fn set_scheduler_quota(&self, ident: &VmIdentity, _quota: SchedQuota) -> EngineResult<()> {
            self.info(ident).map(|_| ())
        }

        fn set_memory_hard_limit(&self, ident: &VmIdentity, _limit: MemLimit) -> EngineResult<()> {
            self.info(ident).map(|_| ())
        }

        fn pin_vcpu(&self, ident: &VmIdentity, _vcpu_index: u32, _pcpu: u32) -> EngineResult<()> {
            self.info(ident).map(|_| ())
        }

        fn attach_device(&self, ident: &VmIdentity, _xml: &str, _scope: Scope) -> EngineResult<()> {
            self.info(ident).map(|_| ())
        }

        fn detach_device(&self, ident: &VmIdentity, _xml: &str, _scope: Scope) -> EngineResult<()> {
            self.info(ident).map(|_| ())
        }

        fn get_live_xml(&self, ident: &VmIdentity) -> EngineResult<String> {
            let state = self.state.lock().unwrap();
            Self::resolve(&state, ident)
                .map(|d| d.xml.clone())
                .ok_or_else(|| crate::error::EngineError::NotFound(ident.to_string()))
        }

        fn memory_stats(&self, ident: &VmIdentity) -> EngineResult<MemoryStats> {
            let info = self.info(ident)?;
            Ok(MemoryStats {
                rss_kib: Some(info.used_mem_kib),
            })
        }

        fn list_all(&self) -> EngineResult<Vec<VmSummary>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .domains
                .values()
                .map(|d| VmSummary {
                    uuid: d.uuid.clone(),
                    name: d.name.clone(),
                    state: d.state.coarse().to_string(),
                })
                .collect())
        }
    }

    fn extract_tag(xml: &str, tag: &str) -> Option<String> {
        let open = format!("<{}>", tag);
        let close = format!("</{}>", tag);
        let start = xml.find(&open)? + open.len();
        let end = xml[start..].find(&close)? + start;
        Some(xml[start..end].to_string())
    }
}
