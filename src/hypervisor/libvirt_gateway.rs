//! Real `Gateway` backed by libvirt, via the `virt` crate.

use crate::error::{EngineError, EngineResult};
use crate::types::{
    DomainInfo, DomainState, MemLimit, MemoryStats, SchedQuota, Scope, UndefineFlags, VmIdentity,
    VmSummary,
};
use log::warn;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

pub struct LibvirtGateway {
    conn: Connect,
}

impl LibvirtGateway {
    /// Opens one connection for the lifetime of this gateway; each worker
    /// thread opens its own.
    pub fn connect(uri: &str) -> EngineResult<Self> {
        let conn = Connect::open(Some(uri))
            .map_err(|e| EngineError::Hypervisor(format!("connect {}: {}", uri, e)))?;
        Ok(LibvirtGateway { conn })
    }

    fn find(&self, ident: &VmIdentity) -> EngineResult<Option<Domain>> {
        if ident.looks_like_uuid() {
            if let Ok(dom) = Domain::lookup_by_uuid_string(&self.conn, ident.as_str()) {
                return Ok(Some(dom));
            }
        }
        match Domain::lookup_by_name(&self.conn, ident.as_str()) {
            Ok(dom) => Ok(Some(dom)),
            Err(_) => Ok(None),
        }
    }

    fn resolve(&self, ident: &VmIdentity) -> EngineResult<Domain> {
        self.find(ident)?
            .ok_or_else(|| EngineError::NotFound(ident.to_string()))
    }

    fn state_from_libvirt(state: u32) -> DomainState {
        match state {
            sys::VIR_DOMAIN_RUNNING => DomainState::Running,
            sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
            sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => DomainState::Shutdown,
            sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
            sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
            _ => DomainState::Unknown,
        }
    }

    fn domain_info(dom: &Domain) -> EngineResult<DomainInfo> {
        let info = dom
            .get_info()
            .map_err(|e| EngineError::Hypervisor(e.to_string()))?;
        let name = dom
            .get_name()
            .map_err(|e| EngineError::Hypervisor(e.to_string()))?;
        Ok(DomainInfo {
            name,
            state: Self::state_from_libvirt(info.state),
            max_mem_kib: info.max_mem,
            used_mem_kib: info.memory,
            vcpu_count: info.nr_virt_cpu,
            cpu_time_ns: info.cpu_time,
        })
    }

    fn scope_flags(scope: Scope) -> u32 {
        let mut flags = 0u32;
        if scope.contains(Scope::LIVE) {
            flags |= sys::VIR_DOMAIN_AFFECT_LIVE;
        }
        if scope.contains(Scope::CONFIG) {
            flags |= sys::VIR_DOMAIN_AFFECT_CONFIG;
        }
        flags
    }
}

impl super::Gateway for LibvirtGateway {
    fn lookup(&self, ident: &VmIdentity) -> EngineResult<Option<DomainInfo>> {
        match self.find(ident)? {
            Some(dom) => Ok(Some(Self::domain_info(&dom)?)),
            None => Ok(None),
        }
    }

    fn define(&self, xml: &str) -> EngineResult<String> {
        let dom = Domain::define_xml(&self.conn, xml)
            .map_err(|e| EngineError::Hypervisor(format!("define: {}", e)))?;
        dom.get_uuid_string()
            .map_err(|e| EngineError::Hypervisor(e.to_string()))
    }

    fn start(&self, ident: &VmIdentity) -> EngineResult<()> {
        let dom = self.resolve(ident)?;
        dom.create()
            .map_err(|e| EngineError::Hypervisor(format!("start: {}", e)))?;
        Ok(())
    }

    fn destroy(&self, ident: &VmIdentity) -> EngineResult<()> {
        let dom = self.resolve(ident)?;
        dom.destroy()
            .map_err(|e| EngineError::Hypervisor(format!("destroy: {}", e)))?;
        Ok(())
    }

    fn shutdown_graceful(&self, ident: &VmIdentity) -> EngineResult<()> {
        let dom = self.resolve(ident)?;
        dom.shutdown()
            .map_err(|e| EngineError::Hypervisor(format!("shutdown: {}", e)))?;
        Ok(())
    }

    fn undefine(&self, ident: &VmIdentity, flags: UndefineFlags) -> EngineResult<()> {
        let dom = self.resolve(ident)?;
        let mut libvirt_flags = 0u32;
        if flags.contains(UndefineFlags::SNAPSHOTS_METADATA) {
            libvirt_flags |= sys::VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA;
        }
        if flags.contains(UndefineFlags::MANAGED_SAVE) {
            libvirt_flags |= sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE;
        }
        match dom.undefine_flags(libvirt_flags) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "undefine_flags({}) failed for {}, falling back to plain undefine: {}",
                    libvirt_flags, ident, e
                );
                dom.undefine()
                    .map_err(|e2| EngineError::Hypervisor(format!("undefine: {}", e2)))
            }
        }
    }

    fn is_active(&self, ident: &VmIdentity) -> EngineResult<bool> {
        let dom = self.resolve(ident)?;
        dom.is_active()
            .map_err(|e| EngineError::Hypervisor(e.to_string()))
    }

    fn info(&self, ident: &VmIdentity) -> EngineResult<DomainInfo> {
        let dom = self.resolve(ident)?;
        Self::domain_info(&dom)
    }

    fn set_memory(&self, ident: &VmIdentity, kib: u64, scope: Scope) -> EngineResult<()> {
        let dom = self.resolve(ident)?;
        dom.set_memory_flags(kib, Self::scope_flags(scope))
            .map_err(|e| EngineError::Hypervisor(format!("set_memory: {}", e)))?;
        Ok(())
    }

    fn set_vcpus(&self, ident: &VmIdentity, n: u32, scope: Scope) -> EngineResult<()> {
        let dom = self.resolve(ident)?;
        dom.set_vcpus_flags(n, Self::scope_flags(scope))
            .map_err(|e| EngineError::Hypervisor(format!("set_vcpus: {}", e)))?;
        Ok(())
    }

    fn set_scheduler_quota(&self, ident: &VmIdentity, quota: SchedQuota) -> EngineResult<()> {
        let dom = self.resolve(ident)?;
        let quota_us: i64 = match quota {
            SchedQuota::Unlimited => -1,
            SchedQuota::MicrosPer100Ms(v) => v,
        };
        // virt 0.4's typed-parameter marshaling for scheduler params is a
        // thin wrapper over libvirt's `virTypedParameter` array; the
        // CFS quota parameter is named "vcpu_quota" and takes a signed
        // long long measured in microseconds per 100ms scheduling period.
        dom.set_scheduler_parameters_flags(
            &[virt::typedparam::TypedParameter::Llong(
                "vcpu_quota".to_string(),
                quota_us,
            )],
            sys::VIR_DOMAIN_AFFECT_LIVE,
        )
        .map_err(|e| EngineError::Hypervisor(format!("set_scheduler_quota: {}", e)))?;
        Ok(())
    }

    fn set_memory_hard_limit(&self, ident: &VmIdentity, limit: MemLimit) -> EngineResult<()> {
        let dom = self.resolve(ident)?;
        let kib: u64 = match limit {
            MemLimit::Unlimited => u64::MAX,
            MemLimit::Kib(v) => v,
        };
        dom.set_memory_parameters_flags(
            &[virt::typedparam::TypedParameter::ULlong(
                "hard_limit".to_string(),
                kib,
            )],
            sys::VIR_DOMAIN_AFFECT_LIVE,
        )
        .map_err(|e| EngineError::Hypervisor(format!("set_memory_hard_limit: {}", e)))?;
        Ok(())
    }

    fn pin_vcpu(&self, ident: &VmIdentity, vcpu_index: u32, pcpu: u32) -> EngineResult<()> {
        let dom = self.resolve(ident)?;
        let cpumaplen = (pcpu / 8 + 1) as usize;
        let mut cpumap = vec![0u8; cpumaplen];
        cpumap[(pcpu / 8) as usize] |= 1 << (pcpu % 8);
        dom.pin_vcpu(vcpu_index, &cpumap)
            .map_err(|e| EngineError::Hypervisor(format!("pin_vcpu: {}", e)))?;
        Ok(())
    }

    fn attach_device(&self, ident: &VmIdentity, xml: &str, scope: Scope) -> EngineResult<()> {
        let dom = self.resolve(ident)?;
        dom.attach_device_flags(xml, Self::scope_flags(scope))
            .map_err(|e| EngineError::Hypervisor(format!("attach_device: {}", e)))?;
        Ok(())
    }

    fn detach_device(&self, ident: &VmIdentity, xml: &str, scope: Scope) -> EngineResult<()> {
        let dom = self.resolve(ident)?;
        dom.detach_device_flags(xml, Self::scope_flags(scope))
            .map_err(|e| EngineError::Hypervisor(format!("detach_device: {}", e)))?;
        Ok(())
    }

    fn get_live_xml(&self, ident: &VmIdentity) -> EngineResult<String> {
        let dom = self.resolve(ident)?;
        dom.get_xml_desc(0)
            .map_err(|e| EngineError::Hypervisor(e.to_string()))
    }

    fn memory_stats(&self, ident: &VmIdentity) -> EngineResult<MemoryStats> {
        let dom = self.resolve(ident)?;
        let stats = dom
            .memory_stats(64, 0)
            .map_err(|e| EngineError::Hypervisor(e.to_string()))?;
        let rss_kib = stats
            .iter()
            .find(|s| s.tag == sys::VIR_DOMAIN_MEMORY_STAT_RSS)
            .map(|s| s.val);
        Ok(MemoryStats { rss_kib })
    }

    fn list_all(&self) -> EngineResult<Vec<VmSummary>> {
        let flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
        let domains = self
            .conn
            .list_all_domains(flags)
            .map_err(|e| EngineError::Hypervisor(e.to_string()))?;

        domains
            .iter()
            .map(|dom| {
                let uuid = dom
                    .get_uuid_string()
                    .map_err(|e| EngineError::Hypervisor(e.to_string()))?;
                let name = dom
                    .get_name()
                    .map_err(|e| EngineError::Hypervisor(e.to_string()))?;
                let info = Self::domain_info(dom)?;
                Ok(VmSummary {
                    uuid,
                    name,
                    state: info.state.coarse().to_string(),
                })
            })
            .collect()
    }
}
