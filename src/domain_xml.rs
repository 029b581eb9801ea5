//! Domain XML builder: a pure function from `(VmConfig, resolved zvol
//! device path)` to a libvirt domain descriptor string. This crate has no
//! `libvirt-gobject` binding to build against, so the document is
//! assembled as a string with `quick_xml`'s escaper guarding every
//! user-supplied value (vm name, iso path, bridge name) that lands inside
//! an attribute.

use crate::types::VmConfig;
use quick_xml::escape::escape;

fn esc(s: &str) -> std::borrow::Cow<'_, str> {
    escape(s)
}

/// Builds the full domain descriptor, including the post-serialization
/// virtio-scsi controller injection.
pub fn build_domain_xml(config: &VmConfig, zvol_device_path: &str) -> String {
    let memory_kib = config.memory_mb * 1024;
    let mut devices = String::new();

    devices.push_str(&format!(
        concat!(
            "    <disk type='block' device='disk'>\n",
            "      <driver name='qemu' type='raw' cache='none' io='native'/>\n",
            "      <source dev='{disk_path}'/>\n",
            "      <target dev='vda' bus='virtio'/>\n",
            "    </disk>\n",
        ),
        disk_path = esc(zvol_device_path),
    ));

    if let Some(iso_path) = &config.iso_path {
        devices.push_str(&format!(
            concat!(
                "    <disk type='file' device='cdrom'>\n",
                "      <driver name='qemu' type='raw'/>\n",
                "      <source file='{iso_path}'/>\n",
                "      <target dev='sda' bus='sata'/>\n",
                "      <readonly/>\n",
                "    </disk>\n",
            ),
            iso_path = esc(iso_path),
        ));
    }

    devices.push_str(
        "    <graphics type='vnc' port='-1' autoport='yes'/>\n    <video>\n      <model type='qxl'/>\n    </video>\n",
    );

    match &config.network_bridge {
        Some(bridge) => {
            devices.push_str(&format!(
                concat!(
                    "    <interface type='bridge'>\n",
                    "      <source bridge='{bridge}'/>\n",
                    "      <model type='virtio'/>\n",
                    "      <driver name='vhost' queues='{queues}'/>\n",
                    "    </interface>\n",
                ),
                bridge = esc(bridge),
                queues = config.vcpu_count,
            ));
        }
        None => {
            devices.push_str(&format!(
                concat!(
                    "    <interface type='network'>\n",
                    "      <source network='default'/>\n",
                    "      <model type='virtio'/>\n",
                    "      <driver name='vhost' queues='{queues}'/>\n",
                    "    </interface>\n",
                ),
                queues = config.vcpu_count,
            ));
        }
    }

    let domain = format!(
        concat!(
            "<domain type='kvm'>\n",
            "  <name>{name}</name>\n",
            "  <memory unit='KiB'>{memory_kib}</memory>\n",
            "  <currentMemory unit='KiB'>{memory_kib}</currentMemory>\n",
            "  <vcpu placement='static'>{vcpu_count}</vcpu>\n",
            "  <os>\n",
            "    <type arch='x86_64' machine='q35'>hvm</type>\n",
            "    <boot dev='cdrom'/>\n",
            "    <boot dev='hd'/>\n",
            "  </os>\n",
            "  <cpu mode='host-passthrough' check='none'/>\n",
            "  <on_poweroff>destroy</on_poweroff>\n",
            "  <on_reboot>restart</on_reboot>\n",
            "  <on_crash>destroy</on_crash>\n",
            "  <devices>\n",
            "{devices}",
            "  </devices>\n",
            "</domain>\n",
        ),
        name = esc(&config.name),
        memory_kib = memory_kib,
        vcpu_count = config.vcpu_count,
        devices = devices,
    );

    inject_virtio_scsi_controller(&domain)
}

/// Live network-interface hotplug fragment for `vm.start`'s `bridge_name`
/// parameter: attaches a virtio network interface to the running domain.
pub fn build_bridge_interface_xml(bridge: &str, queues: u32) -> String {
    format!(
        concat!(
            "<interface type='bridge'>\n",
            "  <source bridge='{bridge}'/>\n",
            "  <model type='virtio'/>\n",
            "  <driver name='vhost' queues='{queues}'/>\n",
            "</interface>\n",
        ),
        bridge = esc(bridge),
        queues = queues.max(1),
    )
}

/// `device.disk.attach` fragment: a block-type disk with virtio bus
/// (default) or the client-requested bus, targeting the given device
/// name.
pub fn build_disk_attach_xml(source: &str, target: &str, bus: &str) -> String {
    format!(
        concat!(
            "<disk type='block' device='disk'>\n",
            "  <driver name='qemu' type='raw' cache='none' io='native'/>\n",
            "  <source dev='{source}'/>\n",
            "  <target dev='{target}' bus='{bus}'/>\n",
            "</disk>\n",
        ),
        source = esc(source),
        target = esc(target),
        bus = esc(bus),
    )
}

/// Locates the exact `<disk>` element in a live domain XML whose
/// `target dev='...'` matches `target`. The hypervisor rejects
/// reconstructed XML, so the original substring is returned verbatim
/// rather than re-serialized.
pub fn find_disk_element_by_target(xml: &str, target: &str) -> Option<String> {
    lazy_static::lazy_static! {
        static ref DISK_RE: regex::Regex = regex::Regex::new(r"(?s)<disk\b.*?(?:/>|</disk>)").unwrap();
    }
    let needle_sq = format!("target dev='{}'", target);
    let needle_dq = format!("target dev=\"{}\"", target);
    DISK_RE
        .find_iter(xml)
        .map(|m| m.as_str().to_string())
        .find(|block| block.contains(&needle_sq) || block.contains(&needle_dq))
}

/// Extracts the VNC port (and, if present, the websocket port) from a live
/// domain XML's `<graphics type='vnc' .../>` element.
pub fn find_vnc_graphics(xml: &str) -> Option<(String, Option<i64>)> {
    lazy_static::lazy_static! {
        static ref GRAPHICS_RE: regex::Regex =
            regex::Regex::new(r#"(?s)<graphics\b[^>]*type=['"]vnc['"][^>]*/?>"#).unwrap();
        static ref PORT_RE: regex::Regex = regex::Regex::new(r#"\bport=['"](-?\d+)['"]"#).unwrap();
        static ref WEBSOCKET_RE: regex::Regex =
            regex::Regex::new(r#"\bwebsocket=['"](-?\d+)['"]"#).unwrap();
    }
    let tag = GRAPHICS_RE.find(xml)?.as_str();
    let port = PORT_RE.captures(tag)?.get(1)?.as_str().to_string();
    let websocket = WEBSOCKET_RE
        .captures(tag)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok());
    Some((port, websocket))
}

/// Textually injects a virtio-scsi controller before `</devices>` so disks
/// attached later via `vm.disk.attach` have a bus to hot-plug onto. Kept
/// as a distinct post-processing step rather than folded into the initial
/// device list.
fn inject_virtio_scsi_controller(xml: &str) -> String {
    const CONTROLLER: &str = "    <controller type='scsi' model='virtio-scsi' index='0'/>\n";
    match xml.find("  </devices>\n") {
        Some(pos) => {
            let mut out = String::with_capacity(xml.len() + CONTROLLER.len());
            out.push_str(&xml[..pos]);
            out.push_str(CONTROLLER);
            out.push_str(&xml[pos..]);
            out
        }
        None => xml.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> VmConfig {
        VmConfig {
            name: "web1".to_string(),
            vcpu_count: 2,
            memory_mb: 2048,
            disk_size_gb: Some(20),
            iso_path: None,
            network_bridge: None,
        }
    }

    #[test]
    fn includes_virtio_scsi_controller_before_devices_close() {
        let xml = build_domain_xml(&base_config(), "/dev/zvol/tank/vms/web1");
        let controller_pos = xml.find("virtio-scsi").unwrap();
        let close_pos = xml.find("</devices>").unwrap();
        assert!(controller_pos < close_pos);
    }

    #[test]
    fn memory_is_converted_to_kib() {
        let xml = build_domain_xml(&base_config(), "/dev/zvol/tank/vms/web1");
        assert!(xml.contains("<memory unit='KiB'>2097152</memory>"));
    }

    #[test]
    fn nat_network_used_when_no_bridge_configured() {
        let xml = build_domain_xml(&base_config(), "/dev/zvol/tank/vms/web1");
        assert!(xml.contains("type='network'"));
        assert!(xml.contains("source network='default'"));
    }

    #[test]
    fn bridge_network_used_when_configured() {
        let mut config = base_config();
        config.network_bridge = Some("br0".to_string());
        let xml = build_domain_xml(&config, "/dev/zvol/tank/vms/web1");
        assert!(xml.contains("type='bridge'"));
        assert!(xml.contains("source bridge='br0'"));
    }

    #[test]
    fn cdrom_omitted_without_iso_path() {
        let xml = build_domain_xml(&base_config(), "/dev/zvol/tank/vms/web1");
        assert!(!xml.contains("device='cdrom'"));
    }

    #[test]
    fn cdrom_present_and_readonly_with_iso_path() {
        let mut config = base_config();
        config.iso_path = Some("/srv/iso/installer.iso".to_string());
        let xml = build_domain_xml(&config, "/dev/zvol/tank/vms/web1");
        assert!(xml.contains("device='cdrom'"));
        assert!(xml.contains("<readonly/>"));
        assert!(xml.contains("bus='sata'"));
    }

    #[test]
    fn bridge_interface_fragment_carries_queue_count() {
        let xml = build_bridge_interface_xml("br0", 4);
        assert!(xml.contains("source bridge='br0'"));
        assert!(xml.contains("queues='4'"));
    }

    #[test]
    fn finds_exact_disk_element_by_target_and_ignores_others() {
        let xml = concat!(
            "<domain><devices>\n",
            "<disk type='block'><source dev='/dev/zvol/tank/vms/a'/><target dev='vda' bus='virtio'/></disk>\n",
            "<disk type='block'><source dev='/dev/zvol/tank/extra'/><target dev='vdb' bus='virtio'/></disk>\n",
            "</devices></domain>",
        );
        let found = find_disk_element_by_target(xml, "vdb").unwrap();
        assert!(found.contains("/dev/zvol/tank/extra"));
        assert!(!found.contains("vms/a"));
    }

    #[test]
    fn missing_disk_target_returns_none() {
        let xml = "<domain><devices><disk><target dev='vda'/></disk></devices></domain>";
        assert!(find_disk_element_by_target(xml, "vdz").is_none());
    }

    #[test]
    fn finds_vnc_port_and_optional_websocket() {
        let xml = "<domain><devices><graphics type='vnc' port='5901' autoport='no' websocket='5701'/></devices></domain>";
        let (port, websocket) = find_vnc_graphics(xml).unwrap();
        assert_eq!(port, "5901");
        assert_eq!(websocket, Some(5701));
    }

    #[test]
    fn vnc_graphics_without_websocket_attribute() {
        let xml = "<domain><devices><graphics type='vnc' port='-1' autoport='yes'/></devices></domain>";
        let (port, websocket) = find_vnc_graphics(xml).unwrap();
        assert_eq!(port, "-1");
        assert_eq!(websocket, None);
    }

    #[test]
    fn no_vnc_graphics_element_returns_none() {
        let xml = "<domain><devices><graphics type='sdl'/></devices></domain>";
        assert!(find_vnc_graphics(xml).is_none());
    }
}
