/// libvirt XML 生成与解析
///
/// 生成域（虚拟机）、网络、磁盘的 XML 配置，并从 `dumpxml` 输出中解析磁盘设备、
/// 网卡与网络类型。

use common::{Error, Result};
use roxmltree::Document;
use std::path::{Path, PathBuf};

use super::{SwitchType, VmSpec};

/// 转义 XML 属性和文本中的特殊字符
pub fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

/// 根据文件扩展名判断磁盘格式
pub fn drive_format(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("qcow2") => "qcow2",
        _ => "raw",
    }
}

/// 生成虚拟机 XML 配置
pub fn domain_xml(spec: &VmSpec) -> String {
    let memory_kib = spec.memory_bytes / 1024;
    let current_kib = spec.min_memory_bytes.unwrap_or(spec.memory_bytes).min(spec.memory_bytes) / 1024;
    let boot = spec.boot_drive.display().to_string();

    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{memory}</memory>
  <currentMemory unit='KiB'>{current}</currentMemory>
  <vcpu placement='static'>{vcpu}</vcpu>
  <cpu mode='host-passthrough' check='none'/>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <clock offset='utc'>
    <timer name='rtc' tickpolicy='catchup'/>
    <timer name='pit' tickpolicy='delay'/>
    <timer name='hpet' present='no'/>
  </clock>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='{format}' cache='writeback'/>
      <source file='{boot}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='{switch}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
  </devices>
</domain>
"#,
        name = escape(&spec.name),
        memory = memory_kib,
        current = current_kib,
        vcpu = spec.processors,
        format = drive_format(&spec.boot_drive),
        boot = escape(&boot),
        switch = escape(&spec.switch_name),
    )
}

/// 生成桥接到宿主机网卡的网络（macvtap bridge 模式）
pub fn external_network_xml(name: &str, host_adapter: &str) -> String {
    format!(
        r#"<network>
  <name>{}</name>
  <forward mode='bridge'>
    <interface dev='{}'/>
  </forward>
</network>
"#,
        escape(name),
        escape(host_adapter)
    )
}

/// 生成磁盘挂载 XML
pub fn disk_xml(path: &Path, device: &str) -> String {
    format!(
        r#"<disk type='file' device='disk'>
  <driver name='qemu' type='{}'/>
  <source file='{}'/>
  <target dev='{}' bus='virtio'/>
</disk>"#,
        drive_format(path),
        escape(&path.display().to_string()),
        device
    )
}

fn parse(xml: &str) -> Result<Document<'_>> {
    Document::parse(xml).map_err(|e| Error::Hypervisor(format!("解析XML失败: {}", e)))
}

/// 解析XML中的磁盘设备名
pub fn parse_disk_devices(xml: &str) -> Result<Vec<String>> {
    let doc = parse(xml)?;

    let devices = doc
        .descendants()
        .filter(|node| node.has_tag_name("disk"))
        .filter_map(|disk| disk.children().find(|n| n.has_tag_name("target")))
        .filter_map(|target| target.attribute("dev"))
        .map(str::to_string)
        .collect();

    Ok(devices)
}

/// 解析XML中的磁盘文件路径
pub fn parse_disk_sources(xml: &str) -> Result<Vec<PathBuf>> {
    let doc = parse(xml)?;

    Ok(doc
        .descendants()
        .filter(|node| node.has_tag_name("disk"))
        .filter_map(|disk| disk.children().find(|n| n.has_tag_name("source")))
        .filter_map(|source| source.attribute("file"))
        .map(PathBuf::from)
        .collect())
}

/// 下一个可用的 virtio 磁盘设备名
pub fn next_disk_device(xml: &str) -> Result<String> {
    let used = parse_disk_devices(xml)?;

    (b'a'..=b'z')
        .map(|c| format!("vd{}", c as char))
        .find(|device| !used.contains(device))
        .ok_or_else(|| Error::Hypervisor("没有可用的磁盘设备名".to_string()))
}

/// 域 XML 中的网卡：(设备名, 网络名, MAC)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInterface {
    pub target: String,
    pub network: String,
    pub mac_address: String,
}

/// 解析域 XML 中的网卡
pub fn parse_domain_interfaces(xml: &str) -> Result<Vec<DomainInterface>> {
    let doc = parse(xml)?;
    let mut interfaces = Vec::new();

    for interface in doc.descendants().filter(|n| n.has_tag_name("interface")) {
        let child_attribute = |tag: &str, attribute: &str| {
            interface
                .children()
                .find(|n| n.has_tag_name(tag))
                .and_then(|n| n.attribute(attribute))
                .map(str::to_string)
        };

        let mac_address = child_attribute("mac", "address")
            .ok_or_else(|| Error::Hypervisor("网卡缺少 MAC 地址".to_string()))?;

        let network = child_attribute("source", "network")
            .or_else(|| child_attribute("source", "bridge"))
            .unwrap_or_default();

        interfaces.push(DomainInterface {
            target: child_attribute("target", "dev").unwrap_or_default(),
            network,
            mac_address: mac_address.to_lowercase(),
        });
    }

    Ok(interfaces)
}

/// 根据网络 XML 的 forward 模式判断交换机类型
pub fn parse_switch_type(xml: &str) -> Result<SwitchType> {
    let doc = parse(xml)?;

    if !doc.root_element().has_tag_name("network") {
        return Err(Error::Hypervisor(format!(
            "不是网络定义: <{}>",
            doc.root_element().tag_name().name()
        )));
    }

    let forward = doc
        .root_element()
        .children()
        .find(|n| n.has_tag_name("forward"));

    let switch_type = match forward {
        None => SwitchType::Private,
        Some(forward) => match forward.attribute("mode").unwrap_or("nat") {
            "nat" | "route" | "open" => SwitchType::Internal,
            "bridge" | "passthrough" | "private" | "vepa" => SwitchType::External,
            _ => SwitchType::Unknown,
        },
    };

    Ok(switch_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = r#"<domain type='kvm'>
  <name>demo-master-0</name>
  <devices>
    <disk type='file' device='disk'>
      <source file='/var/lib/libvirt/images/demo-master-0-boot.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='disk'>
      <source file='/var/lib/libvirt/images/demo-master-0-osd.raw'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <interface type='network'>
      <mac address='52:54:00:AA:BB:CC'/>
      <source network='demo-external'/>
      <target dev='vnet3'/>
      <model type='virtio'/>
    </interface>
  </devices>
</domain>"#;

    #[test]
    fn test_domain_xml() {
        let spec = VmSpec {
            name: "demo-master-0".to_string(),
            processors: 4,
            memory_bytes: 8 * 1024 * 1024 * 1024,
            min_memory_bytes: Some(2 * 1024 * 1024 * 1024),
            switch_name: "demo-external".to_string(),
            boot_drive: PathBuf::from("/pool/demo-master-0-boot.qcow2"),
        };

        let xml = domain_xml(&spec);
        let doc = Document::parse(&xml).unwrap();
        let root = doc.root_element();

        let text = |tag: &str| {
            root.descendants()
                .find(|n| n.has_tag_name(tag))
                .and_then(|n| n.text())
                .unwrap()
                .to_string()
        };

        assert_eq!(text("name"), "demo-master-0");
        assert_eq!(text("memory"), "8388608");
        assert_eq!(text("currentMemory"), "2097152");
        assert_eq!(text("vcpu"), "4");
        assert!(xml.contains("type='qcow2'"));
        assert!(xml.contains("<source network='demo-external'/>"));
    }

    #[test]
    fn test_next_disk_device() {
        assert_eq!(parse_disk_devices(DOMAIN).unwrap(), vec!["vda", "vdb"]);
        assert_eq!(next_disk_device(DOMAIN).unwrap(), "vdc");
        assert_eq!(
            parse_disk_sources(DOMAIN).unwrap(),
            vec![
                PathBuf::from("/var/lib/libvirt/images/demo-master-0-boot.qcow2"),
                PathBuf::from("/var/lib/libvirt/images/demo-master-0-osd.raw"),
            ]
        );
    }

    #[test]
    fn test_parse_domain_interfaces() {
        let interfaces = parse_domain_interfaces(DOMAIN).unwrap();

        assert_eq!(
            interfaces,
            vec![DomainInterface {
                target: "vnet3".to_string(),
                network: "demo-external".to_string(),
                mac_address: "52:54:00:aa:bb:cc".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_switch_type() {
        let nat = "<network><name>default</name><forward mode='nat'/></network>";
        let bridge = "<network><name>ext</name><forward mode='bridge'><interface dev='eno1'/></forward></network>";
        let isolated = "<network><name>private</name></network>";

        assert_eq!(parse_switch_type(nat).unwrap(), SwitchType::Internal);
        assert_eq!(parse_switch_type(bridge).unwrap(), SwitchType::External);
        assert_eq!(parse_switch_type(isolated).unwrap(), SwitchType::Private);
        assert!(parse_switch_type("<domain/>").is_err());
        assert!(parse_switch_type("not xml").is_err());
    }

    #[test]
    fn test_external_network_xml() {
        let xml = external_network_xml("demo-external", "eno1");
        assert_eq!(parse_switch_type(&xml).unwrap(), SwitchType::External);
        assert!(xml.contains("<interface dev='eno1'/>"));
    }

    #[test]
    fn test_disk_xml() {
        let disk = disk_xml(Path::new("/pool/demo-worker-0-osd.raw"), "vdb");
        assert_eq!(parse_disk_devices(&format!("<devices>{}</devices>", disk)).unwrap(), vec!["vdb"]);
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a&b<'c'>"), "a&amp;b&lt;&apos;c&apos;&gt;");
        assert_eq!(drive_format(Path::new("/x/y.raw")), "raw");
        assert_eq!(drive_format(Path::new("/x/y.qcow2")), "qcow2");
    }
}
