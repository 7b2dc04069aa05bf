//! Maps a provider volume serial to a stable host device symlink on
//! managed-Kubernetes nodes. Grounded on
//! `internal/vultrdevice/vultrdevice.go` (`LinkBySerial`,
//! `listSysDevices`) — the teacher has no analog for this, since its
//! FreeBSD backend discovers iSCSI/NVMeoF targets instead of PCI serials.

use std::path::{Path, PathBuf};

const SYS_PCI_PATH: &str = "/sys/devices/pci0000:00/";
const BY_ID_PREFIX: &str = "virtio-";

struct SysDevice {
    name: PathBuf,
    serial: String,
}

fn list_sys_devices(root: &Path) -> std::io::Result<Vec<SysDevice>> {
    let mut found = Vec::new();
    walk(root, &mut found)?;
    Ok(found)
}

fn walk(dir: &Path, found: &mut Vec<SysDevice>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(()), // unreadable subtree, skip rather than fail the whole walk
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_symlink() || file_type.is_dir() {
            walk(&path, found)?;
        }
        if path.file_name().and_then(|n| n.to_str()) == Some("serial") {
            if let Ok(content) = std::fs::read_to_string(&path) {
                let serial = content.lines().next().unwrap_or("").trim().to_string();
                if !serial.is_empty() {
                    if let Some(parent) = path.parent() {
                        if let Some(device_name) = parent.file_name() {
                            found.push(SysDevice {
                                name: PathBuf::from("/dev").join(device_name),
                                serial,
                            });
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn by_id_path(serial: &str) -> PathBuf {
    PathBuf::from("/dev/disk/by-id").join(format!("{BY_ID_PREFIX}{serial}"))
}

/// Ensures `/dev/disk/by-id/virtio-<serial>` exists, symlinked to the
/// device bearing that serial under the PCI bus. No-op if the symlink
/// already exists or no matching device is found.
pub fn link_by_serial(serial: &str) -> std::io::Result<()> {
    link_by_serial_under(Path::new(SYS_PCI_PATH), serial)
}

fn link_by_serial_under(sys_root: &Path, serial: &str) -> std::io::Result<()> {
    let symlink_path = by_id_path(serial);
    if symlink_path.exists() {
        return Ok(());
    }
    for device in list_sys_devices(sys_root)? {
        if device.serial == serial {
            std::os::unix::fs::symlink(&device.name, &symlink_path)?;
            return Ok(());
        }
    }
    tracing::warn!(serial, "no pci device found with matching serial");
    Ok(())
}

/// Called only on Linux managed-Kubernetes nodes per spec.md §4.5; a
/// no-op elsewhere.
#[cfg(target_os = "linux")]
pub async fn ensure_link_if_managed_node(serial: &str) {
    if crate::metadata::is_managed_kubernetes_node().await {
        if let Err(e) = link_by_serial(serial) {
            tracing::warn!(error = %e, serial, "failed to link device by serial");
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn ensure_link_if_managed_node(_serial: &str) {}
