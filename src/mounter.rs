//! Host mount operations for the Node plane: format, mount, unmount,
//! resize, and stat a volume. Grounded on the teacher's
//! `platform/linux.rs` (same `Command::new(...).output()` idiom,
//! stderr-inspecting error mapping) trimmed to the filesystems this
//! driver needs — `ext4`/`xfs` for block, `virtiofs` for vfs. The
//! teacher's iSCSI/NVMeoF discovery and multipath resolution have no
//! counterpart here: this driver's block devices are attached by the
//! provider, not discovered by the node.

use std::process::Command;

use tracing::{debug, error, info, warn};

use crate::error::{ProviderError, Result};

pub const DEFAULT_FS_TYPE: &str = "ext4";

fn run(cmd: &mut Command, action: &str) -> Result<std::process::Output> {
    cmd.output().map_err(|e| {
        error!(error = %e, action, "failed to execute host command");
        ProviderError::Mount(format!("failed to execute {action}: {e}"))
    })
}

pub fn validate_fs_type(fs_type: &str) -> Result<&'static str> {
    match fs_type.to_lowercase().as_str() {
        "ext4" | "" => Ok("ext4"),
        "xfs" => Ok("xfs"),
        other => Err(ProviderError::InvalidArgument(format!(
            "unsupported filesystem type: {other}. supported: ext4, xfs"
        ))),
    }
}

/// Formats a block device. No-op path for `virtiofs`, which is never
/// formatted by the node.
pub fn format_device(device: &str, fs_type: &str) -> Result<()> {
    info!(device, fs_type, "formatting device");
    let mkfs_bin = match fs_type.to_lowercase().as_str() {
        "ext4" => "mkfs.ext4",
        "xfs" => "mkfs.xfs",
        other => {
            return Err(ProviderError::InvalidArgument(format!(
                "cannot format unsupported filesystem: {other}"
            )));
        }
    };
    let force_flag = if fs_type.eq_ignore_ascii_case("xfs") {
        "-f"
    } else {
        "-F"
    };
    let output = run(Command::new(mkfs_bin).args([force_flag, device]), mkfs_bin)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, "{mkfs_bin} failed");
        return Err(ProviderError::Mount(format!("{mkfs_bin} failed: {stderr}")));
    }
    Ok(())
}

/// Checks whether a device already carries a filesystem, via `blkid`.
pub fn needs_formatting(device: &str) -> Result<bool> {
    let output = run(Command::new("blkid").args(["-p", device]), "blkid")?;
    if !output.status.success() {
        return Ok(true);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(!stdout.contains("TYPE="))
}

/// Mounts `source` at `target`, creating `target` with mode 0750 first.
/// `flags` are passed as `-o` mount options when non-empty.
pub fn mount(source: &str, target: &str, fs_type: &str, flags: &[String]) -> Result<()> {
    info!(source, target, fs_type, "mounting");
    create_dir(target)?;

    let mut cmd = Command::new("mount");
    cmd.args(["-t", fs_type]);
    if !flags.is_empty() {
        cmd.args(["-o", &flags.join(",")]);
    }
    cmd.args([source, target]);

    let output = run(&mut cmd, "mount")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, "mount failed");
        return Err(ProviderError::Mount(format!("mount failed: {stderr}")));
    }
    Ok(())
}

/// Bind-mounts `source` onto `target`, matching NodePublishVolume's
/// `["bind"] + mount_flags` per spec.md §4.3.3.
pub fn bind_mount(source: &str, target: &str, flags: &[String], readonly: bool) -> Result<()> {
    info!(source, target, readonly, "bind mounting");
    create_dir(target)?;

    let mut opts = vec!["bind".to_string()];
    opts.extend(flags.iter().cloned());
    if readonly {
        opts.push("ro".to_string());
    }

    let output = run(
        Command::new("mount").args(["-o", &opts.join(","), source, target]),
        "mount --bind",
    )?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, "bind mount failed");
        return Err(ProviderError::Mount(format!("bind mount failed: {stderr}")));
    }
    Ok(())
}

fn create_dir(target: &str) -> Result<()> {
    std::fs::create_dir_all(target)?;
    let mut perms = std::fs::metadata(target)?.permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o750);
    std::fs::set_permissions(target, perms)?;
    Ok(())
}

/// Finds the device backing a mount point via `/proc/mounts`, used by
/// NodeExpandVolume per spec.md §4.3.6 ("look up the device under
/// volume_path via the mount table").
pub fn device_for_mount(target: &str) -> Result<String> {
    let mounts = std::fs::read_to_string("/proc/mounts")?;
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            (mount_point == target).then(|| device.to_string())
        })
        .next()
        .ok_or_else(|| ProviderError::Mount(format!("{target} is not mounted")))
}

pub fn is_mounted(target: &str) -> Result<bool> {
    if let Ok(mounts) = std::fs::read_to_string("/proc/mounts") {
        return Ok(mounts
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(target)));
    }
    let output = run(Command::new("findmnt").args(["-o", "TARGET", target]), "findmnt")?;
    Ok(output.status.success())
}

pub fn unmount(target: &str) -> Result<()> {
    info!(target, "unmounting");
    if !is_mounted(target)? {
        debug!(target, "already not mounted");
        return Ok(());
    }
    let output = run(Command::new("umount").arg(target), "umount")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not mounted") || stderr.contains("no mount point") {
            warn!(target, "was not mounted");
            return Ok(());
        }
        error!(stderr = %stderr, "umount failed");
        return Err(ProviderError::Mount(format!("umount failed: {stderr}")));
    }
    Ok(())
}

/// Unmounts (if mounted) then removes the directory. Shared by
/// NodeUnstageVolume and NodeUnpublishVolume per spec.md §4.3.2/4.3.4.
pub fn cleanup_mount_point(path: &str) -> Result<()> {
    unmount(path)?;
    match std::fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Grows the filesystem on `device` mounted at `path` to fill the
/// device, used by NodeStageVolume (idempotent online grow) and
/// NodeExpandVolume.
pub fn resize(device: &str, path: &str, fs_type: &str) -> Result<()> {
    info!(device, path, fs_type, "resizing filesystem");
    let (bin, args): (&str, Vec<&str>) = match fs_type.to_lowercase().as_str() {
        "xfs" => ("xfs_growfs", vec![path]),
        _ => ("resize2fs", vec![device]),
    };
    let output = run(Command::new(bin).args(&args), bin)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, "{bin} failed");
        return Err(ProviderError::Mount(format!("{bin} failed: {stderr}")));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeStats {
    pub total_bytes: i64,
    pub available_bytes: i64,
    pub used_bytes: i64,
    pub total_inodes: i64,
    pub available_inodes: i64,
    pub used_inodes: i64,
}

/// Stats a mounted volume via `df`/`stat -f`-style reporting, matching
/// the teacher's preference for shelling out to existing host tools
/// over linking `libc` directly for a single syscall.
pub fn stats(volume_path: &str) -> Result<VolumeStats> {
    let bytes_out = run(
        Command::new("stat").args(["-f", "-c", "%S %b %f %a", volume_path]),
        "stat",
    )?;
    if !bytes_out.status.success() {
        let stderr = String::from_utf8_lossy(&bytes_out.stderr);
        return Err(ProviderError::Mount(format!("stat failed: {stderr}")));
    }
    let stdout = String::from_utf8_lossy(&bytes_out.stdout);
    let fields: Vec<&str> = stdout.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(ProviderError::Mount(format!(
            "unexpected stat output: {stdout}"
        )));
    }
    let block_size: i64 = fields[0].parse().unwrap_or(0);
    let total_blocks: i64 = fields[1].parse().unwrap_or(0);
    let free_blocks: i64 = fields[2].parse().unwrap_or(0);
    let avail_blocks: i64 = fields[3].parse().unwrap_or(0);

    let inode_out = run(
        Command::new("stat").args(["-f", "-c", "%c %d", volume_path]),
        "stat",
    )?;
    let inode_stdout = String::from_utf8_lossy(&inode_out.stdout);
    let inode_fields: Vec<&str> = inode_stdout.split_whitespace().collect();
    let (total_inodes, free_inodes) = if inode_fields.len() >= 2 {
        (
            inode_fields[0].parse::<i64>().unwrap_or(0),
            inode_fields[1].parse::<i64>().unwrap_or(0),
        )
    } else {
        (0, 0)
    };

    Ok(VolumeStats {
        total_bytes: total_blocks * block_size,
        available_bytes: avail_blocks * block_size,
        used_bytes: (total_blocks - free_blocks) * block_size,
        total_inodes,
        available_inodes: free_inodes,
        used_inodes: total_inodes - free_inodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_fs_type_defaults_empty_to_ext4() {
        assert_eq!(validate_fs_type("").unwrap(), "ext4");
    }

    #[test]
    fn validate_fs_type_accepts_xfs() {
        assert_eq!(validate_fs_type("xfs").unwrap(), "xfs");
    }

    #[test]
    fn validate_fs_type_rejects_unknown() {
        assert!(validate_fs_type("zfs").is_err());
    }

    #[test]
    fn cleanup_mount_point_on_missing_path_is_success() {
        // path doesn't exist and isn't mounted: unmount no-ops, remove_dir
        // returns NotFound which is treated as success.
        let res = cleanup_mount_point("/nonexistent/path/for/test/only");
        assert!(res.is_ok());
    }
}
