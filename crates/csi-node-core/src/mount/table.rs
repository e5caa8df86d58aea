//! Parses `/proc/self/mountinfo` to answer two questions: "is this path a
//! Mountpoint mount?" and "which mounted path under `root` corresponds to
//! this target's (dev, ino)?" (spec §4.C).

use std::path::{Path, PathBuf};

use crate::error::MountError;

const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// One parsed row of `/proc/self/mountinfo`. Only the fields this module
/// needs are kept; see `proc(5)` for the full format.
#[derive(Debug, Clone)]
struct MountInfoEntry {
    mount_point: String,
    /// The filesystem-specific device name/source, e.g. `mountpoint-s3`.
    mount_source: String,
}

fn parse_mountinfo(contents: &str) -> Vec<MountInfoEntry> {
    let mut entries = Vec::new();
    for line in contents.lines() {
        // Format: `<id> <parent> <major:minor> <root> <mount_point> <opts> <tags...> - <fstype> <source> <super opts>`
        // The separator field is a literal "-"; everything after it is the
        // fstype/source/super-options triple.
        let Some(dash_idx) = line.split_whitespace().position(|f| f == "-") else {
            continue;
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < dash_idx + 3 {
            continue;
        }
        let mount_point = fields.get(4).copied().unwrap_or_default().to_string();
        let mount_source = fields[dash_idx + 2].to_string();
        entries.push(MountInfoEntry { mount_point, mount_source });
    }
    entries
}

/// Returns `true` if `target` is mounted with device name `mountpoint-s3`.
pub(super) fn is_mountpoint_s3_mount(target: &Path) -> Result<bool, MountError> {
    let contents = std::fs::read_to_string(MOUNTINFO_PATH)
        .map_err(|e| MountError::internal("check_mountpoint", format!("reading {MOUNTINFO_PATH}: {e}")))?;
    let target = normalize(target);
    Ok(parse_mountinfo(&contents)
        .iter()
        .any(|e| e.mount_point == target && e.mount_source == "mountpoint-s3"))
}

/// Resolves `target` back to the source mount it's bind-mounted from, by
/// walking the mount table for `mountpoint-s3` entries under `root` whose
/// (dev, ino) matches `target`'s (spec §4.C, `FindSourceMountPoint`).
pub(super) fn find_source_mount_point(target: &Path, root: &Path) -> Result<Option<PathBuf>, MountError> {
    let target_stat = nix::sys::stat::stat(target)
        .map_err(|e| MountError::internal("find_source_mount_point", format!("stat {}: {e}", target.display())))?;

    let contents = std::fs::read_to_string(MOUNTINFO_PATH)
        .map_err(|e| MountError::internal("find_source_mount_point", format!("reading {MOUNTINFO_PATH}: {e}")))?;

    let root = normalize(root);
    for entry in parse_mountinfo(&contents) {
        if entry.mount_source != "mountpoint-s3" || !entry.mount_point.starts_with(&root) {
            continue;
        }
        if let Ok(stat) = nix::sys::stat::stat(Path::new(&entry.mount_point)) {
            if stat.st_dev == target_stat.st_dev && stat.st_ino == target_stat.st_ino {
                return Ok(Some(PathBuf::from(entry.mount_point)));
            }
        }
    }
    Ok(None)
}

fn normalize(path: &Path) -> String {
    path.to_string_lossy().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "\
22 28 0:21 / /sys rw,nosuid,nodev,noexec,relatime shared:2 - sysfs sysfs rw
339 28 0:56 / /var/lib/kubelet/plugins/s3.csi.aws.com/mnt/mp-1 rw,relatime - fuse mountpoint-s3 rw,user_id=0,group_id=0
340 339 0:56 / /var/lib/kubelet/pods/p1/volumes/kubernetes.io~csi/pv-1/mount rw,relatime - fuse mountpoint-s3 rw,user_id=0,group_id=0
";

    #[test]
    fn parses_mount_point_and_source() {
        let entries = parse_mountinfo(SAMPLE);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].mount_point, "/var/lib/kubelet/plugins/s3.csi.aws.com/mnt/mp-1");
        assert_eq!(entries[1].mount_source, "mountpoint-s3");
        assert_eq!(entries[0].mount_source, "sysfs");
    }
}
