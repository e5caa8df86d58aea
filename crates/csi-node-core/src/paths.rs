//! Well-known filesystem layout under a helper pod's directory (spec §3,
//! "Paths"). The node plugin and the helper pod each resolve these
//! independently from their own mount namespace's view of the same
//! directory; only the host-side constructor is used for writes performed
//! by the node plugin, while the pod-side constructor is used for values
//! embedded in environment variables handed to Mountpoint.

use std::path::{Path, PathBuf};

use crate::config::Config;

/// Directory name kubelet uses for a pod's on-host private state.
const PODS_DIR: &str = "pods";
const CREDENTIALS_DIR: &str = "credentials";
const MOUNT_SOCK: &str = "mount.sock";
const MOUNT_ERROR: &str = "mount.error";
const MOUNT_EXIT: &str = "mount.exit";

/// The fixed path a helper pod mounts its own rendezvous directory at,
/// inside its own container filesystem.
pub const HELPER_POD_MOUNT_DIR: &str = "/var/lib/mount-s3";

/// Paths rooted at `<kubelet>/pods/<helper-pod-uid>/<known-subtree>` as seen
/// from the node (host) side.
#[derive(Debug, Clone)]
pub struct HelperPodHostPaths {
    root: PathBuf,
}

impl HelperPodHostPaths {
    pub fn new(config: &Config, helper_pod_uid: &str) -> Self {
        HelperPodHostPaths {
            root: config.kubelet_path.join(PODS_DIR).join(helper_pod_uid).join("volumes/kubernetes.io~empty-dir/mount-dir"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.root.join(CREDENTIALS_DIR)
    }

    pub fn mount_sock(&self) -> PathBuf {
        self.root.join(MOUNT_SOCK)
    }

    pub fn mount_error(&self) -> PathBuf {
        self.root.join(MOUNT_ERROR)
    }

    pub fn mount_exit(&self) -> PathBuf {
        self.root.join(MOUNT_EXIT)
    }
}

/// The same subtree as seen from inside the helper pod's own filesystem
/// view, used only to build values embedded in environment variables (e.g.
/// `AWS_WEB_IDENTITY_TOKEN_FILE`) that Mountpoint will read after the fd
/// handoff.
#[derive(Debug, Clone)]
pub struct HelperPodViewPaths {
    root: PathBuf,
}

impl HelperPodViewPaths {
    pub fn new() -> Self {
        HelperPodViewPaths { root: PathBuf::from(HELPER_POD_MOUNT_DIR) }
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.root.join(CREDENTIALS_DIR)
    }
}

impl Default for HelperPodViewPaths {
    fn default() -> Self {
        Self::new()
    }
}

/// `<kubelet>/plugins/<driver>/mnt/<helper-pod-name>` (spec §3, "Source mount directory").
pub fn source_mount_path(config: &Config, helper_pod_name: &str) -> PathBuf {
    config.source_mount_root().join(helper_pod_name)
}

/// Extracts the PV name from a workload target path of the form
/// `.../volumes/kubernetes.io~csi/<pv>/mount` (spec §4.H, step 1).
pub fn pv_name_from_target(target: &Path) -> Option<String> {
    let components: Vec<_> = target.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect();
    let idx = components.iter().position(|c| c == "kubernetes.io~csi")?;
    components.get(idx + 1).cloned()
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config() -> Config {
        Config {
            kubelet_path: PathBuf::from("/var/lib/kubelet"),
            mount_s3_path: PathBuf::from("/usr/bin/mount-s3"),
            host_plugin_dir: PathBuf::from("/var/lib/kubelet/plugins/s3.csi.aws.com"),
            driver_name: "s3.csi.aws.com".to_string(),
            mountpoint_namespace: "mount-s3".to_string(),
            support_legacy_systemd_mounts: false,
            driver_version: "1.0.0".to_string(),
            node_name: "node-1".to_string(),
        }
    }

    #[test]
    fn helper_pod_host_paths_fixed_children() {
        let paths = HelperPodHostPaths::new(&test_config(), "pod-uid-123");
        assert!(paths.credentials_dir().ends_with("mount-dir/credentials"));
        assert!(paths.mount_sock().ends_with("mount.sock"));
        assert!(paths.mount_error().ends_with("mount.error"));
        assert!(paths.mount_exit().ends_with("mount.exit"));
    }

    #[test]
    fn source_mount_path_is_driver_scoped_per_helper_pod() {
        let path = source_mount_path(&test_config(), "mp-1");
        assert_eq!(path, PathBuf::from("/var/lib/kubelet/plugins/s3.csi.aws.com/mnt/mp-1"));
    }

    #[test]
    fn pv_name_from_target_extracts_pv() {
        let target = Path::new("/var/lib/kubelet/pods/abc/volumes/kubernetes.io~csi/pv-1/mount");
        assert_eq!(pv_name_from_target(target), Some("pv-1".to_string()));
    }

    #[test]
    fn pv_name_from_target_returns_none_for_unrelated_path() {
        let target = Path::new("/some/other/path");
        assert_eq!(pv_name_from_target(target), None);
    }
}
