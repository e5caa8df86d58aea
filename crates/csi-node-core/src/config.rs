//! The configuration needed for the node plugin to run. Values are sourced
//! from the environment variables the driver's DaemonSet injects (spec §6,
//! "Environment variables read"); [`Config::from_env`] applies the same
//! defaults the upstream driver ships with.

use std::path::PathBuf;

/// Node-plugin-wide configuration, analogous to the teacher's `Config`.
#[derive(Clone, Debug)]
pub struct Config {
    /// Root of the kubelet's working directory on the host, e.g. `/var/lib/kubelet`.
    pub kubelet_path: PathBuf,
    /// Path to the `mount-s3` binary, used only by the Service Mounter (4.J).
    pub mount_s3_path: PathBuf,
    /// Host directory under which `<driver>/mnt/<helper-pod-name>` source
    /// mounts are created (spec §3, "Source mount directory").
    pub host_plugin_dir: PathBuf,
    /// Driver name used both as a directory component and in `--user-agent-prefix`.
    pub driver_name: String,
    /// Informer/attachment-cache namespace restriction. Empty means all namespaces.
    pub mountpoint_namespace: String,
    /// Feature switch gating the legacy Service Mounter (4.J) vs the Pod Mounter (4.H).
    pub support_legacy_systemd_mounts: bool,
    /// Driver version stamped into `--user-agent-prefix`.
    pub driver_version: String,
    /// Local node name, used to filter the helper-pod informer and attachment queries.
    pub node_name: String,
}

impl Config {
    /// Reads configuration from the process environment, applying the same
    /// defaults as the upstream DaemonSet manifests.
    pub fn from_env() -> anyhow::Result<Self> {
        let kubelet_path = env_path_or("KUBELET_PATH", "/var/lib/kubelet");
        let mount_s3_path = env_path_or("MOUNT_S3_PATH", "/usr/bin/mount-s3");
        let host_plugin_dir = match std::env::var("HOST_PLUGIN_DIR") {
            Ok(v) => PathBuf::from(v),
            Err(_) => kubelet_path.join("plugins").join(DRIVER_NAME),
        };
        let node_name = std::env::var("CSI_NODE_NAME")
            .or_else(|_| std::env::var("NODE_NAME"))
            .map_err(|_| anyhow::anyhow!("NODE_NAME (or CSI_NODE_NAME) must be set"))?;

        Ok(Config {
            kubelet_path,
            mount_s3_path,
            host_plugin_dir,
            driver_name: DRIVER_NAME.to_string(),
            mountpoint_namespace: std::env::var("MOUNTPOINT_NAMESPACE")
                .unwrap_or_else(|_| "mount-s3".to_string()),
            support_legacy_systemd_mounts: env_bool("SUPPORT_LEGACY_SYSTEMD_MOUNTS", false),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            node_name,
        })
    }

    /// `<kubelet>/plugins/<driver>/mnt/<helper-pod-name>` (spec §3, "Source mount directory").
    pub fn source_mount_root(&self) -> PathBuf {
        self.host_plugin_dir.join("mnt")
    }
}

pub const DRIVER_NAME: &str = "s3.csi.aws.com";

fn env_path_or(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_bool_parses_common_truthy_spellings() {
        std::env::set_var("CSI_TEST_BOOL", "TRUE");
        assert!(env_bool("CSI_TEST_BOOL", false));
        std::env::set_var("CSI_TEST_BOOL", "0");
        assert!(!env_bool("CSI_TEST_BOOL", true));
        std::env::remove_var("CSI_TEST_BOOL");
    }

    #[test]
    fn source_mount_root_is_driver_scoped() {
        let cfg = Config {
            kubelet_path: PathBuf::from("/var/lib/kubelet"),
            mount_s3_path: PathBuf::from("/usr/bin/mount-s3"),
            host_plugin_dir: PathBuf::from("/var/lib/kubelet/plugins/s3.csi.aws.com"),
            driver_name: DRIVER_NAME.to_string(),
            mountpoint_namespace: "mount-s3".to_string(),
            support_legacy_systemd_mounts: false,
            driver_version: "1.0.0".to_string(),
            node_name: "node-1".to_string(),
        };
        assert_eq!(
            cfg.source_mount_root(),
            PathBuf::from("/var/lib/kubelet/plugins/s3.csi.aws.com/mnt")
        );
    }
}
