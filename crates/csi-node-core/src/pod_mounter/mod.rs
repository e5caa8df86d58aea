//! Pod Mounter (component H): orchestrates the full mount protocol against
//! a pre-launched helper pod — resolving which helper pod serves a
//! workload mount, obtaining a FUSE fd, handing it to the helper, and
//! bind-mounting the source to the workload's target (spec §4.H).

use std::collections::BTreeMap;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tracing::{instrument, warn};

use crate::args::ArgumentSet;
use crate::attachment::{self, MatchFields};
use crate::config::Config;
use crate::credentials::{self, AuthenticationSource, CleanupContext, ProvideContext, CREDENTIALS_DIR_MODE};
use crate::env::EnvironmentSet;
use crate::error::{MountError, Result};
use crate::locks::LockTable;
use crate::mount;
use crate::paths::{self, HelperPodHostPaths, HelperPodViewPaths};
use crate::socket::{self, MountOptionsEnvelope};
use crate::watcher::HelperPodWatcher;

/// How long `Mount` waits, in total, for the helper pod to become
/// available and ready before giving up (spec §5: "default ~15 s").
pub const DEFAULT_MOUNT_DEADLINE: Duration = Duration::from_secs(15);
/// Poll interval used while racing `IsMountPoint(source)` against the
/// appearance of `mount.error` (spec §5, `waitForMount`).
const WAIT_FOR_MOUNT_POLL: Duration = Duration::from_millis(200);
const TARGET_DIR_MODE: u32 = 0o755;

/// One workload mount request, as handed down from the (out-of-scope) CSI
/// layer (spec §6, "To the CSI layer").
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub bucket: String,
    pub target: PathBuf,
    pub pod_uid: String,
    pub volume_id: String,
    pub auth_source: AuthenticationSource,
    pub workload_namespace: Option<String>,
    pub service_account_name: Option<String>,
    /// Raw JSON service-account token bundle (spec §3); parsed by
    /// `credentials::pod::provide` only when `auth_source` is `Pod`.
    pub service_account_tokens: String,
    pub workload_role_arn: Option<String>,
    pub sts_region_override: Option<String>,
    pub bucket_region: Option<String>,
    pub container_credentials_uri: Option<String>,
    pub static_secret: Option<BTreeMap<String, String>>,
    pub args: ArgumentSet,
    pub fs_group: Option<String>,
}

pub struct PodMounter {
    config: Config,
    client: Client,
    watcher: Arc<HelperPodWatcher>,
    locks: Arc<LockTable>,
}

impl PodMounter {
    pub fn new(config: Config, client: Client, watcher: Arc<HelperPodWatcher>, locks: Arc<LockTable>) -> Self {
        PodMounter { config, client, watcher, locks }
    }

    #[instrument(level = "info", skip(self, req), fields(target = %req.target.display(), bucket = %req.bucket))]
    pub async fn mount(&self, req: &MountRequest) -> Result<()> {
        let pv_name = paths::pv_name_from_target(&req.target)
            .ok_or_else(|| MountError::invalid_input("pod_mounter.mount", "target path does not contain a PV name component").with_target(&req.target))?;

        if mount::check_mountpoint(&req.target).unwrap_or(false) {
            let source_root = self.config.source_mount_root();
            if mount::find_source_mount_point(&req.target, &source_root).map_err(|e| e.with_target(&req.target))?.is_none() {
                return self.refresh_legacy_mount_credentials(req).await;
            }
        }

        let mut args = req.args.clone();
        args.apply_policy();

        let fields = MatchFields {
            node_name: self.config.node_name.clone(),
            persistent_volume_name: pv_name,
            volume_id: req.volume_id.clone(),
            mount_options: args.sorted_list().join(" "),
            authentication_source: auth_source_label(req.auth_source).to_string(),
            workload_namespace: req.workload_namespace.clone(),
            workload_service_account_name: req.service_account_name.clone(),
            fs_group: req.fs_group.clone(),
        };
        let (_attachment, helper_pod_name) =
            attachment::resolve(&self.client, &fields, &req.pod_uid, attachment::DEFAULT_RESOLVE_DEADLINE).await?;

        let helper_pod = self
            .watcher
            .wait_running(&helper_pod_name, DEFAULT_MOUNT_DEADLINE)
            .await
            .map_err(|e| e.with_helper_pod(&helper_pod_name).with_kubectl_hint(&self.config.mountpoint_namespace, &helper_pod_name))?;
        let helper_pod_uid = helper_pod
            .metadata
            .uid
            .clone()
            .ok_or_else(|| MountError::internal("pod_mounter.mount", "helper pod object has no UID").with_helper_pod(&helper_pod_name))?;

        let _guard = self.locks.lock(&helper_pod_name).await;

        let source = paths::source_mount_path(&self.config, &helper_pod_name);
        verify_or_create_mount_dir(&source)?;
        verify_or_create_mount_dir(&req.target)?;

        let host_paths = HelperPodHostPaths::new(&self.config, &helper_pod_uid);
        let view_paths = HelperPodViewPaths::new();
        mount::ensure_dir(&host_paths.credentials_dir(), CREDENTIALS_DIR_MODE)?;

        let provide_ctx = ProvideContext {
            write_dir: host_paths.credentials_dir(),
            view_dir: view_paths.credentials_dir(),
            pod_uid: req.pod_uid.clone(),
            volume_id: req.volume_id.clone(),
            auth_source: req.auth_source,
            workload_namespace: req.workload_namespace.clone(),
            service_account_name: req.service_account_name.clone(),
            service_account_tokens: req.service_account_tokens.clone(),
            workload_role_arn: req.workload_role_arn.clone(),
            sts_region_override: req.sts_region_override.clone(),
            bucket_region: req.bucket_region.clone(),
            container_credentials_uri: req.container_credentials_uri.clone(),
            static_secret: req.static_secret.clone(),
        };
        let (cred_env, auth_source) = credentials::provide(&provide_ctx, Some(&self.client))
            .await
            .map_err(|e| e.with_helper_pod(&helper_pod_name))?;

        if mount::find_source_mount_point(&req.target, &self.config.source_mount_root())
            .map_err(|e| e.with_target(&req.target))?
            .is_some()
        {
            // Target is already bind-mounted from this source; credentials
            // have just been refreshed above, nothing else to do.
            return Ok(());
        }

        if !mount::check_mountpoint(&source).unwrap_or(false) {
            self.establish_source_mount(req, &args, &source, &helper_pod_name, &cred_env, auth_source).await?;
        }

        mount::bind_mount(&source, &req.target).map_err(|e| e.with_target(&req.target).with_helper_pod(&helper_pod_name))
    }

    async fn establish_source_mount(
        &self,
        req: &MountRequest,
        policied_args: &ArgumentSet,
        source: &Path,
        helper_pod_name: &str,
        cred_env: &EnvironmentSet,
        auth_source: AuthenticationSource,
    ) -> Result<()> {
        let mut env = EnvironmentSet::default_from_process();
        env.merge(cred_env);

        let mut args = policied_args.clone();
        args.move_max_attempts_to_env(&mut env);
        args.remove("read-only");
        let k8s_version = crate::version::kubernetes_server_version(&self.client).await;
        args.set("user-agent-prefix", user_agent_prefix(&self.config.driver_version, auth_source, &k8s_version));

        let host_paths = HelperPodHostPaths::new(&self.config, helper_pod_name);
        let _ = std::fs::remove_file(host_paths.mount_error());

        let read_only = req.args.has("read-only");
        let fuse_fd = mount::mount_fuse(source, read_only).map_err(|e| e.with_helper_pod(helper_pod_name))?;

        let args_list = args.sorted_list();
        let env_list = env.sorted_list();
        let envelope = MountOptionsEnvelope { bucket: &req.bucket, args: &args_list, env: &env_list };
        let send_result = socket::send_mount_options(&host_paths.mount_sock(), fuse_fd.as_raw_fd(), &envelope);
        // `send_mount_options` duplicates the fd into the SCM_RIGHTS message;
        // our local copy is closed unconditionally here (spec §4.H step 10).
        drop(fuse_fd);

        if let Err(e) = send_result {
            let _ = mount::force_unmount(source);
            return Err(e.with_helper_pod(helper_pod_name).with_target(source));
        }

        if let Err(e) = self.wait_for_mount(source, &host_paths.mount_error()).await {
            let _ = mount::force_unmount(source);
            return Err(e.with_helper_pod(helper_pod_name).with_target(source));
        }

        Ok(())
    }

    /// Races an `IsMountPoint(source)` poller against the appearance of
    /// `mount.error`; whichever settles first wins (spec §5).
    async fn wait_for_mount(&self, source: &Path, mount_error_path: &Path) -> Result<()> {
        tokio::time::timeout(DEFAULT_MOUNT_DEADLINE, async {
            loop {
                if mount::check_mountpoint(source).unwrap_or(false) {
                    return Ok(());
                }
                if let Ok(contents) = std::fs::read(mount_error_path) {
                    if !contents.is_empty() {
                        return Err(MountError::internal(
                            "pod_mounter.mount",
                            format!("helper pod reported a mount failure: {}", String::from_utf8_lossy(&contents)),
                        ));
                    }
                }
                tokio::time::sleep(WAIT_FOR_MOUNT_POLL).await;
            }
        })
        .await
        .unwrap_or_else(|_| Err(MountError::internal("pod_mounter.mount", "timed out waiting for helper pod to establish the mount")))
    }

    async fn refresh_legacy_mount_credentials(&self, req: &MountRequest) -> Result<()> {
        let write_dir = self.config.host_plugin_dir.clone();
        let provide_ctx = ProvideContext {
            write_dir: write_dir.clone(),
            view_dir: write_dir,
            pod_uid: req.pod_uid.clone(),
            volume_id: req.volume_id.clone(),
            auth_source: req.auth_source,
            workload_namespace: req.workload_namespace.clone(),
            service_account_name: req.service_account_name.clone(),
            service_account_tokens: req.service_account_tokens.clone(),
            workload_role_arn: req.workload_role_arn.clone(),
            sts_region_override: req.sts_region_override.clone(),
            bucket_region: req.bucket_region.clone(),
            container_credentials_uri: req.container_credentials_uri.clone(),
            static_secret: req.static_secret.clone(),
        };
        credentials::provide(&provide_ctx, Some(&self.client)).await?;
        Ok(())
    }

    /// `Unmount(target, cleanupCtx)`: unmounts `target`. If it turns out to
    /// have been a legacy service mount, also runs the credential broker's
    /// `Cleanup`; pod-served mounts are left to the Pod Unmounter.
    #[instrument(level = "info", skip(self, cleanup_ctx), fields(target = %target.display()))]
    pub async fn unmount(&self, target: &Path, cleanup_ctx: &CleanupContext) -> Result<()> {
        let was_legacy = mount::check_mountpoint(target).unwrap_or(false)
            && mount::find_source_mount_point(target, &self.config.source_mount_root()).map_err(|e| e.with_target(target))?.is_none();

        mount::unmount(target).map_err(|e| e.with_target(target))?;

        if was_legacy {
            credentials::cleanup(cleanup_ctx)?;
        }
        Ok(())
    }

    pub fn is_mount_point(&self, target: &Path) -> Result<bool> {
        mount::check_mountpoint(target)
    }
}

fn verify_or_create_mount_dir(path: &Path) -> Result<()> {
    match nix::sys::stat::stat(path) {
        Ok(stat) if (stat.st_mode & libc::S_IFMT) == libc::S_IFDIR => {
            if let Err(e) = mount::check_mountpoint(path) {
                if mount::is_mountpoint_corrupted(&e) {
                    warn!(path = %path.display(), "unmounting corrupted mount before reuse");
                    mount::force_unmount(path).map_err(|e| e.with_target(path))?;
                } else {
                    return Err(e.with_target(path));
                }
            }
            Ok(())
        }
        Ok(_) => Err(MountError::internal("pod_mounter.mount", format!("{} exists and is not a directory", path.display())).with_target(path)),
        Err(nix::Error::ENOENT) => mount::ensure_dir(path, TARGET_DIR_MODE).map_err(|e| e.with_target(path)),
        Err(e) => Err(MountError::from(e).with_target(path)),
    }
}

fn auth_source_label(source: AuthenticationSource) -> &'static str {
    match source {
        AuthenticationSource::Driver => "driver",
        AuthenticationSource::Pod => "pod",
        AuthenticationSource::Secret => "secret",
    }
}

/// `s3-csi-driver/<ver> credential-source#<src> k8s/<ver>` (spec §6,
/// mount-option policy table: `--user-agent-prefix` is always overwritten).
fn user_agent_prefix(driver_version: &str, auth_source: AuthenticationSource, k8s_version: &str) -> String {
    format!("s3-csi-driver/{driver_version} credential-source#{} k8s/{k8s_version}", auth_source_label(auth_source))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn user_agent_prefix_names_driver_version_auth_source_and_k8s_version() {
        let prefix = user_agent_prefix("1.0.0", AuthenticationSource::Pod, "v1.30.2");
        assert!(prefix.contains("1.0.0"));
        assert!(prefix.contains("credential-source#pod"));
        assert!(prefix.contains("k8s/v1.30.2"));
    }
}
