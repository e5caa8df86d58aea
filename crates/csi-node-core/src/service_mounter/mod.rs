//! Service Mounter (component J, legacy): mounts Mountpoint directly at the
//! workload's target path as a systemd-supervised host service, for nodes
//! that haven't migrated to the Pod Mounter. Kept behind
//! `Config::support_legacy_systemd_mounts` (spec §4.J).

use std::path::{Path, PathBuf};

use kube::Client;
use tracing::instrument;
use uuid::Uuid;
use zbus::zvariant::Value;
use zbus::Connection;

use crate::args::ArgumentSet;
use crate::config::Config;
use crate::credentials::{self, AuthenticationSource, CleanupContext, MountKind, ProvideContext};
use crate::error::{MountError, Result};
use crate::mount;

const START_MODE: &str = "replace";
const TARGET_DIR_MODE: u32 = 0o755;

/// One mount request's inputs for the legacy path. Unlike the Pod Mounter,
/// there is no helper pod and no per-volume lock table entry beyond the
/// unit name systemd itself serializes on.
#[derive(Debug, Clone)]
pub struct ServiceMountRequest {
    pub bucket: String,
    pub target: PathBuf,
    pub pod_uid: String,
    pub volume_id: String,
    pub auth_source: AuthenticationSource,
    pub workload_namespace: Option<String>,
    pub service_account_name: Option<String>,
    pub service_account_tokens: String,
    pub workload_role_arn: Option<String>,
    pub sts_region_override: Option<String>,
    pub bucket_region: Option<String>,
    pub container_credentials_uri: Option<String>,
    pub static_secret: Option<std::collections::BTreeMap<String, String>>,
    pub args: ArgumentSet,
}

pub struct ServiceMounter {
    config: Config,
    client: Client,
}

impl ServiceMounter {
    pub fn new(config: Config, client: Client) -> Self {
        ServiceMounter { config, client }
    }

    /// Creates/repairs `target`, provides credentials at the host plugin
    /// directory, and starts a transient systemd unit running Mountpoint
    /// directly at `target`. A no-op if `target` is already a Mountpoint
    /// mount (spec §4.J).
    #[instrument(level = "info", skip(self, req), fields(bucket = %req.bucket, target = %req.target.display()))]
    pub async fn mount(&self, req: &ServiceMountRequest) -> Result<()> {
        mount::ensure_dir(&req.target, TARGET_DIR_MODE)?;

        if mount::check_mountpoint(&req.target).unwrap_or(false) {
            return Ok(());
        }

        let provide_ctx = ProvideContext {
            write_dir: self.config.host_plugin_dir.clone(),
            view_dir: self.config.host_plugin_dir.clone(),
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
        let (cred_env, _) = credentials::provide(&provide_ctx, Some(&self.client)).await?;

        let mut env = crate::env::EnvironmentSet::default_from_process();
        env.merge(&cred_env);

        let mut args = req.args.clone();
        args.move_max_attempts_to_env(&mut env);
        args.apply_policy();

        let mut argv = vec![self.config.mount_s3_path.to_string_lossy().to_string()];
        argv.extend(args.sorted_list());
        argv.push(req.bucket.clone());
        argv.push(req.target.to_string_lossy().to_string());

        let unit_name = format!("mount-s3-{}-{}.service", self.config.driver_version, Uuid::new_v4());
        start_transient_unit(&unit_name, &argv, &env.sorted_list()).await.map_err(|e| {
            MountError::internal("service_mounter.mount", format!("starting {unit_name}: {e}")).with_target(&req.target)
        })
    }

    /// Unmounts `target` and removes every credential artifact the broker
    /// wrote for it; the legacy path never shares a helper pod to defer
    /// cleanup to (spec §4.J, §4.H step 2).
    #[instrument(level = "info", skip(self))]
    pub async fn unmount(&self, target: &Path, pod_uid: &str, volume_id: &str) -> Result<()> {
        mount::unmount(target)?;
        let cleanup_ctx = CleanupContext {
            write_dir: self.config.host_plugin_dir.clone(),
            pod_uid: pod_uid.to_string(),
            volume_id: volume_id.to_string(),
            mount_kind: MountKind::Service,
        };
        credentials::cleanup(&cleanup_ctx)
    }

    pub fn is_mount_point(&self, target: &Path) -> Result<bool> {
        mount::check_mountpoint(target)
    }
}

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait SystemdManager {
    fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: Vec<(&str, Value<'_>)>,
        aux: Vec<(&str, Vec<(&str, Value<'_>)>)>,
    ) -> zbus::Result<zbus::zvariant::OwnedObjectPath>;
}

/// Asks the host's systemd (over the system D-Bus) to start a transient
/// unit running `argv[0]` with `argv[1..]`, with `env` as its process
/// environment (spec §4.J: "transient unit ... with the Mountpoint binary
/// as ExecPath").
async fn start_transient_unit(unit_name: &str, argv: &[String], env: &[String]) -> zbus::Result<()> {
    let connection = Connection::system().await?;
    let manager = SystemdManagerProxy::new(&connection).await?;

    let exec_path = argv[0].clone();
    let exec_start = vec![(exec_path, argv.to_vec(), false)];
    let properties: Vec<(&str, Value<'_>)> =
        vec![("ExecStart", Value::from(exec_start)), ("Environment", Value::from(env.to_vec())), ("Type", Value::from("simple"))];

    manager.start_transient_unit(unit_name, START_MODE, properties, Vec::new()).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unit_name_is_versioned_and_unique() {
        let a = format!("mount-s3-{}-{}.service", "1.0.0", Uuid::new_v4());
        let b = format!("mount-s3-{}-{}.service", "1.0.0", Uuid::new_v4());
        assert_ne!(a, b);
        assert!(a.starts_with("mount-s3-1.0.0-"));
    }
}
