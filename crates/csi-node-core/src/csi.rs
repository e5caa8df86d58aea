//! Facade presented to the CSI gRPC node service (out of scope here): a
//! single [`NodeMounter`] that dispatches every request to either the Pod
//! Mounter or the legacy Service Mounter, depending on
//! [`Config::support_legacy_systemd_mounts`] (spec §6, "To the CSI layer").
//! All three operations are idempotent on equal inputs, a property both
//! mounters already establish individually.

use std::path::Path;
use std::sync::Arc;

use kube::Client;

use crate::config::Config;
use crate::credentials::CleanupContext;
use crate::error::Result;
use crate::locks::LockTable;
use crate::pod_mounter::{MountRequest, PodMounter};
use crate::service_mounter::{ServiceMounter, ServiceMountRequest};
use crate::watcher::HelperPodWatcher;

pub struct NodeMounter {
    config: Config,
    pod_mounter: PodMounter,
    service_mounter: ServiceMounter,
}

impl NodeMounter {
    pub fn new(config: Config, client: Client, watcher: Arc<HelperPodWatcher>, locks: Arc<LockTable>) -> Self {
        let pod_mounter = PodMounter::new(config.clone(), client.clone(), watcher, locks);
        let service_mounter = ServiceMounter::new(config.clone(), client);
        NodeMounter { config, pod_mounter, service_mounter }
    }

    /// `Mount(ctx, bucket, target, provideCtx, args, fsGroup)` (spec §6).
    /// Routed to the Service Mounter only while the legacy feature switch
    /// is on; the Pod Mounter's own idempotency check already handles a
    /// target left over from a prior legacy mount regardless of the switch.
    pub async fn mount(&self, req: MountRequest) -> Result<()> {
        if self.config.support_legacy_systemd_mounts {
            self.service_mounter.mount(&ServiceMountRequest::from(req)).await
        } else {
            self.pod_mounter.mount(&req).await
        }
    }

    /// `Unmount(ctx, target, cleanupCtx)` (spec §6).
    pub async fn unmount(&self, target: &Path, cleanup: &CleanupContext) -> Result<()> {
        if self.config.support_legacy_systemd_mounts {
            self.service_mounter.unmount(target, &cleanup.pod_uid, &cleanup.volume_id).await
        } else {
            self.pod_mounter.unmount(target, cleanup).await
        }
    }

    /// `IsMountPoint(target)` (spec §6), delegating to whichever mounter's
    /// check is currently in effect.
    pub fn is_mount_point(&self, target: &Path) -> Result<bool> {
        if self.config.support_legacy_systemd_mounts {
            self.service_mounter.is_mount_point(target)
        } else {
            self.pod_mounter.is_mount_point(target)
        }
    }
}

impl From<MountRequest> for ServiceMountRequest {
    fn from(req: MountRequest) -> Self {
        ServiceMountRequest {
            bucket: req.bucket,
            target: req.target,
            pod_uid: req.pod_uid,
            volume_id: req.volume_id,
            auth_source: req.auth_source,
            workload_namespace: req.workload_namespace,
            service_account_name: req.service_account_name,
            service_account_tokens: req.service_account_tokens,
            workload_role_arn: req.workload_role_arn,
            sts_region_override: req.sts_region_override,
            bucket_region: req.bucket_region,
            container_credentials_uri: req.container_credentials_uri,
            static_secret: req.static_secret,
            args: req.args,
        }
    }
}
