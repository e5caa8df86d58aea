//! Attachment resolver (component F): a read-only cache over the
//! `MountpointPodAttachment` custom resource, indexed by the fields the
//! node plugin matches mounts on.
//!
//! The upstream controller populates these records; Kubernetes CRDs can't
//! express arbitrary field-equality selectors the way the core API's
//! built-in types can, so this cache indexes by label instead (the
//! controller stamps the same fields onto the object's labels that it
//! writes into `spec`) and still calls it a "selector" to match the
//! resolution algorithm's shape.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::{Api, Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{MountError, Result};

/// One `(workload-pod-uid, attachment-time)` pair recorded against a helper
/// pod in an attachment record (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct WorkloadAttachment {
    pub workload_pod_uid: String,
    pub attachment_time: String,
}

/// `MountpointPodAttachment.spec` (spec §3, "Helper-Pod Attachment record").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, CustomResource)]
#[kube(
    group = "s3.csi.aws.com",
    version = "v1",
    kind = "MountpointPodAttachment",
    plural = "mountpointpodattachments",
    singular = "mountpointpodattachment",
    shortname = "mpa",
    namespaced = false
)]
pub struct MountpointPodAttachmentSpec {
    pub node_name: String,
    pub persistent_volume_name: String,
    pub volume_id: String,
    pub mount_options: String,
    pub authentication_source: String,
    pub workload_fs_group: Option<String>,
    pub workload_namespace: Option<String>,
    pub workload_service_account_name: Option<String>,
    pub workload_service_account_role_arn: Option<String>,
    /// `helper-pod-name -> [{workload-pod-uid, attachment-time}]`.
    pub mountpoint_s3_pod_attachments: BTreeMap<String, Vec<WorkloadAttachment>>,
}

/// The match fields the controller mirrors onto object labels so the node
/// can select attachment records without a field selector. Role ARN is
/// intentionally excluded: the node consumes it from the record, it never
/// knows the expected value in advance (spec §4.F).
#[derive(Debug, Clone)]
pub struct MatchFields {
    pub node_name: String,
    pub persistent_volume_name: String,
    pub volume_id: String,
    pub mount_options: String,
    pub authentication_source: String,
    pub workload_namespace: Option<String>,
    pub workload_service_account_name: Option<String>,
    pub fs_group: Option<String>,
}

const LABEL_NODE_NAME: &str = "s3.csi.aws.com/node-name";
const LABEL_PV_NAME: &str = "s3.csi.aws.com/persistent-volume-name";
const LABEL_VOLUME_ID: &str = "s3.csi.aws.com/volume-id";
const LABEL_MOUNT_OPTIONS_HASH: &str = "s3.csi.aws.com/mount-options-hash";
const LABEL_AUTH_SOURCE: &str = "s3.csi.aws.com/authentication-source";
const LABEL_WORKLOAD_NAMESPACE: &str = "s3.csi.aws.com/workload-namespace";
const LABEL_WORKLOAD_SERVICE_ACCOUNT: &str = "s3.csi.aws.com/workload-service-account";
const LABEL_FS_GROUP: &str = "s3.csi.aws.com/workload-fs-group";

impl MatchFields {
    fn label_selector(&self) -> String {
        let mut parts = vec![
            format!("{LABEL_NODE_NAME}={}", self.node_name),
            format!("{LABEL_PV_NAME}={}", self.persistent_volume_name),
            format!("{LABEL_VOLUME_ID}={}", self.volume_id),
            format!("{LABEL_MOUNT_OPTIONS_HASH}={}", mount_options_hash(&self.mount_options)),
            format!("{LABEL_AUTH_SOURCE}={}", self.authentication_source),
        ];
        if let Some(ns) = &self.workload_namespace {
            parts.push(format!("{LABEL_WORKLOAD_NAMESPACE}={ns}"));
        }
        if let Some(sa) = &self.workload_service_account_name {
            parts.push(format!("{LABEL_WORKLOAD_SERVICE_ACCOUNT}={sa}"));
        }
        if let Some(fg) = &self.fs_group {
            parts.push(format!("{LABEL_FS_GROUP}={fg}"));
        }
        parts.join(",")
    }
}

/// A short, label-safe digest of a (potentially long, punctuation-bearing)
/// mount-options string, for use as a label value.
fn mount_options_hash(mount_options: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    mount_options.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// How long the resolution loop polls before giving up (spec §4.F: "bounded
/// by a mount-level deadline; default ~15 s").
pub const DEFAULT_RESOLVE_DEADLINE: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Resolves which helper pod serves a workload mount by listing attachment
/// records matching `fields`, then scanning each record's attachment map
/// for `workload_pod_uid`. Polls at a fixed interval until `deadline`
/// elapses (spec §4.F).
#[instrument(level = "debug", skip(client, fields), fields(volume_id = %fields.volume_id, workload_pod_uid = %workload_pod_uid))]
pub async fn resolve(
    client: &Client,
    fields: &MatchFields,
    workload_pod_uid: &str,
    deadline: Duration,
) -> Result<(MountpointPodAttachmentSpec, String)> {
    let api: Api<MountpointPodAttachment> = Api::all(client.clone());
    let selector = fields.label_selector();
    let list_params = kube::api::ListParams::default().labels(&selector);

    let deadline_at = tokio::time::Instant::now() + deadline;
    loop {
        let list = api.list(&list_params).await.map_err(MountError::from)?;
        for record in &list.items {
            for (helper_pod_name, attachments) in &record.spec.mountpoint_s3_pod_attachments {
                if attachments.iter().any(|a| a.workload_pod_uid == workload_pod_uid) {
                    return Ok((record.spec.clone(), helper_pod_name.clone()));
                }
            }
        }

        if tokio::time::Instant::now() >= deadline_at {
            return Err(MountError::not_found(
                "attachment.resolve",
                format!("no attachment record found for volume {} within the mount deadline", fields.volume_id),
            ));
        }
        tokio::time::sleep(POLL_INTERVAL.min(deadline_at.saturating_duration_since(tokio::time::Instant::now()))).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn label_selector_omits_role_arn_and_includes_pod_auth_fields() {
        let fields = MatchFields {
            node_name: "node-1".to_string(),
            persistent_volume_name: "pv-1".to_string(),
            volume_id: "vol-1".to_string(),
            mount_options: "--read-only".to_string(),
            authentication_source: "pod".to_string(),
            workload_namespace: Some("default".to_string()),
            workload_service_account_name: Some("app-sa".to_string()),
            fs_group: Some("1000".to_string()),
        };
        let selector = fields.label_selector();
        assert!(selector.contains("node-name=node-1"));
        assert!(selector.contains("workload-namespace=default"));
        assert!(selector.contains("workload-service-account=app-sa"));
        assert!(selector.contains("workload-fs-group=1000"));
        assert!(!selector.contains("role-arn"));
    }

    #[test]
    fn label_selector_omits_fs_group_when_absent() {
        let fields = MatchFields {
            node_name: "node-1".to_string(),
            persistent_volume_name: "pv-1".to_string(),
            volume_id: "vol-1".to_string(),
            mount_options: "--read-only".to_string(),
            authentication_source: "driver".to_string(),
            workload_namespace: None,
            workload_service_account_name: None,
            fs_group: None,
        };
        assert!(!fields.label_selector().contains("fs-group"));
    }

    #[test]
    fn mount_options_hash_is_stable() {
        assert_eq!(mount_options_hash("--read-only"), mount_options_hash("--read-only"));
        assert_ne!(mount_options_hash("--read-only"), mount_options_hash("--allow-other"));
    }
}
