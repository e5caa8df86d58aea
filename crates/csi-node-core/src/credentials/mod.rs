//! Credential broker (component D): resolves AWS credentials from one of
//! three sources (`driver`, `pod`, `secret`) and serializes them to the
//! per-volume write path so a Mountpoint process can pick them up after
//! the FUSE fd handoff.

mod driver;
mod files;
mod imds;
mod pod;
mod secret;

use std::collections::BTreeMap;
use std::path::PathBuf;

use kube::Client;
use tracing::instrument;

use crate::env::EnvironmentSet;
use crate::error::{MountError, Result};

pub use files::CREDENTIALS_DIR_MODE;
pub use pod::{parse_token_bundle, TokenBundle, TokenClaim, POD_IDENTITY_AUDIENCE, STS_AUDIENCE};

/// Which of the three credential sources a mount request asked for.
/// `unspecified` resolves to `Driver` (spec §3, "Credential Provide Context").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthenticationSource {
    #[default]
    Driver,
    Pod,
    Secret,
}

impl AuthenticationSource {
    pub fn parse(value: &str) -> Self {
        match value {
            "pod" => AuthenticationSource::Pod,
            "secret" => AuthenticationSource::Secret,
            _ => AuthenticationSource::Driver,
        }
    }
}

/// Which mounter produced the artifacts a [`CleanupContext`] is responsible
/// for removing. Carried for parity with the data model; cleanup's prefix
/// match covers both mounters' file naming identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Pod,
    Service,
}

/// A single mount request's authentication inputs (spec §3, "Credential
/// Provide Context").
#[derive(Debug, Clone, Default)]
pub struct ProvideContext {
    pub write_dir: PathBuf,
    pub view_dir: PathBuf,
    pub pod_uid: String,
    pub volume_id: String,
    pub auth_source: AuthenticationSource,
    pub workload_namespace: Option<String>,
    pub service_account_name: Option<String>,
    /// Raw JSON service-account token bundle, as handed down from the CSI
    /// layer's volume context; parsed by [`pod::provide`] via
    /// [`parse_token_bundle`].
    pub service_account_tokens: String,
    pub workload_role_arn: Option<String>,
    pub sts_region_override: Option<String>,
    pub bucket_region: Option<String>,
    pub container_credentials_uri: Option<String>,
    pub static_secret: Option<BTreeMap<String, String>>,
}

/// A single mount request's teardown inputs (spec §3, "Credential Cleanup
/// Context").
#[derive(Debug, Clone)]
pub struct CleanupContext {
    pub write_dir: PathBuf,
    pub pod_uid: String,
    pub volume_id: String,
    pub mount_kind: MountKind,
}

/// Resolves and materializes credentials for one mount request, dispatching
/// on `ctx.auth_source` (spec §4.D). `client` is required (and used) only
/// for the `pod` source's service-account annotation lookup.
#[instrument(level = "debug", skip(ctx, client), fields(pod_uid = %ctx.pod_uid, volume_id = %ctx.volume_id))]
pub async fn provide(ctx: &ProvideContext, client: Option<&Client>) -> Result<(EnvironmentSet, AuthenticationSource)> {
    let prefix = files::prefix(&ctx.pod_uid, &ctx.volume_id);
    let env = match ctx.auth_source {
        AuthenticationSource::Driver => driver::provide(&ctx.write_dir, &prefix)?,
        AuthenticationSource::Secret => {
            let secret = ctx
                .static_secret
                .as_ref()
                .ok_or_else(|| MountError::invalid_input("credentials.provide", "secret authentication source requires a secret map"))?;
            secret::provide(secret)?
        }
        AuthenticationSource::Pod => {
            let client = client
                .ok_or_else(|| MountError::internal("credentials.provide", "pod authentication source requires a Kubernetes client"))?;
            pod::provide(
                client,
                &ctx.write_dir,
                &prefix,
                ctx.workload_namespace.as_deref(),
                ctx.service_account_name.as_deref(),
                &ctx.service_account_tokens,
                ctx.workload_role_arn.as_deref(),
                ctx.sts_region_override.as_deref(),
                ctx.bucket_region.as_deref(),
                ctx.container_credentials_uri.as_deref(),
            )
            .await?
        }
    };
    Ok((env, ctx.auth_source))
}

/// Removes every credential artifact written for one `(pod, volume)` pair,
/// including STS/pod-identity token files (their names share the same
/// prefix). Missing files are not an error (spec §4.D, `Cleanup`).
#[instrument(level = "debug", skip(ctx), fields(pod_uid = %ctx.pod_uid, volume_id = %ctx.volume_id))]
pub fn cleanup(ctx: &CleanupContext) -> Result<()> {
    let prefix = files::prefix(&ctx.pod_uid, &ctx.volume_id);
    files::remove_all_with_prefix(&ctx.write_dir, &prefix)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn unspecified_auth_source_defaults_to_driver() {
        assert_eq!(AuthenticationSource::parse("unspecified"), AuthenticationSource::Driver);
        assert_eq!(AuthenticationSource::parse(""), AuthenticationSource::Driver);
        assert_eq!(AuthenticationSource::parse("pod"), AuthenticationSource::Pod);
    }

    #[tokio::test]
    async fn secret_source_without_secret_map_is_invalid_argument() {
        let ctx = ProvideContext { auth_source: AuthenticationSource::Secret, ..Default::default() };
        let err = provide(&ctx, None).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn cleanup_on_missing_directory_is_not_an_error() {
        let ctx = CleanupContext {
            write_dir: PathBuf::from("/nonexistent/dir/for/sure"),
            pod_uid: "pod1".to_string(),
            volume_id: "vol1".to_string(),
            mount_kind: MountKind::Pod,
        };
        cleanup(&ctx).unwrap();
    }
}
