//! `pod`-sourced credentials (spec §4.D): resolves a workload pod's IAM
//! role — from the attachment record or, failing that, its service
//! account's IRSA annotation — picks the STS region, and writes the
//! STS-audience (and, when a container-credentials provider is in play,
//! the EKS Pod Identity) tokens into the per-volume write path.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::ServiceAccount;
use kube::{Api, Client};

use crate::credentials::files::{self, CREDENTIALS_FILE_MODE};
use crate::credentials::imds;
use crate::env::EnvironmentSet;
use crate::error::{ErrorKind, MountError, Result};

const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";
pub const STS_AUDIENCE: &str = "sts.amazonaws.com";
pub const POD_IDENTITY_AUDIENCE: &str = "pods.eks.amazonaws.com";

/// One audience's token and its expiry, as carried in the service account
/// token bundle (spec §3, "Credential Provide Context").
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TokenClaim {
    pub token: String,
    pub expiry: String,
}

pub type TokenBundle = BTreeMap<String, TokenClaim>;

/// Parses the raw JSON service account token bundle (spec §3: an object
/// mapping audience to `{token, expiry}`) as handed down from the CSI
/// layer's volume context.
pub fn parse_token_bundle(raw: &str) -> Result<TokenBundle> {
    serde_json::from_str(raw)
        .map_err(|e| MountError::invalid_input("credentials.provide", format!("invalid service account token bundle: {e}")))
}

#[allow(clippy::too_many_arguments)]
pub async fn provide(
    client: &Client,
    write_dir: &Path,
    prefix: &str,
    namespace: Option<&str>,
    service_account: Option<&str>,
    tokens_json: &str,
    attachment_role_arn: Option<&str>,
    sts_region_override: Option<&str>,
    bucket_region: Option<&str>,
    container_credentials_uri: Option<&str>,
) -> Result<EnvironmentSet> {
    let namespace = namespace
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MountError::invalid_input("credentials.provide", "pod authentication source requires a workload namespace"))?;
    let service_account = service_account
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MountError::invalid_input("credentials.provide", "pod authentication source requires a workload service account"))?;
    let tokens = parse_token_bundle(tokens_json)?;

    match resolve_role_arn(client, namespace, service_account, attachment_role_arn).await {
        Ok(role_arn) => {
            provide_irsa(write_dir, prefix, &role_arn, &tokens, sts_region_override, bucket_region, container_credentials_uri).await
        }
        Err(e) if is_not_annotated(&e) => match provide_container_credentials(write_dir, prefix, &tokens, container_credentials_uri) {
            Ok(env) => Ok(env),
            Err(_) => Err(e),
        },
        Err(e) => Err(e),
    }
}

/// Prefers the attachment record's role ARN (populated by the controller);
/// falls back to the workload service account's IRSA annotation.
async fn resolve_role_arn(
    client: &Client,
    namespace: &str,
    service_account: &str,
    attachment_role_arn: Option<&str>,
) -> Result<String> {
    if let Some(arn) = attachment_role_arn.filter(|s| !s.is_empty()) {
        return Ok(arn.to_string());
    }

    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let sa = api.get(service_account).await.map_err(MountError::from)?;
    sa.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ROLE_ARN_ANNOTATION))
        .filter(|arn| !arn.is_empty())
        .cloned()
        .ok_or_else(|| {
            MountError::invalid_input(
                "credentials.provide",
                format!("service account {namespace}/{service_account} not annotated with {ROLE_ARN_ANNOTATION}"),
            )
        })
}

fn is_not_annotated(err: &MountError) -> bool {
    err.kind == ErrorKind::InvalidInput && err.message.contains("not annotated")
}

#[allow(clippy::too_many_arguments)]
async fn provide_irsa(
    write_dir: &Path,
    prefix: &str,
    role_arn: &str,
    tokens: &TokenBundle,
    sts_region_override: Option<&str>,
    bucket_region: Option<&str>,
    container_credentials_uri: Option<&str>,
) -> Result<EnvironmentSet> {
    let region = resolve_sts_region(sts_region_override, bucket_region).await?;

    let sts_claim = tokens.get(STS_AUDIENCE).ok_or_else(|| {
        MountError::invalid_input("credentials.provide", format!("no {STS_AUDIENCE} token in service account token bundle"))
    })?;
    std::fs::create_dir_all(write_dir).map_err(MountError::from)?;
    let sts_token_path = files::sts_token_file(write_dir, prefix);
    files::write_atomic(&sts_token_path, sts_claim.token.as_bytes(), CREDENTIALS_FILE_MODE)?;

    let mut env = EnvironmentSet::new();
    env.set("AWS_ROLE_ARN", role_arn);
    env.set("AWS_WEB_IDENTITY_TOKEN_FILE", sts_token_path.display().to_string());
    env.set("AWS_REGION", region);
    env.set("AWS_STS_REGIONAL_ENDPOINTS", "regional");
    env.set("AWS_EC2_METADATA_DISABLED", "true");

    if let (Some(pod_identity_claim), Some(uri)) = (tokens.get(POD_IDENTITY_AUDIENCE), container_credentials_uri) {
        let dest = files::pod_identity_token_file(write_dir, prefix);
        files::write_atomic(&dest, pod_identity_claim.token.as_bytes(), CREDENTIALS_FILE_MODE)?;
        env.set("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE", dest.display().to_string());
        env.set("AWS_CONTAINER_CREDENTIALS_FULL_URI", uri);
    }

    Ok(env)
}

/// Falls back to the EKS Pod Identity / container-credentials-provider
/// token when IRSA is unavailable for this service account.
fn provide_container_credentials(
    write_dir: &Path,
    prefix: &str,
    tokens: &TokenBundle,
    container_credentials_uri: Option<&str>,
) -> Result<EnvironmentSet> {
    let uri = container_credentials_uri
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MountError::invalid_input("credentials.provide", "no container-credentials URI configured"))?;
    let claim = tokens.get(POD_IDENTITY_AUDIENCE).ok_or_else(|| {
        MountError::invalid_input("credentials.provide", format!("no {POD_IDENTITY_AUDIENCE} token in service account token bundle"))
    })?;

    std::fs::create_dir_all(write_dir).map_err(MountError::from)?;
    let dest = files::pod_identity_token_file(write_dir, prefix);
    files::write_atomic(&dest, claim.token.as_bytes(), CREDENTIALS_FILE_MODE)?;

    let mut env = EnvironmentSet::new();
    env.set("AWS_CONTAINER_CREDENTIALS_FULL_URI", uri);
    env.set("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE", dest.display().to_string());
    Ok(env)
}

/// STS region resolution order (spec §4.D): explicit volume attribute →
/// `--region` from mount args → `AWS_REGION` → `AWS_DEFAULT_REGION` → IMDS.
async fn resolve_sts_region(sts_region_override: Option<&str>, bucket_region: Option<&str>) -> Result<String> {
    if let Some(region) = sts_region_override.filter(|s| !s.is_empty()) {
        return Ok(region.to_string());
    }
    if let Some(region) = bucket_region.filter(|s| !s.is_empty()) {
        return Ok(region.to_string());
    }
    if let Ok(region) = std::env::var("AWS_REGION") {
        if !region.is_empty() {
            return Ok(region);
        }
    }
    if let Ok(region) = std::env::var("AWS_DEFAULT_REGION") {
        if !region.is_empty() {
            return Ok(region);
        }
    }
    imds::region()
        .await
        .map_err(|_| MountError::invalid_input("credentials.provide", "unknown region: no explicit, argument, environment, or IMDS region available"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn resolve_sts_region_prefers_explicit_override() {
        let region = resolve_sts_region(Some("eu-central-1"), Some("us-west-2")).await.unwrap();
        assert_eq!(region, "eu-central-1");
    }

    #[tokio::test]
    async fn resolve_sts_region_falls_back_to_bucket_region() {
        let region = resolve_sts_region(None, Some("ap-south-1")).await.unwrap();
        assert_eq!(region, "ap-south-1");
    }

    #[test]
    fn parse_token_bundle_reads_audience_keyed_json() {
        let raw = r#"{"sts.amazonaws.com":{"token":"tok-1","expiry":"2026-01-01T00:00:00Z"}}"#;
        let bundle = parse_token_bundle(raw).unwrap();
        let claim = bundle.get(STS_AUDIENCE).unwrap();
        assert_eq!(claim.token, "tok-1");
        assert_eq!(claim.expiry, "2026-01-01T00:00:00Z");
    }

    #[test]
    fn parse_token_bundle_rejects_malformed_json() {
        let err = parse_token_bundle("not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn not_annotated_detection_matches_only_that_message() {
        let err = MountError::invalid_input("credentials.provide", "service account default/default not annotated with eks.amazonaws.com/role-arn");
        assert!(is_not_annotated(&err));
        let err = MountError::invalid_input("credentials.provide", "some other failure");
        assert!(!is_not_annotated(&err));
    }
}
