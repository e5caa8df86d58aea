//! `driver`-sourced credentials (spec §4.D): reuses the node plugin's own
//! process-level AWS credentials — long-term keys, an IRSA role+token pair,
//! or a container-credentials provider URI+token pair — copying any token
//! files into the per-volume write path so Mountpoint can read them after
//! the fd handoff.

use std::path::Path;

use crate::credentials::files::{self, CREDENTIALS_FILE_MODE};
use crate::env::EnvironmentSet;
use crate::error::{MountError, Result};

/// Materializes the node plugin's own AWS credentials for a mount. Returns
/// the environment to hand to Mountpoint. At least one of the three
/// provider shapes below must be usable, or this fails with `InvalidInput`.
pub fn provide(write_dir: &Path, prefix: &str) -> Result<EnvironmentSet> {
    let mut env = EnvironmentSet::new();
    let mut usable = false;

    if let (Ok(key_id), Ok(secret)) = (std::env::var("AWS_ACCESS_KEY_ID"), std::env::var("AWS_SECRET_ACCESS_KEY")) {
        if !key_id.is_empty() && !secret.is_empty() {
            write_profile(write_dir, prefix, &key_id, &secret)?;
            env.set("AWS_CONFIG_FILE", files::config_file(write_dir, prefix).display().to_string());
            env.set("AWS_SHARED_CREDENTIALS_FILE", files::credentials_file(write_dir, prefix).display().to_string());
            usable = true;
        }
    }

    if let (Ok(role_arn), Ok(token_path)) = (std::env::var("AWS_ROLE_ARN"), std::env::var("AWS_WEB_IDENTITY_TOKEN_FILE")) {
        if !role_arn.is_empty() && !token_path.is_empty() {
            let dest = files::sts_token_file(write_dir, prefix);
            copy_token_file(Path::new(&token_path), &dest)?;
            env.set("AWS_ROLE_ARN", role_arn);
            env.set("AWS_WEB_IDENTITY_TOKEN_FILE", dest.display().to_string());
            usable = true;
        }
    }

    if let (Ok(uri), Ok(token_path)) =
        (std::env::var("AWS_CONTAINER_CREDENTIALS_FULL_URI"), std::env::var("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE"))
    {
        if !uri.is_empty() && !token_path.is_empty() {
            let dest = files::pod_identity_token_file(write_dir, prefix);
            copy_token_file(Path::new(&token_path), &dest)?;
            env.set("AWS_CONTAINER_CREDENTIALS_FULL_URI", uri);
            env.set("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE", dest.display().to_string());
            usable = true;
        }
    }

    if !usable {
        return Err(MountError::invalid_input(
            "credentials.provide",
            "driver authentication source requires long-term keys, an IRSA role+token pair, or a container-credentials URI+token pair in the node plugin's own environment",
        ));
    }

    Ok(env)
}

fn write_profile(write_dir: &Path, prefix: &str, key_id: &str, secret: &str) -> Result<()> {
    std::fs::create_dir_all(write_dir).map_err(MountError::from)?;
    files::write_atomic(&files::config_file(write_dir, prefix), b"[default]\n", CREDENTIALS_FILE_MODE)?;
    let body = format!("[default]\naws_access_key_id = {key_id}\naws_secret_access_key = {secret}\n");
    files::write_atomic(&files::credentials_file(write_dir, prefix), body.as_bytes(), CREDENTIALS_FILE_MODE)
}

fn copy_token_file(source: &Path, dest: &Path) -> Result<()> {
    let contents =
        std::fs::read(source).map_err(|e| MountError::internal("credentials.provide", format!("reading {}: {e}", source.display())))?;
    std::fs::create_dir_all(dest.parent().expect("file paths returned by `files` always have a parent")).map_err(MountError::from)?;
    files::write_atomic(dest, &contents, CREDENTIALS_FILE_MODE)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn requires_at_least_one_usable_provider() {
        for key in [
            "AWS_ACCESS_KEY_ID",
            "AWS_SECRET_ACCESS_KEY",
            "AWS_ROLE_ARN",
            "AWS_WEB_IDENTITY_TOKEN_FILE",
            "AWS_CONTAINER_CREDENTIALS_FULL_URI",
            "AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE",
        ] {
            std::env::remove_var(key);
        }
        let dir = tempfile::tempdir().unwrap();
        let err = provide(dir.path(), "pod1-vol1").unwrap_err();
        assert!(err.message.contains("requires"));
    }

    #[test]
    fn long_term_keys_materialize_profile_files() {
        std::env::set_var("AWS_ACCESS_KEY_ID", "AKIAEXAMPLE");
        std::env::set_var("AWS_SECRET_ACCESS_KEY", "secretvalue");
        std::env::remove_var("AWS_ROLE_ARN");
        std::env::remove_var("AWS_WEB_IDENTITY_TOKEN_FILE");
        std::env::remove_var("AWS_CONTAINER_CREDENTIALS_FULL_URI");
        std::env::remove_var("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE");

        let dir = tempfile::tempdir().unwrap();
        let env = provide(dir.path(), "pod1-vol1").unwrap();
        assert!(env.get("AWS_CONFIG_FILE").is_some());
        assert!(env.get("AWS_SHARED_CREDENTIALS_FILE").is_some());
        let creds = std::fs::read_to_string(files::credentials_file(dir.path(), "pod1-vol1")).unwrap();
        assert!(creds.contains("AKIAEXAMPLE"));

        std::env::remove_var("AWS_ACCESS_KEY_ID");
        std::env::remove_var("AWS_SECRET_ACCESS_KEY");
    }
}
