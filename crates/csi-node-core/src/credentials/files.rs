//! Atomic-rename file writers and the per-(pod, volume) filename
//! conventions credential artifacts follow (spec §3, "Credential file
//! conventions").

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::{MountError, Result};

/// Directory mode for a helper pod's credentials directory: group-readable
/// so the helper pod's non-root container user (sharing the directory's
/// GID) can read the files the node plugin writes (spec §9, Open Question a).
pub const CREDENTIALS_DIR_MODE: u32 = 0o750;
/// File mode for credential artifacts written under that directory.
pub const CREDENTIALS_FILE_MODE: u32 = 0o640;

/// A unique filename prefix for one (pod, volume) pair's credential
/// artifacts, so [`remove_all_with_prefix`] can find and delete exactly the
/// files one `Cleanup` call is responsible for.
pub fn prefix(pod_uid: &str, volume_id: &str) -> String {
    format!("{pod_uid}-{volume_id}")
}

pub fn config_file(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}-s3-csi-config"))
}

pub fn credentials_file(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}-s3-csi-credentials"))
}

/// The IRSA (`sts.amazonaws.com` audience) token file.
pub fn sts_token_file(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}.token"))
}

/// The EKS Pod Identity / container-credentials-provider token file.
pub fn pod_identity_token_file(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}-eks-pod-identity.token"))
}

/// Writes `contents` to `path` atomically: write to a sibling temp file,
/// then rename over the destination, so no reader ever observes a file
/// shorter than its final length (spec §8).
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let dir = path.parent().ok_or_else(|| MountError::internal("write_atomic", "path has no parent directory"))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(|e| MountError::internal("write_atomic", format!("creating temp file in {}: {e}", dir.display())))?;
    use std::io::Write;
    tmp.write_all(contents).map_err(|e| MountError::internal("write_atomic", format!("writing temp file: {e}")))?;
    tmp.flush().map_err(MountError::from)?;
    let file = tmp.as_file();
    file.set_permissions(std::fs::Permissions::from_mode(mode)).map_err(MountError::from)?;
    tmp.persist(path)
        .map_err(|e| MountError::internal("write_atomic", format!("renaming into {}: {e}", path.display())))?;
    Ok(())
}

/// Removes every file in `dir` whose name starts with `prefix`. Missing
/// files and a missing directory are not errors (spec §4.D, `Cleanup`).
pub fn remove_all_with_prefix(dir: &Path, prefix: &str) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(MountError::from(e)),
    };
    for entry in entries {
        let entry = entry.map_err(MountError::from)?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(prefix) {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(MountError::from(e)),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_atomic_produces_readable_file_with_full_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        write_atomic(&path, b"hello world", CREDENTIALS_FILE_MODE).unwrap();
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"hello world");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, CREDENTIALS_FILE_MODE);
    }

    #[test]
    fn remove_all_with_prefix_only_removes_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pod1-vol1-s3-csi-config"), b"a").unwrap();
        std::fs::write(dir.path().join("pod1-vol1-s3-csi-credentials"), b"b").unwrap();
        std::fs::write(dir.path().join("pod2-vol2-s3-csi-config"), b"c").unwrap();
        remove_all_with_prefix(dir.path(), "pod1-vol1").unwrap();
        assert!(!dir.path().join("pod1-vol1-s3-csi-config").exists());
        assert!(!dir.path().join("pod1-vol1-s3-csi-credentials").exists());
        assert!(dir.path().join("pod2-vol2-s3-csi-config").exists());
    }

    #[test]
    fn remove_all_with_prefix_missing_dir_is_not_an_error() {
        remove_all_with_prefix(Path::new("/nonexistent/dir/for/sure"), "x").unwrap();
    }
}
