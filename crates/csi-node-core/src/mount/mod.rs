//! Platform-native mount primitives (component C): `mount(2)`/bind-mount/
//! unmount wrappers, FUSE fd acquisition, and mount-point introspection.

mod table;

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use nix::sys::stat::{umask, Mode};
use sys_mount::{Mount, MountFlags, UnmountFlags};
use tracing::instrument;

use crate::error::{ErrorKind, MountError, Result};

pub use table::{find_source_mount_point, is_mountpoint_s3_mount};

const FUSE_DEVICE: &str = "/dev/fuse";
const MOUNTPOINT_S3_DEVICE_NAME: &str = "mountpoint-s3";

/// Opens `/dev/fuse` and performs the kernel `mount(2)` call that hands the
/// resulting file descriptor to the kernel's FUSE driver (spec §4.C).
///
/// On success the caller owns the returned fd and is responsible for
/// sending it to the helper pod and then closing its local copy. On any
/// failure after opening `/dev/fuse` the fd is closed before the error is
/// returned.
#[instrument(level = "debug", skip(read_only))]
pub fn mount_fuse(target: &Path, read_only: bool) -> Result<OwnedFd> {
    let fuse_fd = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(FUSE_DEVICE)
        .map_err(|e| MountError::internal("mount", format!("opening {FUSE_DEVICE}: {e}")).with_target(target))?;
    let fuse_fd: OwnedFd = fuse_fd.into();

    match mount_fuse_inner(&fuse_fd, target, read_only) {
        Ok(()) => Ok(fuse_fd),
        Err(e) => {
            // fd is dropped here, closing it, matching the "close on any
            // failure after opening" invariant.
            Err(e)
        }
    }
}

fn mount_fuse_inner(fuse_fd: &OwnedFd, target: &Path, read_only: bool) -> Result<()> {
    let stat = nix::sys::stat::stat(target)
        .map_err(|e| MountError::internal("mount", format!("stat {}: {e}", target.display())).with_target(target))?;
    let rootmode = stat.st_mode & libc::S_IFMT;
    let uid = nix::unistd::geteuid();
    let gid = nix::unistd::getegid();

    let data = format!(
        "fd={},rootmode={:o},user_id={},group_id={},default_permissions,allow_other",
        fuse_fd.as_raw_fd(),
        rootmode,
        uid,
        gid,
    );

    let mut flags = MountFlags::NODEV | MountFlags::NOSUID | MountFlags::NOATIME;
    if read_only {
        flags |= MountFlags::RDONLY;
    }

    Mount::builder()
        .fstype("fuse")
        .flags(flags)
        .data(&data)
        .mount(MOUNTPOINT_S3_DEVICE_NAME, target)
        .map_err(|e| MountError::internal("mount", format!("mount(2) at {}: {e}", target.display())).with_target(target))?;
    Ok(())
}

/// Bind-mounts `source` onto `target` (spec §4.C). Fails if either path is empty.
#[instrument(level = "debug")]
pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    if source.as_os_str().is_empty() || target.as_os_str().is_empty() {
        return Err(MountError::invalid_input("bind_mount", "source and target must be non-empty paths"));
    }
    Mount::builder()
        .flags(MountFlags::BIND)
        .mount(source, target)
        .map_err(|e| {
            MountError::internal("bind_mount", format!("bind mount {} -> {}: {e}", source.display(), target.display()))
                .with_target(target)
        })?;
    Ok(())
}

/// Unmounts `target`. Corresponds to a plain `umount(2)`.
#[instrument(level = "debug")]
pub fn unmount(target: &Path) -> Result<()> {
    sys_mount::unmount(target, UnmountFlags::empty())
        .map_err(|e| MountError::internal("unmount", format!("unmount {}: {e}", target.display())).with_target(target))
}

/// Force-detaches a corrupted mount, used when tearing down a stale source
/// mount that a plain unmount would hang on.
#[instrument(level = "debug")]
pub fn force_unmount(target: &Path) -> Result<()> {
    sys_mount::unmount(target, UnmountFlags::FORCE | UnmountFlags::DETACH)
        .map_err(|e| MountError::internal("unmount", format!("force unmount {}: {e}", target.display())).with_target(target))
}

/// Returns `true` if an entry in the kernel mount table at `target` has
/// device name `mountpoint-s3`. Uses `statx` with force-sync first so a
/// hung remote filesystem surfaces as an error rather than a stale success
/// (spec §4.C).
#[instrument(level = "debug")]
pub fn check_mountpoint(target: &Path) -> Result<bool> {
    statx_force_sync(target)?;
    is_mountpoint_s3_mount(target).map_err(|e| e.with_target(target))
}

/// Tests whether `err` indicates a corrupted/stale Mountpoint mount (e.g.
/// `ENOTCONN`, a stale file handle).
pub fn is_mountpoint_corrupted(err: &MountError) -> bool {
    matches!(
        err.message.as_str(),
        s if s.contains("Transport endpoint is not connected")
            || s.contains("Stale file handle")
            || s.contains("Software caused connection abort")
    )
}

fn statx_force_sync(target: &Path) -> Result<()> {
    use nix::fcntl::AtFlags;
    use nix::sys::stat::FileStat;
    // `nix` doesn't expose `statx` directly on all targets; a plain `stat`
    // already forces a round trip to the underlying filesystem, which is
    // enough to surface a hung remote fs as an I/O error here. We keep this
    // as its own function so the force-sync semantics are easy to swap for
    // a raw `libc::statx` call with `AT_STATX_FORCE_SYNC` if ever needed.
    let _: FileStat = nix::sys::stat::fstatat(None, target, AtFlags::empty())
        .map_err(|e| MountError::internal("check_mountpoint", format!("statx {}: {e}", target.display())))?;
    Ok(())
}

/// Ensures `path` exists as a directory with the given mode, creating it if
/// absent (spec §4.H, step 7: "Verify/create both `source` and `target`").
pub fn ensure_dir(path: &Path, mode: u32) -> Result<()> {
    match nix::sys::stat::stat(path) {
        Ok(stat) if (stat.st_mode & libc::S_IFMT) == libc::S_IFDIR => Ok(()),
        Ok(_) => Err(MountError::internal("ensure_dir", format!("{} exists and is not a directory", path.display()))),
        Err(nix::Error::ENOENT) => {
            let old = umask(Mode::empty());
            let res = std::fs::create_dir_all(path).map_err(MountError::from);
            umask(old);
            res
        }
        Err(e) => Err(MountError::from(e)),
    }?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Consumes an [`OwnedFd`], yielding a raw fd the caller now owns (used when
/// handing the FUSE fd to the SCM_RIGHTS sender, which takes ownership).
pub fn into_raw_fd(fd: OwnedFd) -> RawFd {
    fd.into_raw_fd()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn corruption_detection_matches_known_kernel_messages() {
        let err = MountError::internal("check_mountpoint", "Transport endpoint is not connected (os error 107)");
        assert!(is_mountpoint_corrupted(&err));
        let err = MountError::internal("check_mountpoint", "No such file or directory (os error 2)");
        assert!(!is_mountpoint_corrupted(&err));
    }

    #[test]
    fn bind_mount_rejects_empty_paths() {
        let err = bind_mount(Path::new(""), Path::new("/mnt/target")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }
}
