//! Mount-options envelope (spec §3, §6): a single-shot send over a
//! per-helper-pod Unix datagram socket, carrying the FUSE fd as an
//! SCM_RIGHTS ancillary message alongside the bucket name, sorted args,
//! and sorted environment.

use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use nix::sys::socket::{self, ControlMessage, MsgFlags, UnixAddr};
use serde::Serialize;

use crate::error::{MountError, Result};

/// The mount-options envelope sent to a helper pod's `mount.sock`.
#[derive(Debug, Serialize)]
pub struct MountOptionsEnvelope<'a> {
    pub bucket: &'a str,
    pub args: &'a [String],
    pub env: &'a [String],
}

impl MountOptionsEnvelope<'_> {
    /// Encodes the envelope as JSON. Args and env are carried as arrays
    /// rather than a joined, delimited string, so a value containing a
    /// space (e.g. `--user-agent-prefix`'s) round-trips intact.
    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| MountError::internal("socket.send", format!("encoding mount-options envelope: {e}")))
    }
}

/// Sends `envelope` to `socket_path`, handing the FUSE fd across as an
/// SCM_RIGHTS ancillary message. The receiver ends up with an independent
/// descriptor referring to the same underlying file description; the
/// caller is responsible for closing its own copy of `fuse_fd` afterward
/// regardless of outcome (spec §4.H step 10).
pub fn send_mount_options(socket_path: &Path, fuse_fd: RawFd, envelope: &MountOptionsEnvelope<'_>) -> Result<()> {
    let socket = socket::socket(socket::AddressFamily::Unix, socket::SockType::Datagram, socket::SockFlag::empty(), None)
        .map_err(|e| MountError::internal("socket.send", format!("creating datagram socket: {e}")))?;

    let addr = UnixAddr::new(socket_path)
        .map_err(|e| MountError::internal("socket.send", format!("resolving socket address {}: {e}", socket_path.display())))?;

    let payload = envelope.encode()?;
    let iov = [std::io::IoSlice::new(&payload)];
    let cmsgs = [ControlMessage::ScmRights(&[fuse_fd])];

    socket::sendmsg(socket.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), Some(&addr))
        .map_err(|e| MountError::internal("socket.send", format!("sendmsg to {}: {e}", socket_path.display())))?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn envelope_encoding_round_trips_bucket_args_env() {
        let envelope = MountOptionsEnvelope {
            bucket: "my-bucket",
            args: &["--read-only".to_string(), "--allow-other".to_string()],
            env: &["AWS_REGION=us-west-2".to_string()],
        };
        let encoded = envelope.encode().unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded["bucket"], "my-bucket");
        assert_eq!(decoded["args"], serde_json::json!(["--read-only", "--allow-other"]));
        assert_eq!(decoded["env"], serde_json::json!(["AWS_REGION=us-west-2"]));
    }

    #[test]
    fn envelope_encoding_preserves_embedded_spaces_in_arg_values() {
        let args = vec!["--user-agent-prefix=s3-csi-driver/1.0.0 credential-source#pod k8s/v1.30.2".to_string()];
        let envelope = MountOptionsEnvelope { bucket: "my-bucket", args: &args, env: &[] };
        let encoded = envelope.encode().unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded["args"][0], args[0]);
    }
}
