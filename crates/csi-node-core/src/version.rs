//! Driver and Kubernetes server version strings stamped into
//! `--user-agent-prefix` (spec §6). The server version is queried once per
//! process and memoized, the same compute-once pattern `credentials::imds`
//! uses for the IMDS region.

use kube::Client;
use tokio::sync::OnceCell;

static SERVER_VERSION: OnceCell<String> = OnceCell::const_new();

/// This crate's own version, as stamped into Cargo.toml.
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The API server's `gitVersion` (e.g. `v1.30.2`), queried via discovery
/// and cached for the life of the process. Falls back to `"unknown"` if
/// discovery fails, since a missing version string shouldn't block a mount.
pub async fn kubernetes_server_version(client: &Client) -> String {
    SERVER_VERSION
        .get_or_init(|| async {
            match client.apiserver_version().await {
                Ok(info) => info.git_version,
                Err(_) => "unknown".to_string(),
            }
        })
        .await
        .clone()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn driver_version_matches_cargo_package_version() {
        assert_eq!(DRIVER_VERSION, env!("CARGO_PKG_VERSION"));
    }
}
