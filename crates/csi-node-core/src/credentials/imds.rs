//! IMDSv2 region lookup, the last resort in the STS region resolution
//! order (spec §4.D). Called at most once per process: the result is
//! memoized, matching the driver-level region lookup's own behavior.

use tokio::sync::OnceCell;

use crate::error::{MountError, Result};

const TOKEN_URL: &str = "http://169.254.169.254/latest/api/token";
const REGION_URL: &str = "http://169.254.169.254/latest/meta-data/placement/region";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";

static REGION: OnceCell<String> = OnceCell::const_new();

/// Returns the instance's region, fetching it from IMDS on first call and
/// reusing the result for the remaining lifetime of the process.
pub async fn region() -> Result<String> {
    let region = REGION.get_or_try_init(fetch_region).await?;
    Ok(region.clone())
}

async fn fetch_region() -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(2))
        .build()
        .map_err(|e| MountError::internal("credentials.imds", format!("building IMDS client: {e}")))?;

    let token = client
        .put(TOKEN_URL)
        .header(TOKEN_TTL_HEADER, "21600")
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| MountError::internal("credentials.imds", format!("fetching IMDS token: {e}")))?
        .text()
        .await
        .map_err(|e| MountError::internal("credentials.imds", format!("reading IMDS token: {e}")))?;

    let region = client
        .get(REGION_URL)
        .header(TOKEN_HEADER, token)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| MountError::internal("credentials.imds", format!("fetching IMDS region: {e}")))?
        .text()
        .await
        .map_err(|e| MountError::internal("credentials.imds", format!("reading IMDS region: {e}")))?;

    Ok(region.trim().to_string())
}
