//! Node identity from the instance metadata service.
//!
//! On startup the node role asks the hypervisor-local metadata endpoint
//! which compute instance it is running on and in which region; these
//! become the CSI node id and the region topology segment.

use std::time::Duration;

use serde::Deserialize;

/// Metadata service address reachable from every instance.
pub const METADATA_ENDPOINT: &str = "http://169.254.169.254";

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: String,
    pub region: String,
}

#[derive(Deserialize)]
struct Metadata {
    #[serde(rename = "instance-v2-id")]
    instance_id: String,
    region: RegionMetadata,
}

#[derive(Deserialize)]
struct RegionMetadata {
    #[serde(rename = "regioncode")]
    code: String,
}

fn from_json(body: &str) -> Result<InstanceInfo, String> {
    let metadata: Metadata = serde_json::from_str(body)
        .map_err(|error| format!("malformed instance metadata: {}", error))?;
    Ok(InstanceInfo {
        id: metadata.instance_id,
        region: metadata.region.code.to_lowercase(),
    })
}

/// Read the identity of the instance this process runs on.
pub async fn probe(endpoint: &str) -> Result<InstanceInfo, String> {
    let url = format!("{}/v1.json", endpoint.trim_end_matches('/'));

    let client = reqwest::Client::builder()
        .timeout(METADATA_TIMEOUT)
        .build()
        .map_err(|error| error.to_string())?;

    let body = client
        .get(&url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|error| {
            format!("failed to query instance metadata: {}", error)
        })?
        .text()
        .await
        .map_err(|error| {
            format!("failed to read instance metadata: {}", error)
        })?;

    from_json(&body)
}
