//! Cloud metadata service client. Grounded on
//! `internal/vultruserdata/vultruserdata.go`: plain GETs against the
//! instance metadata service, with a 5 second timeout, used both to
//! detect managed-Kubernetes nodes (§4.5) and, at startup, to learn this
//! node's region and instance id (§4.6 step 3) without any provider
//! round-trip.

use std::time::Duration;

use serde::Deserialize;

const USER_DATA_URL: &str = "http://169.254.169.254/latest/user-data";
const INSTANCE_METADATA_URL: &str = "http://169.254.169.254/v1.json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
struct UserData {
    #[serde(default)]
    data: Data,
}

#[derive(Debug, Default, Deserialize)]
struct Data {
    #[serde(default)]
    vke: Vke,
}

#[derive(Debug, Default, Deserialize)]
struct Vke {
    #[serde(default)]
    node_id: String,
}

fn metadata_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()
}

async fn fetch_user_data(url: &str) -> Result<UserData, reqwest::Error> {
    let resp = metadata_client()?.get(url).send().await?.error_for_status()?;
    resp.json::<UserData>().await
}

/// True if this node belongs to the provider's managed Kubernetes
/// flavor. Any failure (timeout, non-200, malformed body) is treated as
/// "not VKE" rather than propagated, matching `IsVKE`'s `if err != nil {
/// return false }`.
pub async fn is_managed_kubernetes_node() -> bool {
    match fetch_user_data(USER_DATA_URL).await {
        Ok(ud) => !ud.data.vke.node_id.is_empty(),
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub instance_id: String,
    pub region: String,
}

#[derive(Debug, Deserialize)]
struct InstanceMetadata {
    instanceid: String,
    region: RegionMetadata,
}

#[derive(Debug, Deserialize)]
struct RegionMetadata {
    regioncode: String,
}

async fn fetch_instance_metadata(url: &str) -> crate::error::Result<InstanceMetadata> {
    let resp = metadata_client()?.get(url).send().await?.error_for_status()?;
    Ok(resp.json::<InstanceMetadata>().await?)
}

/// Resolves this node's identity directly from the instance metadata
/// service, used during startup (§4.6 step 3). No provider round-trip is
/// needed: the metadata service already reports both the instance id and
/// the region code.
pub async fn fetch_node_identity() -> crate::error::Result<NodeIdentity> {
    let metadata = fetch_instance_metadata(INSTANCE_METADATA_URL).await?;
    Ok(NodeIdentity {
        instance_id: metadata.instanceid,
        region: metadata.region.regioncode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_without_vke_block_defaults_empty() {
        let ud: UserData = serde_json::from_str("{}").unwrap();
        assert!(ud.data.vke.node_id.is_empty());
    }

    #[test]
    fn user_data_with_vke_node_id_parses() {
        let ud: UserData =
            serde_json::from_str(r#"{"data":{"vke":{"node_id":"abc123"}}}"#).unwrap();
        assert_eq!(ud.data.vke.node_id, "abc123");
    }

    #[test]
    fn instance_metadata_parses_instanceid_and_regioncode() {
        let md: InstanceMetadata = serde_json::from_str(
            r#"{"instanceid":"abc123","region":{"regioncode":"EWR"}}"#,
        )
        .unwrap();
        assert_eq!(md.instanceid, "abc123");
        assert_eq!(md.region.regioncode, "EWR");
    }
}
