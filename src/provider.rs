//! Thin REST client for the cloud provider's compute and storage APIs.
//!
//! Mirrors the shape of the teacher's `agent_client.rs`: one async method
//! per remote operation, returning a driver-local `Result`. Unlike the
//! teacher this talks plain HTTPS to a cloud API rather than gRPC to a
//! local peer, so the transport is `reqwest` instead of `tonic`.

use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, Result};

const DEFAULT_BASE_URL: &str = "https://api.vultr.com/v2";

#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub links: Links,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Links {
    #[serde(default)]
    pub next: String,
    #[serde(default)]
    pub prev: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub id: String,
    pub region: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawBlockStorage {
    pub id: String,
    pub region: String,
    pub status: String,
    pub label: String,
    pub size_gb: i64,
    #[serde(default)]
    pub block_type: String,
    #[serde(default)]
    pub attached_to_instance: String,
    #[serde(default)]
    pub mount_id: String,
}

#[derive(Debug, Serialize)]
pub struct BlockStorageCreateReq<'a> {
    pub region: &'a str,
    pub size_gb: i64,
    pub label: &'a str,
    pub block_type: &'a str,
}

#[derive(Debug, Serialize)]
pub struct BlockStorageUpdateReq<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_gb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct BlockStorageAttachReq<'a> {
    pub instance_id: &'a str,
    pub live: bool,
}

#[derive(Debug, Serialize)]
pub struct BlockStorageDetachReq {
    pub live: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawVfsStorage {
    pub id: String,
    pub region: String,
    pub status: String,
    pub label: String,
    pub size_gb: i64,
    #[serde(default)]
    pub disk_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VfsAttachment {
    pub target_id: String,
    pub mount_tag: i64,
}

#[derive(Debug, Serialize)]
pub struct VfsStorageCreateReq<'a> {
    pub region: &'a str,
    pub size_gb: i64,
    pub label: &'a str,
    pub disk_type: &'a str,
}

#[derive(Debug, Serialize)]
pub struct VfsStorageUpdateReq<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_gb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<&'a str>,
}

impl ProviderClient {
    pub fn new(token: String) -> Self {
        Self::with_base_url(token, DEFAULT_BASE_URL.to_string(), None)
    }

    pub fn with_base_url(token: String, base_url: String, user_agent: Option<String>) -> Self {
        let mut builder = reqwest::Client::builder();
        if let Some(ua) = user_agent {
            builder = builder.user_agent(ua);
        }
        let http = builder.build().expect("failed to build http client");
        ProviderClient {
            http,
            base_url,
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T> {
        let resp = req.bearer_auth(&self.token).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ProviderError::from_api(status.as_u16(), body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn send_no_body(&self, req: reqwest::RequestBuilder) -> Result<()> {
        let resp = req.bearer_auth(&self.token).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_api(status.as_u16(), body));
        }
        Ok(())
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<Instance> {
        #[derive(Deserialize)]
        struct Resp {
            instance: Instance,
        }
        let resp: Result<Resp> = self
            .send(self.http.get(self.url(&format!("/instances/{instance_id}"))))
            .await;
        match resp {
            Ok(resp) => Ok(resp.instance),
            Err(ProviderError::NotFound(_)) => {
                Err(ProviderError::InstanceNotFound(instance_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_block_storages(
        &self,
        cursor: Option<&str>,
    ) -> Result<(Vec<RawBlockStorage>, Option<String>)> {
        #[derive(Deserialize)]
        struct Resp {
            blocks: Vec<RawBlockStorage>,
            meta: Meta,
        }
        let mut req = self.http.get(self.url("/blocks"));
        if let Some(c) = cursor {
            req = req.query(&[("cursor", c)]);
        }
        let resp: Resp = self.send(req).await?;
        let next = if resp.meta.links.next.is_empty() {
            None
        } else {
            Some(resp.meta.links.next)
        };
        Ok((resp.blocks, next))
    }

    pub async fn get_block_storage(&self, id: &str) -> Result<RawBlockStorage> {
        #[derive(Deserialize)]
        struct Resp {
            block: RawBlockStorage,
        }
        let resp: Resp = self
            .send(self.http.get(self.url(&format!("/blocks/{id}"))))
            .await?;
        Ok(resp.block)
    }

    pub async fn create_block_storage(
        &self,
        req: &BlockStorageCreateReq<'_>,
    ) -> Result<RawBlockStorage> {
        #[derive(Deserialize)]
        struct Resp {
            block: RawBlockStorage,
        }
        let resp: Resp = self
            .send(self.http.post(self.url("/blocks")).json(req))
            .await?;
        Ok(resp.block)
    }

    pub async fn update_block_storage(
        &self,
        id: &str,
        req: &BlockStorageUpdateReq<'_>,
    ) -> Result<()> {
        self.send_no_body(self.http.patch(self.url(&format!("/blocks/{id}"))).json(req))
            .await
    }

    pub async fn delete_block_storage(&self, id: &str) -> Result<()> {
        self.send_no_body(self.http.delete(self.url(&format!("/blocks/{id}"))))
            .await
    }

    pub async fn attach_block_storage(
        &self,
        id: &str,
        req: &BlockStorageAttachReq<'_>,
    ) -> Result<()> {
        self.send_no_body(
            self.http
                .post(self.url(&format!("/blocks/{id}/attach")))
                .json(req),
        )
        .await
    }

    pub async fn detach_block_storage(&self, id: &str, req: &BlockStorageDetachReq) -> Result<()> {
        self.send_no_body(
            self.http
                .post(self.url(&format!("/blocks/{id}/detach")))
                .json(req),
        )
        .await
    }

    pub async fn list_vfs_storages(
        &self,
        cursor: Option<&str>,
    ) -> Result<(Vec<RawVfsStorage>, Option<String>)> {
        #[derive(Deserialize)]
        struct Resp {
            vfs: Vec<RawVfsStorage>,
            meta: Meta,
        }
        let mut req = self.http.get(self.url("/vfs"));
        if let Some(c) = cursor {
            req = req.query(&[("cursor", c)]);
        }
        let resp: Resp = self.send(req).await?;
        let next = if resp.meta.links.next.is_empty() {
            None
        } else {
            Some(resp.meta.links.next)
        };
        Ok((resp.vfs, next))
    }

    pub async fn get_vfs_storage(&self, id: &str) -> Result<RawVfsStorage> {
        #[derive(Deserialize)]
        struct Resp {
            vfs: RawVfsStorage,
        }
        let resp: Resp = self
            .send(self.http.get(self.url(&format!("/vfs/{id}"))))
            .await?;
        Ok(resp.vfs)
    }

    pub async fn list_vfs_attachments(&self, id: &str) -> Result<Vec<VfsAttachment>> {
        #[derive(Deserialize)]
        struct Resp {
            attachments: Vec<VfsAttachment>,
        }
        let resp: Resp = self
            .send(self.http.get(self.url(&format!("/vfs/{id}/attachments"))))
            .await?;
        Ok(resp.attachments)
    }

    pub async fn create_vfs_storage(&self, req: &VfsStorageCreateReq<'_>) -> Result<RawVfsStorage> {
        #[derive(Deserialize)]
        struct Resp {
            vfs: RawVfsStorage,
        }
        let resp: Resp = self.send(self.http.post(self.url("/vfs")).json(req)).await?;
        Ok(resp.vfs)
    }

    pub async fn update_vfs_storage(&self, id: &str, req: &VfsStorageUpdateReq<'_>) -> Result<()> {
        self.send_no_body(self.http.patch(self.url(&format!("/vfs/{id}"))).json(req))
            .await
    }

    pub async fn delete_vfs_storage(&self, id: &str) -> Result<()> {
        self.send_no_body(self.http.delete(self.url(&format!("/vfs/{id}"))))
            .await
    }

    pub async fn attach_vfs_storage(&self, id: &str, target_id: &str) -> Result<()> {
        #[derive(Serialize)]
        struct Req<'a> {
            target_id: &'a str,
        }
        self.send_no_body(
            self.http
                .post(self.url(&format!("/vfs/{id}/attachments")))
                .json(&Req { target_id }),
        )
        .await
    }

    pub async fn detach_vfs_storage(&self, id: &str, target_id: &str) -> Result<()> {
        self.send_no_body(
            self.http
                .delete(self.url(&format!("/vfs/{id}/attachments/{target_id}"))),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_and_path() {
        let client = ProviderClient::with_base_url(
            "tok".into(),
            "https://api.example.com/v2".into(),
            None,
        );
        assert_eq!(client.url("/blocks"), "https://api.example.com/v2/blocks");
    }
}
