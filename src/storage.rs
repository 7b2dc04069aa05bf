//! The storage-type abstraction: a uniform operation set over two
//! heterogeneous provider backends (block, single-writer; vfs,
//! multi-writer), fanned out per spec.md §4.4. Grounded directly on
//! `internal/vultrstorage/vultrstorage.go`'s `VultrStorageHandler` /
//! `Operations` interface.

use tonic::async_trait;

use crate::error::{ProviderError, Result};
use crate::provider::{
    BlockStorageAttachReq, BlockStorageCreateReq, BlockStorageDetachReq, BlockStorageUpdateReq,
    ProviderClient, RawBlockStorage, RawVfsStorage, VfsStorageCreateReq, VfsStorageUpdateReq,
};

pub const GIBIBYTE: i64 = 1 << 30;

pub const BLOCK_NVME_DEFAULT_BYTES: i64 = 10 * GIBIBYTE;
pub const BLOCK_HDD_DEFAULT_BYTES: i64 = 40 * GIBIBYTE;
pub const VFS_NVME_DEFAULT_BYTES: i64 = 10 * GIBIBYTE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Block,
    Vfs,
}

impl StorageType {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageType::Block => "block",
            StorageType::Vfs => "vfs",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "block" => Some(StorageType::Block),
            "vfs" => Some(StorageType::Vfs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskType {
    Nvme,
    Hdd,
}

impl DiskType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "nvme" => Some(DiskType::Nvme),
            "hdd" => Some(DiskType::Hdd),
            _ => None,
        }
    }

    fn block_type(self) -> &'static str {
        match self {
            DiskType::Nvme => "high_perf",
            DiskType::Hdd => "storage_opt",
        }
    }
}

/// `(storage_type, disk_type)` as given on `CreateVolume`, including the
/// legacy `block_type` override spec.md §4.2.1 describes.
pub fn resolve_storage_params(
    parameters: &std::collections::HashMap<String, String>,
) -> Option<(StorageType, DiskType)> {
    if let Some(block_type) = parameters.get("block_type") {
        let disk_type = match block_type.as_str() {
            "high_perf" => DiskType::Nvme,
            "storage_opt" => DiskType::Hdd,
            _ => return None,
        };
        return Some((StorageType::Block, disk_type));
    }
    let storage_type = StorageType::parse(parameters.get("storage_type")?)?;
    let disk_type = DiskType::parse(parameters.get("disk_type")?)?;
    Some((storage_type, disk_type))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessMode {
    SingleNodeWriter,
    MultiNodeMultiWriter,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub node_id: String,
    pub mount_name: String,
}

#[derive(Debug, Clone)]
pub struct Storage {
    pub id: String,
    pub label: String,
    pub region: String,
    pub storage_type: StorageType,
    pub status: String,
    pub size_gb: i64,
    pub attachments: Vec<Attachment>,
}

impl Storage {
    pub fn capacity_bytes(&self) -> i64 {
        self.size_gb * GIBIBYTE
    }

    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    pub fn attachment_for(&self, node_id: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.node_id == node_id)
    }
}

pub struct CreateStorageRequest<'a> {
    pub region: &'a str,
    pub label: &'a str,
    pub size_gb: i64,
    pub disk_type: DiskType,
}

pub struct UpdateStorageRequest {
    pub size_gb: Option<i64>,
    pub label: Option<String>,
}

#[async_trait]
pub trait StorageOps: Send + Sync {
    async fn list(
        &self,
        client: &ProviderClient,
        cursor: Option<&str>,
    ) -> Result<(Vec<Storage>, Option<String>)>;
    async fn get(&self, client: &ProviderClient, id: &str) -> Result<Storage>;
    async fn create(&self, client: &ProviderClient, req: &CreateStorageRequest<'_>) -> Result<Storage>;
    async fn update(&self, client: &ProviderClient, id: &str, req: &UpdateStorageRequest) -> Result<()>;
    async fn delete(&self, client: &ProviderClient, id: &str) -> Result<()>;
    async fn attach(&self, client: &ProviderClient, id: &str, node_id: &str) -> Result<()>;
    async fn detach(&self, client: &ProviderClient, id: &str, node_id: &str) -> Result<()>;
}

fn from_raw_block(raw: RawBlockStorage) -> Storage {
    let attachments = if raw.attached_to_instance.is_empty() {
        Vec::new()
    } else {
        vec![Attachment {
            node_id: raw.attached_to_instance,
            mount_name: raw.mount_id,
        }]
    };
    Storage {
        id: raw.id,
        label: raw.label,
        region: raw.region,
        storage_type: StorageType::Block,
        status: raw.status,
        size_gb: raw.size_gb,
        attachments,
    }
}

pub struct BlockStorageOps;

#[async_trait]
impl StorageOps for BlockStorageOps {
    async fn list(
        &self,
        client: &ProviderClient,
        cursor: Option<&str>,
    ) -> Result<(Vec<Storage>, Option<String>)> {
        let (raw, next) = client.list_block_storages(cursor).await?;
        Ok((raw.into_iter().map(from_raw_block).collect(), next))
    }

    async fn get(&self, client: &ProviderClient, id: &str) -> Result<Storage> {
        let raw = client.get_block_storage(id).await?;
        Ok(from_raw_block(raw))
    }

    async fn create(&self, client: &ProviderClient, req: &CreateStorageRequest<'_>) -> Result<Storage> {
        let raw = client
            .create_block_storage(&BlockStorageCreateReq {
                region: req.region,
                size_gb: req.size_gb,
                label: req.label,
                block_type: req.disk_type.block_type(),
            })
            .await?;
        Ok(from_raw_block(raw))
    }

    async fn update(&self, client: &ProviderClient, id: &str, req: &UpdateStorageRequest) -> Result<()> {
        client
            .update_block_storage(
                id,
                &BlockStorageUpdateReq {
                    size_gb: req.size_gb,
                    label: req.label.as_deref(),
                },
            )
            .await
    }

    async fn delete(&self, client: &ProviderClient, id: &str) -> Result<()> {
        client.delete_block_storage(id).await
    }

    async fn attach(&self, client: &ProviderClient, id: &str, node_id: &str) -> Result<()> {
        client
            .attach_block_storage(
                id,
                &BlockStorageAttachReq {
                    instance_id: node_id,
                    live: true,
                },
            )
            .await
    }

    async fn detach(&self, client: &ProviderClient, id: &str, _node_id: &str) -> Result<()> {
        client
            .detach_block_storage(id, &BlockStorageDetachReq { live: true })
            .await
    }
}

fn from_raw_vfs(raw: RawVfsStorage, attachments: Vec<Attachment>) -> Storage {
    Storage {
        id: raw.id,
        label: raw.label,
        region: raw.region,
        storage_type: StorageType::Vfs,
        status: raw.status,
        size_gb: raw.size_gb,
        attachments,
    }
}

pub struct VfsStorageOps;

#[async_trait]
impl StorageOps for VfsStorageOps {
    async fn list(
        &self,
        client: &ProviderClient,
        cursor: Option<&str>,
    ) -> Result<(Vec<Storage>, Option<String>)> {
        // List checks in CSI do not need attached-instance info, so skip
        // the per-item attachment lookup that `get` performs.
        let (raw, next) = client.list_vfs_storages(cursor).await?;
        Ok((
            raw.into_iter().map(|r| from_raw_vfs(r, Vec::new())).collect(),
            next,
        ))
    }

    async fn get(&self, client: &ProviderClient, id: &str) -> Result<Storage> {
        let raw = client.get_vfs_storage(id).await?;
        let attachments = client
            .list_vfs_attachments(id)
            .await?
            .into_iter()
            .map(|a| Attachment {
                node_id: a.target_id,
                mount_name: a.mount_tag.to_string(),
            })
            .collect();
        Ok(from_raw_vfs(raw, attachments))
    }

    async fn create(&self, client: &ProviderClient, req: &CreateStorageRequest<'_>) -> Result<Storage> {
        let raw = client
            .create_vfs_storage(&VfsStorageCreateReq {
                region: req.region,
                size_gb: req.size_gb,
                label: req.label,
                disk_type: match req.disk_type {
                    DiskType::Nvme => "nvme",
                    DiskType::Hdd => "hdd",
                },
            })
            .await?;
        Ok(from_raw_vfs(raw, Vec::new()))
    }

    async fn update(&self, client: &ProviderClient, id: &str, req: &UpdateStorageRequest) -> Result<()> {
        client
            .update_vfs_storage(
                id,
                &VfsStorageUpdateReq {
                    size_gb: req.size_gb,
                    label: req.label.as_deref(),
                },
            )
            .await
    }

    async fn delete(&self, client: &ProviderClient, id: &str) -> Result<()> {
        client.delete_vfs_storage(id).await
    }

    async fn attach(&self, client: &ProviderClient, id: &str, node_id: &str) -> Result<()> {
        client.attach_vfs_storage(id, node_id).await
    }

    async fn detach(&self, client: &ProviderClient, id: &str, node_id: &str) -> Result<()> {
        client.detach_vfs_storage(id, node_id).await
    }
}

pub struct StorageHandler {
    pub storage_type: StorageType,
    pub disk_type: DiskType,
    pub default_size_bytes: i64,
    pub access_mode: AccessMode,
    ops: Box<dyn StorageOps>,
}

impl StorageHandler {
    pub fn new(storage_type: StorageType, disk_type: DiskType) -> Self {
        let (default_size_bytes, access_mode, ops): (i64, AccessMode, Box<dyn StorageOps>) =
            match storage_type {
                StorageType::Block => (
                    match disk_type {
                        DiskType::Nvme => BLOCK_NVME_DEFAULT_BYTES,
                        DiskType::Hdd => BLOCK_HDD_DEFAULT_BYTES,
                    },
                    AccessMode::SingleNodeWriter,
                    Box::new(BlockStorageOps),
                ),
                StorageType::Vfs => (
                    VFS_NVME_DEFAULT_BYTES,
                    AccessMode::MultiNodeMultiWriter,
                    Box::new(VfsStorageOps),
                ),
            };
        StorageHandler {
            storage_type,
            disk_type,
            default_size_bytes,
            access_mode,
            ops,
        }
    }

    pub fn for_family(storage_type: StorageType) -> Self {
        Self::new(storage_type, DiskType::Nvme)
    }

    pub async fn list(
        &self,
        client: &ProviderClient,
        cursor: Option<&str>,
    ) -> Result<(Vec<Storage>, Option<String>)> {
        self.ops.list(client, cursor).await
    }

    pub async fn list_all(&self, client: &ProviderClient) -> Result<Vec<Storage>> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let (page, next) = self.ops.list(client, cursor.as_deref()).await?;
            all.extend(page);
            match next {
                Some(n) if !n.is_empty() => cursor = Some(n),
                _ => break,
            }
        }
        Ok(all)
    }

    pub async fn get(&self, client: &ProviderClient, id: &str) -> Result<Storage> {
        self.ops.get(client, id).await
    }

    pub async fn create(&self, client: &ProviderClient, req: &CreateStorageRequest<'_>) -> Result<Storage> {
        self.ops.create(client, req).await
    }

    pub async fn update(&self, client: &ProviderClient, id: &str, req: &UpdateStorageRequest) -> Result<()> {
        self.ops.update(client, id, req).await
    }

    pub async fn delete(&self, client: &ProviderClient, id: &str) -> Result<()> {
        self.ops.delete(client, id).await
    }

    pub async fn attach(&self, client: &ProviderClient, id: &str, node_id: &str) -> Result<()> {
        self.ops.attach(client, id, node_id).await
    }

    pub async fn detach(&self, client: &ProviderClient, id: &str, node_id: &str) -> Result<()> {
        self.ops.detach(client, id, node_id).await
    }
}

/// Every storage family, in probe order. `volume_id` is opaque CSI state;
/// callers that only have an id must try each family in turn.
pub const ALL_FAMILIES: [StorageType; 2] = [StorageType::Block, StorageType::Vfs];

/// Finds which family a volume belongs to by probing `Get` against each
/// family in turn, per spec.md §4.2.3 step 1 / `FindVultrStorageHandlerByID`.
pub async fn find_storage_handler(
    client: &ProviderClient,
    id: &str,
) -> Result<(StorageHandler, Storage)> {
    let mut last_err = None;
    for family in ALL_FAMILIES {
        let handler = StorageHandler::for_family(family);
        match handler.get(client, id).await {
            Ok(storage) => return Ok((handler, storage)),
            Err(e) if e.is_wrong_family() => {
                last_err = Some(e);
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| ProviderError::NotFound(id.to_string())))
}
