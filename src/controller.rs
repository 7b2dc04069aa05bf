//! CSI Controller Service Implementation
//!
//! Implements the CSI Controller RPCs against the storage-type handler
//! abstraction (`storage.rs`) and the cloud provider client
//! (`provider.rs`). Adapted from the teacher's `controller.rs` for
//! structure (service struct, `#[tonic::async_trait]` impl, logging and
//! metrics density) with the actual business logic grounded on
//! `internal/vultrstorage/vultrstorage.go` and `driver/controller.go`
//! from the original implementation.

use std::collections::HashMap;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::csi;
use crate::metrics::{self, OperationTimer};
use crate::provider::ProviderClient;
use crate::storage::{
    self, AccessMode, CreateStorageRequest, DiskType, GIBIBYTE, Storage, StorageHandler,
    StorageType, UpdateStorageRequest,
};

const CONVERGENCE_ATTEMPTS: usize = 15;
const CONVERGENCE_INTERVAL: Duration = Duration::from_secs(1);

pub const PUBLISH_CONTEXT_MOUNT_VOL_NAME: &str = "mount_vol_name";
pub const PUBLISH_CONTEXT_STORAGE_TYPE: &str = "storage_type";

pub struct ControllerService {
    provider: ProviderClient,
    region: String,
}

impl ControllerService {
    pub fn new(provider: ProviderClient, region: String) -> Self {
        Self { provider, region }
    }

    /// Validates `name` and `volume_capabilities` against the target
    /// handler's capability set, per spec.md §4.2.1 step 1.
    fn validate_create_request(
        name: &str,
        capabilities: &[csi::VolumeCapability],
        access_mode: &AccessMode,
    ) -> Result<(), Status> {
        if name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        if capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "volume_capabilities must be non-empty",
            ));
        }
        for cap in capabilities {
            Self::check_capability(cap, access_mode)?;
        }
        Ok(())
    }

    fn check_capability(
        cap: &csi::VolumeCapability,
        access_mode: &AccessMode,
    ) -> Result<(), Status> {
        let mode = cap
            .access_mode
            .as_ref()
            .map(|m| m.mode)
            .unwrap_or(csi::volume_capability::access_mode::Mode::Unknown as i32);
        let expected = match access_mode {
            AccessMode::SingleNodeWriter => {
                csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32
            }
            AccessMode::MultiNodeMultiWriter => {
                csi::volume_capability::access_mode::Mode::MultiNodeMultiWriter as i32
            }
        };
        if mode != expected {
            return Err(Status::invalid_argument(format!(
                "unsupported access mode {mode} for this storage type"
            )));
        }
        match &cap.access_type {
            Some(csi::volume_capability::AccessType::Block(_)) => Ok(()),
            Some(csi::volume_capability::AccessType::Mount(_)) => Ok(()),
            None => Err(Status::invalid_argument("access_type is required")),
        }
    }

    /// Computes the requested size in bytes per spec.md §4.2.1 step 4.
    fn resolve_size_bytes(
        capacity_range: Option<&csi::CapacityRange>,
        default_size_bytes: i64,
    ) -> Result<i64, Status> {
        match capacity_range {
            Some(range) if range.required_bytes > 0 => Ok(range.required_bytes),
            Some(range) if range.limit_bytes > 0 => Ok(range.limit_bytes),
            Some(_) => {
                if default_size_bytes > 0 {
                    Ok(default_size_bytes)
                } else {
                    Err(Status::out_of_range("capacity range resolves to nothing"))
                }
            }
            None => Ok(default_size_bytes),
        }
    }

    async fn poll_until_active(
        &self,
        handler: &StorageHandler,
        id: &str,
    ) -> Result<Storage, Status> {
        for attempt in 0..CONVERGENCE_ATTEMPTS {
            let storage = handler.get(&self.provider, id).await?;
            if storage.is_active() {
                return Ok(storage);
            }
            debug!(id, attempt, status = %storage.status, "waiting for storage to become active");
            metrics::record_retry("CreateVolume");
            tokio::time::sleep(CONVERGENCE_INTERVAL).await;
        }
        Err(Status::internal(format!(
            "storage {id} did not become active within {CONVERGENCE_ATTEMPTS}s"
        )))
    }

    async fn poll_until_attached(
        &self,
        handler: &StorageHandler,
        id: &str,
        node_id: &str,
    ) -> Result<String, Status> {
        for attempt in 0..CONVERGENCE_ATTEMPTS {
            let storage = handler.get(&self.provider, id).await?;
            if let Some(attachment) = storage.attachment_for(node_id) {
                return Ok(attachment.mount_name.clone());
            }
            debug!(id, node_id, attempt, "waiting for attachment to converge");
            metrics::record_retry("ControllerPublishVolume");
            tokio::time::sleep(CONVERGENCE_INTERVAL).await;
        }
        Err(Status::internal(format!(
            "attachment of {id} to {node_id} did not converge within {CONVERGENCE_ATTEMPTS}s"
        )))
    }

    fn topology(&self) -> Vec<csi::topology_requirement::Topology> {
        let mut segments = HashMap::new();
        segments.insert("region".to_string(), self.region.clone());
        vec![csi::topology_requirement::Topology { segments }]
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = OperationTimer::new("CreateVolume");
        let req = request.into_inner();
        info!(name = %req.name, "CreateVolume request");

        let (storage_type, disk_type) = match storage::resolve_storage_params(&req.parameters) {
            Some(v) => v,
            None => {
                let status = Status::invalid_argument(
                    "parameters must include storage_type/disk_type or legacy block_type",
                );
                timer.failure(metrics::status_label(&status));
                return Err(status);
            }
        };
        let handler = StorageHandler::new(storage_type, disk_type);

        if let Err(status) =
            Self::validate_create_request(&req.name, &req.volume_capabilities, &handler.access_mode)
        {
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }

        // Idempotency check: an existing volume with this label wins,
        // per spec.md §4.2.1 step 3 / scenario 2.
        let existing = match handler.list_all(&self.provider).await {
            Ok(list) => list.into_iter().find(|s| s.label == req.name),
            Err(e) => {
                let status = Status::from(e);
                timer.failure(metrics::status_label(&status));
                return Err(status);
            }
        };

        if let Some(storage) = existing {
            info!(volume_id = %storage.id, "CreateVolume idempotent hit on existing label");
            timer.success();
            return Ok(Response::new(csi::CreateVolumeResponse {
                volume: Some(csi::Volume {
                    capacity_bytes: storage.capacity_bytes(),
                    volume_id: storage.id,
                    volume_context: HashMap::new(),
                    accessible_topology: self.topology(),
                }),
            }));
        }

        let size_bytes =
            match Self::resolve_size_bytes(req.capacity_range.as_ref(), handler.default_size_bytes) {
                Ok(bytes) => bytes,
                Err(status) => {
                    timer.failure(metrics::status_label(&status));
                    return Err(status);
                }
            };
        let size_gb = (size_bytes + GIBIBYTE - 1) / GIBIBYTE;

        let created = match handler
            .create(
                &self.provider,
                &CreateStorageRequest {
                    region: &self.region,
                    label: &req.name,
                    size_gb,
                    disk_type,
                },
            )
            .await
        {
            Ok(created) => created,
            Err(e) => {
                error!(error = %e, "create_volume provider call failed");
                let status = Status::from(e);
                timer.failure(metrics::status_label(&status));
                return Err(status);
            }
        };

        let active = match self.poll_until_active(&handler, &created.id).await {
            Ok(active) => active,
            Err(status) => {
                timer.failure(metrics::status_label(&status));
                return Err(status);
            }
        };

        info!(volume_id = %active.id, size_gb = active.size_gb, "volume created");
        timer.success();
        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(csi::Volume {
                capacity_bytes: active.capacity_bytes(),
                volume_id: active.id,
                volume_context: HashMap::new(),
                accessible_topology: self.topology(),
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = OperationTimer::new("DeleteVolume");
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            let status = Status::invalid_argument("volume_id is required");
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }
        info!(volume_id = %req.volume_id, "DeleteVolume request");

        let (handler, storage) = match storage::find_storage_handler(&self.provider, &req.volume_id).await {
            Ok(found) => found,
            Err(e) if e.is_wrong_family() => {
                info!(volume_id = %req.volume_id, "volume already absent, delete is a no-op");
                timer.success();
                return Ok(Response::new(csi::DeleteVolumeResponse {}));
            }
            Err(e) => {
                let status = Status::from(e);
                timer.failure(metrics::status_label(&status));
                return Err(status);
            }
        };

        // Best-effort detach from every attached instance.
        for attachment in &storage.attachments {
            if let Err(e) = handler.detach(&self.provider, &storage.id, &attachment.node_id).await {
                if e.is_already_detached() {
                    continue;
                }
                error!(error = %e, volume_id = %storage.id, "failed to detach before delete");
                let status = Status::from(e);
                timer.failure(metrics::status_label(&status));
                return Err(status);
            }
        }

        if let Err(e) = handler.delete(&self.provider, &storage.id).await {
            error!(error = %e, volume_id = %storage.id, "delete failed");
            let status = Status::from(e);
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }

        info!(volume_id = %storage.id, "volume deleted");
        timer.success();
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("ControllerPublishVolume");
        let req = request.into_inner();
        if req.volume_id.is_empty() || req.node_id.is_empty() {
            let status = Status::invalid_argument("volume_id and node_id are required");
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }
        if req.readonly {
            let status = Status::invalid_argument("readonly publish is not supported");
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }
        info!(volume_id = %req.volume_id, node_id = %req.node_id, "ControllerPublishVolume request");

        let (handler, storage) = match storage::find_storage_handler(&self.provider, &req.volume_id).await {
            Ok(found) => found,
            Err(e) => {
                let status = Status::from(e);
                timer.failure(metrics::status_label(&status));
                return Err(status);
            }
        };

        if let Err(e) = self.provider.get_instance(&req.node_id).await {
            let status = Status::from(e);
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }

        if let Some(attachment) = storage.attachment_for(&req.node_id) {
            info!(volume_id = %storage.id, node_id = %req.node_id, "already attached, returning existing context");
            timer.success();
            return Ok(Response::new(csi::ControllerPublishVolumeResponse {
                publish_context: publish_context(&attachment.mount_name, handler.storage_type),
            }));
        }

        if handler.storage_type == StorageType::Block && !storage.attachments.is_empty() {
            let status = Status::failed_precondition("block volume is already attached to another node");
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }

        match handler.attach(&self.provider, &storage.id, &req.node_id).await {
            Ok(()) => {}
            Err(e) if e.is_already_attached() => {
                warn!(volume_id = %storage.id, "attach reported already-attached, treating as success");
            }
            Err(e) => {
                error!(error = %e, volume_id = %storage.id, "attach failed");
                let status = Status::from(e);
                timer.failure(metrics::status_label(&status));
                return Err(status);
            }
        }

        let mount_name = match self.poll_until_attached(&handler, &storage.id, &req.node_id).await {
            Ok(name) => name,
            Err(status) => {
                timer.failure(metrics::status_label(&status));
                return Err(status);
            }
        };

        info!(volume_id = %storage.id, node_id = %req.node_id, "volume attached");
        timer.success();
        Ok(Response::new(csi::ControllerPublishVolumeResponse {
            publish_context: publish_context(&mount_name, handler.storage_type),
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("ControllerUnpublishVolume");
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            let status = Status::invalid_argument("volume_id is required");
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }
        info!(volume_id = %req.volume_id, node_id = %req.node_id, "ControllerUnpublishVolume request");

        let (handler, storage) = match storage::find_storage_handler(&self.provider, &req.volume_id).await {
            Ok(found) => found,
            Err(e) if e.is_wrong_family() => {
                timer.success();
                return Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}));
            }
            Err(e) => {
                let status = Status::from(e);
                timer.failure(metrics::status_label(&status));
                return Err(status);
            }
        };

        if storage.attachments.is_empty() {
            timer.success();
            return Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}));
        }

        for attachment in storage.attachments.iter().filter(|a| a.node_id == req.node_id) {
            if let Err(e) = handler.detach(&self.provider, &storage.id, &attachment.node_id).await {
                if e.is_already_detached() {
                    continue;
                }
                error!(error = %e, volume_id = %storage.id, "detach failed");
                let status = Status::from(e);
                timer.failure(metrics::status_label(&status));
                return Err(status);
            }
        }

        timer.success();
        Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }

        let (handler, _storage) = storage::find_storage_handler(&self.provider, &req.volume_id)
            .await
            .map_err(Status::from)?;

        let unsupported = req
            .volume_capabilities
            .iter()
            .find(|c| Self::check_capability(c, &handler.access_mode).is_err());

        if let Some(_bad) = unsupported {
            return Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "requested capability is not supported by this storage type".to_string(),
            }));
        }

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
            }),
            message: String::new(),
        }))
    }

    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let req = request.into_inner();
        if !req.starting_token.is_empty() && req.starting_token.parse::<u64>().is_err() {
            return Err(Status::invalid_argument("starting_token must be an integer"));
        }

        let mut entries = Vec::new();
        for family in storage::ALL_FAMILIES {
            let handler = StorageHandler::for_family(family);
            let all = handler.list_all(&self.provider).await.map_err(Status::from)?;
            entries.extend(all.into_iter().map(|s| csi::list_volumes_response::Entry {
                volume: Some(csi::Volume {
                    capacity_bytes: s.capacity_bytes(),
                    volume_id: s.id,
                    volume_context: HashMap::new(),
                    accessible_topology: self.topology(),
                }),
            }));
        }

        Ok(Response::new(csi::ListVolumesResponse {
            entries,
            next_token: String::new(),
        }))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented("GetCapacity is not supported"))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        let rpc = |t: csi::controller_service_capability::rpc::Type| csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc { r#type: t as i32 },
            )),
        };
        use csi::controller_service_capability::rpc::Type::*;
        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities: vec![
                rpc(CreateDeleteVolume),
                rpc(PublishUnpublishVolume),
                rpc(ListVolumes),
                rpc(ExpandVolume),
            ],
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("CreateSnapshot is not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("DeleteSnapshot is not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("ListSnapshots is not supported"))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        info!(volume_id = %req.volume_id, "ControllerExpandVolume request");

        let (handler, storage) = storage::find_storage_handler(&self.provider, &req.volume_id)
            .await
            .map_err(Status::from)?;

        let new_bytes = Self::resolve_size_bytes(req.capacity_range.as_ref(), handler.default_size_bytes)?;
        let current_bytes = storage.capacity_bytes();
        if new_bytes < current_bytes {
            return Err(Status::invalid_argument(
                "requested capacity is smaller than current capacity",
            ));
        }

        let new_size_gb = (new_bytes + GIBIBYTE - 1) / GIBIBYTE;
        handler
            .update(
                &self.provider,
                &storage.id,
                &UpdateStorageRequest {
                    size_gb: Some(new_size_gb),
                    label: None,
                },
            )
            .await
            .map_err(Status::from)?;

        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes: new_size_gb * GIBIBYTE,
            node_expansion_required: handler.storage_type == StorageType::Block,
        }))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerGetVolume is not supported"))
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerModifyVolume is not supported",
        ))
    }
}

fn publish_context(mount_vol_name: &str, storage_type: StorageType) -> HashMap<String, String> {
    let mut ctx = HashMap::new();
    ctx.insert(PUBLISH_CONTEXT_MOUNT_VOL_NAME.to_string(), mount_vol_name.to_string());
    ctx.insert(PUBLISH_CONTEXT_STORAGE_TYPE.to_string(), storage_type.as_str().to_string());
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_size_bytes_prefers_required_over_limit() {
        let range = csi::CapacityRange {
            required_bytes: 2 * GIBIBYTE,
            limit_bytes: 5 * GIBIBYTE,
        };
        assert_eq!(
            ControllerService::resolve_size_bytes(Some(&range), storage::BLOCK_HDD_DEFAULT_BYTES).unwrap(),
            2 * GIBIBYTE
        );
    }

    #[test]
    fn resolve_size_bytes_falls_back_to_default() {
        let range = csi::CapacityRange {
            required_bytes: 0,
            limit_bytes: 0,
        };
        assert_eq!(
            ControllerService::resolve_size_bytes(Some(&range), storage::BLOCK_HDD_DEFAULT_BYTES).unwrap(),
            storage::BLOCK_HDD_DEFAULT_BYTES
        );
    }

    #[test]
    fn resolve_size_bytes_no_range_uses_default() {
        assert_eq!(
            ControllerService::resolve_size_bytes(None, storage::VFS_NVME_DEFAULT_BYTES).unwrap(),
            storage::VFS_NVME_DEFAULT_BYTES
        );
    }

    #[test]
    fn publish_context_round_trips_mount_name_and_family() {
        let ctx = publish_context("tag-123", StorageType::Vfs);
        assert_eq!(ctx.get(PUBLISH_CONTEXT_MOUNT_VOL_NAME).unwrap(), "tag-123");
        assert_eq!(ctx.get(PUBLISH_CONTEXT_STORAGE_TYPE).unwrap(), "vfs");
    }

    #[test]
    fn check_capability_rejects_mismatched_access_mode() {
        let cap = csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume::default(),
            )),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::MultiNodeMultiWriter as i32,
            }),
        };
        assert!(ControllerService::check_capability(&cap, &AccessMode::SingleNodeWriter).is_err());
    }
}
