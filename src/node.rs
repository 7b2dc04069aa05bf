//! CSI Node Service Implementation
//!
//! Handles volume staging and publishing on the node: format/mount a
//! provider block device or attach a virtio-fs tag, bind-mount it into
//! the pod's path, and report capacity. Adapted from the teacher's
//! `node.rs` — `validate_path` is kept nearly verbatim; the iSCSI/NVMeoF
//! connect/disconnect logic has no counterpart here since this driver's
//! devices are attached by the provider, not discovered by the node.

use std::collections::HashMap;

use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::csi;
use crate::device;
use crate::metrics::{self, OperationTimer};
use crate::mounter;

const BY_ID_PREFIX: &str = "/dev/disk/by-id/virtio-";
const DEFAULT_MAX_VOLUMES_PER_NODE: i64 = 11;

pub struct NodeService {
    node_id: String,
    region: String,
}

impl NodeService {
    pub fn new(node_id: String, region: String) -> Self {
        Self { node_id, region }
    }

    /// Rejects paths that are empty, relative, contain `..`, or carry
    /// shell metacharacters, before any `std::process::Command` is built
    /// from them.
    fn validate_path(path: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument("path cannot be empty"));
        }
        if !path.starts_with('/') {
            return Err(Status::invalid_argument("path must be absolute"));
        }
        if path.contains("..") {
            return Err(Status::invalid_argument("path cannot contain '..'"));
        }
        let dangerous = [';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r'];
        if path.contains(dangerous.as_slice()) {
            return Err(Status::invalid_argument(
                "path contains a shell metacharacter",
            ));
        }
        Ok(())
    }

    /// `mount_vol_name` arrives via `PublishContext`, which is
    /// attacker-adjacent data from the orchestrator's point of view, so
    /// it gets the same scrutiny as a path before use as a device serial
    /// or virtiofs tag.
    fn validate_mount_vol_name(name: &str) -> Result<(), Status> {
        if name.is_empty() {
            return Err(Status::invalid_argument("mount_vol_name is required"));
        }
        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid {
            return Err(Status::invalid_argument(
                "mount_vol_name contains invalid characters",
            ));
        }
        Ok(())
    }

    fn publish_context_value<'a>(
        ctx: &'a HashMap<String, String>,
        key: &str,
    ) -> Result<&'a str, Status> {
        ctx.get(key)
            .map(String::as_str)
            .ok_or_else(|| Status::invalid_argument(format!("publish_context missing {key}")))
    }

    fn fs_type_and_flags(capability: Option<&csi::VolumeCapability>) -> (String, Vec<String>) {
        match capability.and_then(|c| c.access_type.as_ref()) {
            Some(csi::volume_capability::AccessType::Mount(mount)) => {
                let fs_type = if mount.fs_type.is_empty() {
                    mounter::DEFAULT_FS_TYPE.to_string()
                } else {
                    mount.fs_type.clone()
                };
                (fs_type, mount.mount_flags.clone())
            }
            _ => (mounter::DEFAULT_FS_TYPE.to_string(), Vec::new()),
        }
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let timer = OperationTimer::new("NodeStageVolume");
        let req = request.into_inner();
        if let Err(status) = Self::validate_path(&req.staging_target_path) {
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }
        if req.volume_id.is_empty() {
            let status = Status::invalid_argument("volume_id is required");
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }

        let mount_vol_name = match Self::publish_context_value(&req.publish_context, "mount_vol_name") {
            Ok(name) => name,
            Err(status) => {
                timer.failure(metrics::status_label(&status));
                return Err(status);
            }
        };
        let storage_type = match Self::publish_context_value(&req.publish_context, "storage_type") {
            Ok(t) => t,
            Err(status) => {
                timer.failure(metrics::status_label(&status));
                return Err(status);
            }
        };
        if let Err(status) = Self::validate_mount_vol_name(mount_vol_name) {
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }

        info!(volume_id = %req.volume_id, storage_type, "NodeStageVolume request");

        let (fs_type, mount_flags) = Self::fs_type_and_flags(req.volume_capability.as_ref());

        match storage_type {
            "block" => {
                device::ensure_link_if_managed_node(mount_vol_name).await;
                let source = format!("{BY_ID_PREFIX}{mount_vol_name}");
                let fs_type = match mounter::validate_fs_type(&fs_type) {
                    Ok(fs_type) => fs_type,
                    Err(e) => {
                        error!(error = %e, "unsupported filesystem type requested");
                        let status = Status::from(e);
                        timer.failure(metrics::status_label(&status));
                        return Err(status);
                    }
                };

                match mounter::needs_formatting(&source) {
                    Ok(true) => {
                        if let Err(e) = mounter::format_device(&source, fs_type) {
                            let status = Status::from(e);
                            timer.failure(metrics::status_label(&status));
                            return Err(status);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        let status = Status::from(e);
                        timer.failure(metrics::status_label(&status));
                        return Err(status);
                    }
                }
                match mounter::is_mounted(&req.staging_target_path) {
                    Ok(true) => {}
                    Ok(false) => {
                        if let Err(e) =
                            mounter::mount(&source, &req.staging_target_path, fs_type, &mount_flags)
                        {
                            let status = Status::from(e);
                            timer.failure(metrics::status_label(&status));
                            return Err(status);
                        }
                    }
                    Err(e) => {
                        let status = Status::from(e);
                        timer.failure(metrics::status_label(&status));
                        return Err(status);
                    }
                }
                // Idempotent with a prior ControllerExpandVolume: grow the
                // filesystem to match the device if it hasn't already.
                if let Err(e) = mounter::resize(&source, &req.staging_target_path, fs_type) {
                    error!(error = %e, "online filesystem grow failed, continuing");
                }
            }
            "vfs" => match mounter::is_mounted(&req.staging_target_path) {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(e) =
                        mounter::mount(mount_vol_name, &req.staging_target_path, "virtiofs", &[])
                    {
                        let status = Status::from(e);
                        timer.failure(metrics::status_label(&status));
                        return Err(status);
                    }
                }
                Err(e) => {
                    let status = Status::from(e);
                    timer.failure(metrics::status_label(&status));
                    return Err(status);
                }
            },
            other => {
                let status = Status::invalid_argument(format!(
                    "unknown storage_type in publish_context: {other}"
                ));
                timer.failure(metrics::status_label(&status));
                return Err(status);
            }
        }

        timer.success();
        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let timer = OperationTimer::new("NodeUnstageVolume");
        let req = request.into_inner();
        if let Err(status) = Self::validate_path(&req.staging_target_path) {
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }

        if let Err(e) = mounter::cleanup_mount_point(&req.staging_target_path) {
            let status = Status::from(e);
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }

        timer.success();
        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("NodePublishVolume");
        let req = request.into_inner();
        if let Err(status) = Self::validate_path(&req.staging_target_path) {
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }
        if let Err(status) = Self::validate_path(&req.target_path) {
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }

        info!(volume_id = %req.volume_id, target_path = %req.target_path, "NodePublishVolume request");

        let (_fs_type, mount_flags) = Self::fs_type_and_flags(req.volume_capability.as_ref());
        if let Err(e) =
            mounter::bind_mount(&req.staging_target_path, &req.target_path, &mount_flags, req.readonly)
        {
            let status = Status::from(e);
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }

        timer.success();
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("NodeUnpublishVolume");
        let req = request.into_inner();
        if let Err(status) = Self::validate_path(&req.target_path) {
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }

        if let Err(e) = mounter::cleanup_mount_point(&req.target_path) {
            let status = Status::from(e);
            timer.failure(metrics::status_label(&status));
            return Err(status);
        }

        timer.success();
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        Self::validate_path(&req.volume_path)?;

        let stats = mounter::stats(&req.volume_path).map_err(Status::from)?;

        Ok(Response::new(csi::NodeGetVolumeStatsResponse {
            usage: vec![
                csi::VolumeUsage {
                    available: stats.available_bytes,
                    total: stats.total_bytes,
                    used: stats.used_bytes,
                    unit: csi::volume_usage::Unit::Bytes as i32,
                },
                csi::VolumeUsage {
                    available: stats.available_inodes,
                    total: stats.total_inodes,
                    used: stats.used_inodes,
                    unit: csi::volume_usage::Unit::Inodes as i32,
                },
            ],
        }))
    }

    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        Self::validate_path(&req.volume_path)?;

        info!(volume_id = %req.volume_id, volume_path = %req.volume_path, "NodeExpandVolume request");

        let device = mounter::device_for_mount(&req.volume_path).map_err(Status::from)?;
        let (fs_type, _) = Self::fs_type_and_flags(req.volume_capability.as_ref());
        mounter::resize(&device, &req.volume_path, &fs_type).map_err(Status::from)?;

        let capacity_bytes = req
            .capacity_range
            .as_ref()
            .map(|r| r.required_bytes)
            .unwrap_or(0);

        Ok(Response::new(csi::NodeExpandVolumeResponse { capacity_bytes }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let rpc = |t: csi::node_service_capability::rpc::Type| csi::NodeServiceCapability {
            r#type: Some(csi::node_service_capability::Type::Rpc(
                csi::node_service_capability::Rpc { r#type: t as i32 },
            )),
        };
        use csi::node_service_capability::rpc::Type::*;
        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities: vec![
                rpc(StageUnstageVolume),
                rpc(GetVolumeStats),
                rpc(ExpandVolume),
            ],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        let mut segments = HashMap::new();
        segments.insert("region".to_string(), self.region.clone());

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: DEFAULT_MAX_VOLUMES_PER_NODE,
            accessible_topology: Some(csi::topology_requirement::Topology { segments }),
        }))
    }
}
