//! Controller RPC tests against a hand-rolled fake Vultr API, grounded
//! on `driver/fakeClient.go`'s in-memory `fakeStorageDriver` approach:
//! rather than mocking the HTTP transport, stand up a real (tiny)
//! HTTP server backed by an in-memory block/vfs storage map and point
//! `ProviderClient` at it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use vultr_csi_driver::controller::ControllerService;
use vultr_csi_driver::csi;
use vultr_csi_driver::csi::controller_server::Controller;
use vultr_csi_driver::provider::ProviderClient;

#[derive(Clone, Default)]
struct BlockRecord {
    label: String,
    region: String,
    size_gb: i64,
    attached_to_instance: String,
    mount_id: String,
}

#[derive(Clone, Default)]
struct VfsRecord {
    label: String,
    region: String,
    size_gb: i64,
}

#[derive(Default)]
struct FakeInner {
    blocks: HashMap<String, BlockRecord>,
    vfs: HashMap<String, VfsRecord>,
    vfs_attachments: HashMap<String, Vec<String>>,
    next_id: u64,
}

#[derive(Clone, Default)]
struct FakeState(Arc<Mutex<FakeInner>>);

impl FakeState {
    fn next_id(&self) -> String {
        let mut inner = self.0.lock().unwrap();
        inner.next_id += 1;
        format!("fake-{}", inner.next_id)
    }
}

/// Minimal HTTP/1.1 request/response handling — just enough to satisfy
/// `reqwest`'s client side. No keep-alive: every response closes the
/// connection, matching the simplest possible fake transport.
async fn serve_one(stream: &mut tokio::net::TcpStream, state: &FakeState) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = header_text.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let content_length: usize = lines
        .find_map(|l| l.strip_prefix("Content-Length: ").or_else(|| l.strip_prefix("content-length: ")))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    let body_str = String::from_utf8_lossy(&body).to_string();

    let (status, payload) = route(&method, &path, &body_str, state);
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{payload}",
        reason = if status == 200 { "OK" } else { "Error" },
        len = payload.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn route(method: &str, path: &str, body: &str, state: &FakeState) -> (u16, String) {
    let segments: Vec<&str> = path.trim_start_matches('/').split('?').next().unwrap_or("").split('/').collect();

    match (method, segments.as_slice()) {
        ("GET", ["instances", id]) => {
            (200, format!(r#"{{"instance":{{"id":"{id}","region":"ewr","label":""}}}}"#))
        }
        ("GET", ["blocks"]) => {
            let inner = state.0.lock().unwrap();
            let items: Vec<String> = inner
                .blocks
                .iter()
                .map(|(id, b)| block_json(id, b))
                .collect();
            (200, format!(r#"{{"blocks":[{}],"meta":{{"links":{{"next":""}}}}}}"#, items.join(",")))
        }
        ("POST", ["blocks"]) => {
            let label = json_field(body, "label").unwrap_or_default();
            let region = json_field(body, "region").unwrap_or_default();
            let size_gb = json_number(body, "size_gb").unwrap_or(0);
            let id = state.next_id();
            let mut inner = state.0.lock().unwrap();
            inner.blocks.insert(
                id.clone(),
                BlockRecord {
                    label,
                    region,
                    size_gb,
                    attached_to_instance: String::new(),
                    mount_id: String::new(),
                },
            );
            (200, format!(r#"{{"block":{}}}"#, block_json(&id, &inner.blocks[&id])))
        }
        ("GET", ["blocks", id]) => {
            let inner = state.0.lock().unwrap();
            match inner.blocks.get(*id) {
                Some(b) => (200, format!(r#"{{"block":{}}}"#, block_json(id, b))),
                None => (404, r#"{"error":"block storage not found"}"#.to_string()),
            }
        }
        ("PATCH", ["blocks", id]) => {
            let mut inner = state.0.lock().unwrap();
            if let Some(size_gb) = json_number(body, "size_gb") {
                if let Some(b) = inner.blocks.get_mut(*id) {
                    b.size_gb = size_gb;
                }
            }
            (200, "{}".to_string())
        }
        ("DELETE", ["blocks", id]) => {
            state.0.lock().unwrap().blocks.remove(*id);
            (200, "{}".to_string())
        }
        ("POST", ["blocks", id, "attach"]) => {
            let instance_id = json_field(body, "instance_id").unwrap_or_default();
            let mut inner = state.0.lock().unwrap();
            if let Some(b) = inner.blocks.get_mut(*id) {
                b.attached_to_instance = instance_id;
                b.mount_id = format!("mnt-{id}");
            }
            (200, "{}".to_string())
        }
        ("POST", ["blocks", id, "detach"]) => {
            let mut inner = state.0.lock().unwrap();
            if let Some(b) = inner.blocks.get_mut(*id) {
                b.attached_to_instance.clear();
                b.mount_id.clear();
            }
            (200, "{}".to_string())
        }
        ("GET", ["vfs"]) => {
            let inner = state.0.lock().unwrap();
            let items: Vec<String> = inner.vfs.iter().map(|(id, v)| vfs_json(id, v)).collect();
            (200, format!(r#"{{"vfs":[{}],"meta":{{"links":{{"next":""}}}}}}"#, items.join(",")))
        }
        ("POST", ["vfs"]) => {
            let label = json_field(body, "label").unwrap_or_default();
            let region = json_field(body, "region").unwrap_or_default();
            let size_gb = json_number(body, "size_gb").unwrap_or(0);
            let id = state.next_id();
            let mut inner = state.0.lock().unwrap();
            inner.vfs.insert(id.clone(), VfsRecord { label, region, size_gb });
            (200, format!(r#"{{"vfs":{}}}"#, vfs_json(&id, &inner.vfs[&id])))
        }
        ("GET", ["vfs", id]) => {
            let inner = state.0.lock().unwrap();
            match inner.vfs.get(*id) {
                Some(v) => (200, format!(r#"{{"vfs":{}}}"#, vfs_json(id, v))),
                None => (404, r#"{"error":"vfs storage not found"}"#.to_string()),
            }
        }
        ("PATCH", ["vfs", id]) => {
            let mut inner = state.0.lock().unwrap();
            if let Some(size_gb) = json_number(body, "size_gb") {
                if let Some(v) = inner.vfs.get_mut(*id) {
                    v.size_gb = size_gb;
                }
            }
            (200, "{}".to_string())
        }
        ("DELETE", ["vfs", id]) => {
            state.0.lock().unwrap().vfs.remove(*id);
            (200, "{}".to_string())
        }
        ("GET", ["vfs", id, "attachments"]) => {
            let inner = state.0.lock().unwrap();
            let targets = inner.vfs_attachments.get(*id).cloned().unwrap_or_default();
            let items: Vec<String> = targets
                .iter()
                .map(|t| format!(r#"{{"target_id":"{t}","mount_tag":1}}"#))
                .collect();
            (200, format!(r#"{{"attachments":[{}]}}"#, items.join(",")))
        }
        ("POST", ["vfs", id, "attachments"]) => {
            let target_id = json_field(body, "target_id").unwrap_or_default();
            let mut inner = state.0.lock().unwrap();
            inner.vfs_attachments.entry(id.to_string()).or_default().push(target_id);
            (200, "{}".to_string())
        }
        ("DELETE", ["vfs", id, "attachments", target_id]) => {
            let mut inner = state.0.lock().unwrap();
            if let Some(targets) = inner.vfs_attachments.get_mut(*id) {
                targets.retain(|t| t != target_id);
            }
            (200, "{}".to_string())
        }
        _ => (404, r#"{"error":"no such route"}"#.to_string()),
    }
}

fn block_json(id: &str, b: &BlockRecord) -> String {
    format!(
        r#"{{"id":"{id}","region":"{region}","status":"active","label":"{label}","size_gb":{size_gb},"attached_to_instance":"{attached}","mount_id":"{mount_id}"}}"#,
        region = b.region,
        label = b.label,
        size_gb = b.size_gb,
        attached = b.attached_to_instance,
        mount_id = b.mount_id,
    )
}

fn vfs_json(id: &str, v: &VfsRecord) -> String {
    format!(
        r#"{{"id":"{id}","region":"{region}","status":"active","label":"{label}","size_gb":{size_gb}}}"#,
        region = v.region,
        label = v.label,
        size_gb = v.size_gb,
    )
}

/// Extracts a bare string field from a flat JSON object without pulling
/// in a parser — good enough for the fixed request shapes this driver
/// sends.
fn json_field(body: &str, key: &str) -> Option<String> {
    let needle = format!("\"{key}\":\"");
    let start = body.find(&needle)? + needle.len();
    let end = body[start..].find('"')? + start;
    Some(body[start..end].to_string())
}

fn json_number(body: &str, key: &str) -> Option<i64> {
    let needle = format!("\"{key}\":");
    let start = body.find(&needle)? + needle.len();
    let rest = &body[start..];
    let end = rest.find(|c: char| c == ',' || c == '}').unwrap_or(rest.len());
    rest[..end].trim().parse().ok()
}

async fn spawn_fake_provider() -> (ProviderClient, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = FakeState::default();

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let state = state.clone();
            tokio::spawn(async move {
                let _ = serve_one(&mut stream, &state).await;
            });
        }
    });

    let client = ProviderClient::with_base_url("test-token".to_string(), format!("http://{addr}"), None);
    (client, handle)
}

fn block_request(name: &str) -> csi::CreateVolumeRequest {
    let mut parameters = HashMap::new();
    parameters.insert("storage_type".to_string(), "block".to_string());
    parameters.insert("disk_type".to_string(), "hdd".to_string());
    csi::CreateVolumeRequest {
        name: name.to_string(),
        capacity_range: None,
        volume_capabilities: vec![csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume::default(),
            )),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
            }),
        }],
        parameters,
        accessibility_requirements: None,
    }
}

#[tokio::test]
async fn create_volume_with_defaults_quantizes_to_block_hdd_size() {
    let (provider, _h) = spawn_fake_provider().await;
    let svc = ControllerService::new(provider, "ewr".to_string());

    let resp = svc
        .create_volume(tonic::Request::new(block_request("v1")))
        .await
        .unwrap()
        .into_inner();
    let volume = resp.volume.unwrap();
    assert_eq!(volume.capacity_bytes, 40 * (1i64 << 30));
    assert_eq!(volume.accessible_topology[0].segments.get("region").unwrap(), "ewr");
}

#[tokio::test]
async fn create_volume_is_idempotent_by_label() {
    let (provider, _h) = spawn_fake_provider().await;
    let svc = ControllerService::new(provider, "ewr".to_string());

    let first = svc
        .create_volume(tonic::Request::new(block_request("v2")))
        .await
        .unwrap()
        .into_inner();
    let second = svc
        .create_volume(tonic::Request::new(block_request("v2")))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(first.volume.unwrap().volume_id, second.volume.unwrap().volume_id);
}

#[tokio::test]
async fn delete_unknown_volume_returns_success() {
    let (provider, _h) = spawn_fake_provider().await;
    let svc = ControllerService::new(provider, "ewr".to_string());

    let resp = svc
        .delete_volume(tonic::Request::new(csi::DeleteVolumeRequest {
            volume_id: "does-not-exist".to_string(),
        }))
        .await;
    assert!(resp.is_ok());
}

#[tokio::test]
async fn publish_then_unpublish_round_trips_publish_context() {
    let (provider, _h) = spawn_fake_provider().await;
    let svc = ControllerService::new(provider, "ewr".to_string());

    let created = svc
        .create_volume(tonic::Request::new(block_request("v3")))
        .await
        .unwrap()
        .into_inner();
    let volume_id = created.volume.unwrap().volume_id;

    let publish = svc
        .controller_publish_volume(tonic::Request::new(csi::ControllerPublishVolumeRequest {
            volume_id: volume_id.clone(),
            node_id: "node-1".to_string(),
            volume_capability: None,
            readonly: false,
            volume_context: HashMap::new(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(publish.publish_context.get("storage_type").unwrap(), "block");
    assert!(!publish.publish_context.get("mount_vol_name").unwrap().is_empty());

    let unpublish = svc
        .controller_unpublish_volume(tonic::Request::new(csi::ControllerUnpublishVolumeRequest {
            volume_id,
            node_id: "node-1".to_string(),
        }))
        .await;
    assert!(unpublish.is_ok());
}

#[tokio::test]
async fn publish_to_second_node_is_rejected() {
    let (provider, _h) = spawn_fake_provider().await;
    let svc = ControllerService::new(provider, "ewr".to_string());

    let created = svc
        .create_volume(tonic::Request::new(block_request("v4")))
        .await
        .unwrap()
        .into_inner();
    let volume_id = created.volume.unwrap().volume_id;

    svc.controller_publish_volume(tonic::Request::new(csi::ControllerPublishVolumeRequest {
        volume_id: volume_id.clone(),
        node_id: "node-1".to_string(),
        volume_capability: None,
        readonly: false,
        volume_context: HashMap::new(),
    }))
    .await
    .unwrap();

    let second = svc
        .controller_publish_volume(tonic::Request::new(csi::ControllerPublishVolumeRequest {
            volume_id,
            node_id: "node-2".to_string(),
            volume_capability: None,
            readonly: false,
            volume_context: HashMap::new(),
        }))
        .await;

    assert_eq!(second.unwrap_err().code(), tonic::Code::FailedPrecondition);
}

#[tokio::test]
async fn expand_rejects_shrinking_and_flags_block_node_expansion() {
    let (provider, _h) = spawn_fake_provider().await;
    let svc = ControllerService::new(provider, "ewr".to_string());

    let created = svc
        .create_volume(tonic::Request::new(block_request("v5")))
        .await
        .unwrap()
        .into_inner();
    let volume_id = created.volume.unwrap().volume_id;

    let shrink = svc
        .controller_expand_volume(tonic::Request::new(csi::ControllerExpandVolumeRequest {
            volume_id: volume_id.clone(),
            capacity_range: Some(csi::CapacityRange {
                required_bytes: 1 * (1i64 << 30),
                limit_bytes: 0,
            }),
        }))
        .await;
    assert_eq!(shrink.unwrap_err().code(), tonic::Code::InvalidArgument);

    let grow = svc
        .controller_expand_volume(tonic::Request::new(csi::ControllerExpandVolumeRequest {
            volume_id,
            capacity_range: Some(csi::CapacityRange {
                required_bytes: 80 * (1i64 << 30),
                limit_bytes: 0,
            }),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(grow.capacity_bytes, 80 * (1i64 << 30));
    assert!(grow.node_expansion_required);
}
