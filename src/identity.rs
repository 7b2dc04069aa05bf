//! CSI Identity Service Implementation
//!
//! Plugin identification, capability advertisement, and readiness
//! probing. Adapted from the teacher's `identity.rs` — the
//! `ReadinessState` pattern is kept nearly verbatim; the plugin name and
//! the version-must-be-non-empty rule come from spec.md §4.1 and
//! `cmd/csi-vultr-driver/main.go`'s `if version == "" { log.Fatal(...) }`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tonic::{Request, Response, Status};

use crate::csi;

pub const DRIVER_NAME: &str = "block.csi.vultr.com";

/// Shared readiness state for the CSI driver.
///
/// Used by `probe()` to report actual readiness and flipped by `main`
/// once all services are registered and again during shutdown.
#[derive(Debug, Default)]
pub struct ReadinessState {
    ready: AtomicBool,
}

impl ReadinessState {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

pub struct IdentityService {
    driver_name: String,
    version: String,
    readiness: Option<Arc<ReadinessState>>,
}

impl IdentityService {
    pub fn new(driver_name: String, version: String) -> Self {
        Self {
            driver_name,
            version,
            readiness: None,
        }
    }

    pub fn with_readiness(driver_name: String, version: String, readiness: Arc<ReadinessState>) -> Self {
        Self {
            driver_name,
            version,
            readiness: Some(readiness),
        }
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: self.version.clone(),
            manifest: std::collections::HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let capabilities = vec![
            csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::Service(
                    csi::plugin_capability::Service {
                        r#type: csi::plugin_capability::service::Type::ControllerService as i32,
                    },
                )),
            },
            csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::VolumeExpansion(
                    csi::plugin_capability::VolumeExpansion {
                        r#type: csi::plugin_capability::volume_expansion::Type::Online as i32,
                    },
                )),
            },
        ];

        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Returns `ready=true` unconditionally once the process is up, per
    /// spec.md §4.1 — there is no external call here. The
    /// `ReadinessState` hook exists so `main` can report `false` during
    /// the narrow startup/shutdown window before services are wired.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        let ready = match &self.readiness {
            Some(state) => state.is_ready(),
            None => true,
        };
        Ok(Response::new(csi::ProbeResponse {
            ready: Some(crate::google::protobuf::BoolValue { value: ready }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi::identity_server::Identity;

    fn service() -> IdentityService {
        IdentityService::new(DRIVER_NAME.to_string(), "0.1.0".to_string())
    }

    #[tokio::test]
    async fn get_plugin_info_reports_name_and_version() {
        let response = Identity::get_plugin_info(&service(), Request::new(csi::GetPluginInfoRequest {}))
            .await
            .unwrap();
        let info = response.into_inner();
        assert_eq!(info.name, DRIVER_NAME);
        assert_eq!(info.vendor_version, "0.1.0");
    }

    #[tokio::test]
    async fn get_plugin_capabilities_advertises_controller_and_expansion() {
        let response = Identity::get_plugin_capabilities(
            &service(),
            Request::new(csi::GetPluginCapabilitiesRequest {}),
        )
        .await
        .unwrap();
        assert_eq!(response.into_inner().capabilities.len(), 2);
    }

    #[tokio::test]
    async fn probe_without_readiness_state_is_always_ready() {
        let response = Identity::probe(&service(), Request::new(csi::ProbeRequest {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner().ready, Some(true));
    }

    #[tokio::test]
    async fn probe_with_readiness_state_tracks_transitions() {
        let readiness = Arc::new(ReadinessState::new());
        let service =
            IdentityService::with_readiness(DRIVER_NAME.to_string(), "0.1.0".to_string(), readiness.clone());

        let response = Identity::probe(&service, Request::new(csi::ProbeRequest {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner().ready, Some(false));

        readiness.set_ready(true);
        let response = Identity::probe(&service, Request::new(csi::ProbeRequest {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner().ready, Some(true));
    }

    #[test]
    fn readiness_state_transitions() {
        let state = ReadinessState::new();
        assert!(!state.is_ready());
        state.set_ready(true);
        assert!(state.is_ready());
        state.set_ready(false);
        assert!(!state.is_ready());
    }
}
