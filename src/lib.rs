//! Vultr CSI Driver Library
//!
//! Kubernetes CSI driver that provisions and attaches Vultr block
//! storage and virtual file system (VFS) storage volumes.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - A REST client for the Vultr compute and storage APIs
//! - A storage-type abstraction unifying block and vfs backends
//! - Host mount/format/resize operations and device-symlink management

/// CSI proto generated types
pub mod google {
    pub mod protobuf {
        tonic::include_proto!("google.protobuf");
    }
}

pub mod csi {
    pub mod v1 {
        tonic::include_proto!("csi.v1");
    }
    pub use v1::*;
}

pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod identity;
pub mod metadata;
pub mod metrics;
pub mod mounter;
pub mod node;
pub mod provider;
pub mod server;
pub mod storage;

pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;
pub use provider::ProviderClient;
pub use server::NonBlockingGrpcServer;
