//! Generated gRPC contracts and conversions to and from the domain model.
//!
//! The `.proto` sources under `proto/hypervisor/v1` are the authoritative
//! wire contract; this crate compiles them with `tonic-build` and layers the
//! `hypervisor-types` conversions on top so services and clients never touch
//! raw tags or enum integers.

pub mod convert;

pub mod v1 {
    #![allow(clippy::derive_partial_eq_without_eq)]
    tonic::include_proto!("hypervisor.v1");
}

pub use v1::agent_service_client::AgentServiceClient;
pub use v1::agent_service_server::{AgentService, AgentServiceServer};
pub use v1::cluster_service_client::ClusterServiceClient;
pub use v1::cluster_service_server::{ClusterService, ClusterServiceServer};
pub use v1::compute_service_client::ComputeServiceClient;
pub use v1::compute_service_server::{ComputeService, ComputeServiceServer};
