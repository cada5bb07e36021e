//! Abstract access to the container orchestrator's control plane.
//!
//! The proxy never talks to an orchestrator API directly; everything goes
//! through the [`ClusterClient`] trait so that deployments can plug in their
//! control-plane client while tests use [`testutils::FakeCluster`].

pub mod client;
pub mod endpoints;
pub mod env;
pub mod nodes;
pub mod testutils;
pub mod types;

pub use client::{ClusterClient, PodWatch};
pub use endpoints::ServiceEndpoints;
pub use nodes::{NodeStat, NodesStat};
pub use types::{
    EndpointAddress, EndpointPort, Endpoints, JobSpec, LabelSelector, NodeInfo, Pod, PodPhase,
};

#[derive(thiserror::Error, Debug, Clone)]
pub enum ClusterError {
    #[error("control plane request failed: {0}")]
    Api(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("control plane request timed out: {0}")]
    Timeout(String),

    #[error("operation not supported by this provider: {0}")]
    Unsupported(&'static str),
}
